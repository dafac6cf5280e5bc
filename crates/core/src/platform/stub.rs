use std::path::PathBuf;

use crate::error::EngineError;
use crate::gesture::GestureDescription;
use crate::logger;
use crate::types::{Bitmap, Frame};
use super::{FrameSource, GestureDispatcher, IntentRequest, NotificationRequest, Platform, SystemDispatcher};

pub fn platform(frame: Option<PathBuf>) -> Platform {
    Platform::new(
        Box::new(StubFrames { path: frame, image: None, seq: 0 }),
        Box::new(StubGestures),
        Box::new(StubSystem),
    )
}

/// Replays one image from disk, or produces no frames.
struct StubFrames {
    path: Option<PathBuf>,
    image: Option<Bitmap>,
    seq: u64,
}

impl FrameSource for StubFrames {
    fn start(&mut self) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            logger::info_p("stub", "frames.start() without image, image events will idle");
            return Ok(());
        };
        logger::info_p("stub", &format!("frames.start({})", path.display()));
        let image = image::open(path)
            .map_err(|e| EngineError::CaptureUnavailable(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        self.image = Some(image);
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Option<Frame>, EngineError> {
        let Some(image) = &self.image else { return Ok(None) };
        self.seq += 1;
        Ok(Some(Frame::new(self.seq, image.clone())))
    }

    fn stop(&mut self) {
        logger::info_p("stub", &format!("frames.stop() after {} frames", self.seq));
        self.image = None;
    }
}

struct StubGestures;

impl GestureDispatcher for StubGestures {
    fn dispatch(&mut self, gesture: &GestureDescription) -> bool {
        for stroke in &gesture.strokes {
            logger::info_p("stub", &format!(
                "gesture({:?}, +{}ms, {}ms)",
                stroke.path.iter().map(|p| (p.x, p.y)).collect::<Vec<_>>(),
                stroke.start_delay_ms,
                stroke.duration_ms
            ));
        }
        true
    }
}

struct StubSystem;

impl SystemDispatcher for StubSystem {
    fn send_intent(&mut self, intent: &IntentRequest) -> bool {
        let kind = if intent.broadcast { "broadcast" } else { "activity" };
        logger::info_p("stub", &format!("intent[{}](\"{}\", {:?})", kind, intent.action, intent.component));
        true
    }

    fn post_notification(&mut self, notification: &NotificationRequest) -> bool {
        logger::info_p("stub", &format!("notify(\"{}\", \"{}\")", notification.title, notification.message));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn replays_image_with_increasing_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        Bitmap::from_pixel(6, 3, Rgba([0, 0, 0, 255])).save(&path).unwrap();

        let mut p = platform(Some(path));
        p.frames.start().unwrap();
        let a = p.frames.capture_frame().unwrap().unwrap();
        let b = p.frames.capture_frame().unwrap().unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));
        assert_eq!(a.image.dimensions(), (6, 3));
        p.frames.stop();
        assert!(p.frames.capture_frame().unwrap().is_none());
    }

    #[test]
    fn unreadable_image_fails_start() {
        let mut p = platform(Some(PathBuf::from("/nonexistent/screen.png")));
        assert!(matches!(p.frames.start(), Err(EngineError::CaptureUnavailable(_))));
    }
}
