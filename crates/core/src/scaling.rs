//! Detection-quality downscaling of frames and reference areas.

use std::sync::Arc;

use image::imageops::{self, FilterType};

use crate::types::{Bitmap, Frame, Point, Rect};

/// Factor applied to the frame so its longest side is at most `quality`.
/// Never upscales. `quality == 0` disables scaling.
pub fn scale_ratio(quality: u32, width: u32, height: u32) -> f64 {
    let longest = width.max(height);
    if quality == 0 || longest == 0 {
        return 1.0;
    }
    (quality as f64 / longest as f64).min(1.0)
}

pub fn scale_len(len: u32, ratio: f64) -> u32 {
    ((len as f64 * ratio).round() as u32).max(1)
}

pub fn scale_rect(rect: Rect, ratio: f64) -> Rect {
    if ratio == 1.0 {
        return rect;
    }
    Rect::new(
        (rect.left as f64 * ratio).round() as i32,
        (rect.top as f64 * ratio).round() as i32,
        scale_len(rect.width, ratio),
        scale_len(rect.height, ratio),
    )
}

/// Map a point from scaled frame coordinates back to screen coordinates.
pub fn unscale_point(p: Point, ratio: f64) -> Point {
    if ratio == 1.0 {
        return p;
    }
    Point::new((p.x as f64 / ratio).round() as i32, (p.y as f64 / ratio).round() as i32)
}

/// Frame at detection resolution.
#[derive(Clone)]
pub struct ScaledFrame {
    pub seq: u64,
    pub image: Arc<Bitmap>,
    pub ratio: f64,
}

/// Keeps the scaled version of the most recent frame so each frame is resized once.
#[derive(Default)]
pub struct FrameScaler {
    last: Option<ScaledFrame>,
}

impl FrameScaler {
    pub fn scale(&mut self, frame: &Frame, quality: u32) -> ScaledFrame {
        if let Some(last) = &self.last {
            if last.seq == frame.seq {
                return last.clone();
            }
        }
        let ratio = scale_ratio(quality, frame.width(), frame.height());
        let image = if ratio < 1.0 {
            let w = scale_len(frame.width(), ratio);
            let h = scale_len(frame.height(), ratio);
            Arc::new(imageops::resize(frame.image.as_ref(), w, h, FilterType::Triangle))
        } else {
            Arc::clone(&frame.image)
        };
        let scaled = ScaledFrame { seq: frame.seq, image, ratio };
        self.last = Some(scaled.clone());
        scaled
    }
}
