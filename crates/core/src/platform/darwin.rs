use std::process::{Command as ProcessCommand, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use core_foundation::array::CFArray;
use core_foundation::base::TCFType;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_graphics::display::CGDisplay;
use core_graphics::event::*;
use core_graphics::event_source::*;
use core_graphics::geometry::*;
use core_graphics::image::CGImage;
use core_graphics::window::*;
use regex::Regex;

use crate::error::EngineError;
use crate::gesture::{GestureDescription, Stroke};
use crate::logger;
use crate::types::{Bitmap, Frame, Point, Rect};
use super::{FrameSource, GestureDispatcher, IntentRequest, NotificationRequest, Platform, SystemDispatcher};

/// Captured window, shared so gestures land relative to what was captured.
#[derive(Debug, Clone, Copy)]
struct Window {
    id: CGWindowID,
    bounds: Rect,
}

type SharedWindow = Arc<Mutex<Option<Window>>>;

/// Capture the first on-screen window whose title or owner matches
/// `window_pattern`, or the main display when the pattern is empty.
pub fn platform(window_pattern: &str) -> Platform {
    let window: SharedWindow = Arc::new(Mutex::new(None));
    Platform::new(
        Box::new(DarwinFrames { pattern: window_pattern.to_string(), window: Arc::clone(&window), seq: 0 }),
        Box::new(DarwinGestures { window }),
        Box::new(DarwinSystem),
    )
}

struct DarwinFrames {
    pattern: String,
    window: SharedWindow,
    seq: u64,
}

impl DarwinFrames {
    fn set_window(&self, window: Option<Window>) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = window;
    }

    fn current_window(&self) -> Option<Window> {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSource for DarwinFrames {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.pattern.is_empty() {
            logger::info_p("darwin", "capturing main display");
            self.set_window(None);
            return Ok(());
        }
        let re = Regex::new(&format!("(?i){}", self.pattern))
            .map_err(|e| EngineError::CaptureUnavailable(format!("invalid pattern '{}': {}", self.pattern, e)))?;
        let (window, title) = find_window(|name, owner, _| re.is_match(name) || re.is_match(owner))
            .ok_or_else(|| EngineError::CaptureUnavailable(format!("no window matches '{}'", self.pattern)))?;
        logger::info_p("darwin", &format!("capturing \"{}\" (id: {})", title, window.id));
        self.set_window(Some(window));
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Option<Frame>, EngineError> {
        let image = match self.current_window() {
            None => CGDisplay::main().image(),
            Some(window) => {
                // Window may have moved since the last frame.
                let (window, _) = find_window(|_, _, id| id == window.id)
                    .ok_or_else(|| EngineError::CaptureLost(format!("window {} closed", window.id)))?;
                self.set_window(Some(window));
                let b = window.bounds;
                let rect = CGRect::new(
                    &CGPoint::new(b.left as f64, b.top as f64),
                    &CGSize::new(b.width as f64, b.height as f64),
                );
                create_image(
                    rect,
                    kCGWindowListOptionIncludingWindow,
                    window.id,
                    kCGWindowImageBoundsIgnoreFraming | kCGWindowImageNominalResolution,
                )
            }
        };
        // A missed capture is transient; the next tick retries.
        let Some(image) = image else { return Ok(None) };
        let Some(bitmap) = to_bitmap(&image) else { return Ok(None) };
        self.seq += 1;
        Ok(Some(Frame::new(self.seq, bitmap)))
    }

    fn stop(&mut self) {
        logger::info_p("darwin", &format!("capture stopped after {} frames", self.seq));
        self.set_window(None);
    }
}

/// BGRA rows, possibly padded, to a tightly packed RGBA bitmap.
fn to_bitmap(image: &CGImage) -> Option<Bitmap> {
    let width = image.width() as u32;
    let height = image.height() as u32;
    let bpr = image.bytes_per_row();
    if width == 0 || height == 0 || image.bits_per_pixel() != 32 {
        return None;
    }
    let data = image.data();
    let bytes = data.bytes();
    let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
    for row in bytes.chunks(bpr).take(height as usize) {
        for px in row[..width as usize * 4].chunks_exact(4) {
            rgba.extend_from_slice(&[px[2], px[1], px[0], 255]);
        }
    }
    Bitmap::from_raw(width, height, rgba)
}

/// First on-screen, normal-layer window accepted by `matches(name, owner, id)`.
fn find_window(matches: impl Fn(&str, &str, CGWindowID) -> bool) -> Option<(Window, String)> {
    unsafe {
        let option = kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements;
        let window_list_ref = CGWindowListCopyWindowInfo(option, kCGNullWindowID);
        if window_list_ref.is_null() {
            logger::warn_p("darwin", "failed to get window list");
            return None;
        }

        let list: CFArray = CFArray::wrap_under_create_rule(window_list_ref as _);
        for dict_ptr in &list.get_all_values() {
            let dict: CFDictionary<CFString, *const std::ffi::c_void> =
                CFDictionary::wrap_under_get_rule(*dict_ptr as _);

            let name = get_cf_string(&dict, "kCGWindowName").unwrap_or_default();
            let owner = get_cf_string(&dict, "kCGWindowOwnerName").unwrap_or_default();
            let layer = get_cf_number(&dict, "kCGWindowLayer");
            let Some(id) = get_cf_number(&dict, "kCGWindowNumber").map(|v| v as CGWindowID) else { continue };
            if layer != Some(0) || !matches(&name, &owner, id) {
                continue;
            }
            let Some(bounds) = get_cf_dict(&dict, "kCGWindowBounds") else { continue };
            let bounds = Rect::new(
                get_cf_number(&bounds, "X").unwrap_or(0) as i32,
                get_cf_number(&bounds, "Y").unwrap_or(0) as i32,
                get_cf_number(&bounds, "Width").unwrap_or(0).max(0) as u32,
                get_cf_number(&bounds, "Height").unwrap_or(0).max(0) as u32,
            );
            let title = if name.is_empty() { owner } else { name };
            return Some((Window { id, bounds }, title));
        }
        None
    }
}

struct DarwinGestures {
    window: SharedWindow,
}

impl DarwinGestures {
    fn origin(&self) -> Point {
        match *self.window.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(w) => Point::new(w.bounds.left, w.bounds.top),
            None => Point::default(),
        }
    }

    fn stroke(&self, source: &CGEventSource, stroke: &Stroke, origin: Point) -> bool {
        let points: Vec<CGPoint> = stroke
            .path
            .iter()
            .map(|p| CGPoint::new((origin.x + p.x) as f64, (origin.y + p.y) as f64))
            .collect();
        let (Some(first), Some(last)) = (points.first(), points.last()) else { return false };

        let post = |kind: CGEventType, at: CGPoint| match CGEvent::new_mouse_event(source.clone(), kind, at, CGMouseButton::Left) {
            Ok(event) => {
                event.post(CGEventTapLocation::HID);
                true
            }
            Err(_) => false,
        };

        if !post(CGEventType::LeftMouseDown, *first) {
            return false;
        }
        let steps = points.len().saturating_sub(1).max(1) as u64;
        let step = Duration::from_millis(stroke.duration_ms / steps);
        for at in points.iter().skip(1) {
            thread::sleep(step);
            post(CGEventType::LeftMouseDragged, *at);
        }
        if points.len() == 1 {
            thread::sleep(Duration::from_millis(stroke.duration_ms));
        }
        post(CGEventType::LeftMouseUp, *last)
    }
}

impl GestureDispatcher for DarwinGestures {
    fn dispatch(&mut self, gesture: &GestureDescription) -> bool {
        let Ok(source) = CGEventSource::new(CGEventSourceStateID::HIDSystemState) else {
            logger::error_p("darwin", "cannot create event source");
            return false;
        };
        let origin = self.origin();
        let mut strokes: Vec<&Stroke> = gesture.strokes.iter().collect();
        strokes.sort_by_key(|s| s.start_delay_ms);

        // Mouse input cannot overlap, so strokes run one after another.
        let started = Instant::now();
        for stroke in strokes {
            let due = Duration::from_millis(stroke.start_delay_ms);
            if let Some(wait) = due.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
            if !self.stroke(&source, stroke, origin) {
                return false;
            }
        }
        true
    }
}

struct DarwinSystem;

fn run_quiet(cmd: &mut ProcessCommand) -> bool {
    cmd.stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn applescript_string(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

impl SystemDispatcher for DarwinSystem {
    /// Activities open through LaunchServices: `component` is a bundle id,
    /// `action` a URL or path. Broadcasts have no system counterpart.
    fn send_intent(&mut self, intent: &IntentRequest) -> bool {
        if intent.broadcast {
            logger::debug_p("darwin", &format!("broadcast \"{}\" stays in-process", intent.action));
            return true;
        }
        let mut cmd = ProcessCommand::new("open");
        if let Some(bundle) = &intent.component {
            cmd.arg("-b").arg(bundle);
        }
        cmd.arg(&intent.action);
        let ok = run_quiet(&mut cmd);
        if !ok {
            logger::warn_p("darwin", &format!("open {} failed", intent.action));
        }
        ok
    }

    fn post_notification(&mut self, notification: &NotificationRequest) -> bool {
        let script = format!(
            "display notification {} with title {}",
            applescript_string(&notification.message),
            applescript_string(&notification.title),
        );
        run_quiet(ProcessCommand::new("osascript").arg("-e").arg(&script))
    }
}

// --- CF Dictionary helpers ---

unsafe fn get_cf_string(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<String> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    let cf_str: CFString = CFString::wrap_under_get_rule(*value as _);
    Some(cf_str.to_string())
}

unsafe fn get_cf_number(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<i64> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    let cf_num: CFNumber = CFNumber::wrap_under_get_rule(*value as _);
    cf_num.to_i64()
}

unsafe fn get_cf_dict(
    dict: &CFDictionary<CFString, *const std::ffi::c_void>,
    key: &str,
) -> Option<CFDictionary<CFString, *const std::ffi::c_void>> {
    let cf_key = CFString::new(key);
    let value = dict.find(&cf_key)?;
    Some(CFDictionary::wrap_under_get_rule(*value as _))
}
