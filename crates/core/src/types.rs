use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Decoded RGBA pixels of a reference image or a screen capture.
pub type Bitmap = RgbaImage;

/// Screen coordinate in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, by: Option<Point>) -> Self {
        match by {
            Some(o) => Point::new(self.x.saturating_add(o.x), self.y.saturating_add(o.y)),
            None => self,
        }
    }
}

/// Screen-space rectangle, origin at top-left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    pub fn right(&self) -> i32 {
        self.left.saturating_add(self.width as i32)
    }

    pub fn bottom(&self) -> i32 {
        self.top.saturating_add(self.height as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.left + (self.width / 2) as i32,
            self.top + (self.height / 2) as i32,
        )
    }

    /// Intersection with `[0, width) x [0, height)`. Empty when fully outside.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let l = self.left.clamp(0, width as i32);
        let t = self.top.clamp(0, height as i32);
        let r = self.right().clamp(0, width as i32);
        let b = self.bottom().clamp(0, height as i32);
        Rect::new(l, t, (r - l).max(0) as u32, (b - t).max(0) as u32)
    }
}

/// One screen capture handed to the engine by a frame source.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the source, used for per-frame caches.
    pub seq: u64,
    pub image: Arc<Bitmap>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(seq: u64, image: Bitmap) -> Self {
        Self { seq, image: Arc::new(image), captured_at: Instant::now() }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width(), self.height())
    }
}

/// Lifecycle of one scenario run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped(StopReason),
}

impl EngineState {
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped(_) => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    AllEventsDisabled,
    Error(String),
}

/// Command from the TUI to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Select(usize),
    StartStop,
    PauseResume,
    Reload,
    Quit,
}
