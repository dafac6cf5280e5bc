pub mod mock;
pub mod stub;

#[cfg(target_os = "macos")]
pub mod darwin;

use std::path::PathBuf;

use serde::Serialize;

use crate::error::EngineError;
use crate::gesture::GestureDescription;
use crate::logger;
use crate::model::{Importance, IntentExtra};
use crate::types::Frame;

/// Screen capture provider.
pub trait FrameSource: Send {
    /// Acquire the capture. Fails with `CaptureUnavailable` when it cannot start.
    fn start(&mut self) -> Result<(), EngineError>;
    /// Latest frame, or `None` when no new frame is ready. Must return within a
    /// short bounded time. `Err` means the source is gone for good.
    fn capture_frame(&mut self) -> Result<Option<Frame>, EngineError>;
    fn stop(&mut self);
}

/// Input injection. Returns false when the gesture could not be performed.
pub trait GestureDispatcher: Send {
    fn dispatch(&mut self, gesture: &GestureDescription) -> bool;
}

/// Outbound intents and notifications. Returns false on delivery failure.
pub trait SystemDispatcher: Send {
    fn send_intent(&mut self, intent: &IntentRequest) -> bool;
    fn post_notification(&mut self, notification: &NotificationRequest) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentRequest {
    pub action: String,
    pub component: Option<String>,
    pub flags: u32,
    pub extras: Vec<IntentExtra>,
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRequest {
    /// Action id, so repeated posts from one action replace each other.
    pub id: i64,
    pub title: String,
    pub message: String,
    pub importance: Importance,
}

/// Host collaborators for one run.
pub struct Platform {
    pub frames: Box<dyn FrameSource>,
    pub gestures: Box<dyn GestureDispatcher>,
    pub system: Box<dyn SystemDispatcher>,
}

impl Platform {
    pub fn new(
        frames: Box<dyn FrameSource>,
        gestures: Box<dyn GestureDispatcher>,
        system: Box<dyn SystemDispatcher>,
    ) -> Self {
        Self { frames, gestures, system }
    }
}

/// How the host platform is chosen.
#[derive(Debug, Clone, Default)]
pub struct PlatformOptions {
    pub force_stub: bool,
    /// Stub frame source replays this image instead of producing no frames.
    pub stub_frame: Option<PathBuf>,
    /// Window title pattern for native capture. Empty captures the main display.
    pub window_pattern: String,
}

/// Create the platform appropriate for the current OS.
pub fn create_platform(options: &PlatformOptions) -> Platform {
    if options.force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return stub::platform(options.stub_frame.clone());
    }
    #[cfg(target_os = "macos")]
    {
        logger::register_prefix("darwin", logger::COLOR_GRAY);
        darwin::platform(&options.window_pattern)
    }
    #[cfg(not(target_os = "macos"))]
    {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        stub::platform(options.stub_frame.clone())
    }
}
