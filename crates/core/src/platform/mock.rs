//! In-memory collaborators for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::bitmaps::BitmapLoader;
use crate::error::{BitmapError, EngineError};
use crate::gesture::GestureDescription;
use crate::matcher::{MatchOutcome, TemplateMatcher};
use crate::scaling::ScaledFrame;
use crate::types::{Bitmap, Frame, Point, Rect};
use super::{FrameSource, GestureDispatcher, IntentRequest, NotificationRequest, Platform, SystemDispatcher};

/// Everything the mock dispatchers received. Clones share the same log.
#[derive(Clone, Default)]
pub struct Recorder {
    gestures: Arc<Mutex<Vec<GestureDescription>>>,
    intents: Arc<Mutex<Vec<IntentRequest>>>,
    notifications: Arc<Mutex<Vec<NotificationRequest>>>,
    fail_gestures: Arc<AtomicBool>,
    fail_system: Arc<AtomicBool>,
}

impl Recorder {
    pub fn gestures(&self) -> Vec<GestureDescription> {
        self.gestures.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn intents(&self) -> Vec<IntentRequest> {
        self.intents.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn notifications(&self) -> Vec<NotificationRequest> {
        self.notifications.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// First point of every dispatched stroke.
    pub fn tap_points(&self) -> Vec<Point> {
        self.gestures()
            .iter()
            .flat_map(|g| g.strokes.iter().filter_map(|s| s.path.first().copied()))
            .collect()
    }

    pub fn fail_gestures(&self, fail: bool) {
        self.fail_gestures.store(fail, Ordering::SeqCst);
    }

    pub fn fail_system(&self, fail: bool) {
        self.fail_system.store(fail, Ordering::SeqCst);
    }
}

pub struct RecordingGestures(Recorder);

impl GestureDispatcher for RecordingGestures {
    fn dispatch(&mut self, gesture: &GestureDescription) -> bool {
        if self.0.fail_gestures.load(Ordering::SeqCst) {
            return false;
        }
        self.0.gestures.lock().unwrap_or_else(PoisonError::into_inner).push(gesture.clone());
        true
    }
}

pub struct RecordingSystem(Recorder);

impl SystemDispatcher for RecordingSystem {
    fn send_intent(&mut self, intent: &IntentRequest) -> bool {
        if self.0.fail_system.load(Ordering::SeqCst) {
            return false;
        }
        self.0.intents.lock().unwrap_or_else(PoisonError::into_inner).push(intent.clone());
        true
    }

    fn post_notification(&mut self, notification: &NotificationRequest) -> bool {
        if self.0.fail_system.load(Ordering::SeqCst) {
            return false;
        }
        self.0.notifications.lock().unwrap_or_else(PoisonError::into_inner).push(notification.clone());
        true
    }
}

/// Frame source returning the same image on every capture.
pub struct ScriptedFrames {
    image: Option<Bitmap>,
    seq: u64,
    unavailable: Option<String>,
    lost_after: Option<u64>,
    captures: Arc<AtomicUsize>,
}

impl ScriptedFrames {
    pub fn repeating(image: Bitmap) -> Self {
        Self { image: Some(image), seq: 0, unavailable: None, lost_after: None, captures: Arc::default() }
    }

    /// Source that never has a frame ready.
    pub fn empty() -> Self {
        Self { image: None, seq: 0, unavailable: None, lost_after: None, captures: Arc::default() }
    }

    /// Source whose `start` fails.
    pub fn unavailable(reason: &str) -> Self {
        Self { unavailable: Some(reason.to_string()), ..Self::empty() }
    }

    /// Fail every capture after `frames` successful ones.
    pub fn lost_after(mut self, frames: u64) -> Self {
        self.lost_after = Some(frames);
        self
    }

    /// Shared count of `capture_frame` calls.
    pub fn capture_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.captures)
    }
}

impl FrameSource for ScriptedFrames {
    fn start(&mut self) -> Result<(), EngineError> {
        match &self.unavailable {
            Some(reason) => Err(EngineError::CaptureUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn capture_frame(&mut self) -> Result<Option<Frame>, EngineError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.lost_after.is_some_and(|n| self.seq >= n) {
            return Err(EngineError::CaptureLost("scripted source ended".into()));
        }
        let Some(image) = &self.image else { return Ok(None) };
        self.seq += 1;
        Ok(Some(Frame::new(self.seq, image.clone())))
    }

    fn stop(&mut self) {}
}

/// Platform backed by `frames` and recording dispatchers.
pub fn platform(frames: ScriptedFrames) -> (Platform, Recorder) {
    let recorder = Recorder::default();
    let platform = Platform::new(
        Box::new(frames),
        Box::new(RecordingGestures(recorder.clone())),
        Box::new(RecordingSystem(recorder.clone())),
    );
    (platform, recorder)
}

/// Matcher answering with a confidence chosen per reference size.
///
/// The reported position is the center of the searched area. Sizes without a
/// score match at 0.
#[derive(Clone, Default)]
pub struct ScriptedMatcher {
    scores: Arc<Mutex<HashMap<(u32, u32), f64>>>,
}

impl ScriptedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, size: (u32, u32), confidence: f64) {
        self.scores.lock().unwrap_or_else(PoisonError::into_inner).insert(size, confidence);
    }
}

impl TemplateMatcher for ScriptedMatcher {
    fn find(&mut self, _frame: &ScaledFrame, template: &Bitmap, area: Rect) -> MatchOutcome {
        let confidence = self
            .scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&template.dimensions())
            .copied()
            .unwrap_or(0.0);
        MatchOutcome { confidence, position: Some(area.center()) }
    }
}

/// Produces blank bitmaps of the requested size, except for paths marked missing.
#[derive(Default)]
pub struct MemoryBitmapLoader {
    missing: HashSet<String>,
    loads: Arc<AtomicUsize>,
}

impl MemoryBitmapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(mut self, path: &str) -> Self {
        self.missing.insert(path.to_string());
        self
    }

    pub fn load_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }
}

impl BitmapLoader for MemoryBitmapLoader {
    fn load(&self, path: &str, size: Option<(u32, u32)>) -> Result<Bitmap, BitmapError> {
        if self.missing.contains(path) {
            return Err(BitmapError::NotFound(PathBuf::from(path)));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let (width, height) = size.unwrap_or((1, 1));
        Ok(Bitmap::new(width, height))
    }
}
