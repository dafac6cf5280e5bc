use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::bitmaps::{BitmapCache, BitmapLoader};
use crate::debug::{DebugRecord, DebugSink, NullSink};
use crate::error::EngineError;
use crate::evaluator::ConditionEvaluator;
use crate::executor::ActionExecutor;
use crate::gesture::{GestureSynthesizer, UnblockScheduler};
use crate::logger;
use crate::matcher::{NccMatcher, TemplateMatcher};
use crate::model::Scenario;
use crate::platform::{FrameSource, Platform};
use crate::processor::{ScenarioProcessor, TickOutcome};
use crate::sleep::CancelToken;
use crate::state::ProcessingState;
use crate::types::{EngineState, StopReason};
use crate::validate;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum time between tick starts.
    pub tick_interval: Duration,
    pub bitmap_cache_bytes: usize,
    pub observe_all_conditions: bool,
    pub unblock_workaround: bool,
    pub allow_negative_counters: bool,
    pub random_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            bitmap_cache_bytes: 64 * 1024 * 1024,
            observe_all_conditions: false,
            unblock_workaround: false,
            allow_negative_counters: false,
            random_seed: None,
        }
    }
}

/// A scenario ready to run. Consumed by [`ScenarioEngine::start`]; a new run
/// needs a new engine.
pub struct ScenarioEngine {
    scenario: Scenario,
    config: EngineConfig,
    platform: Platform,
    loader: Box<dyn BitmapLoader>,
    matcher: Box<dyn TemplateMatcher>,
    sink: Box<dyn DebugSink>,
}

impl ScenarioEngine {
    pub fn new(scenario: Scenario, config: EngineConfig, platform: Platform, loader: Box<dyn BitmapLoader>) -> Self {
        Self {
            scenario,
            config,
            platform,
            loader,
            matcher: Box::new(NccMatcher::new()),
            sink: Box::new(NullSink),
        }
    }

    pub fn with_matcher(mut self, matcher: Box<dyn TemplateMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn DebugSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> EngineState {
        EngineState::Idle
    }

    /// Validate the scenario, acquire the frame source and spawn the processing
    /// thread.
    ///
    /// An invalid scenario is an error. A frame source that cannot start yields
    /// a handle that is already stopped with [`StopReason::Error`].
    pub fn start(self) -> Result<EngineHandle, EngineError> {
        validate::validate(&self.scenario)?;
        let ScenarioEngine { scenario, config, platform, loader, matcher, mut sink } = self;
        let Platform { mut frames, gestures, system } = platform;

        let shared = Arc::new(Shared::default());
        let cancel = CancelToken::new();
        let (broadcast_tx, broadcast_rx) = mpsc::channel();

        if let Err(e) = frames.start() {
            logger::error_p("engine", &format!("cannot start {}: {}", scenario.name, e));
            let reason = StopReason::Error(e.to_string());
            sink.record(DebugRecord::SessionEnded { reason: e.to_string() });
            shared.set_state(EngineState::Stopped(reason.clone()));
            return Ok(EngineHandle { shared, cancel, broadcast_tx, thread: None, early_stop: Some(reason) });
        }

        let seed = config.random_seed.unwrap_or_else(clock_seed);
        let state = ProcessingState::new(&scenario, config.allow_negative_counters);
        let cache = BitmapCache::new(loader, config.bitmap_cache_bytes);
        let evaluator =
            ConditionEvaluator::new(cache, matcher, scenario.detection_quality, config.observe_all_conditions);
        let executor = ActionExecutor::new(
            gestures,
            system,
            GestureSynthesizer::new(seed, scenario.randomize),
            UnblockScheduler::new(config.unblock_workaround),
            cancel.clone(),
        );

        sink.record(DebugRecord::SessionStarted {
            scenario_id: scenario.id,
            scenario_name: scenario.name.clone(),
            event_names: scenario.events.iter().map(|e| (e.id, e.name.clone())).collect::<BTreeMap<_, _>>(),
            enabled: state.enabled_snapshot(),
        });
        logger::info_p("engine", &format!("starting {} ({} events)", scenario.name, scenario.events.len()));

        let run = RunLoop {
            processor: ScenarioProcessor::new(Arc::new(scenario), evaluator, executor, state),
            frames,
            sink,
            interval: config.tick_interval,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            broadcasts: broadcast_rx,
        };
        shared.set_state(EngineState::Running);
        let thread = thread::Builder::new()
            .name("autotap-engine".into())
            .spawn(move || run.run())
            .map_err(|e| EngineError::CaptureUnavailable(format!("cannot spawn processing thread: {e}")))?;

        Ok(EngineHandle { shared, cancel, broadcast_tx, thread: Some(thread), early_stop: None })
    }
}

fn clock_seed() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// State shared between the handle and the processing thread.
#[derive(Default)]
struct Shared {
    state: Mutex<EngineState>,
    /// Pause flag; the condvar wakes the loop on resume and on stop.
    paused: Mutex<bool>,
    resume: Condvar,
}

impl Shared {
    fn state(&self) -> EngineState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Block while paused. Returns early once `cancel` is raised.
    fn wait_while_paused(&self, cancel: &CancelToken) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !cancel.is_cancelled() {
            paused = self.resume.wait(paused).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set_paused(&self, value: bool) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = value;
        self.resume.notify_all();
    }
}

/// Control side of a running scenario.
pub struct EngineHandle {
    shared: Arc<Shared>,
    cancel: CancelToken,
    broadcast_tx: Sender<String>,
    thread: Option<JoinHandle<StopReason>>,
    /// Set when the run never started.
    early_stop: Option<StopReason>,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Suspend processing after the current tick.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != EngineState::Running {
            return Err(EngineError::transition(&state, &EngineState::Paused));
        }
        *state = EngineState::Paused;
        drop(state);
        self.shared.set_paused(true);
        logger::info_p("engine", "paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != EngineState::Paused {
            return Err(EngineError::transition(&state, &EngineState::Running));
        }
        *state = EngineState::Running;
        drop(state);
        self.shared.set_paused(false);
        logger::info_p("engine", "resumed");
        Ok(())
    }

    /// Request a stop. Pending pauses and waits return immediately; no tick
    /// starts afterwards. Stopping a stopped run does nothing.
    pub fn stop(&self) {
        self.cancel.cancel();
        // Wake a paused loop; it re-checks the token under the pause lock.
        self.shared.set_paused(false);
    }

    /// Deliver a broadcast to the next trigger pass.
    pub fn broadcast(&self, action: &str) {
        self.broadcast_tx.send(action.to_string()).ok();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the processing thread and return why it stopped.
    pub fn join(mut self) -> StopReason {
        if let Some(reason) = self.early_stop.take() {
            return reason;
        }
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(reason)) => reason,
            Some(Err(_)) => {
                let reason = StopReason::Error("processing thread panicked".into());
                self.shared.set_state(EngineState::Stopped(reason.clone()));
                reason
            }
            None => StopReason::Requested,
        }
    }

    pub fn stop_and_join(self) -> StopReason {
        self.stop();
        self.join()
    }
}

struct RunLoop {
    processor: ScenarioProcessor,
    frames: Box<dyn FrameSource>,
    sink: Box<dyn DebugSink>,
    interval: Duration,
    shared: Arc<Shared>,
    cancel: CancelToken,
    broadcasts: Receiver<String>,
}

impl RunLoop {
    fn run(mut self) -> StopReason {
        let reason = self.tick_until_stopped();
        self.frames.stop();

        let label = match &reason {
            StopReason::Requested => "requested".to_string(),
            StopReason::AllEventsDisabled => "all events disabled".to_string(),
            StopReason::Error(e) => format!("error: {e}"),
        };
        match &reason {
            StopReason::Error(_) => logger::error_p("engine", &format!("stopped after {} ticks, {}", self.processor.ticks(), label)),
            _ => logger::info_p("engine", &format!("stopped after {} ticks, {}", self.processor.ticks(), label)),
        }
        self.sink.record(DebugRecord::SessionEnded { reason: label });
        self.shared.set_state(EngineState::Stopped(reason.clone()));
        reason
    }

    fn tick_until_stopped(&mut self) -> StopReason {
        loop {
            self.shared.wait_while_paused(&self.cancel);
            if self.cancel.is_cancelled() {
                return StopReason::Requested;
            }
            let started = Instant::now();

            for action in self.broadcasts.try_iter() {
                self.processor.state_mut().push_broadcast(action);
            }

            let frame = match self.frames.capture_frame() {
                Ok(frame) => frame,
                Err(e) => return StopReason::Error(e.to_string()),
            };

            match self.processor.process_tick(frame.as_ref(), self.sink.as_mut()) {
                TickOutcome::Continue => {}
                TickOutcome::AllEventsDisabled => return StopReason::AllEventsDisabled,
                TickOutcome::Cancelled => return StopReason::Requested,
            }

            let elapsed = started.elapsed();
            if elapsed < self.interval && !self.cancel.sleep(self.interval - elapsed) {
                return StopReason::Requested;
            }
        }
    }
}
