use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;

use crate::bitmaps::FsBitmapLoader;
use crate::debug::{self, DebugReceiver, LiveSnapshot, ReportRecorder};
use crate::engine::{EngineHandle, ScenarioEngine};
use crate::loader::{self, ScenarioEntry};
use crate::logger;
use crate::model::Scenario;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::types::{Command, EngineState, StopReason};

/// What the TUI shows. Written by the supervisor thread only.
#[derive(Debug, Default)]
pub struct SupervisorState {
    pub entries: Vec<ScenarioEntry>,
    pub selected: usize,
    /// Name of the scenario the engine state belongs to.
    pub active: Option<String>,
    pub engine: EngineState,
    pub live: LiveSnapshot,
    pub dropped_records: u64,
    pub last_report: Option<PathBuf>,
}

impl SupervisorState {
    pub fn new(entries: Vec<ScenarioEntry>, last_scenario: Option<&str>) -> Self {
        let selected = last_scenario
            .and_then(|name| entries.iter().position(|e| e.name == name))
            .unwrap_or(0);
        Self { entries, selected, ..Self::default() }
    }

    pub fn selected_entry(&self) -> Option<&ScenarioEntry> {
        self.entries.get(self.selected)
    }
}

/// Builds the host collaborators for each new run.
pub type PlatformFactory = Box<dyn FnMut() -> Platform + Send>;

#[derive(Debug, Clone)]
pub struct SupervisorPaths {
    pub scenarios: PathBuf,
    pub logs: PathBuf,
    pub settings: PathBuf,
}

struct Run {
    name: String,
    handle: EngineHandle,
    debug: DebugReceiver,
    report: Option<ReportRecorder>,
}

/// Owns the current engine run and applies TUI commands to it.
pub struct Supervisor {
    shared: Arc<Mutex<SupervisorState>>,
    settings: Settings,
    paths: SupervisorPaths,
    platforms: PlatformFactory,
    run: Option<Run>,
}

impl Supervisor {
    pub fn new(
        shared: Arc<Mutex<SupervisorState>>,
        settings: Settings,
        paths: SupervisorPaths,
        platforms: PlatformFactory,
    ) -> Self {
        Self { shared, settings, paths, platforms, run: None }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Main loop. Runs on a background thread until `Quit`.
    pub fn supervise(mut self, cmd_rx: mpsc::Receiver<Command>) {
        loop {
            while let Ok(cmd) = cmd_rx.try_recv() {
                if !self.handle(cmd) {
                    return;
                }
            }
            self.poll();
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Apply one command. Returns false on `Quit`.
    pub fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Quit => {
                logger::info("shutting down");
                if let Some(run) = self.run.as_ref() {
                    run.handle.stop();
                }
                self.finish_run();
                return false;
            }
            Command::Select(idx) => {
                let mut state = self.lock();
                if idx < state.entries.len() {
                    state.selected = idx;
                }
            }
            Command::StartStop => match self.run.as_ref() {
                Some(run) => {
                    logger::info(&format!("stopping {}", run.name));
                    run.handle.stop();
                }
                None => self.start_selected(),
            },
            Command::PauseResume => {
                let Some(run) = self.run.as_ref() else { return true };
                let result = match run.handle.state() {
                    EngineState::Paused => run.handle.resume(),
                    _ => run.handle.pause(),
                };
                if let Err(e) = result {
                    logger::warn(&e.to_string());
                }
                let engine = run.handle.state();
                self.lock().engine = engine;
            }
            Command::Reload => {
                if self.run.is_some() {
                    logger::warn("stop the running scenario before reloading");
                    return true;
                }
                let entries = loader::load_scenarios(&self.paths.scenarios);
                logger::info(&format!("reloaded {} scenario(s)", entries.len()));
                let mut state = self.lock();
                let previous = state.selected_entry().map(|e| e.name.clone());
                state.selected = previous
                    .and_then(|name| entries.iter().position(|e| e.name == name))
                    .unwrap_or(0);
                state.entries = entries;
            }
        }
        true
    }

    /// Forward debug records to the live view and reap a finished run.
    pub fn poll(&mut self) {
        let Some(run) = self.run.as_mut() else { return };
        let records = run.debug.drain();
        if let Some(report) = run.report.as_mut() {
            records.iter().for_each(|r| report.observe(r));
        }
        let engine = run.handle.state();
        let dropped = run.debug.dropped();
        let finished = run.handle.is_finished();
        {
            let mut state = self.lock();
            records.iter().for_each(|r| state.live.apply(r));
            state.engine = engine;
            state.dropped_records = dropped;
        }
        if finished {
            self.finish_run();
        }
    }

    fn start_selected(&mut self) {
        let entry = {
            let state = self.lock();
            state.selected_entry().cloned()
        };
        let Some(entry) = entry else {
            logger::warn("no scenario selected");
            return;
        };
        let Some(scenario) = entry.scenario.as_ref() else {
            logger::error(&format!("{} did not load: {}", entry.name, entry.error.as_deref().unwrap_or("unknown error")));
            return;
        };

        let (sink, debug) = debug::channel(self.settings.debug_channel_capacity);
        let engine = ScenarioEngine::new(
            Scenario::clone(scenario),
            self.settings.engine_config(),
            (self.platforms)(),
            Box::new(FsBitmapLoader::new(&entry.dir)),
        )
        .with_sink(Box::new(sink));

        match engine.start() {
            Ok(handle) => {
                logger::info(&format!("started {}", entry.name));
                {
                    let mut state = self.lock();
                    state.active = Some(entry.name.clone());
                    state.engine = handle.state();
                    state.live = LiveSnapshot::default();
                    state.dropped_records = 0;
                }
                let report = self.settings.debug_report.then(ReportRecorder::new);
                self.run = Some(Run { name: entry.name.clone(), handle, debug, report });
                self.settings.last_scenario = Some(entry.name);
                self.settings.save(&self.paths.settings);
            }
            Err(e) => logger::error(&format!("cannot start {}: {}", entry.name, e)),
        }
    }

    fn finish_run(&mut self) {
        let Some(mut run) = self.run.take() else { return };
        let records = run.debug.drain();
        let reason = run.handle.join();
        // The loop's final records arrive after the join.
        let records = records.into_iter().chain(run.debug.drain()).collect::<Vec<_>>();

        let mut report_path = None;
        if let Some(mut report) = run.report.take() {
            records.iter().for_each(|r| report.observe(r));
            let path = report_file(&self.paths.logs, &run.name);
            match report.finish(run.debug.dropped()).write_json(&path) {
                Ok(()) => {
                    logger::info(&format!("report written to {}", path.display()));
                    report_path = Some(path);
                }
                Err(e) => logger::error(&format!("cannot write report: {:#}", e)),
            }
        }

        let mut state = self.lock();
        records.iter().for_each(|r| state.live.apply(r));
        state.engine = EngineState::Stopped(reason.clone());
        state.dropped_records = run.debug.dropped();
        if report_path.is_some() {
            state.last_report = report_path;
        }
        drop(state);

        match reason {
            StopReason::Error(e) => logger::error(&format!("{} stopped: {}", run.name, e)),
            _ => logger::info(&format!("{} stopped", run.name)),
        }
    }
}

fn report_file(logs: &Path, name: &str) -> PathBuf {
    let stem = name.replace('/', "-");
    logs.join(format!("report-{}-{}.json", stem, Local::now().format("%Y%m%d-%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::JSON_FILE;
    use crate::platform::mock::{self, Recorder, ScriptedFrames};
    use std::time::Instant;

    const TAP_JSON: &str = r#"{
  "id": 3,
  "name": "tap",
  "events": [{
    "id": 1, "name": "tap", "kind": "trigger", "operator": "all",
    "conditions": [{ "id": 1, "type": "trigger", "trigger": "counter_reached",
                     "counter": "taps", "comparison": "lower", "operand": { "number": 3 } }],
    "actions": [
      { "id": 1, "order": 0, "type": "click", "target": { "on": "fixed", "x": 5, "y": 6 }, "press_duration_ms": 1 },
      { "id": 2, "order": 1, "type": "change_counter", "counter": "taps", "operation": "add", "operand": { "number": 1 } }
    ]
  }]
}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: SupervisorPaths,
        shared: Arc<Mutex<SupervisorState>>,
        recorder: Arc<Mutex<Option<Recorder>>>,
    }

    fn fixture() -> (Fixture, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let scenarios = dir.path().join("scenarios");
        std::fs::create_dir_all(scenarios.join("tap")).unwrap();
        std::fs::write(scenarios.join("tap").join(JSON_FILE), TAP_JSON).unwrap();
        let paths = SupervisorPaths {
            scenarios: scenarios.clone(),
            logs: dir.path().to_path_buf(),
            settings: dir.path().join("settings.json"),
        };
        let shared = Arc::new(Mutex::new(SupervisorState::new(loader::load_scenarios(&scenarios), None)));
        let recorder = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&recorder);
        let settings = Settings { tick_interval_ms: 2, debug_report: true, random_seed: Some(3), ..Settings::default() };
        let supervisor = Supervisor::new(
            Arc::clone(&shared),
            settings,
            paths.clone(),
            Box::new(move || {
                let (platform, rec) = mock::platform(ScriptedFrames::empty());
                *slot.lock().unwrap() = Some(rec);
                platform
            }),
        );
        (Fixture { _dir: dir, paths, shared, recorder }, supervisor)
    }

    fn poll_until(supervisor: &mut Supervisor, mut done: impl FnMut(&SupervisorState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            supervisor.poll();
            if done(&supervisor.shared.lock().unwrap()) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn run_feeds_live_view_and_writes_report() {
        let (fx, mut supervisor) = fixture();
        supervisor.handle(Command::StartStop);
        assert!(supervisor.is_running());
        assert_eq!(fx.shared.lock().unwrap().active.as_deref(), Some("tap"));

        poll_until(&mut supervisor, |s| s.live.counters.get("taps") == Some(&3));
        supervisor.handle(Command::StartStop);
        poll_until(&mut supervisor, |s| matches!(s.engine, EngineState::Stopped(_)));
        assert!(!supervisor.is_running());

        let recorder = fx.recorder.lock().unwrap().clone().unwrap();
        assert_eq!(recorder.gestures().len(), 3);

        let state = fx.shared.lock().unwrap();
        assert_eq!(state.engine, EngineState::Stopped(StopReason::Requested));
        let report = state.last_report.clone().unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(json["scenario_name"], "tap");
        assert_eq!(json["counters"]["taps"], 3);

        let saved = Settings::load(&fx.paths.settings);
        assert_eq!(saved.last_scenario.as_deref(), Some("tap"));
    }

    #[test]
    fn pause_toggles_and_quit_stops_the_run() {
        let (fx, mut supervisor) = fixture();
        supervisor.handle(Command::PauseResume);
        assert_eq!(fx.shared.lock().unwrap().engine, EngineState::Idle);

        supervisor.handle(Command::StartStop);
        supervisor.handle(Command::PauseResume);
        assert_eq!(fx.shared.lock().unwrap().engine, EngineState::Paused);
        supervisor.handle(Command::PauseResume);
        assert_eq!(fx.shared.lock().unwrap().engine, EngineState::Running);

        assert!(!supervisor.handle(Command::Quit));
        assert!(matches!(fx.shared.lock().unwrap().engine, EngineState::Stopped(_)));
    }

    #[test]
    fn reload_keeps_selection_by_name() {
        let (fx, mut supervisor) = fixture();
        std::fs::create_dir_all(fx.paths.scenarios.join("aaa")).unwrap();
        std::fs::write(fx.paths.scenarios.join("aaa").join(JSON_FILE), TAP_JSON).unwrap();

        supervisor.handle(Command::Reload);
        let state = fx.shared.lock().unwrap();
        let names: Vec<&str> = state.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "tap"]);
        assert_eq!(state.selected_entry().unwrap().name, "tap");
    }

    #[test]
    fn broken_scenario_does_not_start() {
        let (fx, mut supervisor) = fixture();
        std::fs::write(fx.paths.scenarios.join("tap").join(JSON_FILE), "{").unwrap();
        supervisor.handle(Command::Reload);
        supervisor.handle(Command::StartStop);
        assert!(!supervisor.is_running());
        assert!(fx.shared.lock().unwrap().entries[0].error.is_some());
    }
}
