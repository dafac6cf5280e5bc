use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::counters::CounterStore;
use crate::debug::{DebugRecord, DebugSink};
use crate::evaluator::ConditionResults;
use crate::gesture::{GestureDescription, GestureSynthesizer, UnblockScheduler};
use crate::logger;
use crate::model::{
    Action, ActionId, ActionKind, ChangeCounter, Click, Event, Intent, Notification, NotificationMessage, Pause,
    Swipe, Target, ToggleEvent,
};
use crate::platform::{GestureDispatcher, IntentRequest, NotificationRequest, SystemDispatcher};
use crate::sleep::CancelToken;
use crate::state::ProcessingState;
use crate::types::Point;

/// Settle time after starting an activity.
pub const INTENT_ACTIVITY_DELAY_MS: u64 = 1000;
/// Settle time after sending a broadcast.
pub const INTENT_BROADCAST_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ActionOutcome {
    Done,
    /// Nothing was dispatched, e.g. the anchor condition was not detected.
    Skipped(String),
    Failed(String),
    /// The run was stopped while the action was in progress.
    Cancelled,
}

impl ActionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ActionOutcome::Done => "done",
            ActionOutcome::Skipped(_) => "skipped",
            ActionOutcome::Failed(_) => "failed",
            ActionOutcome::Cancelled => "cancelled",
        }
    }
}

/// What happened to one event's action list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub outcomes: Vec<(ActionId, ActionOutcome)>,
    /// True when a stop interrupted the list.
    pub cancelled: bool,
}

/// Per-call inputs of [`ActionExecutor::execute`].
pub struct ExecutionContext<'a> {
    pub tick: u64,
    pub event: &'a Event,
    pub results: &'a ConditionResults,
    pub state: &'a mut ProcessingState,
    pub sink: &'a mut dyn DebugSink,
}

/// Runs action lists sequentially on the processing thread.
pub struct ActionExecutor {
    gestures: Box<dyn GestureDispatcher>,
    system: Box<dyn SystemDispatcher>,
    synth: GestureSynthesizer,
    unblock: UnblockScheduler,
    cancel: CancelToken,
}

impl ActionExecutor {
    pub fn new(
        gestures: Box<dyn GestureDispatcher>,
        system: Box<dyn SystemDispatcher>,
        synth: GestureSynthesizer,
        unblock: UnblockScheduler,
        cancel: CancelToken,
    ) -> Self {
        Self { gestures, system, synth, unblock, cancel }
    }

    /// Execute `ctx.event`'s actions in order. A failing action never stops the
    /// list; a stop request does.
    pub fn execute(&mut self, ctx: ExecutionContext<'_>) -> ExecutionReport {
        let ExecutionContext { tick, event, results, state, sink } = ctx;
        let mut report = ExecutionReport::default();

        for action in event.ordered_actions() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.run(event, action, results, state, sink);
            match &outcome {
                ActionOutcome::Skipped(why) | ActionOutcome::Failed(why) => logger::warn_p(
                    "exec",
                    &format!("{} #{} {}: {}", event.name, action.id, outcome.label(), why),
                ),
                _ => {}
            }
            if sink.enabled() {
                sink.record(DebugRecord::ActionExecuted {
                    tick,
                    event_id: event.id,
                    action_id: action.id,
                    kind: action.kind.label().to_string(),
                    outcome: outcome.clone(),
                });
            }
            let stop = outcome == ActionOutcome::Cancelled;
            report.outcomes.push((action.id, outcome));
            if stop {
                report.cancelled = true;
                break;
            }
        }
        report
    }

    /// Inject the unblock gesture when a dispatch failed and the cooldown allows.
    pub fn end_of_tick(&mut self, now: std::time::Instant) -> bool {
        if !self.unblock.should_fire(now) {
            return false;
        }
        logger::info_p("exec", "injecting unblock gesture");
        self.gestures.dispatch(&crate::gesture::unblock_gesture())
    }

    fn run(
        &mut self,
        event: &Event,
        action: &Action,
        results: &ConditionResults,
        state: &mut ProcessingState,
        sink: &mut dyn DebugSink,
    ) -> ActionOutcome {
        match &action.kind {
            ActionKind::Click(click) => self.click(click, results),
            ActionKind::Swipe(swipe) => self.swipe(swipe, results),
            ActionKind::Pause(pause) => self.pause(pause),
            ActionKind::Intent(intent) => self.intent(intent, state),
            ActionKind::ToggleEvent(toggle) => toggle_events(toggle, state, sink),
            ActionKind::ChangeCounter(change) => change_counter(change, &mut state.counters, sink),
            ActionKind::Notification(notification) => self.notify(event, action.id, notification, &state.counters),
        }
    }

    fn click(&mut self, click: &Click, results: &ConditionResults) -> ActionOutcome {
        let Some(at) = resolve_target(&click.target, results) else {
            return ActionOutcome::Skipped(unresolved(&click.target));
        };
        self.repeat(click.repeat_count, click.repeat_delay_ms, |synth| synth.click(at, click.press_duration_ms))
    }

    fn swipe(&mut self, swipe: &Swipe, results: &ConditionResults) -> ActionOutcome {
        let Some(from) = resolve_target(&swipe.from, results) else {
            return ActionOutcome::Skipped(unresolved(&swipe.from));
        };
        let Some(to) = resolve_target(&swipe.to, results) else {
            return ActionOutcome::Skipped(unresolved(&swipe.to));
        };
        self.repeat(swipe.repeat_count, swipe.repeat_delay_ms, |synth| synth.swipe(from, to, swipe.duration_ms))
    }

    /// Dispatch `1 + repeat_count` gestures with cancellable waits between them.
    fn repeat(
        &mut self,
        repeat_count: u32,
        delay_ms: u64,
        mut build: impl FnMut(&mut GestureSynthesizer) -> GestureDescription,
    ) -> ActionOutcome {
        for i in 0..=repeat_count {
            if i > 0 {
                let delay = self.synth.delay(delay_ms);
                if !self.cancel.sleep_ms(delay) {
                    return ActionOutcome::Cancelled;
                }
            }
            if self.cancel.is_cancelled() {
                return ActionOutcome::Cancelled;
            }
            let gesture = build(&mut self.synth);
            let ok = self.gestures.dispatch(&gesture);
            self.unblock.record_dispatch(ok);
            if !ok {
                return ActionOutcome::Failed("gesture dispatch failed".into());
            }
            // Dispatch returns before the gesture finishes on screen.
            if !self.cancel.sleep_ms(gesture.total_ms()) {
                return ActionOutcome::Cancelled;
            }
        }
        ActionOutcome::Done
    }

    fn pause(&mut self, pause: &Pause) -> ActionOutcome {
        if self.cancel.is_cancelled() {
            return ActionOutcome::Cancelled;
        }
        let ms = self.synth.delay(pause.duration_ms);
        if self.cancel.sleep_ms(ms) { ActionOutcome::Done } else { ActionOutcome::Cancelled }
    }

    fn intent(&mut self, intent: &Intent, state: &mut ProcessingState) -> ActionOutcome {
        let request = IntentRequest {
            action: intent.action.clone(),
            component: intent.component.clone(),
            flags: intent.flags,
            extras: intent.extras.clone(),
            broadcast: intent.broadcast,
        };
        if !self.system.send_intent(&request) {
            return ActionOutcome::Failed(format!("intent {} not delivered", intent.action));
        }
        let settle = if intent.broadcast {
            state.push_broadcast(intent.action.clone());
            INTENT_BROADCAST_DELAY_MS
        } else {
            INTENT_ACTIVITY_DELAY_MS
        };
        if self.cancel.sleep_ms(settle) { ActionOutcome::Done } else { ActionOutcome::Cancelled }
    }

    fn notify(&mut self, event: &Event, id: ActionId, notification: &Notification, counters: &CounterStore) -> ActionOutcome {
        let request = NotificationRequest {
            id,
            title: notification.title.clone().unwrap_or_else(|| event.name.clone()),
            message: render_message(&notification.message, counters),
            importance: notification.importance,
        };
        if self.system.post_notification(&request) {
            ActionOutcome::Done
        } else {
            ActionOutcome::Failed("notification not posted".into())
        }
    }
}

/// Screen point for `target`, or `None` when its anchor was not detected.
pub fn resolve_target(target: &Target, results: &ConditionResults) -> Option<Point> {
    match target {
        Target::Fixed { x, y } => Some(Point::new(*x, *y)),
        Target::OnCondition { condition_id, offset } => results.anchor(*condition_id).map(|p| p.offset(*offset)),
        Target::OnFirstDetected { offset } => results.first_detected().map(|(_, p)| p.offset(*offset)),
    }
}

fn unresolved(target: &Target) -> String {
    match target {
        Target::OnCondition { condition_id, .. } => format!("condition {condition_id} not detected"),
        _ => "no detected condition to anchor on".into(),
    }
}

fn toggle_events(toggle: &ToggleEvent, state: &mut ProcessingState, sink: &mut dyn DebugSink) -> ActionOutcome {
    let changes = match toggle.toggle_all {
        Some(kind) => state.toggle_all(kind),
        None => {
            // All or nothing: an unknown target leaves every flag untouched.
            if let Some(t) = toggle.toggles.iter().find(|t| !state.contains(t.event_id)) {
                return ActionOutcome::Failed(format!("unknown event {}", t.event_id));
            }
            toggle
                .toggles
                .iter()
                .filter_map(|t| state.toggle(t.event_id, t.toggle).map(|enabled| (t.event_id, enabled)))
                .collect()
        }
    };
    for (event_id, enabled) in changes {
        sink.record(DebugRecord::EventToggled { event_id, enabled });
    }
    ActionOutcome::Done
}

fn change_counter(change: &ChangeCounter, counters: &mut CounterStore, sink: &mut dyn DebugSink) -> ActionOutcome {
    let old = counters.get(&change.counter);
    match counters.apply(&change.counter, change.operation, &change.operand) {
        Ok(new) => {
            sink.record(DebugRecord::CounterChanged { name: change.counter.clone(), old, new });
            ActionOutcome::Done
        }
        Err(e) => ActionOutcome::Failed(e.to_string()),
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern is valid"))
}

/// Message text with `{name}` replaced by counter values.
pub fn render_message(message: &NotificationMessage, counters: &CounterStore) -> String {
    match message {
        NotificationMessage::Text(text) => placeholder()
            .replace_all(text, |caps: &Captures| counters.get(caps[1].trim()).to_string())
            .into_owned(),
        NotificationMessage::CounterValue(name) => format!("{} = {}", name, counters.get(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::NullSink;
    use crate::evaluator::ProcessedConditionResult;
    use crate::model::{
        CounterOperation, EventKind, EventToggle, Importance, Operand, Operator, Scenario, ToggleType,
    };
    use crate::platform::mock;
    use std::thread;
    use std::time::{Duration, Instant};

    fn action(id: ActionId, order: u32, kind: ActionKind) -> Action {
        Action { id, name: String::new(), order, kind }
    }

    fn click_on(target: Target) -> ActionKind {
        ActionKind::Click(Click { target, press_duration_ms: 1, repeat_count: 0, repeat_delay_ms: 0 })
    }

    fn add(counter: &str, n: i64) -> ActionKind {
        ActionKind::ChangeCounter(ChangeCounter {
            counter: counter.into(),
            operation: CounterOperation::Add,
            operand: Operand::Number(n),
        })
    }

    fn event(id: i64, operator: Operator, actions: Vec<Action>) -> Event {
        Event {
            id,
            scenario_id: 1,
            name: format!("event {id}"),
            kind: EventKind::Image,
            operator,
            priority: 0,
            enabled_on_start: true,
            keep_detecting: true,
            conditions: vec![],
            actions,
        }
    }

    fn detected(id: i64, at: Point) -> ProcessedConditionResult {
        ProcessedConditionResult {
            condition_id: id,
            fulfilled: true,
            detected: true,
            confidence: Some(0.95),
            position: Some(at),
            error: None,
        }
    }

    fn executor(cancel: CancelToken) -> (ActionExecutor, mock::Recorder) {
        let (platform, recorder) = mock::platform(mock::ScriptedFrames::empty());
        let exec = ActionExecutor::new(
            platform.gestures,
            platform.system,
            GestureSynthesizer::new(1, false),
            UnblockScheduler::new(true),
            cancel,
        );
        (exec, recorder)
    }

    fn run(exec: &mut ActionExecutor, event: &Event, results: &ConditionResults, state: &mut ProcessingState) -> ExecutionReport {
        exec.execute(ExecutionContext { tick: 1, event, results, state, sink: &mut NullSink })
    }

    fn state(events: &[Event]) -> ProcessingState {
        let scenario = Scenario {
            id: 1,
            name: "s".into(),
            detection_quality: 0,
            randomize: false,
            events: events.to_vec(),
        };
        ProcessingState::new(&scenario, false)
    }

    #[test]
    fn runs_in_declared_order() {
        let e = event(1, Operator::All, vec![
            action(2, 1, click_on(Target::Fixed { x: 2, y: 2 })),
            action(1, 0, click_on(Target::Fixed { x: 1, y: 1 })),
        ]);
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        run(&mut exec, &e, &ConditionResults::default(), &mut st);
        assert_eq!(rec.tap_points(), vec![Point::new(1, 1), Point::new(2, 2)]);
    }

    #[test]
    fn unanchored_click_is_skipped_and_list_continues() {
        let e = event(1, Operator::All, vec![
            action(1, 0, click_on(Target::OnCondition { condition_id: 9, offset: None })),
            action(2, 1, add("after", 1)),
        ]);
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        let report = run(&mut exec, &e, &ConditionResults::default(), &mut st);
        assert!(rec.gestures().is_empty());
        assert!(matches!(report.outcomes[0].1, ActionOutcome::Skipped(_)));
        assert_eq!(report.outcomes[1].1, ActionOutcome::Done);
        assert_eq!(st.counters.get("after"), 1);
    }

    #[test]
    fn anchored_click_uses_detected_position_and_offset() {
        let e = event(1, Operator::All, vec![action(1, 0, click_on(Target::OnCondition {
            condition_id: 7,
            offset: Some(Point::new(3, -2)),
        }))]);
        let mut results = ConditionResults::default();
        results.push(detected(7, Point::new(100, 50)));
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        run(&mut exec, &e, &results, &mut st);
        assert_eq!(rec.tap_points(), vec![Point::new(103, 48)]);
    }

    #[test]
    fn first_detected_skips_undetected_results() {
        let e = event(1, Operator::Any, vec![action(1, 0, click_on(Target::OnFirstDetected { offset: None }))]);
        let mut results = ConditionResults::default();
        let mut miss = detected(1, Point::new(5, 5));
        miss.fulfilled = false;
        miss.detected = false;
        results.push(miss);
        results.push(detected(2, Point::new(40, 40)));
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        run(&mut exec, &e, &results, &mut st);
        assert_eq!(rec.tap_points(), vec![Point::new(40, 40)]);
    }

    #[test]
    fn failed_dispatch_continues_and_arms_unblock() {
        let e = event(1, Operator::All, vec![
            action(1, 0, click_on(Target::Fixed { x: 1, y: 1 })),
            action(2, 1, add("n", 2)),
        ]);
        let (mut exec, rec) = executor(CancelToken::new());
        rec.fail_gestures(true);
        let mut st = state(&[e.clone()]);
        let report = run(&mut exec, &e, &ConditionResults::default(), &mut st);
        assert!(matches!(report.outcomes[0].1, ActionOutcome::Failed(_)));
        assert_eq!(st.counters.get("n"), 2);

        rec.fail_gestures(false);
        let now = Instant::now();
        assert!(exec.end_of_tick(now));
        assert!(!exec.end_of_tick(now));
        assert_eq!(rec.gestures().len(), 1);
    }

    #[test]
    fn repeat_dispatches_each_time() {
        let e = event(1, Operator::All, vec![action(1, 0, ActionKind::Click(Click {
            target: Target::Fixed { x: 4, y: 4 },
            press_duration_ms: 1,
            repeat_count: 2,
            repeat_delay_ms: 1,
        }))]);
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        run(&mut exec, &e, &ConditionResults::default(), &mut st);
        assert_eq!(rec.gestures().len(), 3);
    }

    #[test]
    fn stop_during_pause_aborts_the_rest() {
        let e = event(1, Operator::All, vec![
            action(1, 0, ActionKind::Pause(Pause { duration_ms: 30_000 })),
            action(2, 1, click_on(Target::Fixed { x: 1, y: 1 })),
        ]);
        let cancel = CancelToken::new();
        let (mut exec, rec) = executor(cancel.clone());
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        let started = Instant::now();
        let mut st = state(&[e.clone()]);
        let report = run(&mut exec, &e, &ConditionResults::default(), &mut st);
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.cancelled);
        assert_eq!(report.outcomes, vec![(1, ActionOutcome::Cancelled)]);
        assert!(rec.gestures().is_empty());
    }

    #[test]
    fn toggles_apply_to_targets() {
        let b = event(2, Operator::All, vec![]);
        let a = event(1, Operator::All, vec![action(1, 0, ActionKind::ToggleEvent(ToggleEvent {
            toggle_all: None,
            toggles: vec![EventToggle { event_id: 2, toggle: ToggleType::Toggle }],
        }))]);
        let (mut exec, _) = executor(CancelToken::new());
        let mut st = state(&[a.clone(), b]);
        run(&mut exec, &a, &ConditionResults::default(), &mut st);
        assert!(!st.is_enabled(2));
        run(&mut exec, &a, &ConditionResults::default(), &mut st);
        assert!(st.is_enabled(2));
    }

    #[test]
    fn unknown_toggle_target_changes_nothing() {
        let b = event(2, Operator::All, vec![]);
        let a = event(1, Operator::All, vec![action(1, 0, ActionKind::ToggleEvent(ToggleEvent {
            toggle_all: None,
            toggles: vec![
                EventToggle { event_id: 2, toggle: ToggleType::Disable },
                EventToggle { event_id: 99, toggle: ToggleType::Disable },
            ],
        }))]);
        let (mut exec, _) = executor(CancelToken::new());
        let mut st = state(&[a.clone(), b]);
        let report = run(&mut exec, &a, &ConditionResults::default(), &mut st);
        assert!(matches!(report.outcomes[0], (1, ActionOutcome::Failed(_))));
        assert!(st.is_enabled(2));
    }

    #[test]
    fn notification_interpolates_counters() {
        let mut counters = CounterStore::new(false);
        counters.set("runs", 4).unwrap();
        let text = NotificationMessage::Text("done {runs} of { goal }".into());
        assert_eq!(render_message(&text, &counters), "done 4 of 0");
        let value = NotificationMessage::CounterValue("runs".into());
        assert_eq!(render_message(&value, &counters), "runs = 4");

        let e = event(1, Operator::All, vec![action(5, 0, ActionKind::Notification(Notification {
            title: None,
            message: text,
            importance: Importance::High,
        }))]);
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        st.counters.set("runs", 4).unwrap();
        run(&mut exec, &e, &ConditionResults::default(), &mut st);
        let posted = rec.notifications();
        assert_eq!(posted[0].title, "event 1");
        assert_eq!(posted[0].message, "done 4 of 0");
    }

    #[test]
    fn broadcast_intent_reaches_next_trigger_pass() {
        let e = event(1, Operator::All, vec![action(1, 0, ActionKind::Intent(Intent {
            action: "autotap.PING".into(),
            component: None,
            flags: 0,
            extras: vec![],
            broadcast: true,
        }))]);
        let (mut exec, rec) = executor(CancelToken::new());
        let mut st = state(&[e.clone()]);
        let report = run(&mut exec, &e, &ConditionResults::default(), &mut st);
        assert_eq!(report.outcomes[0].1, ActionOutcome::Done);
        assert_eq!(rec.intents().len(), 1);
        st.begin_broadcast_window();
        assert!(st.has_broadcast("autotap.PING"));
    }
}
