use std::collections::HashSet;

use crate::error::{EngineError, ValidationIssue};
use crate::model::{
    Action, ActionKind, ConditionKind, Event, EventKind, NotificationMessage, Operand, Operator, Scenario, Target,
    TriggerCondition, MAX_DURATION_MS, MIN_DURATION_MS,
};

/// Check a scenario graph before it is run. Collects every issue found.
pub fn validate(scenario: &Scenario) -> Result<(), EngineError> {
    let issues = issues(scenario);
    if issues.is_empty() { Ok(()) } else { Err(EngineError::Validation(issues)) }
}

pub fn issues(scenario: &Scenario) -> Vec<ValidationIssue> {
    let mut out = Vec::new();
    let event_ids: HashSet<i64> = scenario.events.iter().map(|e| e.id).collect();

    let mut seen_events = HashSet::new();
    let mut seen_conditions = HashSet::new();
    let mut seen_actions = HashSet::new();

    for event in &scenario.events {
        let here = format!("event {}", event.id);
        if !seen_events.insert(event.id) {
            out.push(ValidationIssue::new(&here, "duplicate event id"));
        }
        if event.conditions.is_empty() {
            out.push(ValidationIssue::new(&here, "has no conditions"));
        }
        if event.actions.is_empty() {
            out.push(ValidationIssue::new(&here, "has no actions"));
        }
        for condition in &event.conditions {
            let at = format!("{here} / condition {}", condition.id);
            if !seen_conditions.insert(condition.id) {
                out.push(ValidationIssue::new(&at, "duplicate condition id"));
            }
            if !condition.kind.fits(event.kind) {
                out.push(ValidationIssue::new(&at, "condition kind does not match event kind"));
            }
            check_condition(&condition.kind, &at, &mut out);
        }
        for action in &event.actions {
            let at = format!("{here} / action {}", action.id);
            if !seen_actions.insert(action.id) {
                out.push(ValidationIssue::new(&at, "duplicate action id"));
            }
            check_action(event, action, &event_ids, &at, &mut out);
        }
    }
    out
}

fn check_condition(kind: &ConditionKind, at: &str, out: &mut Vec<ValidationIssue>) {
    match kind {
        ConditionKind::Image(image) => {
            if image.path.trim().is_empty() {
                out.push(ValidationIssue::new(at, "reference path is not set"));
            }
            if image.area.is_empty() {
                out.push(ValidationIssue::new(at, "detection area is empty"));
            }
            if image.threshold > 100 {
                out.push(ValidationIssue::new(at, "threshold above 100"));
            }
        }
        ConditionKind::Trigger(TriggerCondition::CounterReached { counter, operand, .. }) => {
            if counter.trim().is_empty() {
                out.push(ValidationIssue::new(at, "counter name is not set"));
            }
            check_operand(operand, at, out);
        }
        ConditionKind::Trigger(TriggerCondition::TimerReached { duration_ms, .. }) => {
            if *duration_ms == 0 {
                out.push(ValidationIssue::new(at, "timer duration is zero"));
            }
        }
        ConditionKind::Trigger(TriggerCondition::BroadcastReceived { action }) => {
            if action.trim().is_empty() {
                out.push(ValidationIssue::new(at, "broadcast action is not set"));
            }
        }
    }
}

fn check_operand(operand: &Operand, at: &str, out: &mut Vec<ValidationIssue>) {
    if let Operand::Counter(name) = operand {
        if name.trim().is_empty() {
            out.push(ValidationIssue::new(at, "operand counter name is not set"));
        }
    }
}

fn check_duration(ms: u64, what: &str, at: &str, out: &mut Vec<ValidationIssue>) {
    if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&ms) {
        out.push(ValidationIssue::new(
            at,
            format!("{what} {ms}ms outside {MIN_DURATION_MS}..={MAX_DURATION_MS}ms"),
        ));
    }
}

fn check_target(event: &Event, target: &Target, at: &str, out: &mut Vec<ValidationIssue>) {
    match target {
        Target::Fixed { .. } => {}
        Target::OnCondition { condition_id, .. } => {
            if event.kind != EventKind::Image || event.operator != Operator::All {
                out.push(ValidationIssue::new(at, "condition anchor needs an image event with operator ALL"));
                return;
            }
            match event.condition(*condition_id).map(|c| &c.kind) {
                Some(ConditionKind::Image(image)) if image.should_be_detected => {}
                Some(ConditionKind::Image(_)) => {
                    out.push(ValidationIssue::new(at, format!("anchor condition {condition_id} expects absence")));
                }
                _ => out.push(ValidationIssue::new(
                    at,
                    format!("anchor condition {condition_id} is not an image condition of this event"),
                )),
            }
        }
        Target::OnFirstDetected { .. } => {
            if event.kind != EventKind::Image {
                out.push(ValidationIssue::new(at, "detected-position anchor needs an image event"));
            }
        }
    }
}

fn check_action(event: &Event, action: &Action, event_ids: &HashSet<i64>, at: &str, out: &mut Vec<ValidationIssue>) {
    match &action.kind {
        ActionKind::Click(click) => {
            check_target(event, &click.target, at, out);
            check_duration(click.press_duration_ms, "press duration", at, out);
        }
        ActionKind::Swipe(swipe) => {
            check_target(event, &swipe.from, at, out);
            check_target(event, &swipe.to, at, out);
            check_duration(swipe.duration_ms, "swipe duration", at, out);
        }
        // Waits are not gestures: any non-empty length is fine.
        ActionKind::Pause(pause) => {
            if pause.duration_ms == 0 {
                out.push(ValidationIssue::new(at, "pause duration is not set"));
            }
        }
        ActionKind::Intent(intent) => {
            if intent.action.trim().is_empty() {
                out.push(ValidationIssue::new(at, "intent action is not set"));
            }
        }
        ActionKind::ToggleEvent(toggle) => {
            if toggle.toggle_all.is_none() && toggle.toggles.is_empty() {
                out.push(ValidationIssue::new(at, "toggles nothing"));
            }
            if toggle.toggle_all.is_none() {
                for t in &toggle.toggles {
                    if !event_ids.contains(&t.event_id) {
                        out.push(ValidationIssue::new(at, format!("toggles unknown event {}", t.event_id)));
                    }
                }
            }
        }
        ActionKind::ChangeCounter(change) => {
            if change.counter.trim().is_empty() {
                out.push(ValidationIssue::new(at, "counter name is not set"));
            }
            check_operand(&change.operand, at, out);
        }
        ActionKind::Notification(notification) => {
            if let NotificationMessage::CounterValue(name) = &notification.message {
                if name.trim().is_empty() {
                    out.push(ValidationIssue::new(at, "counter name is not set"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChangeCounter, Click, Comparison, Condition, CounterOperation, DetectionType, EventToggle, ImageCondition,
        Pause, ToggleEvent, ToggleType,
    };
    use crate::types::Rect;

    fn image(id: i64, present: bool) -> Condition {
        Condition {
            id,
            name: String::new(),
            kind: ConditionKind::Image(ImageCondition {
                path: "ok.png".into(),
                area: Rect::new(0, 0, 10, 10),
                threshold: 80,
                detection: DetectionType::Exact,
                should_be_detected: present,
            }),
        }
    }

    fn runs_below(id: i64) -> Condition {
        Condition {
            id,
            name: String::new(),
            kind: ConditionKind::Trigger(TriggerCondition::CounterReached {
                counter: "runs".into(),
                comparison: Comparison::Lower,
                operand: Operand::Number(3),
            }),
        }
    }

    fn click(id: i64, target: Target) -> Action {
        Action {
            id,
            name: String::new(),
            order: 0,
            kind: ActionKind::Click(Click { target, press_duration_ms: 50, repeat_count: 0, repeat_delay_ms: 0 }),
        }
    }

    fn event(id: i64, kind: EventKind, operator: Operator, conditions: Vec<Condition>, actions: Vec<Action>) -> Event {
        Event {
            id,
            scenario_id: 1,
            name: String::new(),
            kind,
            operator,
            priority: 0,
            enabled_on_start: true,
            keep_detecting: true,
            conditions,
            actions,
        }
    }

    fn scenario(events: Vec<Event>) -> Scenario {
        Scenario { id: 1, name: "s".into(), detection_quality: 0, randomize: false, events }
    }

    fn messages(s: &Scenario) -> Vec<String> {
        issues(s).into_iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn valid_scenario_passes() {
        let s = scenario(vec![event(
            1,
            EventKind::Image,
            Operator::All,
            vec![image(10, true)],
            vec![click(100, Target::OnCondition { condition_id: 10, offset: None })],
        )]);
        assert!(validate(&s).is_ok());
    }

    #[test]
    fn empty_events_are_rejected() {
        let s = scenario(vec![event(1, EventKind::Image, Operator::All, vec![], vec![])]);
        let m = messages(&s);
        assert!(m.contains(&"event 1: has no conditions".to_string()));
        assert!(m.contains(&"event 1: has no actions".to_string()));
    }

    #[test]
    fn kinds_must_match() {
        let s = scenario(vec![event(
            1,
            EventKind::Trigger,
            Operator::All,
            vec![image(10, true)],
            vec![click(100, Target::Fixed { x: 0, y: 0 })],
        )]);
        assert_eq!(messages(&s), vec!["event 1 / condition 10: condition kind does not match event kind"]);
    }

    #[test]
    fn image_events_accept_counter_gates() {
        let s = scenario(vec![event(
            1,
            EventKind::Image,
            Operator::All,
            vec![image(10, true), runs_below(11)],
            vec![click(100, Target::Fixed { x: 0, y: 0 })],
        )]);
        assert!(validate(&s).is_ok());
    }

    #[test]
    fn anchors_are_checked() {
        let any = event(
            1,
            EventKind::Image,
            Operator::Any,
            vec![image(10, true)],
            vec![click(100, Target::OnCondition { condition_id: 10, offset: None })],
        );
        let absent = event(
            2,
            EventKind::Image,
            Operator::All,
            vec![image(20, false)],
            vec![click(200, Target::OnCondition { condition_id: 20, offset: None })],
        );
        let foreign = event(
            3,
            EventKind::Image,
            Operator::All,
            vec![image(30, true)],
            vec![click(300, Target::OnCondition { condition_id: 10, offset: None })],
        );
        let m = messages(&scenario(vec![any, absent, foreign]));
        assert_eq!(m.len(), 3, "{m:?}");
        assert!(m[0].contains("operator ALL"));
        assert!(m[1].contains("expects absence"));
        assert!(m[2].contains("not an image condition of this event"));
    }

    #[test]
    fn duplicates_ranges_and_targets() {
        let mut bad_pause = click(100, Target::Fixed { x: 0, y: 0 });
        bad_pause.kind = ActionKind::Pause(Pause { duration_ms: 0 });
        let toggle = Action {
            id: 101,
            name: String::new(),
            order: 1,
            kind: ActionKind::ToggleEvent(ToggleEvent {
                toggle_all: None,
                toggles: vec![EventToggle { event_id: 42, toggle: ToggleType::Enable }],
            }),
        };
        let counter = Action {
            id: 101,
            name: String::new(),
            order: 2,
            kind: ActionKind::ChangeCounter(ChangeCounter {
                counter: " ".into(),
                operation: CounterOperation::Add,
                operand: Operand::Number(1),
            }),
        };
        let s = scenario(vec![
            event(1, EventKind::Trigger, Operator::All, vec![runs_below(10)], vec![bad_pause, toggle, counter]),
            event(1, EventKind::Trigger, Operator::All, vec![runs_below(10)], vec![click(102, Target::Fixed { x: 0, y: 0 })]),
        ]);
        let m = messages(&s);
        assert!(m.iter().any(|x| x == "event 1 / action 100: pause duration is not set"));
        assert!(m.iter().any(|x| x.contains("toggles unknown event 42")));
        assert!(m.iter().any(|x| x == "event 1 / action 101: duplicate action id"));
        assert!(m.iter().any(|x| x == "event 1 / action 101: counter name is not set"));
        assert!(m.iter().any(|x| x == "event 1: duplicate event id"));
        assert!(m.iter().any(|x| x == "event 1 / condition 10: duplicate condition id"));
        assert!(matches!(validate(&s), Err(EngineError::Validation(v)) if v.len() == m.len()));
    }

    #[test]
    fn long_waits_are_not_gesture_bound() {
        let mut pause = click(100, Target::Fixed { x: 0, y: 0 });
        pause.kind = ActionKind::Pause(Pause { duration_ms: 300_000 });
        let mut repeated = click(101, Target::Fixed { x: 0, y: 0 });
        if let ActionKind::Click(c) = &mut repeated.kind {
            c.repeat_count = 2;
            c.repeat_delay_ms = 120_000;
        }
        let s = scenario(vec![event(1, EventKind::Trigger, Operator::All, vec![runs_below(10)], vec![pause, repeated])]);
        assert!(validate(&s).is_ok(), "{:?}", messages(&s));
    }
}
