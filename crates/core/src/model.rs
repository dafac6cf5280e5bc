//! Scenario graph: events own their conditions and actions.
//!
//! The graph is immutable while a scenario runs. Runtime state (enabled flags,
//! counters, timers) lives in [`crate::state::ProcessingState`].

use serde::{Deserialize, Serialize};

use crate::types::{Point, Rect};

pub type ScenarioId = i64;
pub type EventId = i64;
pub type ConditionId = i64;
pub type ActionId = i64;

/// Shortest gesture or pause the engine will produce.
pub const MIN_DURATION_MS: u64 = 1;
/// Longest gesture or pause the engine will produce.
pub const MAX_DURATION_MS: u64 = 60_000;

fn default_true() -> bool {
    true
}

fn default_quality() -> u32 {
    1200
}

fn default_press_ms() -> u64 {
    50
}

fn default_swipe_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    /// Target length of the longest frame side during detection. 0 disables downscaling.
    #[serde(default = "default_quality")]
    pub detection_quality: u32,
    #[serde(default)]
    pub randomize: bool,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Scenario {
    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Events of `kind`, lowest priority value first. Ties keep declaration order.
    pub fn events_by_priority(&self, kind: EventKind) -> Vec<&Event> {
        let mut events: Vec<&Event> = self.events.iter().filter(|e| e.kind == kind).collect();
        events.sort_by_key(|e| e.priority);
        events
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Screen driven, evaluated against every frame.
    Image,
    /// Counter/timer/broadcast driven, evaluated once per tick.
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(default)]
    pub scenario_id: ScenarioId,
    pub name: String,
    pub kind: EventKind,
    pub operator: Operator,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled_on_start: bool,
    /// When false, the image phase of a tick ends once this event fulfils.
    #[serde(default = "default_true")]
    pub keep_detecting: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Event {
    pub fn condition(&self, id: ConditionId) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    /// Actions in execution order. Equal orders keep declaration order.
    pub fn ordered_actions(&self) -> Vec<&Action> {
        let mut actions: Vec<&Action> = self.actions.iter().collect();
        actions.sort_by_key(|a| a.order);
        actions
    }
}

// --- Conditions ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: ConditionId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ConditionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    Image(ImageCondition),
    Trigger(TriggerCondition),
}

impl ConditionKind {
    /// Image events hold image conditions and may be gated on counters;
    /// trigger events never touch the frame.
    pub fn fits(&self, event: EventKind) -> bool {
        match (self, event) {
            (ConditionKind::Image(_), EventKind::Image) => true,
            (ConditionKind::Trigger(TriggerCondition::CounterReached { .. }), EventKind::Image) => true,
            (ConditionKind::Trigger(_), EventKind::Trigger) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCondition {
    /// Reference bitmap, relative to the scenario directory.
    pub path: String,
    /// Where the reference was captured. Its size is the reference size.
    pub area: Rect,
    /// Minimum confidence, in percent, for the reference to count as detected.
    pub threshold: u8,
    #[serde(default)]
    pub detection: DetectionType,
    #[serde(default = "default_true")]
    pub should_be_detected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DetectionType {
    /// Only the captured area is checked.
    #[default]
    Exact,
    WholeScreen,
    InArea { area: Rect },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TriggerCondition {
    CounterReached {
        counter: String,
        comparison: Comparison,
        operand: Operand,
    },
    TimerReached {
        duration_ms: u64,
        #[serde(default)]
        restart: bool,
    },
    BroadcastReceived {
        action: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Equals,
    Greater,
    GreaterOrEquals,
    Lower,
    LowerOrEquals,
}

impl Comparison {
    pub fn holds(self, value: i64, target: i64) -> bool {
        match self {
            Comparison::Equals => value == target,
            Comparison::Greater => value > target,
            Comparison::GreaterOrEquals => value >= target,
            Comparison::Lower => value < target,
            Comparison::LowerOrEquals => value <= target,
        }
    }
}

/// Right-hand side of a counter comparison or operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Number(i64),
    Counter(String),
}

// --- Actions ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub order: u32,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Click(Click),
    Swipe(Swipe),
    Pause(Pause),
    Intent(Intent),
    ToggleEvent(ToggleEvent),
    ChangeCounter(ChangeCounter),
    Notification(Notification),
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Click(_) => "click",
            ActionKind::Swipe(_) => "swipe",
            ActionKind::Pause(_) => "pause",
            ActionKind::Intent(_) => "intent",
            ActionKind::ToggleEvent(_) => "toggle_event",
            ActionKind::ChangeCounter(_) => "change_counter",
            ActionKind::Notification(_) => "notification",
        }
    }
}

/// Where a gesture lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Target {
    Fixed {
        x: i32,
        y: i32,
    },
    /// Position detected for `condition_id` in the triggering results.
    OnCondition {
        condition_id: ConditionId,
        #[serde(default)]
        offset: Option<Point>,
    },
    /// First detected image condition, for ANY events.
    OnFirstDetected {
        #[serde(default)]
        offset: Option<Point>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Click {
    pub target: Target,
    #[serde(default = "default_press_ms")]
    pub press_duration_ms: u64,
    /// Extra executions after the first one.
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default)]
    pub repeat_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swipe {
    pub from: Target,
    pub to: Target,
    #[serde(default = "default_swipe_ms")]
    pub duration_ms: u64,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default)]
    pub repeat_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub extras: Vec<IntentExtra>,
    #[serde(default)]
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentExtra {
    pub key: String,
    pub value: ExtraValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleType {
    Enable,
    Disable,
    Toggle,
}

impl ToggleType {
    pub fn apply(self, enabled: bool) -> bool {
        match self {
            ToggleType::Enable => true,
            ToggleType::Disable => false,
            ToggleType::Toggle => !enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleEvent {
    #[serde(default)]
    pub toggle_all: Option<ToggleType>,
    #[serde(default)]
    pub toggles: Vec<EventToggle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventToggle {
    pub event_id: EventId,
    pub toggle: ToggleType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterOperation {
    Add,
    Subtract,
    Set,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCounter {
    pub counter: String,
    pub operation: CounterOperation,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub title: Option<String>,
    pub message: NotificationMessage,
    #[serde(default)]
    pub importance: Importance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMessage {
    /// Free text; `{name}` is replaced by the value of counter `name`.
    Text(String),
    /// Renders as `name = value`.
    CounterValue(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Default,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_sort_by_priority_and_keep_ties() {
        let ev = |id, priority| Event {
            id,
            scenario_id: 1,
            name: format!("e{id}"),
            kind: EventKind::Image,
            operator: Operator::All,
            priority,
            enabled_on_start: true,
            keep_detecting: true,
            conditions: vec![],
            actions: vec![],
        };
        let scenario = Scenario {
            id: 1,
            name: "s".into(),
            detection_quality: 0,
            randomize: false,
            events: vec![ev(1, 5), ev(2, 0), ev(3, 5), ev(4, -1)],
        };
        let ids: Vec<EventId> = scenario.events_by_priority(EventKind::Image).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 2, 1, 3]);
        assert!(scenario.events_by_priority(EventKind::Trigger).is_empty());
    }

    #[test]
    fn scenario_json_uses_tagged_kinds() {
        let src = r#"{
            "id": 7, "name": "farm",
            "events": [{
                "id": 1, "name": "ok button", "kind": "image", "operator": "all",
                "conditions": [{
                    "id": 10, "type": "image", "path": "ok.png",
                    "area": {"left": 10, "top": 20, "width": 30, "height": 40},
                    "threshold": 80
                }, {
                    "id": 11, "type": "trigger", "trigger": "counter_reached",
                    "counter": "runs", "comparison": "lower", "operand": {"number": 3}
                }],
                "actions": [{
                    "id": 100, "type": "click", "target": {"on": "on_condition", "condition_id": 10}
                }]
            }]
        }"#;
        let scenario: Scenario = serde_json::from_str(src).unwrap();
        assert_eq!(scenario.detection_quality, 1200);
        let event = &scenario.events[0];
        assert!(event.enabled_on_start && event.keep_detecting);
        match &event.conditions[0].kind {
            ConditionKind::Image(img) => {
                assert_eq!(img.detection, DetectionType::Exact);
                assert!(img.should_be_detected);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &event.actions[0].kind {
            ActionKind::Click(click) => {
                assert_eq!(click.press_duration_ms, 50);
                assert_eq!(click.repeat_count, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn comparisons() {
        assert!(Comparison::Lower.holds(2, 3));
        assert!(!Comparison::Lower.holds(3, 3));
        assert!(Comparison::LowerOrEquals.holds(3, 3));
        assert!(Comparison::Equals.holds(-1, -1));
        assert!(Comparison::GreaterOrEquals.holds(4, 3));
        assert!(!Comparison::Greater.holds(3, 3));
    }
}
