use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::counters::CounterStore;
use crate::model::{ConditionId, ConditionKind, EventId, EventKind, Scenario, ToggleType, TriggerCondition};

/// Mutable state of one run. Owned by the processing thread only.
pub struct ProcessingState {
    pub counters: CounterStore,
    enabled: HashMap<EventId, bool>,
    /// Timer conditions of each event, re-armed when the event is enabled again.
    event_timers: HashMap<EventId, Vec<ConditionId>>,
    /// Start of each armed timer. Absent means disarmed.
    timers: HashMap<ConditionId, Instant>,
    broadcasts: HashSet<String>,
    pending_broadcasts: HashSet<String>,
}

impl ProcessingState {
    pub fn new(scenario: &Scenario, allow_negative_counters: bool) -> Self {
        let now = Instant::now();
        let mut state = Self {
            counters: CounterStore::new(allow_negative_counters),
            enabled: HashMap::new(),
            event_timers: HashMap::new(),
            timers: HashMap::new(),
            broadcasts: HashSet::new(),
            pending_broadcasts: HashSet::new(),
        };
        for event in &scenario.events {
            state.enabled.insert(event.id, event.enabled_on_start);
            let timers: Vec<ConditionId> = event
                .conditions
                .iter()
                .filter(|c| matches!(c.kind, ConditionKind::Trigger(TriggerCondition::TimerReached { .. })))
                .map(|c| c.id)
                .collect();
            if event.enabled_on_start {
                for id in &timers {
                    state.timers.insert(*id, now);
                }
            }
            state.event_timers.insert(event.id, timers);
        }
        state
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.enabled.contains_key(&id)
    }

    pub fn is_enabled(&self, id: EventId) -> bool {
        self.enabled.get(&id).copied().unwrap_or(false)
    }

    pub fn all_disabled(&self) -> bool {
        !self.enabled.values().any(|e| *e)
    }

    /// Ids of enabled events of `kind`, in priority order.
    pub fn enabled_events(&self, scenario: &Scenario, kind: EventKind) -> Vec<EventId> {
        scenario
            .events_by_priority(kind)
            .into_iter()
            .filter(|e| self.is_enabled(e.id))
            .map(|e| e.id)
            .collect()
    }

    /// Apply a toggle. Returns the new flag when the event exists.
    pub fn toggle(&mut self, id: EventId, toggle: ToggleType) -> Option<bool> {
        let current = *self.enabled.get(&id)?;
        let next = toggle.apply(current);
        self.enabled.insert(id, next);
        if next && !current {
            self.arm_timers(id, Instant::now());
        }
        Some(next)
    }

    pub fn toggle_all(&mut self, toggle: ToggleType) -> Vec<(EventId, bool)> {
        let mut ids: Vec<EventId> = self.enabled.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.toggle(id, toggle).map(|v| (id, v)))
            .collect()
    }

    pub fn enabled_snapshot(&self) -> BTreeMap<EventId, bool> {
        self.enabled.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn arm_timers(&mut self, event: EventId, now: Instant) {
        if let Some(ids) = self.event_timers.get(&event) {
            for id in ids {
                self.timers.insert(*id, now);
            }
        }
    }

    /// True once `duration` has elapsed on an armed timer. A reached timer
    /// restarts or disarms.
    pub fn timer_reached(&mut self, id: ConditionId, duration: Duration, restart: bool, now: Instant) -> bool {
        let Some(start) = self.timers.get(&id).copied() else { return false };
        if now.saturating_duration_since(start) < duration {
            return false;
        }
        if restart {
            self.timers.insert(id, now);
        } else {
            self.timers.remove(&id);
        }
        true
    }

    /// Queue a broadcast for the next trigger pass.
    pub fn push_broadcast(&mut self, action: impl Into<String>) {
        self.pending_broadcasts.insert(action.into());
    }

    pub fn has_broadcast(&self, action: &str) -> bool {
        self.broadcasts.contains(action)
    }

    /// Make queued broadcasts visible, replacing the previous pass's. Each
    /// broadcast is seen by exactly one trigger pass.
    pub fn begin_broadcast_window(&mut self) {
        self.broadcasts = std::mem::take(&mut self.pending_broadcasts);
    }
}
