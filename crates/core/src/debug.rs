//! Instrumentation records pushed by the processing thread.
//!
//! The processing thread only ever sends owned values. Consumers fold them into
//! a [`LiveSnapshot`] for display or a [`DebugReport`] for the session summary.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;

use crate::evaluator::ProcessedConditionResult;
use crate::executor::ActionOutcome;
use crate::model::{ActionId, EventId, ScenarioId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum DebugRecord {
    SessionStarted {
        scenario_id: ScenarioId,
        scenario_name: String,
        event_names: BTreeMap<EventId, String>,
        enabled: BTreeMap<EventId, bool>,
    },
    TickStarted {
        tick: u64,
        frame_seq: Option<u64>,
    },
    ConditionEvaluated {
        tick: u64,
        event_id: EventId,
        result: ProcessedConditionResult,
    },
    EventProcessed {
        tick: u64,
        event_id: EventId,
        fulfilled: bool,
        duration_us: u64,
    },
    ActionExecuted {
        tick: u64,
        event_id: EventId,
        action_id: ActionId,
        kind: String,
        outcome: ActionOutcome,
    },
    CounterChanged {
        name: String,
        old: i64,
        new: i64,
    },
    EventToggled {
        event_id: EventId,
        enabled: bool,
    },
    TickCompleted {
        tick: u64,
        duration_us: u64,
        counters: BTreeMap<String, i64>,
    },
    SessionEnded {
        reason: String,
    },
}

/// Receiver of debug records. Implementations must not block.
pub trait DebugSink: Send {
    fn record(&mut self, record: DebugRecord);

    /// False when records are discarded, so callers can skip building them.
    fn enabled(&self) -> bool {
        true
    }
}

pub struct NullSink;

impl DebugSink for NullSink {
    fn record(&mut self, _record: DebugRecord) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Bounded channel sink. Records are dropped, and counted, when the consumer lags.
pub struct ChannelSink {
    tx: SyncSender<DebugRecord>,
    dropped: Arc<AtomicU64>,
}

pub struct DebugReceiver {
    rx: Receiver<DebugRecord>,
    dropped: Arc<AtomicU64>,
}

pub fn channel(capacity: usize) -> (ChannelSink, DebugReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ChannelSink { tx, dropped: Arc::clone(&dropped) },
        DebugReceiver { rx, dropped },
    )
}

impl DebugSink for ChannelSink {
    fn record(&mut self, record: DebugRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl DebugReceiver {
    /// Everything received so far, without waiting.
    pub fn drain(&self) -> Vec<DebugRecord> {
        self.rx.try_iter().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// --- Live view ---

const RECENT_ACTIONS: usize = 20;

/// Rolling view of the current session for the TUI.
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    pub scenario_name: String,
    pub event_names: BTreeMap<EventId, String>,
    pub tick: u64,
    pub frame_seq: Option<u64>,
    pub last_tick_us: u64,
    pub ticks_total_us: u64,
    pub ticks_done: u64,
    /// Condition results of the current tick.
    pub conditions: Vec<(EventId, ProcessedConditionResult)>,
    pub last_fulfilled: Option<(EventId, u64)>,
    pub counters: BTreeMap<String, i64>,
    pub enabled: BTreeMap<EventId, bool>,
    pub recent_actions: VecDeque<String>,
    pub ended: Option<String>,
}

impl LiveSnapshot {
    pub fn apply(&mut self, record: &DebugRecord) {
        match record {
            DebugRecord::SessionStarted { scenario_name, event_names, enabled, .. } => {
                *self = LiveSnapshot {
                    scenario_name: scenario_name.clone(),
                    event_names: event_names.clone(),
                    enabled: enabled.clone(),
                    ..Default::default()
                };
            }
            DebugRecord::TickStarted { tick, frame_seq } => {
                self.tick = *tick;
                self.frame_seq = *frame_seq;
                self.conditions.clear();
            }
            DebugRecord::ConditionEvaluated { event_id, result, .. } => {
                self.conditions.push((*event_id, result.clone()));
            }
            DebugRecord::EventProcessed { tick, event_id, fulfilled, .. } => {
                if *fulfilled {
                    self.last_fulfilled = Some((*event_id, *tick));
                }
            }
            DebugRecord::ActionExecuted { event_id, action_id, kind, outcome, .. } => {
                if self.recent_actions.len() == RECENT_ACTIONS {
                    self.recent_actions.pop_front();
                }
                self.recent_actions.push_back(format!(
                    "{} #{} ({}): {}",
                    self.event_name(*event_id),
                    action_id,
                    kind,
                    outcome.label()
                ));
            }
            DebugRecord::CounterChanged { name, new, .. } => {
                self.counters.insert(name.clone(), *new);
            }
            DebugRecord::EventToggled { event_id, enabled } => {
                self.enabled.insert(*event_id, *enabled);
            }
            DebugRecord::TickCompleted { duration_us, counters, .. } => {
                self.last_tick_us = *duration_us;
                self.ticks_total_us += duration_us;
                self.ticks_done += 1;
                self.counters = counters.clone();
            }
            DebugRecord::SessionEnded { reason } => {
                self.ended = Some(reason.clone());
            }
        }
    }

    pub fn event_name(&self, id: EventId) -> &str {
        self.event_names.get(&id).map(String::as_str).unwrap_or("?")
    }

    pub fn average_tick_ms(&self) -> f64 {
        if self.ticks_done == 0 {
            0.0
        } else {
            self.ticks_total_us as f64 / self.ticks_done as f64 / 1000.0
        }
    }
}

// --- Session report ---

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventReport {
    pub name: String,
    pub evaluations: u64,
    pub fulfilled: u64,
    pub total_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionReport {
    pub event_id: EventId,
    pub evaluations: u64,
    pub fulfilled: u64,
    pub errors: u64,
    pub max_confidence: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionReport {
    pub kind: String,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Summary of one session, written as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebugReport {
    pub scenario_id: ScenarioId,
    pub scenario_name: String,
    pub started_at: String,
    pub ticks: u64,
    pub frames: u64,
    pub average_tick_ms: f64,
    pub max_tick_ms: f64,
    pub events: BTreeMap<EventId, EventReport>,
    pub conditions: BTreeMap<i64, ConditionReport>,
    pub actions: BTreeMap<ActionId, ActionReport>,
    pub counters: BTreeMap<String, i64>,
    pub stop_reason: Option<String>,
    pub dropped_records: u64,
}

impl DebugReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))
    }
}

/// Folds records into a [`DebugReport`].
#[derive(Default)]
pub struct ReportRecorder {
    report: DebugReport,
    total_tick_us: u64,
    max_tick_us: u64,
}

impl ReportRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &DebugRecord) {
        let r = &mut self.report;
        match record {
            DebugRecord::SessionStarted { scenario_id, scenario_name, event_names, .. } => {
                r.scenario_id = *scenario_id;
                r.scenario_name = scenario_name.clone();
                r.started_at = Local::now().to_rfc3339();
                for (id, name) in event_names {
                    r.events.entry(*id).or_default().name = name.clone();
                }
            }
            DebugRecord::TickStarted { frame_seq, .. } => {
                if frame_seq.is_some() {
                    r.frames += 1;
                }
            }
            DebugRecord::ConditionEvaluated { event_id, result, .. } => {
                let c = r.conditions.entry(result.condition_id).or_default();
                c.event_id = *event_id;
                c.evaluations += 1;
                if result.fulfilled {
                    c.fulfilled += 1;
                }
                if let Some(err) = &result.error {
                    c.errors += 1;
                    c.last_error = Some(err.clone());
                }
                if let Some(conf) = result.confidence {
                    c.max_confidence = Some(c.max_confidence.map_or(conf, |m| m.max(conf)));
                }
            }
            DebugRecord::EventProcessed { event_id, fulfilled, duration_us, .. } => {
                let e = r.events.entry(*event_id).or_default();
                e.evaluations += 1;
                e.total_us += duration_us;
                if *fulfilled {
                    e.fulfilled += 1;
                }
            }
            DebugRecord::ActionExecuted { action_id, kind, outcome, .. } => {
                let a = r.actions.entry(*action_id).or_default();
                a.kind = kind.clone();
                match outcome {
                    ActionOutcome::Done => a.done += 1,
                    ActionOutcome::Skipped(_) => a.skipped += 1,
                    ActionOutcome::Failed(_) => a.failed += 1,
                    ActionOutcome::Cancelled => a.cancelled += 1,
                }
            }
            DebugRecord::CounterChanged { name, new, .. } => {
                r.counters.insert(name.clone(), *new);
            }
            DebugRecord::EventToggled { .. } => {}
            DebugRecord::TickCompleted { duration_us, counters, .. } => {
                r.ticks += 1;
                self.total_tick_us += duration_us;
                self.max_tick_us = self.max_tick_us.max(*duration_us);
                r.counters = counters.clone();
            }
            DebugRecord::SessionEnded { reason } => {
                r.stop_reason = Some(reason.clone());
            }
        }
    }

    pub fn finish(mut self, dropped_records: u64) -> DebugReport {
        if self.report.ticks > 0 {
            self.report.average_tick_ms = self.total_tick_us as f64 / self.report.ticks as f64 / 1000.0;
        }
        self.report.max_tick_ms = self.max_tick_us as f64 / 1000.0;
        self.report.dropped_records = dropped_records;
        self.report
    }
}
