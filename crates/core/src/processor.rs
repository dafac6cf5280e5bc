use std::sync::Arc;
use std::time::Instant;

use crate::debug::{DebugRecord, DebugSink};
use crate::evaluator::ConditionEvaluator;
use crate::executor::{ActionExecutor, ExecutionContext};
use crate::logger;
use crate::model::{Event, EventKind, Scenario};
use crate::state::ProcessingState;
use crate::types::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Nothing is left to evaluate; the run should end.
    AllEventsDisabled,
    /// A stop request interrupted an action list.
    Cancelled,
}

/// One run's evaluation and execution, tick by tick.
pub struct ScenarioProcessor {
    scenario: Arc<Scenario>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    state: ProcessingState,
    tick: u64,
}

impl ScenarioProcessor {
    pub fn new(
        scenario: Arc<Scenario>,
        evaluator: ConditionEvaluator,
        executor: ActionExecutor,
        state: ProcessingState,
    ) -> Self {
        Self { scenario, evaluator, executor, state, tick: 0 }
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProcessingState {
        &mut self.state
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Run one tick.
    ///
    /// The enabled event lists are fixed when the tick starts, so toggles apply
    /// from the next tick. Trigger events run first, then image events when a
    /// frame is available. The image pass ends early after a fulfilled event
    /// that does not keep detecting.
    pub fn process_tick(&mut self, frame: Option<&Frame>, sink: &mut dyn DebugSink) -> TickOutcome {
        if self.state.all_disabled() {
            return TickOutcome::AllEventsDisabled;
        }

        let scenario = Arc::clone(&self.scenario);
        let started = Instant::now();
        self.tick += 1;
        if sink.enabled() {
            sink.record(DebugRecord::TickStarted { tick: self.tick, frame_seq: frame.map(|f| f.seq) });
        }

        self.state.begin_broadcast_window();
        let triggers = self.state.enabled_events(&scenario, EventKind::Trigger);
        let images = match frame {
            Some(_) => self.state.enabled_events(&scenario, EventKind::Image),
            None => Vec::new(),
        };

        for id in triggers {
            let Some(event) = scenario.event(id) else { continue };
            if self.process_event(event, frame, sink) == Some(TickOutcome::Cancelled) {
                return TickOutcome::Cancelled;
            }
        }

        for id in images {
            let Some(event) = scenario.event(id) else { continue };
            match self.process_event(event, frame, sink) {
                Some(TickOutcome::Cancelled) => return TickOutcome::Cancelled,
                Some(_) if !event.keep_detecting => break,
                _ => {}
            }
        }

        if self.executor.end_of_tick(Instant::now()) {
            logger::debug_p("engine", "unblock gesture dispatched");
        }

        if sink.enabled() {
            sink.record(DebugRecord::TickCompleted {
                tick: self.tick,
                duration_us: started.elapsed().as_micros() as u64,
                counters: self.state.counters.snapshot(),
            });
        }
        TickOutcome::Continue
    }

    /// Evaluate `event` and run its actions when fulfilled. Returns `None` when
    /// the event did not fulfil.
    fn process_event(&mut self, event: &Event, frame: Option<&Frame>, sink: &mut dyn DebugSink) -> Option<TickOutcome> {
        let started = Instant::now();
        let verdict = self.evaluator.evaluate_event(event, frame, &mut self.state, started);

        if sink.enabled() {
            for result in verdict.results.iter() {
                sink.record(DebugRecord::ConditionEvaluated { tick: self.tick, event_id: event.id, result: result.clone() });
            }
            sink.record(DebugRecord::EventProcessed {
                tick: self.tick,
                event_id: event.id,
                fulfilled: verdict.fulfilled,
                duration_us: started.elapsed().as_micros() as u64,
            });
        }
        if !verdict.fulfilled {
            return None;
        }

        logger::debug_p("engine", &format!("tick {}: {} fulfilled", self.tick, event.name));
        let report = self.executor.execute(ExecutionContext {
            tick: self.tick,
            event,
            results: &verdict.results,
            state: &mut self.state,
            sink,
        });
        Some(if report.cancelled { TickOutcome::Cancelled } else { TickOutcome::Continue })
    }
}
