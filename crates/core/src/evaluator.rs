use std::time::{Duration, Instant};

use serde::Serialize;

use crate::bitmaps::BitmapCache;
use crate::matcher::TemplateMatcher;
use crate::model::{Condition, ConditionId, ConditionKind, DetectionType, Event, EventKind, ImageCondition, Operator, TriggerCondition};
use crate::scaling::{scale_len, scale_rect, unscale_point, FrameScaler};
use crate::state::ProcessingState;
use crate::types::{Frame, Point};

/// Outcome of evaluating one condition during one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedConditionResult {
    pub condition_id: ConditionId,
    pub fulfilled: bool,
    /// Image conditions: the reference was found at or above the threshold.
    pub detected: bool,
    pub confidence: Option<f64>,
    /// Screen position of the best match, reported even when not fulfilled.
    pub position: Option<Point>,
    /// Set when the condition could not be evaluated, e.g. unreadable bitmap.
    pub error: Option<String>,
}

impl ProcessedConditionResult {
    fn trigger(condition_id: ConditionId, fulfilled: bool) -> Self {
        Self { condition_id, fulfilled, detected: fulfilled, confidence: None, position: None, error: None }
    }

    fn failed(condition_id: ConditionId, error: String) -> Self {
        Self { condition_id, fulfilled: false, detected: false, confidence: None, position: None, error: Some(error) }
    }
}

/// Results of one event evaluation, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionResults(Vec<ProcessedConditionResult>);

impl ConditionResults {
    pub fn push(&mut self, result: ProcessedConditionResult) {
        self.0.push(result);
    }

    pub fn get(&self, id: ConditionId) -> Option<&ProcessedConditionResult> {
        self.0.iter().find(|r| r.condition_id == id)
    }

    /// Screen position usable as a gesture anchor for condition `id`.
    pub fn anchor(&self, id: ConditionId) -> Option<Point> {
        self.get(id).filter(|r| r.fulfilled && r.detected).and_then(|r| r.position)
    }

    /// Position of the first fulfilled, detected image result.
    pub fn first_detected(&self) -> Option<(ConditionId, Point)> {
        self.0
            .iter()
            .filter(|r| r.fulfilled && r.detected)
            .find_map(|r| r.position.map(|p| (r.condition_id, p)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessedConditionResult> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventVerdict {
    pub fulfilled: bool,
    pub results: ConditionResults,
}

/// Evaluates conditions and events against a frame and the run state.
pub struct ConditionEvaluator {
    bitmaps: BitmapCache,
    matcher: Box<dyn TemplateMatcher>,
    scaler: FrameScaler,
    quality: u32,
    /// Keep evaluating image ALL events past the first failure, for debug output.
    observe_all: bool,
}

impl ConditionEvaluator {
    pub fn new(bitmaps: BitmapCache, matcher: Box<dyn TemplateMatcher>, quality: u32, observe_all: bool) -> Self {
        Self { bitmaps, matcher, scaler: FrameScaler::default(), quality, observe_all }
    }

    pub fn bitmaps(&self) -> &BitmapCache {
        &self.bitmaps
    }

    pub fn bitmaps_mut(&mut self) -> &mut BitmapCache {
        &mut self.bitmaps
    }

    /// Evaluate `event`'s conditions in declared order.
    ///
    /// ALL stops at the first unfulfilled condition, ANY at the first fulfilled
    /// one. An event without conditions is never fulfilled.
    pub fn evaluate_event(
        &mut self,
        event: &Event,
        frame: Option<&Frame>,
        state: &mut ProcessingState,
        now: Instant,
    ) -> EventVerdict {
        let mut results = ConditionResults::default();
        if event.conditions.is_empty() {
            return EventVerdict { fulfilled: false, results };
        }

        let keep_going = self.observe_all && event.kind == EventKind::Image;
        let fulfilled = match event.operator {
            Operator::All => {
                let mut verdict = true;
                for condition in &event.conditions {
                    let result = self.evaluate(condition, frame, state, now);
                    let ok = result.fulfilled;
                    results.push(result);
                    if !ok {
                        verdict = false;
                        if !keep_going {
                            break;
                        }
                    }
                }
                verdict
            }
            Operator::Any => {
                let mut verdict = false;
                for condition in &event.conditions {
                    let result = self.evaluate(condition, frame, state, now);
                    let ok = result.fulfilled;
                    results.push(result);
                    if ok {
                        verdict = true;
                        break;
                    }
                }
                verdict
            }
        };
        EventVerdict { fulfilled, results }
    }

    pub fn evaluate(
        &mut self,
        condition: &Condition,
        frame: Option<&Frame>,
        state: &mut ProcessingState,
        now: Instant,
    ) -> ProcessedConditionResult {
        match &condition.kind {
            ConditionKind::Image(image) => match frame {
                Some(frame) => self.evaluate_image(condition.id, image, frame),
                None => ProcessedConditionResult::failed(condition.id, "no frame".into()),
            },
            ConditionKind::Trigger(trigger) => {
                ProcessedConditionResult::trigger(condition.id, evaluate_trigger(condition.id, trigger, state, now))
            }
        }
    }

    fn evaluate_image(&mut self, id: ConditionId, condition: &ImageCondition, frame: &Frame) -> ProcessedConditionResult {
        let scaled = self.scaler.scale(frame, self.quality);
        let size = (
            scale_len(condition.area.width, scaled.ratio),
            scale_len(condition.area.height, scaled.ratio),
        );
        let template = match self.bitmaps.get(&condition.path, Some(size)) {
            Ok(bitmap) => bitmap,
            Err(e) => return ProcessedConditionResult::failed(id, e.to_string()),
        };

        let search = match condition.detection {
            DetectionType::Exact => condition.area,
            DetectionType::WholeScreen => frame.bounds(),
            DetectionType::InArea { area } => area,
        };
        let outcome = self.matcher.find(&scaled, &template, scale_rect(search, scaled.ratio));

        let detected = outcome.confidence >= f64::from(condition.threshold) / 100.0;
        ProcessedConditionResult {
            condition_id: id,
            fulfilled: detected == condition.should_be_detected,
            detected,
            confidence: Some(outcome.confidence),
            position: outcome.position.map(|p| unscale_point(p, scaled.ratio)),
            error: None,
        }
    }
}

fn evaluate_trigger(id: ConditionId, trigger: &TriggerCondition, state: &mut ProcessingState, now: Instant) -> bool {
    match trigger {
        TriggerCondition::CounterReached { counter, comparison, operand } => {
            let value = state.counters.get(counter);
            let target = state.counters.resolve(operand);
            comparison.holds(value, target)
        }
        TriggerCondition::TimerReached { duration_ms, restart } => {
            state.timer_reached(id, Duration::from_millis(*duration_ms), *restart, now)
        }
        TriggerCondition::BroadcastReceived { action } => state.has_broadcast(action),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmaps::BitmapLoader;
    use crate::error::BitmapError;
    use crate::matcher::MatchOutcome;
    use crate::model::{Comparison, Operand, Scenario};
    use crate::scaling::ScaledFrame;
    use crate::types::{Bitmap, Rect};
    use std::path::PathBuf;

    struct Loader;

    impl BitmapLoader for Loader {
        fn load(&self, path: &str, size: Option<(u32, u32)>) -> Result<Bitmap, BitmapError> {
            if path == "missing.png" {
                return Err(BitmapError::NotFound(PathBuf::from(path)));
            }
            let (w, h) = size.unwrap_or((4, 4));
            Ok(Bitmap::new(w, h))
        }
    }

    /// Confidence per reference width; records searched areas.
    struct ByWidth {
        areas: std::sync::Arc<std::sync::Mutex<Vec<Rect>>>,
    }

    impl TemplateMatcher for ByWidth {
        fn find(&mut self, _frame: &ScaledFrame, template: &Bitmap, area: Rect) -> MatchOutcome {
            self.areas.lock().unwrap().push(area);
            let confidence = f64::from(template.width()) / 100.0;
            MatchOutcome { confidence, position: Some(Point::new(area.left + 1, area.top + 1)) }
        }
    }

    fn evaluator(quality: u32, observe_all: bool) -> (ConditionEvaluator, std::sync::Arc<std::sync::Mutex<Vec<Rect>>>) {
        let areas = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let cache = BitmapCache::new(Box::new(Loader), 1 << 20);
        let matcher = ByWidth { areas: areas.clone() };
        (ConditionEvaluator::new(cache, Box::new(matcher), quality, observe_all), areas)
    }

    // Confidence equals width / 100, so a 90 px wide area matches at 0.9.
    fn image(id: ConditionId, width: u32, present: bool) -> Condition {
        Condition {
            id,
            name: format!("img{id}"),
            kind: ConditionKind::Image(ImageCondition {
                path: format!("{id}.png"),
                area: Rect::new(10, 10, width, 10),
                threshold: 80,
                detection: DetectionType::Exact,
                should_be_detected: present,
            }),
        }
    }

    fn counter_below(id: ConditionId, name: &str, limit: i64) -> Condition {
        Condition {
            id,
            name: String::new(),
            kind: ConditionKind::Trigger(TriggerCondition::CounterReached {
                counter: name.into(),
                comparison: Comparison::Lower,
                operand: Operand::Number(limit),
            }),
        }
    }

    fn event(operator: Operator, conditions: Vec<Condition>) -> Event {
        Event {
            id: 1,
            scenario_id: 1,
            name: "e".into(),
            kind: EventKind::Image,
            operator,
            priority: 0,
            enabled_on_start: true,
            keep_detecting: true,
            conditions,
            actions: vec![],
        }
    }

    fn state_for(event: &Event) -> ProcessingState {
        let scenario = Scenario {
            id: 1,
            name: "s".into(),
            detection_quality: 0,
            randomize: false,
            events: vec![event.clone()],
        };
        ProcessingState::new(&scenario, false)
    }

    fn frame() -> Frame {
        Frame::new(1, Bitmap::new(200, 100))
    }

    #[test]
    fn threshold_and_expected_presence() {
        let (mut ev, _) = evaluator(0, false);
        let e = event(Operator::All, vec![]);
        let mut state = state_for(&e);
        let now = Instant::now();

        let hit = ev.evaluate(&image(1, 90, true), Some(&frame()), &mut state, now);
        assert!(hit.fulfilled && hit.detected);
        assert_eq!(hit.confidence, Some(0.9));

        let at_threshold = ev.evaluate(&image(2, 80, true), Some(&frame()), &mut state, now);
        assert!(at_threshold.fulfilled);

        let absent = ev.evaluate(&image(3, 50, false), Some(&frame()), &mut state, now);
        assert!(absent.fulfilled && !absent.detected);
        assert!(absent.position.is_some());
    }

    #[test]
    fn missing_bitmap_is_a_diagnostic_not_a_crash() {
        let (mut ev, _) = evaluator(0, false);
        let mut cond = image(1, 90, false);
        if let ConditionKind::Image(img) = &mut cond.kind {
            img.path = "missing.png".into();
        }
        let e = event(Operator::All, vec![]);
        let mut state = state_for(&e);
        let result = ev.evaluate(&cond, Some(&frame()), &mut state, Instant::now());
        assert!(!result.fulfilled);
        assert!(result.error.unwrap().contains("missing.png"));
    }

    #[test]
    fn all_short_circuits_on_first_failure() {
        let (mut ev, _) = evaluator(0, false);
        let e = event(Operator::All, vec![image(1, 90, true), image(2, 10, true), image(3, 90, true)]);
        let mut state = state_for(&e);
        let verdict = ev.evaluate_event(&e, Some(&frame()), &mut state, Instant::now());
        assert!(!verdict.fulfilled);
        assert_eq!(verdict.results.len(), 2);
    }

    #[test]
    fn observing_all_keeps_the_verdict() {
        let (mut ev, _) = evaluator(0, true);
        let e = event(Operator::All, vec![image(1, 10, true), image(2, 90, true)]);
        let mut state = state_for(&e);
        let verdict = ev.evaluate_event(&e, Some(&frame()), &mut state, Instant::now());
        assert!(!verdict.fulfilled);
        assert_eq!(verdict.results.len(), 2);
        assert!(verdict.results.get(2).unwrap().fulfilled);
    }

    #[test]
    fn any_stops_at_first_success() {
        let (mut ev, _) = evaluator(0, false);
        let e = event(Operator::Any, vec![image(1, 10, true), image(2, 90, true), image(3, 95, true)]);
        let mut state = state_for(&e);
        let verdict = ev.evaluate_event(&e, Some(&frame()), &mut state, Instant::now());
        assert!(verdict.fulfilled);
        assert_eq!(verdict.results.len(), 2);
        assert_eq!(verdict.results.first_detected().map(|(id, _)| id), Some(2));
    }

    #[test]
    fn empty_event_is_never_fulfilled() {
        let (mut ev, _) = evaluator(0, false);
        for op in [Operator::All, Operator::Any] {
            let e = event(op, vec![]);
            let mut state = state_for(&e);
            assert!(!ev.evaluate_event(&e, Some(&frame()), &mut state, Instant::now()).fulfilled);
        }
    }

    #[test]
    fn counter_condition_reads_missing_as_zero() {
        let (mut ev, _) = evaluator(0, false);
        let e = event(Operator::All, vec![]);
        let mut state = state_for(&e);
        let now = Instant::now();
        assert!(ev.evaluate(&counter_below(5, "runs", 3), None, &mut state, now).fulfilled);
        state.counters.set("runs", 3).unwrap();
        assert!(!ev.evaluate(&counter_below(5, "runs", 3), None, &mut state, now).fulfilled);
    }

    #[test]
    fn detection_quality_scales_search_and_position() {
        // 200 px wide frame at quality 100 -> ratio 0.5
        let (mut ev, areas) = evaluator(100, false);
        let e = event(Operator::All, vec![]);
        let mut state = state_for(&e);
        let result = ev.evaluate(&image(1, 180, true), Some(&frame()), &mut state, Instant::now());
        assert_eq!(areas.lock().unwrap()[0], Rect::new(5, 5, 90, 5));
        assert_eq!(result.confidence, Some(0.9));
        assert_eq!(result.position, Some(Point::new(12, 12)));
    }

    #[test]
    fn whole_screen_searches_the_frame() {
        let (mut ev, areas) = evaluator(0, false);
        let mut cond = image(1, 90, true);
        if let ConditionKind::Image(img) = &mut cond.kind {
            img.detection = DetectionType::WholeScreen;
        }
        let e = event(Operator::All, vec![]);
        let mut state = state_for(&e);
        ev.evaluate(&cond, Some(&frame()), &mut state, Instant::now());
        assert_eq!(areas.lock().unwrap()[0], Rect::new(0, 0, 200, 100));
    }
}
