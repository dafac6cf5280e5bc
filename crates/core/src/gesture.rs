use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::model::{MAX_DURATION_MS, MIN_DURATION_MS};
use crate::sleep::{jitter_i32, jitter_ms};
use crate::types::Point;

/// Max pixel offset applied to each randomized coordinate.
pub const RANDOM_POSITION_OFFSET_PX: i32 = 5;
/// Max millisecond offset applied to each randomized duration.
pub const RANDOM_DURATION_OFFSET_MS: u64 = 5;
/// Minimum time between two unblock gestures.
pub const UNBLOCK_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stroke {
    /// Visited points, in order. A single point is a tap.
    pub path: Vec<Point>,
    pub start_delay_ms: u64,
    pub duration_ms: u64,
}

/// Input gesture handed to a gesture dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GestureDescription {
    pub strokes: Vec<Stroke>,
}

impl GestureDescription {
    pub fn single(path: Vec<Point>, duration_ms: u64) -> Self {
        Self { strokes: vec![Stroke { path, start_delay_ms: 0, duration_ms }] }
    }

    /// Total time from first stroke start to last stroke end.
    pub fn total_ms(&self) -> u64 {
        self.strokes.iter().map(|s| s.start_delay_ms + s.duration_ms).max().unwrap_or(0)
    }
}

pub fn clamp_duration(ms: u64) -> u64 {
    ms.clamp(MIN_DURATION_MS, MAX_DURATION_MS)
}

/// Builds click and swipe gestures, jittered by a run-scoped random source.
pub struct GestureSynthesizer {
    rng: StdRng,
    randomize: bool,
}

impl GestureSynthesizer {
    pub fn new(seed: u64, randomize: bool) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), randomize }
    }

    pub fn randomize(&self) -> bool {
        self.randomize
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Duration clamped to the dispatchable range, jittered when randomizing.
    pub fn duration(&mut self, ms: u64) -> u64 {
        if self.randomize {
            jitter_ms(&mut self.rng, ms, RANDOM_DURATION_OFFSET_MS, MIN_DURATION_MS, MAX_DURATION_MS)
        } else {
            clamp_duration(ms)
        }
    }

    /// Wait length, jittered when randomizing but never clamped to the gesture range.
    pub fn delay(&mut self, ms: u64) -> u64 {
        if self.randomize {
            jitter_ms(&mut self.rng, ms, RANDOM_DURATION_OFFSET_MS, 0, u64::MAX)
        } else {
            ms
        }
    }

    pub fn position(&mut self, p: Point) -> Point {
        if !self.randomize {
            return p;
        }
        Point::new(
            jitter_i32(&mut self.rng, p.x, RANDOM_POSITION_OFFSET_PX),
            jitter_i32(&mut self.rng, p.y, RANDOM_POSITION_OFFSET_PX),
        )
    }

    /// Tap at `at`. Randomized taps drift by a pixel so the press is not static.
    pub fn click(&mut self, at: Point, press_ms: u64) -> GestureDescription {
        let duration = self.duration(press_ms);
        let start = self.position(at);
        let path = if self.randomize {
            let end = Point::new(jitter_i32(&mut self.rng, start.x, 1), jitter_i32(&mut self.rng, start.y, 1));
            if end == start { vec![start] } else { vec![start, end] }
        } else {
            vec![start]
        };
        GestureDescription::single(path, duration)
    }

    pub fn swipe(&mut self, from: Point, to: Point, duration_ms: u64) -> GestureDescription {
        let duration = self.duration(duration_ms);
        let path = vec![self.position(from), self.position(to)];
        GestureDescription::single(path, duration)
    }
}

/// Short taps in the top-left corner that wake a stuck input pipeline.
pub fn unblock_gesture() -> GestureDescription {
    let taps = [Point::new(0, 0), Point::new(1, 0), Point::new(0, 1)];
    GestureDescription {
        strokes: taps
            .iter()
            .enumerate()
            .map(|(i, p)| Stroke { path: vec![*p], start_delay_ms: i as u64 * 10, duration_ms: MIN_DURATION_MS })
            .collect(),
    }
}

/// Decides when to inject [`unblock_gesture`]: after a failed dispatch, at most
/// once per cooldown.
pub struct UnblockScheduler {
    enabled: bool,
    cooldown: Duration,
    suspect: bool,
    last_fired: Option<Instant>,
}

impl UnblockScheduler {
    pub fn new(enabled: bool) -> Self {
        Self::with_cooldown(enabled, UNBLOCK_COOLDOWN)
    }

    pub fn with_cooldown(enabled: bool, cooldown: Duration) -> Self {
        Self { enabled, cooldown, suspect: false, last_fired: None }
    }

    pub fn record_dispatch(&mut self, ok: bool) {
        if !ok {
            self.suspect = true;
        }
    }

    /// True when the workaround should run now. Consumes the pending suspicion.
    pub fn should_fire(&mut self, now: Instant) -> bool {
        if !self.enabled || !self.suspect {
            return false;
        }
        if let Some(last) = self.last_fired {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.suspect = false;
        self.last_fired = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_click_is_exact() {
        let mut g = GestureSynthesizer::new(1, false);
        let gesture = g.click(Point::new(10, 20), 50);
        assert_eq!(gesture, GestureDescription::single(vec![Point::new(10, 20)], 50));
    }

    #[test]
    fn durations_stay_in_range_for_any_seed() {
        for seed in 0..200 {
            let mut g = GestureSynthesizer::new(seed, seed % 2 == 0);
            for requested in [0, 1, 3, 50, MAX_DURATION_MS, MAX_DURATION_MS + 1, u64::MAX] {
                let d = g.click(Point::new(0, 0), requested).strokes[0].duration_ms;
                assert!((MIN_DURATION_MS..=MAX_DURATION_MS).contains(&d), "seed {seed}: {d}");
                let d = g.swipe(Point::new(0, 0), Point::new(5, 5), requested).strokes[0].duration_ms;
                assert!((MIN_DURATION_MS..=MAX_DURATION_MS).contains(&d), "seed {seed}: {d}");
            }
        }
    }

    #[test]
    fn waits_keep_their_length() {
        let mut plain = GestureSynthesizer::new(1, false);
        assert_eq!(plain.delay(300_000), 300_000);
        assert_eq!(plain.delay(0), 0);
        let mut jittered = GestureSynthesizer::new(1, true);
        for _ in 0..100 {
            let d = jittered.delay(300_000);
            assert!(d.abs_diff(300_000) <= RANDOM_DURATION_OFFSET_MS, "{d}");
        }
    }

    #[test]
    fn randomized_positions_stay_close() {
        let mut g = GestureSynthesizer::new(42, true);
        for _ in 0..200 {
            let gesture = g.swipe(Point::new(100, 100), Point::new(300, 100), 200);
            let path = &gesture.strokes[0].path;
            assert!((path[0].x - 100).abs() <= RANDOM_POSITION_OFFSET_PX);
            assert!((path[1].x - 300).abs() <= RANDOM_POSITION_OFFSET_PX);
            let click = g.click(Point::new(50, 50), 40);
            for p in &click.strokes[0].path {
                assert!((p.x - 50).abs() <= RANDOM_POSITION_OFFSET_PX + 1);
                assert!((p.y - 50).abs() <= RANDOM_POSITION_OFFSET_PX + 1);
            }
        }
    }

    #[test]
    fn same_seed_same_gestures() {
        let mut a = GestureSynthesizer::new(9, true);
        let mut b = GestureSynthesizer::new(9, true);
        assert_eq!(a.click(Point::new(1, 1), 30), b.click(Point::new(1, 1), 30));
    }

    #[test]
    fn unblock_needs_failure_and_respects_cooldown() {
        let mut s = UnblockScheduler::with_cooldown(true, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(!s.should_fire(t0));
        s.record_dispatch(false);
        assert!(s.should_fire(t0));
        assert!(!s.should_fire(t0));
        s.record_dispatch(false);
        assert!(!s.should_fire(t0 + Duration::from_secs(3)));
        assert!(s.should_fire(t0 + Duration::from_secs(11)));

        let mut off = UnblockScheduler::new(false);
        off.record_dispatch(false);
        assert!(!off.should_fire(t0));
    }

    #[test]
    fn unblock_gesture_is_short() {
        let g = unblock_gesture();
        assert_eq!(g.strokes.len(), 3);
        assert!(g.total_ms() < 100);
    }
}
