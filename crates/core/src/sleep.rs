use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

/// Shared stop flag that wakes sleepers as soon as it is raised.
///
/// Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first. Returns false when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        // Too far out to represent: wait for cancellation only.
        let deadline = Instant::now().checked_add(duration);
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return false;
            }
            let Some(deadline) = deadline else {
                cancelled = cvar.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = cvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn sleep_ms(&self, ms: u64) -> bool {
        self.sleep(Duration::from_millis(ms))
    }
}

/// `value` shifted by a uniform amount in `[-spread, spread]`.
pub fn jitter_i32(rng: &mut impl Rng, value: i32, spread: i32) -> i32 {
    if spread <= 0 {
        return value;
    }
    value.saturating_add(rng.gen_range(-spread..=spread))
}

/// `ms` shifted by a uniform amount in `[-spread, spread]`, clamped to `[min, max]`.
pub fn jitter_ms(rng: &mut impl Rng, ms: u64, spread: u64, min: u64, max: u64) -> u64 {
    let base = ms.min(i64::MAX as u64) as i64;
    let shifted = if spread == 0 {
        base
    } else {
        let s = spread as i64;
        base.saturating_add(rng.gen_range(-s..=s))
    };
    (shifted.max(0) as u64).clamp(min, max)
}
