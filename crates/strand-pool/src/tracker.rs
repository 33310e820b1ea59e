//! Throughput observation and worker-count suggestions.
//!
//! Completions are counted lock-free on the hot path; once per management
//! tick the controller asks for a step. The suggestion is a hill climb on
//! interval throughput: keep moving in the direction that last improved the
//! rate, back off when it degraded, and hold for one tick after a reversal
//! so the pool does not oscillate around the optimum.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// Relative change below which two interval rates count as flat.
const FLAT_TOLERANCE: f64 = 0.05;

struct History {
    last_rate: f64,
    last_step: i64,
    /// Set when the previous tick reversed direction; forces one quiet tick.
    holding: bool,
    last_at: Instant,
}

pub struct ThroughputTracker {
    completions: CachePadded<AtomicU64>,
    min_workers: u32,
    max_workers: u32,
    history: Mutex<History>,
}

impl ThroughputTracker {
    pub fn new(min_workers: u32, max_workers: u32) -> Self {
        Self {
            completions: CachePadded::new(AtomicU64::new(0)),
            min_workers,
            max_workers,
            history: Mutex::new(History {
                last_rate: 0.0,
                last_step: 0,
                holding: false,
                last_at: Instant::now(),
            }),
        }
    }

    /// Record one completed work item. Called from every worker.
    #[inline]
    pub fn register_execution(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Completions recorded since the last suggestion interval closed.
    #[inline]
    pub fn pending_completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    /// Close the current observation interval and suggest a change to the
    /// active-worker count. Called once per management tick.
    ///
    /// `critical` overrides history: the pool is stalled and must grow.
    /// With `needs_adjustment` false the tracker records the interval but
    /// stays quiet. The returned step is clamped so that
    /// `current_active + step` stays within `[min_workers, max_workers]`.
    pub fn register_and_suggest(
        &self,
        current_active: u32,
        needs_adjustment: bool,
        critical: bool,
    ) -> i64 {
        let completed = self.completions.swap(0, Ordering::Relaxed);
        let mut h = self.history.lock().expect("tracker history poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(h.last_at);
        h.last_at = now;
        let rate = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            completed as f64
        };

        if critical {
            let step = if current_active == 0 { 2 } else { 1 };
            let step = self.clamp(current_active, step);
            h.last_rate = rate;
            h.last_step = step.max(1);
            h.holding = false;
            tracing::debug!(step, rate, "critical growth suggested");
            return step;
        }

        if !needs_adjustment {
            h.last_rate = rate;
            h.last_step = 0;
            h.holding = false;
            return 0;
        }

        let rising = rate > h.last_rate * (1.0 + FLAT_TOLERANCE);
        let falling = rate < h.last_rate * (1.0 - FLAT_TOLERANCE);

        let mut step: i64 = match h.last_step {
            s if s > 0 => {
                // Growth helped: keep growing. Growth hurt: back off.
                if rising {
                    1
                } else if falling {
                    -1
                } else {
                    0
                }
            }
            s if s < 0 => {
                if rising {
                    -1
                } else if falling {
                    1
                } else {
                    0
                }
            }
            _ => {
                // No recent motion: probe upward only when the rate moved.
                if rising { 1 } else { 0 }
            }
        };

        // Dampen oscillation: a reversal waits out one tick before landing.
        if step != 0 && h.last_step != 0 && step.signum() != h.last_step.signum() {
            if !h.holding {
                h.holding = true;
                step = 0;
            } else {
                h.holding = false;
            }
        } else {
            h.holding = false;
        }

        let step = self.clamp(current_active, step);
        h.last_rate = rate;
        if step != 0 {
            h.last_step = step;
            tracing::trace!(step, rate, current_active, "tuning step suggested");
        }
        step
    }

    fn clamp(&self, current_active: u32, step: i64) -> i64 {
        let target = (current_active as i64 + step)
            .clamp(self.min_workers as i64, self.max_workers as i64);
        target - current_active as i64
    }
}

impl std::fmt::Debug for ThroughputTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThroughputTracker")
            .field("pending", &self.pending_completions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn tick(tracker: &ThroughputTracker, completions: u64) {
        for _ in 0..completions {
            tracker.register_execution();
        }
        // Keep interval rates comparable across ticks.
        thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn critical_overrides_history() {
        let tracker = ThroughputTracker::new(0, 8);
        assert_eq!(tracker.register_and_suggest(0, false, true), 2);
        assert_eq!(tracker.register_and_suggest(3, false, true), 1);
    }

    #[test]
    fn critical_step_is_clamped_to_max() {
        let tracker = ThroughputTracker::new(0, 4);
        assert_eq!(tracker.register_and_suggest(4, true, true), 0);
    }

    #[test]
    fn quiet_when_no_adjustment_needed() {
        let tracker = ThroughputTracker::new(0, 8);
        tick(&tracker, 100);
        assert_eq!(tracker.register_and_suggest(2, false, false), 0);
    }

    #[test]
    fn keeps_growing_while_throughput_rises() {
        let tracker = ThroughputTracker::new(0, 8);
        tick(&tracker, 10);
        assert_eq!(tracker.register_and_suggest(1, true, false), 1, "probe");
        tick(&tracker, 40);
        assert_eq!(tracker.register_and_suggest(2, true, false), 1);
        tick(&tracker, 80);
        assert_eq!(tracker.register_and_suggest(3, true, false), 1);
    }

    #[test]
    fn holds_one_tick_before_reversing() {
        let tracker = ThroughputTracker::new(0, 8);
        tick(&tracker, 10);
        assert_eq!(tracker.register_and_suggest(1, true, false), 1);
        // Throughput collapsed after growth: the reversal is damped once.
        tick(&tracker, 1);
        assert_eq!(tracker.register_and_suggest(2, true, false), 0, "held");
        tick(&tracker, 0);
        assert_eq!(tracker.register_and_suggest(2, true, false), -1);
    }

    #[test]
    fn steps_never_leave_the_configured_range() {
        let tracker = ThroughputTracker::new(2, 4);
        tick(&tracker, 10);
        assert_eq!(tracker.register_and_suggest(2, true, false), 1);
        // Throughput collapses; the first reversal is held, the second would
        // shrink but the floor clamps it away.
        tick(&tracker, 2);
        assert_eq!(tracker.register_and_suggest(2, true, false), 0, "held");
        tick(&tracker, 0);
        assert_eq!(
            tracker.register_and_suggest(2, true, false),
            0,
            "shrink clamped at min_workers"
        );
    }
}
