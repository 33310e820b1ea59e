//! Counting gate that parks surplus workers without destroying them.
//!
//! The gate tracks three numbers under one mutex: `expected` (how many
//! workers the controller intends to hold parked), `waiting` (how many are
//! currently blocked here), and `releases` (wake tickets handed out but not
//! yet consumed). Tickets make `sub_expected(1)` release *exactly one*
//! parked worker even when the release races a worker that has announced a
//! park but not reached the gate yet.
//!
//! Mirrors of `expected` and `waiting` are kept in atomics so the no-demand
//! fast path (the overwhelmingly common case) is a pair of loads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::cancel::CancelToken;
use crate::error::{PoolError, PoolResult};

/// How a pass through the gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No unmet parking demand: the caller was never blocked.
    Passed,
    /// The caller parked and was released by `sub_expected`.
    Released,
    /// The caller parked for the whole timeout without being released. Its
    /// own unit of demand has been withdrawn.
    TimedOut,
}

struct GateState {
    expected: usize,
    waiting: usize,
    releases: usize,
}

pub struct PartialBlocker {
    /// Lock-free mirror of `GateState::expected`.
    demand: CachePadded<AtomicUsize>,
    /// Lock-free mirror of `GateState::waiting`.
    parked: CachePadded<AtomicUsize>,
    disposed: AtomicBool,
    gate: Mutex<GateState>,
    cv: Condvar,
}

impl PartialBlocker {
    pub fn new() -> Self {
        Self {
            demand: CachePadded::new(AtomicUsize::new(0)),
            parked: CachePadded::new(AtomicUsize::new(0)),
            disposed: AtomicBool::new(false),
            gate: Mutex::new(GateState {
                expected: 0,
                waiting: 0,
                releases: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// True while more parks are wanted than workers are parked. Racy by
    /// design: a stale answer costs one extra pass through the gate, where
    /// the caller re-checks under the lock.
    #[inline]
    pub fn has_unmet_demand(&self) -> bool {
        self.demand.load(Ordering::Acquire) > self.parked.load(Ordering::Acquire)
    }

    /// Number of workers the controller currently intends parked.
    #[inline]
    pub fn expected(&self) -> usize {
        self.demand.load(Ordering::Acquire)
    }

    /// Park the caller while unmet demand exists. `timeout` of `None` waits
    /// forever (still interruptible by cancellation and disposal).
    ///
    /// Disposal outranks cancellation: once the gate is torn down, every
    /// waiter reports `Interrupted` even if its token has also fired.
    pub fn wait(&self, timeout: Option<Duration>, token: &CancelToken) -> PoolResult<WaitOutcome> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Interrupted);
        }
        if token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        if !self.has_unmet_demand() {
            return Ok(WaitOutcome::Passed);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut g = self.gate.lock().expect("blocker mutex poisoned");
        if g.waiting >= g.expected {
            return Ok(WaitOutcome::Passed);
        }
        g.waiting += 1;
        self.sync_mirrors(&g);

        loop {
            if token.is_cancelled() || self.disposed.load(Ordering::Acquire) {
                g.waiting -= 1;
                g.expected = g.expected.saturating_sub(1);
                self.sync_mirrors(&g);
                return if self.disposed.load(Ordering::Acquire) {
                    Err(PoolError::Interrupted)
                } else {
                    Err(PoolError::Cancelled)
                };
            }
            if g.releases > 0 {
                g.releases -= 1;
                g.waiting -= 1;
                self.sync_mirrors(&g);
                return Ok(WaitOutcome::Released);
            }
            g = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        g.waiting -= 1;
                        g.expected = g.expected.saturating_sub(1);
                        self.sync_mirrors(&g);
                        return Ok(WaitOutcome::TimedOut);
                    }
                    let (g, _) = self
                        .cv
                        .wait_timeout(g, deadline - now)
                        .expect("blocker condvar poisoned");
                    g
                }
                None => self.cv.wait(g).expect("blocker condvar poisoned"),
            };
        }
    }

    /// Schedule `n` additional parks.
    pub fn add_expected(&self, n: usize) {
        let mut g = self.gate.lock().expect("blocker mutex poisoned");
        g.expected += n;
        self.sync_mirrors(&g);
    }

    /// Withdraw up to `n` units of parking demand, waking one parked worker
    /// per unit that a worker was already holding. Returns the number of
    /// units actually withdrawn (0 when no demand was outstanding).
    pub fn sub_expected(&self, n: usize) -> usize {
        let mut g = self.gate.lock().expect("blocker mutex poisoned");
        let taken = n.min(g.expected);
        if taken == 0 {
            return 0;
        }
        g.expected -= taken;
        // Workers parked beyond the remaining demand (and beyond tickets
        // already in flight) each get a ticket.
        let surplus = (g.waiting - g.releases.min(g.waiting)).saturating_sub(g.expected);
        let tickets = surplus.min(taken);
        g.releases += tickets;
        self.sync_mirrors(&g);
        for _ in 0..tickets {
            self.cv.notify_one();
        }
        taken
    }

    /// Wake every parked worker so it re-checks its cancellation token.
    pub fn wake_all(&self) {
        let _g = self.gate.lock().expect("blocker mutex poisoned");
        self.cv.notify_all();
    }

    /// Permanently unblock the gate; parked workers return `Interrupted`.
    /// Used when the owner tears the gate down without joining its waiters,
    /// as opposed to a token-driven stop (which reports `Cancelled`).
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.wake_all();
    }

    fn sync_mirrors(&self, g: &MutexGuard<'_, GateState>) {
        self.demand.store(g.expected, Ordering::Release);
        self.parked.store(g.waiting, Ordering::Release);
    }
}

impl Default for PartialBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PartialBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialBlocker")
            .field("expected", &self.demand.load(Ordering::Relaxed))
            .field("parked", &self.parked.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn passes_through_without_demand() {
        let blocker = PartialBlocker::new();
        let token = CancelToken::new();
        assert_eq!(blocker.wait(Some(LONG), &token), Ok(WaitOutcome::Passed));
    }

    #[test]
    fn sub_expected_releases_exactly_one() {
        let blocker = Arc::new(PartialBlocker::new());
        let released = Arc::new(AtomicUsize::new(0));
        blocker.add_expected(3);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let blocker = Arc::clone(&blocker);
            let released = Arc::clone(&released);
            handles.push(thread::spawn(move || {
                let token = CancelToken::new();
                if blocker.wait(Some(LONG), &token) == Ok(WaitOutcome::Released) {
                    released.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        // Let all three reach the gate.
        while blocker.parked.load(Ordering::Acquire) < 3 {
            thread::yield_now();
        }

        assert_eq!(blocker.sub_expected(1), 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(released.load(Ordering::SeqCst), 1, "exactly one released");
        assert_eq!(blocker.parked.load(Ordering::Acquire), 2);

        assert_eq!(blocker.sub_expected(2), 2);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rescinding_demand_before_the_park_leaves_no_stale_ticket() {
        let blocker = PartialBlocker::new();
        let token = CancelToken::new();

        // Demand raised and withdrawn while nobody is parked.
        blocker.add_expected(1);
        assert_eq!(blocker.sub_expected(1), 1);

        // A later arrival must pass straight through, not consume a ticket.
        assert_eq!(blocker.wait(Some(LONG), &token), Ok(WaitOutcome::Passed));
        assert_eq!(blocker.expected(), 0);
    }

    #[test]
    fn timeout_withdraws_the_callers_demand() {
        let blocker = PartialBlocker::new();
        let token = CancelToken::new();
        blocker.add_expected(1);
        assert_eq!(
            blocker.wait(Some(Duration::from_millis(50)), &token),
            Ok(WaitOutcome::TimedOut)
        );
        assert_eq!(blocker.expected(), 0, "demand withdrawn on timeout");
    }

    #[test]
    fn cancellation_unblocks_an_infinite_wait() {
        let blocker = Arc::new(PartialBlocker::new());
        let token = CancelToken::new();
        blocker.add_expected(1);

        let handle = {
            let blocker = Arc::clone(&blocker);
            let token = token.clone();
            thread::spawn(move || blocker.wait(None, &token))
        };

        while blocker.parked.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        token.cancel();
        blocker.wake_all();
        assert_eq!(handle.join().unwrap(), Err(PoolError::Cancelled));
        assert_eq!(blocker.expected(), 0);
    }

    #[test]
    fn dispose_interrupts_parked_waiters() {
        let blocker = Arc::new(PartialBlocker::new());
        blocker.add_expected(1);

        let handle = {
            let blocker = Arc::clone(&blocker);
            thread::spawn(move || blocker.wait(None, &CancelToken::new()))
        };

        while blocker.parked.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        blocker.dispose();
        assert_eq!(handle.join().unwrap(), Err(PoolError::Interrupted));
    }

    #[test]
    fn dispose_outranks_a_fired_token() {
        let blocker = PartialBlocker::new();
        let token = CancelToken::new();
        token.cancel();
        blocker.dispose();
        assert_eq!(
            blocker.wait(Some(LONG), &token),
            Err(PoolError::Interrupted),
            "a torn-down gate reports disposal, not cancellation"
        );
    }
}
