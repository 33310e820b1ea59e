//! Pool lifecycle and public surface.
//!
//! The pool owns the census, the blocker gate, the throughput tracker, the
//! work queue, and the worker join handles. Workers hold an `Arc` of the
//! shared core; the management callback holds only a `Weak`, so a dropped
//! pool never leaves a live controller behind.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::blocker::PartialBlocker;
use crate::cancel::CancelToken;
use crate::census::{Census, MAX_TOTAL_WORKERS};
use crate::error::{PoolError, PoolResult};
use crate::manager;
use crate::queue::{AddError, WorkQueue};
use crate::ticker::{ManagementTicker, TickRegistration};
use crate::tracker::ThroughputTracker;
use crate::worker::WorkerSlot;

/// A unit of work accepted by the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool lifecycle states. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::StopRequested,
            _ => PoolState::Stopped,
        }
    }
}

/// Tunables beyond the constructor's required arguments.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Idle time after which a surplus worker may retire. Negative disables
    /// trimming entirely.
    pub trim_period_ms: i64,
    /// Short-poll timeout for surplus workers: how long one lingers awake to
    /// steal strays before deactivating.
    pub steal_awake_period_ms: u64,
    /// Ceiling on how far a bounded queue may grow past its base capacity.
    pub max_queue_extension: usize,
    /// Controller cadence.
    pub management_period_ms: u64,
    /// Queue-pressure threshold: queued items per tracked worker that
    /// justify growth.
    pub work_items_per_worker: usize,
    /// Preferred steady-state worker ceiling. Defaults to the processor
    /// count.
    pub reasonable_workers: Option<u32>,
    /// Bound below which growth is attempted inline on submission.
    /// Defaults to half the processor count.
    pub fast_spawn_limit: Option<u32>,
    /// Ticker driving the controller. Defaults to the process-wide one.
    pub ticker: Option<Arc<ManagementTicker>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            trim_period_ms: 300_000,
            steal_awake_period_ms: 2_000,
            max_queue_extension: 256,
            management_period_ms: 500,
            work_items_per_worker: 4,
            reasonable_workers: None,
            fast_spawn_limit: None,
            ticker: None,
        }
    }
}

pub(crate) struct PoolCore {
    pub(crate) name: String,
    pub(crate) min_workers: u32,
    pub(crate) max_workers: u32,
    pub(crate) reasonable_workers: u32,
    pub(crate) fast_spawn_limit: u32,
    pub(crate) work_items_per_worker: usize,
    pub(crate) trim_period: Option<Duration>,
    pub(crate) steal_awake_period: Duration,
    pub(crate) management_period: Duration,
    pub(crate) max_queue_extension: usize,
    pub(crate) is_daemon: bool,

    state: AtomicU8,
    pub(crate) let_finish: AtomicBool,
    pub(crate) cancel: CancelToken,

    pub(crate) census: Census,
    pub(crate) blocker: PartialBlocker,
    pub(crate) tracker: ThroughputTracker,
    pub(crate) queue: WorkQueue<Job>,

    /// Workers currently inside a work item; the portable stand-in for
    /// OS-level run state used by the critical-spawn decision.
    pub(crate) running: CachePadded<AtomicUsize>,
    /// Any worker completed an item since the last management tick.
    pub(crate) saw_work: AtomicBool,
    pub(crate) tick_acc_ns: AtomicU64,

    pub(crate) accepted: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) cancelled_items: AtomicU64,

    pub(crate) slots: Box<[WorkerSlot]>,
    pub(crate) next_worker_id: AtomicU64,

    pub(crate) ticker: Arc<ManagementTicker>,
    registration: Mutex<Option<TickRegistration>>,
    lifecycle_lock: Mutex<()>,
}

impl PoolCore {
    #[inline]
    pub(crate) fn load_state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn store_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A self-tuning worker pool.
///
/// The active-worker count adapts to offered load: submission bursts grow
/// it inline up to the fast-spawn limit, the periodic controller grows it
/// toward (and tunes it around) the reasonable count, and idle workers park
/// on a gate and eventually retire down to `min_workers`.
pub struct Pool {
    core: Arc<PoolCore>,
}

impl Pool {
    /// Create a pool. `queue_capacity` of 0 means unbounded. The pool stays
    /// `Created` (no threads) until the first submission or an explicit
    /// [`start`](Pool::start).
    pub fn new(
        min_workers: u32,
        max_workers: u32,
        queue_capacity: usize,
        name: impl Into<String>,
        is_daemon: bool,
        options: PoolOptions,
    ) -> PoolResult<Self> {
        if max_workers == 0 || max_workers > MAX_TOTAL_WORKERS {
            return Err(PoolError::InvalidArgument(format!(
                "max_workers must be in [1, {MAX_TOTAL_WORKERS}], got {max_workers}"
            )));
        }
        if min_workers > max_workers {
            return Err(PoolError::InvalidArgument(format!(
                "min_workers ({min_workers}) exceeds max_workers ({max_workers})"
            )));
        }
        if options.management_period_ms == 0 {
            return Err(PoolError::InvalidArgument(
                "management_period_ms must be positive".into(),
            ));
        }

        let cpus = num_cpus::get() as u32;
        let reasonable_workers = options
            .reasonable_workers
            .unwrap_or(cpus)
            .clamp(1, max_workers);
        let fast_spawn_limit = options
            .fast_spawn_limit
            .unwrap_or_else(|| (cpus / 2).max(1))
            .min(max_workers);
        let trim_period = if options.trim_period_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(options.trim_period_ms as u64))
        };

        let slots = (0..max_workers)
            .map(|_| WorkerSlot::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let core = Arc::new(PoolCore {
            name: name.into(),
            min_workers,
            max_workers,
            reasonable_workers,
            fast_spawn_limit,
            work_items_per_worker: options.work_items_per_worker.max(1),
            trim_period,
            steal_awake_period: Duration::from_millis(options.steal_awake_period_ms.max(1)),
            management_period: Duration::from_millis(options.management_period_ms),
            max_queue_extension: options.max_queue_extension,
            is_daemon,
            state: AtomicU8::new(PoolState::Created as u8),
            let_finish: AtomicBool::new(false),
            cancel: CancelToken::new(),
            census: Census::new(max_workers),
            blocker: PartialBlocker::new(),
            tracker: ThroughputTracker::new(min_workers, max_workers),
            queue: WorkQueue::new(queue_capacity, options.max_queue_extension),
            running: CachePadded::new(AtomicUsize::new(0)),
            saw_work: AtomicBool::new(false),
            tick_acc_ns: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            cancelled_items: AtomicU64::new(0),
            slots,
            next_worker_id: AtomicU64::new(0),
            ticker: options.ticker.unwrap_or_else(ManagementTicker::global),
            registration: Mutex::new(None),
            lifecycle_lock: Mutex::new(()),
        });

        Ok(Pool { core })
    }

    /// Transition to `Running`, prewarm to `min_workers`, and register the
    /// controller. Idempotent; fails with `Closed` after a stop.
    pub fn start(&self) -> PoolResult<()> {
        self.ensure_running()
    }

    /// Submit a work item, blocking while a bounded queue is full.
    pub fn submit<F>(&self, f: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_running()?;
        match self.core.queue.add(Box::new(f) as Job) {
            Ok(()) => {
                self.core.accepted.fetch_add(1, Ordering::Relaxed);
                manager::maybe_spawn(&self.core);
                Ok(())
            }
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Submit without blocking. `Ok(false)` reports a full bounded queue.
    pub fn try_submit<F>(&self, f: F) -> PoolResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_running()?;
        match self.core.queue.try_add(Box::new(f) as Job) {
            Ok(()) => {
                self.core.accepted.fetch_add(1, Ordering::Relaxed);
                manager::maybe_spawn(&self.core);
                Ok(true)
            }
            Err(AddError::Full(_)) => Ok(false),
            Err(AddError::Closed(_)) => Err(PoolError::Closed),
        }
    }

    /// Bring the pool up to `n` workers ahead of load.
    pub fn prewarm(&self, n: u32) -> PoolResult<()> {
        self.ensure_running()?;
        let target = n.min(self.core.max_workers);
        let mut rounds = 0;
        while self.core.census.total() < target {
            if !manager::add_or_activate(&self.core, target) {
                break;
            }
            rounds += 1;
            if rounds > target * 2 + 4 {
                break;
            }
        }
        Ok(())
    }

    /// Stop the pool and block until every worker has joined.
    ///
    /// With `let_finish` every already-accepted item still executes; without
    /// it, queued items are discarded (counted, never silently lost).
    /// Running items are never interrupted. Idempotent.
    pub fn stop(&self, let_finish: bool) {
        let _lifecycle = self.core.lifecycle_lock.lock().expect("lifecycle poisoned");
        match self.core.load_state() {
            PoolState::Stopped => return,
            PoolState::StopRequested => {}
            PoolState::Created | PoolState::Running => {
                self.core.let_finish.store(let_finish, Ordering::Release);
                self.core.store_state(PoolState::StopRequested);
                tracing::debug!(pool = %self.core.name, let_finish, "stop requested");
                // Flags first, wakeups second: a woken waiter must observe
                // the cancellation that woke it.
                self.core.cancel.cancel();
                self.core.queue.close();
                self.core.blocker.wake_all();
            }
        }

        // Sweep until every slot is vacated: a spawn that raced the state
        // change may park its handle after our first pass.
        loop {
            let mut joined_any = false;
            for slot in self.core.slots.iter() {
                if let Some(handle) = slot.take_handle() {
                    let _ = handle.join();
                    joined_any = true;
                }
            }
            if !self.core.slots.iter().any(|s| s.is_occupied()) {
                break;
            }
            if !joined_any {
                std::thread::yield_now();
            }
        }

        // Workers drain as they exit; sweep whatever raced past them.
        let core = &self.core;
        core.queue.drain(|job| {
            if core.let_finish.load(Ordering::Acquire) {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("work item panicked during final drain");
                }
                core.executed.fetch_add(1, Ordering::Relaxed);
            } else {
                drop(job);
                core.cancelled_items.fetch_add(1, Ordering::Relaxed);
            }
        });

        *self.core.registration.lock().expect("registration poisoned") = None;
        self.core.store_state(PoolState::Stopped);
        tracing::debug!(pool = %self.core.name, "pool stopped");
    }

    #[inline]
    pub fn state(&self) -> PoolState {
        self.core.load_state()
    }

    #[inline]
    pub fn min_workers(&self) -> u32 {
        self.core.min_workers
    }

    #[inline]
    pub fn max_workers(&self) -> u32 {
        self.core.max_workers
    }

    /// Workers currently eligible to run (not parked on the gate).
    #[inline]
    pub fn active_workers(&self) -> u32 {
        self.core.census.active()
    }

    /// Workers tracked by the pool, parked ones included.
    #[inline]
    pub fn total_workers(&self) -> u32 {
        self.core.census.total()
    }

    /// One consistent `(active, total)` reading, taken from a single load of
    /// the census word.
    #[inline]
    pub fn worker_counts(&self) -> (u32, u32) {
        let counts = self.core.census.snapshot();
        (counts.active(), counts.total())
    }

    /// Items accepted but not yet handed to a worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.core.queue.size()
    }

    #[inline]
    pub fn queue_capacity(&self) -> usize {
        self.core.queue.capacity()
    }

    #[inline]
    pub fn queue_extended_capacity(&self) -> usize {
        self.core.queue.extended_capacity()
    }

    /// Items accepted over the pool's lifetime.
    #[inline]
    pub fn accepted_items(&self) -> u64 {
        self.core.accepted.load(Ordering::Relaxed)
    }

    /// Items that ran to completion (panicked items included).
    #[inline]
    pub fn executed_items(&self) -> u64 {
        self.core.executed.load(Ordering::Relaxed)
    }

    /// Items discarded by a non-let-finish stop.
    #[inline]
    pub fn cancelled_items(&self) -> u64 {
        self.core.cancelled_items.load(Ordering::Relaxed)
    }

    fn ensure_running(&self) -> PoolResult<()> {
        loop {
            match self.core.load_state() {
                PoolState::Running => return Ok(()),
                PoolState::StopRequested | PoolState::Stopped => return Err(PoolError::Closed),
                PoolState::Created => {
                    let _lifecycle =
                        self.core.lifecycle_lock.lock().expect("lifecycle poisoned");
                    if self.core.load_state() != PoolState::Created {
                        continue;
                    }
                    if !self.core.transition(PoolState::Created, PoolState::Running) {
                        continue;
                    }
                    let mut rounds = 0;
                    while self.core.census.total() < self.core.min_workers {
                        if !manager::add_or_activate(&self.core, self.core.min_workers) {
                            break;
                        }
                        rounds += 1;
                        if rounds > self.core.min_workers * 2 + 4 {
                            break;
                        }
                    }
                    *self.core.registration.lock().expect("registration poisoned") =
                        Some(manager::register_manager(&self.core));
                    tracing::debug!(
                        pool = %self.core.name,
                        min = self.core.min_workers,
                        max = self.core.max_workers,
                        "pool started"
                    );
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.core.is_daemon {
            // Daemon pools detach: signal shutdown but never block the
            // dropping thread on joins. Nobody is left to release the gate,
            // so it is disposed outright; parked workers surface
            // `Interrupted` rather than a token cancellation.
            if self.core.load_state() < PoolState::StopRequested {
                self.core.let_finish.store(false, Ordering::Release);
                self.core.store_state(PoolState::StopRequested);
                self.core.cancel.cancel();
                self.core.queue.close();
                self.core.blocker.dispose();
            }
            *self.core.registration.lock().expect("registration poisoned") = None;
        } else {
            self.stop(false);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.core.name)
            .field("state", &self.state())
            .field("total", &self.total_workers())
            .field("active", &self.active_workers())
            .field("queued", &self.queued())
            .finish()
    }
}
