//! Per-thread worker loop.
//!
//! Every loop iteration passes the blocker gate first (a pair of atomic
//! loads when no parking demand exists), then polls the queue. A poll miss
//! chooses between a long poll (at or below the reasonable worker count)
//! and a short poll (above it); timeouts either retire the worker through a
//! die slot or park it on the gate. The census is adjusted exactly once per
//! park: either by this worker (own demand) or by the controller (absorbed
//! demand), never both.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use crate::blocker::WaitOutcome;
use crate::cancel::CancelToken;
use crate::pool::{Job, PoolCore};
use crate::queue::LocalQueue;

/// Join-handle slot, claimed by CAS before each spawn. Slots are
/// preallocated to `max_workers` so worker identity never needs a lock on
/// the hot path.
pub(crate) struct WorkerSlot {
    occupied: AtomicBool,
    /// Set by the spawner once the join handle is parked in the slot; the
    /// worker waits for it before vacating, so a reaped handle can never be
    /// confused with one that was not stored yet.
    started: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerSlot {
    pub(crate) fn empty() -> Self {
        Self {
            occupied: AtomicBool::new(false),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }

    pub(crate) fn take_handle(&self) -> Option<thread::JoinHandle<()>> {
        self.handle.lock().expect("worker slot poisoned").take()
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<thread::JoinHandle<()>>> {
        self.handle.lock().expect("worker slot poisoned")
    }
}

enum Exit {
    /// Claimed a die slot; the cascade settles the census.
    Retired,
    /// Cancellation or queue closure observed.
    Cancelled,
}

struct WorkerCtx {
    core: Arc<PoolCore>,
    id: u64,
    token: CancelToken,
    local: LocalQueue<Job>,
    /// Worker-local view of its census activeness.
    active: Cell<bool>,
}

/// Spawn one worker thread. The caller has already raised `total`; this
/// only claims a slot and starts the OS thread, so a failure here is
/// compensated by the caller with `dec_total`.
pub(crate) fn spawn_worker(core: &Arc<PoolCore>) -> std::io::Result<()> {
    let slot = claim_slot(core)
        .ok_or_else(|| std::io::Error::other("no free worker slot"))?;
    core.slots[slot].started.store(false, Ordering::Release);
    // Drop any finished predecessor's handle, detaching its dead thread.
    drop(core.slots[slot].take_handle());

    let id = core.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let token = core.cancel.clone();
    let core2 = Arc::clone(core);

    let spawned = thread::Builder::new()
        .name(format!("{}-worker-{}", core.name, id))
        .spawn(move || worker_main(core2, slot, id, token));

    match spawned {
        Ok(handle) => {
            *core.slots[slot].lock_handle() = Some(handle);
            core.slots[slot].started.store(true, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            core.slots[slot].occupied.store(false, Ordering::Release);
            Err(e)
        }
    }
}

fn claim_slot(core: &PoolCore) -> Option<usize> {
    core.slots.iter().position(|s| {
        s.occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    })
}

fn worker_main(core: Arc<PoolCore>, slot: usize, id: u64, token: CancelToken) {
    tracing::trace!(worker = id, "worker thread started");
    let local = core.queue.register_local();
    // The spawn path only raised `total`; a fresh worker claims activeness
    // itself before its first poll.
    claim_active(&core);

    let ctx = WorkerCtx {
        core: Arc::clone(&core),
        id,
        token,
        local,
        active: Cell::new(true),
    };

    let exit = match catch_unwind(AssertUnwindSafe(|| run_loop(&ctx))) {
        Ok(exit) => exit,
        Err(_) => {
            tracing::error!(worker = id, "worker loop panicked; retiring the worker");
            Exit::Cancelled
        }
    };

    if ctx.token.is_cancelled() {
        shutdown_drain(&ctx);
    }

    match exit {
        Exit::Retired => {}
        Exit::Cancelled => {
            if ctx.active.get() {
                core.census.dec_active(0);
            }
        }
    }
    core.census.retire_cascade();

    let WorkerCtx { local, .. } = ctx;
    core.queue.deregister_local(local);

    // Don't vacate the slot before the spawner has parked our join handle.
    while !core.slots[slot].started.load(Ordering::Acquire) {
        thread::yield_now();
    }
    core.slots[slot].occupied.store(false, Ordering::Release);
    tracing::trace!(worker = id, "worker thread exited");
}

fn run_loop(ctx: &WorkerCtx) -> Exit {
    let core = &ctx.core;
    loop {
        if ctx.token.is_cancelled() {
            return Exit::Cancelled;
        }

        if !ctx.active.get() {
            match core.blocker.wait(core.trim_period, &ctx.token) {
                Ok(WaitOutcome::Released) | Ok(WaitOutcome::Passed) => {
                    // Released: the controller raised `active` for us.
                    // Passed: another worker absorbed the demand; our census
                    // share was never spent.
                    ctx.active.set(true);
                }
                Ok(WaitOutcome::TimedOut) => {
                    // Parked for a whole trim period with no demand for us.
                    if core
                        .census
                        .request_die_slot(core.min_workers, core.max_workers)
                    {
                        tracing::trace!(worker = ctx.id, "idle past trim period, retiring");
                        return Exit::Retired;
                    }
                    claim_active(core);
                    ctx.active.set(true);
                }
                Err(_) => return Exit::Cancelled,
            }
        }

        // Fast path: something is already runnable.
        if let Some(job) = core.queue.take_now(&ctx.local) {
            execute(ctx, job);
            continue;
        }

        let seen_active = core.census.active();
        if seen_active <= core.reasonable_workers {
            // Long poll: hold the line at the preferred steady state.
            match core.queue.take(&ctx.local, core.trim_period, &ctx.token, true) {
                Some(job) => execute(ctx, job),
                None => {
                    if ctx.token.is_cancelled() || core.queue.is_closed() {
                        return Exit::Cancelled;
                    }
                    if core.trim_period.is_none() {
                        continue;
                    }
                    // Idle for a full trim period: retire, else park.
                    if core.blocker.has_unmet_demand() {
                        ctx.active.set(false);
                    } else if core.census.dec_active(core.min_workers) {
                        if core
                            .census
                            .request_die_slot(core.min_workers, core.max_workers)
                        {
                            tracing::trace!(worker = ctx.id, "trimming idle worker");
                            return Exit::Retired;
                        }
                        core.blocker.add_expected(1);
                        ctx.active.set(false);
                    }
                }
            }
        } else {
            // Short poll: a surplus worker lingers briefly to steal strays,
            // then deactivates.
            match core
                .queue
                .take(&ctx.local, Some(core.steal_awake_period), &ctx.token, true)
            {
                Some(job) => execute(ctx, job),
                None => {
                    if ctx.token.is_cancelled() || core.queue.is_closed() {
                        return Exit::Cancelled;
                    }
                    let total = core.census.total();
                    let floor = if seen_active > core.reasonable_workers {
                        core.reasonable_workers
                    } else if total > core.fast_spawn_limit {
                        core.fast_spawn_limit
                    } else {
                        core.min_workers
                    };
                    if core.blocker.has_unmet_demand() {
                        ctx.active.set(false);
                    } else if core.census.dec_active(floor) {
                        core.blocker.add_expected(1);
                        ctx.active.set(false);
                    }
                }
            }
        }
    }
}

/// Rejoin the active set. Only contended for the instant between a
/// controller's speculative `inc_active` and its revert, so the retry loop
/// is short in practice.
fn claim_active(core: &PoolCore) {
    while !core.census.inc_active() {
        std::hint::spin_loop();
        thread::yield_now();
    }
}

fn execute(ctx: &WorkerCtx, job: Job) {
    let core = &ctx.core;
    core.running.fetch_add(1, Ordering::AcqRel);
    let result = catch_unwind(AssertUnwindSafe(job));
    core.running.fetch_sub(1, Ordering::AcqRel);
    if result.is_err() {
        tracing::warn!(worker = ctx.id, "work item panicked");
    }
    core.tracker.register_execution();
    core.saw_work.store(true, Ordering::Release);
    core.executed.fetch_add(1, Ordering::Relaxed);
}

/// Empty the queue after cancellation: run everything under let-finish,
/// otherwise count and discard.
fn shutdown_drain(ctx: &WorkerCtx) {
    let core = &ctx.core;
    let let_finish = core.let_finish.load(Ordering::Acquire);
    let mut cancelled = 0u64;
    while let Some(job) = core.queue.take_now(&ctx.local) {
        if let_finish {
            execute(ctx, job);
        } else {
            drop(job);
            cancelled += 1;
        }
    }
    if cancelled > 0 {
        core.cancelled_items.fetch_add(cancelled, Ordering::Relaxed);
        tracing::debug!(worker = ctx.id, cancelled, "discarded queued items on shutdown");
    }
}
