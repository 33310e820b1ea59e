//! Periodic pool controller.
//!
//! Registered on the shared ticker; each invocation rate-limits itself to
//! the configured management period and then walks a fixed sequence:
//! starvation rescue, growth toward the reasonable worker count, bounded
//! queue extension under stall, critical spawn when nothing is running,
//! and finally the throughput tracker's tuning step.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::pool::{PoolCore, PoolState};
use crate::ticker::TickRegistration;
use crate::worker;

pub(crate) fn register_manager(core: &Arc<PoolCore>) -> TickRegistration {
    let weak = Arc::downgrade(core);
    core.ticker.register(Arc::new(move |dt| match weak.upgrade() {
        Some(core) => manager_tick(&core, dt),
        None => false,
    }))
}

fn manager_tick(core: &Arc<PoolCore>, dt: Duration) -> bool {
    match core.load_state() {
        PoolState::Stopped => return false,
        PoolState::Created | PoolState::StopRequested => return true,
        PoolState::Running => {}
    }

    // Rate-limit: the ticker may run faster than the management period.
    let acc = core.tick_acc_ns.load(Ordering::Relaxed) + dt.as_nanos() as u64;
    if acc < core.management_period.as_nanos() as u64 {
        core.tick_acc_ns.store(acc, Ordering::Relaxed);
        return true;
    }
    core.tick_acc_ns.store(0, Ordering::Relaxed);

    let saw_work = core.saw_work.load(Ordering::Acquire);

    // Starvation rescue: queued work with nobody eligible to run it.
    if core.census.active() == 0 && core.queue.size() > 0 {
        add_or_activate(core, 1);
    }

    // Normal growth toward the preferred steady state.
    let mut rounds = 0;
    while core.census.active() < core.reasonable_workers {
        if !queue_pressure(core) || !add_or_activate(core, core.reasonable_workers) {
            break;
        }
        rounds += 1;
        if rounds >= core.reasonable_workers {
            break;
        }
    }

    // A stalled bounded queue grows before the pool does: extending is
    // cheaper than a worker that the same stall would block.
    if core.queue.is_bounded() && !saw_work {
        let size = core.queue.size();
        let extended = core.queue.extended_capacity();
        let base = core.queue.capacity();
        if size >= extended && extended - base < core.max_queue_extension {
            core.queue.extend_capacity(core.census.total() as usize + 1);
        }
    }

    // Critical spawn: growth is wanted, the pool is at or past the
    // reasonable count, and (almost) nothing is actually on-CPU.
    let mut critical = false;
    if queue_pressure(core) && core.census.total() >= core.reasonable_workers {
        let running = core.running.load(Ordering::Acquire) as u32;
        if running <= 1 || (!saw_work && running < core.reasonable_workers) {
            for _ in 0..2 {
                if !add_or_activate(core, core.max_workers) {
                    break;
                }
            }
            critical = true;
            tracing::debug!(running, "critical growth applied");
        }
    }

    // Throughput tuning.
    let counts = core.census.snapshot();
    let needs_adjustment = counts.total() < core.max_workers && queue_pressure(core);
    let step = core
        .tracker
        .register_and_suggest(counts.active(), needs_adjustment, critical);
    if step > 0 {
        for _ in 0..step {
            if !add_or_activate(core, core.max_workers) {
                break;
            }
        }
    } else if step < 0 {
        for _ in 0..-step {
            if !deactivate_one(core) {
                break;
            }
        }
    }

    core.saw_work.store(false, Ordering::Release);
    true
}

// The bounded-queue clause compares against the base capacity on purpose:
// an extension raises what the queue admits, not the backlog level at which
// the pool must grow.
fn queue_pressure(core: &PoolCore) -> bool {
    let size = core.queue.size();
    size > core.work_items_per_worker * core.census.total() as usize
        || (core.queue.is_bounded() && size >= core.queue.capacity())
}

/// Bring one more worker into the active set: unpark a parked one if any,
/// else spawn a thread. The census moves before the blocker on the unpark
/// path and is reverted when no park demand was outstanding.
pub(crate) fn add_or_activate(core: &Arc<PoolCore>, cap: u32) -> bool {
    if core.census.inc_active() {
        if core.blocker.sub_expected(1) > 0 {
            return true;
        }
        core.census.dec_active(0);
    }

    if core.load_state() != PoolState::Running {
        return false;
    }
    if !core.census.inc_total(cap) {
        return false;
    }
    match worker::spawn_worker(core) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("worker spawn failed: {e}");
            core.census.dec_total(0);
            false
        }
    }
}

/// Park one active worker: census first, then a unit of gate demand.
fn deactivate_one(core: &Arc<PoolCore>) -> bool {
    if core.census.dec_active(core.reasonable_workers) {
        core.blocker.add_expected(1);
        true
    } else {
        false
    }
}

/// Submission-path fast spawn: skip the management-tick latency for
/// trivially parallel bursts. Purely an optimisation; every invariant holds
/// without it.
pub(crate) fn maybe_spawn(core: &Arc<PoolCore>) {
    let active = core.census.active();
    if active < core.fast_spawn_limit && (active as usize) < core.queue.size() + 2 {
        add_or_activate(core, core.fast_spawn_limit);
    }
}
