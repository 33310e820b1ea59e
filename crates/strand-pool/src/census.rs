//! Packed atomic census of worker states.
//!
//! One 32-bit word holds three counters:
//!
//! ```text
//! bits [0..12)   total      workers tracked by the pool (active + parked)
//! bits [12..24)  active     workers eligible to run (not held by the gate)
//! bits [24..32)  die_slots  outstanding self-retire permissions
//! ```
//!
//! Every mutation is a read-modify-CAS over the single word, so the
//! cross-field invariants (`active <= total`, retire consumes a die slot,
//! a retiring all-active pool drops `active` together with `total`) hold at
//! every observable moment without a lock.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

const FIELD_BITS: u32 = 12;
const FIELD_MASK: u32 = (1 << FIELD_BITS) - 1;
const ACTIVE_SHIFT: u32 = FIELD_BITS;
const DIE_SHIFT: u32 = 2 * FIELD_BITS;
const DIE_MASK: u32 = 0xFF;

/// Hard ceiling on `total`, imposed by the 12-bit field.
pub const MAX_TOTAL_WORKERS: u32 = FIELD_MASK;

/// Hard ceiling on outstanding die slots, imposed by the 8-bit field.
pub const MAX_DIE_SLOTS: u32 = DIE_MASK;

/// Retries before the CAS loop yields the CPU instead of spinning.
const SPIN_LIMIT: u32 = 64;

/// Decoded view of the census word at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CensusCounts(u32);

impl CensusCounts {
    fn pack(total: u32, active: u32, die_slots: u32) -> Self {
        debug_assert!(total <= FIELD_MASK);
        debug_assert!(active <= total);
        debug_assert!(die_slots <= DIE_MASK);
        CensusCounts(total | (active << ACTIVE_SHIFT) | (die_slots << DIE_SHIFT))
    }

    #[inline]
    pub fn total(self) -> u32 {
        self.0 & FIELD_MASK
    }

    #[inline]
    pub fn active(self) -> u32 {
        (self.0 >> ACTIVE_SHIFT) & FIELD_MASK
    }

    #[inline]
    pub fn die_slots(self) -> u32 {
        (self.0 >> DIE_SHIFT) & DIE_MASK
    }

    /// Workers held by the gate.
    #[inline]
    pub fn parked(self) -> u32 {
        self.total() - self.active()
    }

    /// Workers that will remain once every outstanding die slot is consumed.
    #[inline]
    pub fn projected_alive(self) -> u32 {
        self.total().saturating_sub(self.die_slots())
    }
}

/// The shared census word plus the construction-time ceiling on `total`.
pub struct Census {
    word: CachePadded<AtomicU32>,
    max_total: u32,
}

/// What `retire_cascade` did besides decrementing `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireOutcome {
    pub active_was_decremented: bool,
    pub die_slot_consumed: bool,
}

impl Census {
    /// `max_total` must be in `[1, MAX_TOTAL_WORKERS]`; the pool validates
    /// this at construction.
    pub fn new(max_total: u32) -> Self {
        debug_assert!((1..=MAX_TOTAL_WORKERS).contains(&max_total));
        Self {
            word: CachePadded::new(AtomicU32::new(0)),
            max_total,
        }
    }

    #[inline]
    pub fn snapshot(&self) -> CensusCounts {
        CensusCounts(self.word.load(Ordering::Acquire))
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.snapshot().total()
    }

    #[inline]
    pub fn active(&self) -> u32 {
        self.snapshot().active()
    }

    #[inline]
    pub fn die_slots(&self) -> u32 {
        self.snapshot().die_slots()
    }

    /// Raise `total` by one. Fails once `total` reaches `min(cap, max_total)`.
    pub fn inc_total(&self, cap: u32) -> bool {
        let cap = cap.min(self.max_total);
        self.mutate(|c| {
            (c.total() < cap).then(|| CensusCounts::pack(c.total() + 1, c.active(), c.die_slots()))
        })
        .is_some()
    }

    /// Lower `total` by one, compensating a spawn that never came up.
    /// Fails at `floor`, and refuses to strand `active` above `total`.
    pub fn dec_total(&self, floor: u32) -> bool {
        self.mutate(|c| {
            (c.total() > floor && c.active() < c.total())
                .then(|| CensusCounts::pack(c.total() - 1, c.active(), c.die_slots()))
        })
        .is_some()
    }

    /// Raise `active` by one. Fails when every tracked worker is already
    /// active.
    pub fn inc_active(&self) -> bool {
        self.mutate(|c| {
            (c.active() < c.total())
                .then(|| CensusCounts::pack(c.total(), c.active() + 1, c.die_slots()))
        })
        .is_some()
    }

    /// Lower `active` by one. Fails at `floor`.
    pub fn dec_active(&self, floor: u32) -> bool {
        self.mutate(|c| {
            (c.active() > floor)
                .then(|| CensusCounts::pack(c.total(), c.active() - 1, c.die_slots()))
        })
        .is_some()
    }

    /// Claim a retirement permission. Succeeds only while the pool would
    /// still hold more than `floor` workers after every outstanding slot is
    /// consumed, `total` is within `ceil`, and the 8-bit field has room.
    pub fn request_die_slot(&self, floor: u32, ceil: u32) -> bool {
        self.mutate(|c| {
            (c.projected_alive() > floor && c.total() <= ceil && c.die_slots() < MAX_DIE_SLOTS)
                .then(|| CensusCounts::pack(c.total(), c.active(), c.die_slots() + 1))
        })
        .is_some()
    }

    /// Atomic composite used exactly once by each exiting worker: consume a
    /// die slot if one is outstanding, drop `active` together with `total`
    /// when the pool was fully active, and drop `total`.
    pub fn retire_cascade(&self) -> RetireOutcome {
        let result = self.mutate(|c| {
            if c.total() == 0 {
                return None;
            }
            let die_slots = c.die_slots().saturating_sub(1);
            let active = if c.active() == c.total() {
                c.active() - 1
            } else {
                c.active()
            };
            Some(CensusCounts::pack(c.total() - 1, active, die_slots))
        });
        match result {
            Some((before, after)) => RetireOutcome {
                active_was_decremented: after.active() < before.active(),
                die_slot_consumed: after.die_slots() < before.die_slots(),
            },
            None => {
                debug_assert!(false, "retire_cascade on an empty census");
                RetireOutcome {
                    active_was_decremented: false,
                    die_slot_consumed: false,
                }
            }
        }
    }

    /// Read-modify-CAS with a bounded spin between retries. The closure
    /// returns `None` to report a failed guard; the loop always converges
    /// because some participant's CAS lands on every round.
    fn mutate<F>(&self, f: F) -> Option<(CensusCounts, CensusCounts)>
    where
        F: Fn(CensusCounts) -> Option<CensusCounts>,
    {
        let mut spins = 0;
        let mut current = CensusCounts(self.word.load(Ordering::Acquire));
        loop {
            let next = f(current)?;
            match self.word.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((current, next)),
                Err(actual) => {
                    current = CensusCounts(actual);
                    spins += 1;
                    if spins < SPIN_LIMIT {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                        spins = 0;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Census {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.snapshot();
        f.debug_struct("Census")
            .field("total", &c.total())
            .field("active", &c.active())
            .field("die_slots", &c.die_slots())
            .field("max_total", &self.max_total)
            .finish()
    }
}
