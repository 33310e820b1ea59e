//! Work-item queue: a global injector, per-worker local deques with steal
//! support, and a bounded-capacity accounting layer that the controller can
//! extend when the pool is stalled.
//!
//! `len` counts items accepted but not yet handed to a worker for
//! execution. Items staged into a local deque by a batch steal still count
//! as queued; the counter drops exactly once per item returned from a take.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerDeque};
use crossbeam_utils::CachePadded;

use crate::cancel::CancelToken;

/// Items moved per refill from the injector into a local deque.
const REFILL_BATCH: usize = 16;
/// Items moved per steal from another worker's local deque.
const STEAL_BATCH: usize = 8;

/// Rejected insertion, handing the item back to the caller.
#[derive(Debug)]
pub enum AddError<T> {
    /// Bounded queue at (extended) capacity.
    Full(T),
    /// The queue no longer accepts work.
    Closed(T),
}

impl<T> AddError<T> {
    pub fn into_inner(self) -> T {
        match self {
            AddError::Full(item) | AddError::Closed(item) => item,
        }
    }
}

/// Per-worker handle: a local FIFO deque plus the steal-rotation state.
/// Owned by exactly one worker thread.
pub struct LocalQueue<T> {
    worker: WorkerDeque<T>,
    id: u64,
    seed: Cell<u64>,
}

impl<T> LocalQueue<T> {
    /// xorshift step seeded once from the process RNG; rotates the steal
    /// starting point so workers don't gang up on one victim.
    fn next_index(&self) -> u64 {
        let mut x = self.seed.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed.set(x);
        x
    }
}

pub struct WorkQueue<T> {
    injector: Injector<T>,
    stealers: Mutex<Vec<(u64, Stealer<T>)>>,
    next_local_id: AtomicU64,

    len: CachePadded<AtomicUsize>,
    /// Base capacity; 0 means unbounded.
    base_capacity: usize,
    /// Current effective capacity (base plus any extension granted).
    extended: CachePadded<AtomicUsize>,
    max_extension: usize,

    closed: AtomicBool,
    take_sleepers: AtomicUsize,
    add_sleepers: AtomicUsize,
    sleep_mutex: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize, max_extension: usize) -> Self {
        Self {
            injector: Injector::new(),
            stealers: Mutex::new(Vec::new()),
            next_local_id: AtomicU64::new(0),
            len: CachePadded::new(AtomicUsize::new(0)),
            base_capacity: capacity,
            extended: CachePadded::new(AtomicUsize::new(capacity)),
            max_extension,
            closed: AtomicBool::new(false),
            take_sleepers: AtomicUsize::new(0),
            add_sleepers: AtomicUsize::new(0),
            sleep_mutex: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.base_capacity
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.base_capacity > 0
    }

    /// Effective capacity after extensions. Only meaningful when bounded.
    #[inline]
    pub fn extended_capacity(&self) -> usize {
        self.extended.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Grow the effective capacity by `n`, clamped so the total extension
    /// never exceeds the configured maximum. Returns the new capacity.
    pub fn extend_capacity(&self, n: usize) -> usize {
        if !self.is_bounded() {
            return 0;
        }
        let ceiling = self.base_capacity + self.max_extension;
        let new = self
            .extended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur.saturating_add(n).min(ceiling);
                (next != cur).then_some(next)
            })
            .map(|prev| prev.saturating_add(n).min(ceiling))
            .unwrap_or(ceiling);
        tracing::debug!(capacity = new, "queue capacity extended");
        // Waiting producers may now have room.
        if self.add_sleepers.load(Ordering::Relaxed) > 0 {
            let _g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.not_full.notify_all();
        }
        new
    }

    /// Non-blocking insert.
    pub fn try_add(&self, item: T) -> Result<(), AddError<T>> {
        if self.is_closed() {
            return Err(AddError::Closed(item));
        }
        if !self.reserve_slot() {
            return Err(AddError::Full(item));
        }
        self.injector.push(item);
        self.notify_taker();
        Ok(())
    }

    /// Insert, blocking while a bounded queue is full. Fails only once the
    /// queue is closed.
    pub fn add(&self, item: T) -> Result<(), AddError<T>> {
        let mut item = item;
        loop {
            match self.try_add(item) {
                Ok(()) => return Ok(()),
                Err(AddError::Closed(it)) => return Err(AddError::Closed(it)),
                Err(AddError::Full(it)) => item = it,
            }
            let g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.add_sleepers.fetch_add(1, Ordering::Relaxed);
            // Re-check after registering so a racing take cannot strand us.
            if self.is_closed() || self.len.load(Ordering::Acquire) < self.extended_capacity() {
                self.add_sleepers.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
            let g = self.not_full.wait(g).expect("queue condvar poisoned");
            drop(g);
            self.add_sleepers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Non-blocking take: local deque first, then a batched refill from the
    /// injector.
    pub fn take_now(&self, local: &LocalQueue<T>) -> Option<T> {
        if let Some(item) = local.worker.pop() {
            self.note_taken();
            return Some(item);
        }
        loop {
            match self
                .injector
                .steal_batch_with_limit_and_pop(&local.worker, REFILL_BATCH)
            {
                Steal::Success(item) => {
                    self.note_taken();
                    return Some(item);
                }
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Take with a timeout. `timeout` of `None` waits until an item arrives,
    /// the token fires, or the queue closes. `steal_allowed` additionally
    /// raids other workers' local deques before sleeping.
    pub fn take(
        &self,
        local: &LocalQueue<T>,
        timeout: Option<Duration>,
        token: &CancelToken,
        steal_allowed: bool,
    ) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = self.take_now(local) {
                return Some(item);
            }
            if steal_allowed {
                if let Some(item) = self.steal_into(local) {
                    self.note_taken();
                    return Some(item);
                }
            }
            if token.is_cancelled() || self.is_closed() {
                return None;
            }

            let g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.take_sleepers.fetch_add(1, Ordering::Relaxed);
            // An add that raced us has already published to the injector.
            if !self.injector.is_empty() || self.is_closed() || token.is_cancelled() {
                self.take_sleepers.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.take_sleepers.fetch_sub(1, Ordering::Relaxed);
                        return None;
                    }
                    let (g, _) = self
                        .not_empty
                        .wait_timeout(g, deadline - now)
                        .expect("queue condvar poisoned");
                    drop(g);
                }
                None => {
                    let g = self.not_empty.wait(g).expect("queue condvar poisoned");
                    drop(g);
                }
            }
            self.take_sleepers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Register a local deque for a new worker thread.
    pub fn register_local(&self) -> LocalQueue<T> {
        let worker = WorkerDeque::new_fifo();
        let id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        self.stealers
            .lock()
            .expect("queue stealer registry poisoned")
            .push((id, worker.stealer()));
        LocalQueue {
            worker,
            id,
            seed: Cell::new(rand::random::<u64>() | 1),
        }
    }

    /// Return a worker's staged items to the injector and drop its stealer.
    /// Called by every exiting worker so no accepted item is stranded.
    pub fn deregister_local(&self, local: LocalQueue<T>) {
        let mut moved = 0usize;
        while let Some(item) = local.worker.pop() {
            self.injector.push(item);
            moved += 1;
        }
        self.stealers
            .lock()
            .expect("queue stealer registry poisoned")
            .retain(|(id, _)| *id != local.id);
        if moved > 0 {
            let _g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.not_empty.notify_all();
        }
    }

    /// Stop accepting work and wake everyone blocked on the queue.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_all();
    }

    pub fn wake_all(&self) {
        let _g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Hand every remaining item to `f`. Used by the pool after workers have
    /// joined; also sweeps stealers left by workers that died uncleanly.
    pub fn drain(&self, mut f: impl FnMut(T)) {
        loop {
            match self.injector.steal() {
                Steal::Success(item) => {
                    self.note_taken();
                    f(item);
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        let stealers = self
            .stealers
            .lock()
            .expect("queue stealer registry poisoned");
        for (_, stealer) in stealers.iter() {
            loop {
                match stealer.steal() {
                    Steal::Success(item) => {
                        self.note_taken();
                        f(item);
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
    }

    fn steal_into(&self, local: &LocalQueue<T>) -> Option<T> {
        let stealers = self
            .stealers
            .lock()
            .expect("queue stealer registry poisoned");
        let n = stealers.len();
        if n <= 1 {
            return None;
        }
        let start = (local.next_index() % n as u64) as usize;
        for i in 0..n {
            let (id, stealer) = &stealers[(start + i) % n];
            if *id == local.id {
                continue;
            }
            loop {
                match stealer.steal_batch_with_limit_and_pop(&local.worker, STEAL_BATCH) {
                    Steal::Success(item) => return Some(item),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    fn reserve_slot(&self) -> bool {
        if !self.is_bounded() {
            self.len.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let cap = self.extended_capacity();
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| {
                (l < cap).then(|| l + 1)
            })
            .is_ok()
    }

    fn note_taken(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        if self.add_sleepers.load(Ordering::Relaxed) > 0 {
            let _g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.not_full.notify_one();
        }
    }

    fn notify_taker(&self) {
        if self.take_sleepers.load(Ordering::Relaxed) > 0 {
            let _g = self.sleep_mutex.lock().expect("queue sleep mutex poisoned");
            self.not_empty.notify_one();
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.size())
            .field("capacity", &self.base_capacity)
            .field("extended", &self.extended_capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
