//! Shared management ticker.
//!
//! A single named thread periodically invokes registered callbacks with the
//! time elapsed since their last invocation. Callbacks rate-limit
//! themselves; returning `false` requests removal. Registration hands back
//! an RAII guard whose drop unregisters, so a dying owner can never leave a
//! dangling callback behind. The tick thread exits once the registry is
//! empty and is restarted on the next registration.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Periodic callback. Receives the elapsed time since its previous
/// invocation; returns `false` to be removed.
pub type TickCallback = Arc<dyn Fn(Duration) -> bool + Send + Sync>;

struct Entry {
    callback: TickCallback,
    last: Instant,
}

struct Registry {
    entries: HashMap<u64, Entry>,
    /// True while a tick thread is alive for this registry.
    running: bool,
}

pub struct ManagementTicker {
    name: String,
    period: Duration,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// RAII guard for a registered callback; dropping it unregisters.
pub struct TickRegistration {
    ticker: Weak<ManagementTicker>,
    id: u64,
}

impl Drop for TickRegistration {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.upgrade() {
            ticker.unregister(self.id);
        }
    }
}

static GLOBAL: OnceLock<Arc<ManagementTicker>> = OnceLock::new();

impl ManagementTicker {
    pub fn new(name: impl Into<String>, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            period: period.max(Duration::from_millis(1)),
            registry: Mutex::new(Registry {
                entries: HashMap::new(),
                running: false,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// The process-wide ticker most pools share.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| ManagementTicker::new("strand", Duration::from_millis(100)))
            .clone()
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn register(self: &Arc<Self>, callback: TickCallback) -> TickRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.registry.lock().expect("ticker registry poisoned");
        reg.entries.insert(
            id,
            Entry {
                callback,
                last: Instant::now(),
            },
        );
        self.ensure_thread(&mut reg);
        TickRegistration {
            ticker: Arc::downgrade(self),
            id,
        }
    }

    fn unregister(&self, id: u64) -> bool {
        let mut reg = self.registry.lock().expect("ticker registry poisoned");
        reg.entries.remove(&id).is_some()
    }

    fn ensure_thread(self: &Arc<Self>, reg: &mut Registry) {
        if reg.running {
            return;
        }
        reg.running = true;
        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-tick", self.name))
            .spawn(move || tick_loop(weak));
        if let Err(e) = spawned {
            reg.running = false;
            tracing::warn!("failed to start tick thread: {e}");
        }
    }
}

fn tick_loop(weak: Weak<ManagementTicker>) {
    loop {
        let Some(ticker) = weak.upgrade() else { return };
        let period = ticker.period;

        let due: Vec<(u64, TickCallback, Duration)> = {
            let mut reg = ticker.registry.lock().expect("ticker registry poisoned");
            let now = Instant::now();
            reg.entries
                .iter_mut()
                .map(|(id, entry)| {
                    let dt = now.duration_since(entry.last);
                    entry.last = now;
                    (*id, Arc::clone(&entry.callback), dt)
                })
                .collect()
        };

        let mut remove = Vec::new();
        for (id, callback, dt) in due {
            let keep = catch_unwind(AssertUnwindSafe(|| callback(dt))).unwrap_or_else(|_| {
                tracing::error!("tick callback panicked; removing it");
                false
            });
            if !keep {
                remove.push(id);
            }
        }

        {
            let mut reg = ticker.registry.lock().expect("ticker registry poisoned");
            for id in remove {
                reg.entries.remove(&id);
            }
            if reg.entries.is_empty() {
                reg.running = false;
                return;
            }
        }

        // Don't hold the ticker alive while sleeping.
        drop(ticker);
        thread::sleep(period);
    }
}

impl std::fmt::Debug for ManagementTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementTicker")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish()
    }
}
