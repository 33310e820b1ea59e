//! Self-tuning worker pool.
//!
//! A thread pool whose active-worker count follows offered load. Three
//! pieces carry the design: a packed atomic [`census`](census::Census) of
//! worker states, a [`blocker`](blocker::PartialBlocker) gate that parks
//! surplus workers without destroying them, and a periodic controller that
//! reads throughput and queue pressure to grow, throttle, or trim the pool.
//!
//! The supporting primitives (work queue, ticker, cancellation token) are
//! exposed so higher-level schedulers can reuse them directly.
//!
//! ```no_run
//! use strand_pool::{Pool, PoolOptions};
//!
//! let pool = Pool::new(0, 8, 1024, "example", false, PoolOptions::default())?;
//! pool.submit(|| println!("hello from a worker"))?;
//! pool.stop(true);
//! # Ok::<(), strand_pool::PoolError>(())
//! ```

pub mod blocker;
pub mod cancel;
pub mod census;
pub mod error;
mod manager;
pub mod pool;
pub mod queue;
pub mod ticker;
pub mod tracker;
mod worker;

pub use cancel::CancelToken;
pub use error::{PoolError, PoolResult};
pub use pool::{Pool, PoolOptions, PoolState};
pub use ticker::{ManagementTicker, TickRegistration};
