use thiserror::Error;

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the pool's public API and its wait primitives.
///
/// A full bounded queue is not an error: `try_submit` reports it as
/// `Ok(false)`. Internal CAS retries never surface here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidArgument(String),

    #[error("pool is closed to new work")]
    Closed,

    #[error("wait cancelled")]
    Cancelled,

    #[error("wait interrupted by pool disposal")]
    Interrupted,
}
