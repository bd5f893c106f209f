use thiserror::Error;

/// Specialized result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the observation engines.
///
/// Lifecycle mismatches (starting a running engine, stopping a stopped one)
/// are not errors; they are reported through [`StartOutcome`][crate::watch::StartOutcome]
/// and [`StopOutcome`][crate::watch::StopOutcome] so callers can treat them
/// as idempotent.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An argument failed validation; the operation had no side effects.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The engine backing a handle is gone.
    #[error("engine not initialized")]
    NotInitialized,

    /// A singleton resource was set up twice.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The named entry is not registered.
    #[error("entry not found")]
    NotFound,

    /// The named entry is already registered.
    #[error("entry already exists")]
    Exists,

    /// Registry growth failed; nothing was added.
    #[error("out of memory")]
    OutOfMemory,
}
