//! Error taxonomy for the allocator (spec §7).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdError>;

/// Errors produced by the allocator and its transaction engine.
///
/// Names are descriptive rather than mirroring the original's numeric error
/// codes; callers should match on variant, not on any `Display` text.
#[derive(Debug, Error)]
pub enum AdError {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("out of memory")]
    NoMemory,

    #[error("no space available: {0}")]
    NoSpace(String),

    #[error("address refers to no published group/arena: {0}")]
    NonExistent(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("operation canceled")]
    Canceled,

    #[error("division by zero")]
    DivByZero,

    #[error("backing store I/O error")]
    Io(#[from] std::io::Error),
}

impl AdError {
    /// True for errors that are safe to retry against a different arena
    /// selector (spec §4.4's LAST_USED → REUSE → NEW fallthrough).
    pub fn is_no_space(&self) -> bool {
        matches!(self, AdError::NoSpace(_))
    }
}
