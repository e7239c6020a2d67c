#![forbid(unsafe_code)]
//! Error types for StrataFS accounting.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all accounting operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    /// A reservation recalculation could not take the GC lock without
    /// blocking while btree locks were held; the caller must unwind and
    /// retry.
    #[error("operation would block")]
    WouldBlock,

    #[error("pointer to nonexistent stripe {idx}")]
    MissingStripe { idx: u64 },

    #[error("stripe {idx} already exists")]
    StripeExists { idx: u64 },

    /// Accounting corruption detected at runtime. Debug builds panic before
    /// this is ever constructed; release builds surface it and mark the
    /// filesystem inconsistent.
    #[error("filesystem inconsistency: {0}")]
    Inconsistency(String),
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
