//! Error types for the Floodgate engine.
//!
//! The taxonomy follows one rule: validation and conflict errors are
//! surfaced to the caller, everything else is recovered internally.
//! Backend failures are absorbed by the resilient store's failover,
//! config load failures fall back to the last-known-good snapshot, and
//! event persistence failures are logged and swallowed. The admission
//! path itself never fails closed because of an internal error.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A manual block target or filter failed format validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// An active block already covers the requested target.
    ///
    /// Surfaced with a distinct variant so callers can offer an
    /// overwrite flow instead of treating it as a hard failure.
    #[error("an active block already exists for this target")]
    BlockExists,

    /// A storage backend failed and no fallback could serve the call.
    #[error("storage backend error: {0}")]
    Backend(#[from] StoreError),

    /// Rate limit configuration could not be loaded from storage.
    #[error("configuration load error: {0}")]
    ConfigLoad(String),

    /// An audit event could not be persisted.
    #[error("event persistence error: {0}")]
    EventPersist(String),

    /// I/O errors (settings file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
