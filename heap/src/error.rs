//! Heap-specific error types.

use std::error::Error;
use std::fmt;

/// Errors produced by heap operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The caller asked for zero bytes.
    InvalidRequest {
        /// Number of bytes requested.
        requested: usize,
    },
    /// The arena cannot satisfy the request, even after a collection.
    OutOfMemory {
        /// Number of bytes requested.
        requested: usize,
        /// Largest request the arena could still satisfy.
        available: usize,
    },
    /// The host refused to map the arena backing store.
    MapFailed {
        /// Requested mapping length in bytes.
        requested: usize,
    },
    /// Settings rejected by validation.
    InvalidSettings {
        /// What was wrong with them.
        reason: &'static str,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest { requested } => {
                write!(f, "invalid allocation request: {requested} bytes")
            }
            Self::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "out of memory: requested {requested} bytes, largest satisfiable request is {available} bytes"
                )
            }
            Self::MapFailed { requested } => {
                write!(f, "failed to map {requested} bytes for the arena")
            }
            Self::InvalidSettings { reason } => {
                write!(f, "invalid heap settings: {reason}")
            }
        }
    }
}

impl Error for HeapError {}
