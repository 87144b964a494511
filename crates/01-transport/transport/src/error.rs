//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: capacity validation,
//! allocation/mapping failures, and misuse of the framed ring. Back-pressure is
//! not an error; rings report it through [`crate::RingWrite::Full`].

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Debug)]
/// Errors surfaced by low-level transport helpers.
pub enum TransportError {
    /// Requested ring capacity is below the minimum or not a power of two.
    InvalidCapacity { requested: usize, minimum: usize },
    /// Allocation of a shared region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
    /// Creating or mapping a file-backed region failed.
    MappingFailed { path: PathBuf, source: io::Error },
    /// Message does not fit the ring's maximum record length.
    MessageTooLong { length: usize, maximum: usize },
    /// Message type identifiers must be strictly positive.
    InvalidMessageType(i32),
    /// The single consumer of a ring has already been handed out.
    ConsumerClaimed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidCapacity { requested, minimum } => {
                write!(
                    f,
                    "ring capacity {requested} must be a power of two of at least {minimum} bytes"
                )
            }
            TransportError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate shared region of {size} bytes aligned to {alignment}"
                )
            }
            TransportError::MappingFailed { path, source } => {
                write!(f, "failed to map {}: {source}", path.display())
            }
            TransportError::MessageTooLong { length, maximum } => {
                write!(f, "message of {length} bytes exceeds maximum of {maximum}")
            }
            TransportError::InvalidMessageType(id) => {
                write!(f, "message type id {id} must be greater than zero")
            }
            TransportError::ConsumerClaimed => write!(f, "ring consumer already claimed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::MappingFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
