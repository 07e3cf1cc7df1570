//! Structural faults, rendered the way the teacher crate's `errors` crate
//! renders them: a small closed enum carrying enough structure for tests and
//! logs to match on the *kind* of failure, propagated through `anyhow`.
//!
//! A precondition that isn't met on a mutation apply is deliberately *not*
//! represented here: per the overlay cache's error taxonomy, that's a no-op,
//! not a fault.
use thiserror::Error;

use crate::path::DocumentKey;

#[derive(Debug, Error)]
pub enum OverlayError {
    /// The underlying transactional store failed or the transaction was
    /// aborted by the host. Fatal to the enclosing transaction; no local
    /// retry is attempted here.
    #[error("overlay store operation failed")]
    StorageFault {
        #[source]
        source: anyhow::Error,
    },

    /// A persisted overlay record failed to deserialize. Treated as a fatal
    /// invariant break for the affected transaction.
    #[error("overlay for {key:?} is corrupted")]
    CorruptedOverlay {
        key: DocumentKey,
        #[source]
        source: anyhow::Error,
    },
}

impl OverlayError {
    pub fn storage_fault(source: impl Into<anyhow::Error>) -> Self {
        OverlayError::StorageFault { source: source.into() }
    }

    pub fn corrupted_overlay(key: DocumentKey, source: impl Into<anyhow::Error>) -> Self {
        OverlayError::CorruptedOverlay { key, source: source.into() }
    }
}
