//! Local overlay cache and local documents view for an offline-first
//! document database client.
//!
//! A client holds three pieces of state about the documents it knows
//! about: the last acknowledged value from the server (the *remote
//! document cache*), the pending writes it has queued but not yet had
//! acknowledged (the *mutation queue*), and a derived, memoized view of
//! "what the document looks like with pending writes applied" (the
//! *overlay cache*). This crate owns the overlay cache and the view layer
//! that keeps it consistent as remote state and the mutation queue change
//! underneath it; the remote cache, mutation queue and index manager are
//! injected collaborators (see [`collaborators`]).
//!
//! Two interchangeable overlay cache backends are provided:
//! [`overlay_cache::MemoryOverlayCache`] (overlays die with the process) and
//! [`overlay_cache::PersistentOverlayCache`] (backed by an injected
//! [`overlay_cache::persistent::IndexedStore`]). Both satisfy the same
//! [`overlay_cache::OverlayCache`] contract, so [`local_documents::LocalDocumentsView`]
//! is indifferent to which one it's handed.
pub mod collaborators;
pub mod config;
pub mod document;
pub mod error;
pub mod local_documents;
pub mod mutation;
pub mod overlay;
pub mod overlay_cache;
pub mod path;
pub mod sorted_map;
pub mod transaction;

#[cfg(test)]
mod proptests;
#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use collaborators::{
    query_matches,
    Clock,
    IndexManager,
    MutationBatch,
    MutationQueue,
    Query,
    QueryFilter,
    QueryOffset,
    QueryTarget,
    RemoteDocumentCache,
    SystemClock,
};
pub use document::{
    ConvexObject,
    FieldPath,
    FoundDocument,
    MaybeDocument,
    Timestamp,
};
pub use error::OverlayError;
pub use local_documents::LocalDocumentsView;
pub use mutation::{
    calculate_overlay_mutation,
    FieldMask,
    Mutation,
    PatchValue,
    Precondition,
};
pub use overlay::{
    BatchId,
    Overlay,
    BATCH_ID_UNKNOWN,
};
pub use overlay_cache::{
    MemoryOverlayCache,
    OverlayCache,
    PersistentOverlayCache,
};
pub use path::{
    DocumentKey,
    ResourcePath,
};
pub use transaction::PersistenceTransaction;
