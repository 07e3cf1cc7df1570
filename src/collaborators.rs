//! External collaborator contracts (§4.5): the remote document cache, the
//! mutation queue, the index manager and the query primitives. These are
//! treated as injected dependencies of [`crate::local_documents::LocalDocumentsView`]
//! rather than implemented by this crate; persistence mechanics, schema
//! migration and wire serialization live behind these traits and are out of
//! scope here.
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{
    document::{
        FieldPath,
        MaybeDocument,
        Timestamp,
    },
    mutation::{
        FieldMask,
        Mutation,
    },
    overlay::BatchId,
    path::{
        DocumentKey,
        ResourcePath,
    },
    transaction::PersistenceTransaction,
};

/// Injects `now()` for local-write timestamps, mirroring the teacher crate's
/// `common::runtime::Runtime` abstraction over wall-clock time so tests can
/// supply a fixed clock instead of reading `SystemTime::now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The default clock, backed by the system wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp::new(micros)
    }
}

/// The remote document cache: the durable, server-acknowledged view of
/// documents, with no knowledge of overlays or pending mutations.
#[async_trait]
pub trait RemoteDocumentCache: Send + Sync {
    async fn get_entry(
        &self,
        tx: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> anyhow::Result<MaybeDocument>;

    async fn get_entries(
        &self,
        tx: &mut PersistenceTransaction,
        keys: &[DocumentKey],
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut result = BTreeMap::new();
        for key in keys {
            result.insert(key.clone(), self.get_entry(tx, key).await?);
        }
        Ok(result)
    }

    async fn get_documents_matching_query(
        &self,
        tx: &mut PersistenceTransaction,
        query: &Query,
        since_read_time: Timestamp,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>>;
}

/// A single batch of mutations assigned a batch id by the mutation queue.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.mutations.iter().map(Mutation::key)
    }

    /// Applies every mutation in this batch that targets `key` to `doc`, in
    /// order, folding the touched fields into `mask`.
    pub fn apply_to_local_view_with_field_mask(
        &self,
        key: &DocumentKey,
        doc: &mut MaybeDocument,
        mask: FieldMask,
        local_write_time: Timestamp,
    ) -> FieldMask {
        let mut mask = mask;
        for mutation in self.mutations.iter().filter(|m| m.key() == key) {
            mask = mutation.apply_to_local_view_with_field_mask(doc, mask, local_write_time);
        }
        mask
    }
}

/// The mutation queue: the ordered log of batches the client has sent to, or
/// is about to send to, the server.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// Returns every batch that touches at least one key in `keys`, ordered
    /// ascending by `batch_id`.
    async fn get_all_mutation_batches_affecting_document_keys(
        &self,
        tx: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> anyhow::Result<Vec<MutationBatch>>;
}

/// Resolves a collection-group id to the parent collection paths that have
/// at least one sub-collection with that id.
#[async_trait]
pub trait IndexManager: Send + Sync {
    async fn get_collection_parents(
        &self,
        tx: &mut PersistenceTransaction,
        collection_group: &str,
    ) -> anyhow::Result<Vec<ResourcePath>>;
}

/// A minimal top-level equality filter, sufficient to drive the query-match
/// scenarios this crate is responsible for (full query planning is out of
/// scope; see §1).
#[derive(Clone, Debug, PartialEq)]
pub struct QueryFilter {
    pub field: FieldPath,
    pub equals: JsonValue,
}

/// What a [`Query`] ranges over. A sum type rather than parity-based path
/// inspection, per the "dynamic variant checks" design note: the caller
/// states its intent directly instead of us inferring it from path shape.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryTarget {
    Document(DocumentKey),
    Collection(ResourcePath),
    CollectionGroup(Arc<str>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub target: QueryTarget,
    pub filter: Option<QueryFilter>,
}

impl Query {
    pub fn document(key: DocumentKey) -> Self {
        Self { target: QueryTarget::Document(key), filter: None }
    }

    pub fn collection(path: ResourcePath) -> Self {
        Self { target: QueryTarget::Collection(path), filter: None }
    }

    pub fn collection_group(group: impl Into<Arc<str>>) -> Self {
        Self { target: QueryTarget::CollectionGroup(group.into()), filter: None }
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn is_document_query(&self) -> bool {
        matches!(self.target, QueryTarget::Document(_))
    }

    pub fn is_collection_group_query(&self) -> bool {
        matches!(self.target, QueryTarget::CollectionGroup(_))
    }

    /// Rebinds this query to a collection query rooted at `path`, keeping
    /// the filter. Used to fan a collection-group query out across each of
    /// its parent collections.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Query {
        Query {
            target: QueryTarget::Collection(path),
            filter: self.filter.clone(),
        }
    }
}

/// Tests whether `doc` satisfies `query`'s filter. A document that doesn't
/// exist never matches.
pub fn query_matches(query: &Query, doc: &MaybeDocument) -> bool {
    let Some(found) = doc.as_found() else {
        return false;
    };
    match &query.filter {
        None => true,
        Some(filter) => found.data.get(&filter.field) == Some(&filter.equals),
    }
}

/// The cursor a caller holds between calls to
/// [`crate::local_documents::LocalDocumentsView::get_documents_matching_query`]:
/// the remote read time and overlay batch id it has already observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryOffset {
    pub read_time: Timestamp,
    pub largest_batch_id: BatchId,
}

impl QueryOffset {
    pub fn none() -> Self {
        Self { read_time: Timestamp::MIN, largest_batch_id: crate::overlay::BATCH_ID_UNKNOWN }
    }
}
