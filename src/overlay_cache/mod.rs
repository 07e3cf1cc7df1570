//! The `OverlayCache` contract (§4.3), shared by the in-memory (C3) and
//! persistent (C4) implementations.
pub mod memory;
pub mod persistent;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    mutation::Mutation,
    overlay::{
        BatchId,
        Overlay,
    },
    path::{
        DocumentKey,
        ResourcePath,
    },
    transaction::PersistenceTransaction,
};

pub use memory::MemoryOverlayCache;
pub use persistent::PersistentOverlayCache;

#[async_trait]
pub trait OverlayCache: Send + Sync {
    /// Returns the overlay for `key`, or `None` if there isn't one.
    async fn get_overlay(
        &self,
        tx: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> anyhow::Result<Option<Overlay>>;

    /// For each `(key, mutation)` pair, atomically installs an overlay
    /// `(largest_batch_id, mutation)` for `key`, replacing any prior overlay
    /// for that key.
    async fn save_overlays(
        &self,
        tx: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        mutations: BTreeMap<DocumentKey, Mutation>,
    ) -> anyhow::Result<()>;

    /// Removes exactly the overlays whose `largest_batch_id == batch_id`.
    async fn remove_overlays_for_batch_id(
        &self,
        tx: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> anyhow::Result<()>;

    /// Removes the overlay for `key`, if one exists. Recalculation calls this
    /// when the current mutation queue's composed effect on `key` is a
    /// no-op, so an overlay saved by an earlier recalculation pass doesn't
    /// linger once nothing in the queue still produces it.
    async fn remove_overlay(&self, tx: &mut PersistenceTransaction, key: &DocumentKey) -> anyhow::Result<()>;

    /// Returns every overlay whose key is an immediate child of `collection`
    /// and whose `largest_batch_id > since_batch_id`. Sub-collection
    /// descendants are excluded.
    async fn get_overlays_for_collection(
        &self,
        tx: &mut PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> anyhow::Result<BTreeMap<DocumentKey, Overlay>>;

    /// Returns overlays whose key's collection group equals `collection_group`
    /// and whose `largest_batch_id > since_batch_id`, ordered ascending by
    /// `largest_batch_id`. The result is always a union of *whole* mutation
    /// batches: enumeration only stops at a batch boundary once at least
    /// `count` overlays have been collected, so the result may exceed `count`
    /// but never splits a batch.
    async fn get_overlays_for_collection_group(
        &self,
        tx: &mut PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> anyhow::Result<Vec<(DocumentKey, Overlay)>>;
}

/// Drains `(batch_id, key, overlay)` triples, already grouped by ascending
/// `batch_id` and then by key, into a result that never splits a batch:
/// a whole bucket is appended once the running total is below `count`, and
/// the scan stops as soon as a completed bucket pushes the total to `count`
/// or beyond. Shared by the in-memory and persistent implementations so the
/// whole-batch rule (invariant 4, §8) has exactly one place it can go wrong.
pub(crate) fn collect_whole_batches(
    buckets: impl Iterator<Item = (BatchId, Vec<(DocumentKey, Overlay)>)>,
    count: usize,
) -> Vec<(DocumentKey, Overlay)> {
    let mut result = Vec::new();
    for (_, bucket) in buckets {
        result.extend(bucket);
        if result.len() >= count {
            break;
        }
    }
    result
}
