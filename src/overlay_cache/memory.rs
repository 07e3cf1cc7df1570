//! The in-memory `OverlayCache` (C3): overlays die with the process, but the
//! contract is otherwise identical to the persistent implementation.
use std::collections::{
    BTreeMap,
    BTreeSet,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    collect_whole_batches,
    OverlayCache,
};
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
    sorted_map::SortedDocumentMap,
    transaction::PersistenceTransaction,
};

#[derive(Default)]
struct State {
    overlays: SortedDocumentMap<Overlay>,
    // Inverted index, kept in lockstep with `overlays`: `k in
    // overlay_by_batch_id[b]` iff `overlays[k].largest_batch_id == b`.
    overlay_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl State {
    fn save_overlay(&mut self, largest_batch_id: BatchId, key: DocumentKey, mutation: Mutation) {
        if let Some(old) = self.overlays.get(&key) {
            if let Some(bucket) = self.overlay_by_batch_id.get_mut(&old.largest_batch_id) {
                bucket.remove(&key);
                if bucket.is_empty() {
                    self.overlay_by_batch_id.remove(&old.largest_batch_id);
                }
            }
        }
        self.overlays.insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_by_batch_id.entry(largest_batch_id).or_default().insert(key);
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        if let Some(old) = self.overlays.remove(key) {
            if let Some(bucket) = self.overlay_by_batch_id.get_mut(&old.largest_batch_id) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.overlay_by_batch_id.remove(&old.largest_batch_id);
                }
            }
        }
    }
}

/// The in-memory overlay cache. The transaction parameter on every method is
/// accepted for contract conformance and otherwise ignored: this
/// implementation owns its two maps exclusively and needs no transactional
/// isolation of its own.
#[derive(Default)]
pub struct MemoryOverlayCache {
    state: Mutex<State>,
}

impl MemoryOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverlayCache for MemoryOverlayCache {
    async fn get_overlay(
        &self,
        _tx: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> anyhow::Result<Option<Overlay>> {
        Ok(self.state.lock().overlays.get(key).cloned())
    }

    async fn save_overlays(
        &self,
        _tx: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        mutations: BTreeMap<DocumentKey, Mutation>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (key, mutation) in mutations {
            state.save_overlay(largest_batch_id, key, mutation);
        }
        Ok(())
    }

    async fn remove_overlays_for_batch_id(
        &self,
        _tx: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if let Some(keys) = state.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                state.overlays.remove(&key);
            }
        }
        Ok(())
    }

    async fn remove_overlay(&self, _tx: &mut PersistenceTransaction, key: &DocumentKey) -> anyhow::Result<()> {
        self.state.lock().remove_overlay(key);
        Ok(())
    }

    async fn get_overlays_for_collection(
        &self,
        _tx: &mut PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> anyhow::Result<BTreeMap<DocumentKey, Overlay>> {
        let state = self.state.lock();
        let seek = DocumentKey::from_path(collection.child(""))?;
        let mut result = BTreeMap::new();
        for (key, overlay) in state.overlays.iter_from(&seek) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if !key.is_immediate_child_of(collection) {
                continue;
            }
            if overlay.largest_batch_id > since_batch_id {
                result.insert(key.clone(), overlay.clone());
            }
        }
        Ok(result)
    }

    async fn get_overlays_for_collection_group(
        &self,
        _tx: &mut PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> anyhow::Result<Vec<(DocumentKey, Overlay)>> {
        let state = self.state.lock();
        let mut buckets: BTreeMap<BatchId, Vec<(DocumentKey, Overlay)>> = BTreeMap::new();
        for (key, overlay) in state.overlays.iter() {
            if overlay.largest_batch_id <= since_batch_id {
                continue;
            }
            if key.collection_group().as_deref() != Some(collection_group) {
                continue;
            }
            buckets
                .entry(overlay.largest_batch_id)
                .or_default()
                .push((key.clone(), overlay.clone()));
        }
        Ok(collect_whole_batches(buckets.into_iter(), count))
    }
}
