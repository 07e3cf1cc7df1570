//! The local documents view (C5): merges the remote document cache, the
//! mutation queue and the overlay cache into a coherent local view, and
//! repairs overlays when remote state changes invalidate them. Grounded on
//! `database::Database`'s read/write coordination in
//! `database/src/reads.rs` and `database/src/writes.rs`, which play the
//! same "consult cache, fall back to collaborators, repair on drift" role
//! over the teacher's own index/document layers.
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use tracing::{
    debug,
    warn,
};

use crate::{
    collaborators::{
        query_matches,
        Clock,
        IndexManager,
        MutationQueue,
        Query,
        QueryOffset,
        QueryTarget,
        RemoteDocumentCache,
    },
    config::OVERLAY_RECALCULATION_BATCH_WARN_THRESHOLD,
    document::{
        MaybeDocument,
        Timestamp,
    },
    mutation::{
        calculate_overlay_mutation,
        FieldMask,
        Mutation,
    },
    overlay::Overlay,
    overlay_cache::OverlayCache,
    path::DocumentKey,
    transaction::PersistenceTransaction,
};

/// The read-side coordinator (C5). Everything it touches is an injected
/// collaborator: it owns no document or overlay state of its own.
pub struct LocalDocumentsView {
    remote_documents: Arc<dyn RemoteDocumentCache>,
    mutation_queue: Arc<dyn MutationQueue>,
    overlays: Arc<dyn OverlayCache>,
    index_manager: Arc<dyn IndexManager>,
    clock: Arc<dyn Clock>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Arc<dyn RemoteDocumentCache>,
        mutation_queue: Arc<dyn MutationQueue>,
        overlays: Arc<dyn OverlayCache>,
        index_manager: Arc<dyn IndexManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { remote_documents, mutation_queue, overlays, index_manager, clock }
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// §4.4.1. Skips the remote read entirely when the overlay's mutation
    /// isn't a patch: a set/delete overwrites the base unconditionally, so
    /// the base state can't affect the result.
    pub async fn get_document(
        &self,
        tx: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> anyhow::Result<MaybeDocument> {
        let overlay = self.overlays.get_overlay(tx, key).await?;
        let mut base = self.get_base_document(tx, key, overlay.as_ref()).await?;
        if let Some(overlay) = &overlay {
            base = overlay.mutation.apply_to_local_view(&base, self.now());
        }
        Ok(base)
    }

    async fn get_base_document(
        &self,
        tx: &mut PersistenceTransaction,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> anyhow::Result<MaybeDocument> {
        let needs_remote_read = match overlay {
            None => true,
            Some(overlay) => overlay.mutation.is_patch(),
        };
        if needs_remote_read {
            self.remote_documents.get_entry(tx, key).await
        } else {
            Ok(MaybeDocument::invalid(key.clone()))
        }
    }

    /// §4.4.2.
    pub async fn get_documents(
        &self,
        tx: &mut PersistenceTransaction,
        keys: &[DocumentKey],
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        let docs = self.remote_documents.get_entries(tx, keys).await?;
        self.get_local_view_of_documents(tx, docs, &BTreeSet::new()).await
    }

    /// §4.4.3.
    pub async fn get_local_view_of_documents(
        &self,
        tx: &mut PersistenceTransaction,
        docs: BTreeMap<DocumentKey, MaybeDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        self.compute_views(tx, docs, &BTreeMap::new(), existence_state_changed).await
    }

    /// §4.4.4.
    pub async fn compute_views(
        &self,
        tx: &mut PersistenceTransaction,
        mut docs: BTreeMap<DocumentKey, MaybeDocument>,
        memoized_overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut to_recalc = BTreeMap::new();
        let now = self.now();
        for (key, doc) in docs.iter_mut() {
            let overlay = match memoized_overlays.get(key) {
                Some(overlay) => Some(overlay.clone()),
                None => self.overlays.get_overlay(tx, key).await?,
            };
            let needs_recalc = existence_state_changed.contains(key)
                && overlay.as_ref().map_or(true, |o| o.mutation.is_patch());
            if needs_recalc {
                debug!(?key, "existence state changed, scheduling overlay recalculation");
                to_recalc.insert(key.clone(), doc.clone());
            } else if let Some(overlay) = overlay {
                *doc = overlay.mutation.apply_to_local_view(doc, now);
            }
        }
        if !to_recalc.is_empty() {
            let recalculated = self.recalculate_and_save_overlays(tx, to_recalc).await?;
            docs.extend(recalculated);
        }
        Ok(docs)
    }

    /// §4.4.5. Descending batch-id iteration is load-bearing: it's what
    /// assigns each key's overlay to the highest contributing batch id
    /// (invariant 5). Returns `docs` with every key's in-place accumulated
    /// mutations applied, so a caller recalculating on behalf of a larger
    /// view (see [`Self::compute_views`]) can merge the result back in
    /// rather than re-reading it.
    pub async fn recalculate_and_save_overlays(
        &self,
        tx: &mut PersistenceTransaction,
        mut docs: BTreeMap<DocumentKey, MaybeDocument>,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        let keys: BTreeSet<DocumentKey> = docs.keys().cloned().collect();
        let batches = self.mutation_queue.get_all_mutation_batches_affecting_document_keys(tx, &keys).await?;
        if batches.len() > *OVERLAY_RECALCULATION_BATCH_WARN_THRESHOLD {
            warn!(
                batch_count = batches.len(),
                threshold = *OVERLAY_RECALCULATION_BATCH_WARN_THRESHOLD,
                "recalculateAndSaveOverlays touching unusually many batches"
            );
        }

        let now = self.now();
        let mut masks: BTreeMap<DocumentKey, FieldMask> = BTreeMap::new();
        let mut documents_by_batch_id = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                if let Some(doc) = docs.get_mut(key) {
                    let mask = masks.entry(key.clone()).or_default();
                    *mask = batch.apply_to_local_view_with_field_mask(key, doc, mask.clone(), now);
                    documents_by_batch_id
                        .entry(batch.batch_id)
                        .or_insert_with(BTreeSet::new)
                        .insert(key.clone());
                }
            }
        }

        let mut processed = BTreeSet::new();
        let mut to_clear = Vec::new();
        for (&batch_id, keys) in documents_by_batch_id.iter().rev() {
            let mut staged = BTreeMap::new();
            for key in keys {
                if processed.insert(key.clone()) {
                    let doc = &docs[key];
                    let mask = masks.get(key).cloned().unwrap_or_default();
                    match calculate_overlay_mutation(doc, &mask) {
                        Some(mutation) => {
                            staged.insert(key.clone(), mutation);
                        },
                        None => to_clear.push(key.clone()),
                    }
                }
            }
            if !staged.is_empty() {
                self.overlays.save_overlays(tx, batch_id, staged).await?;
            }
        }
        // A key whose recalculated effect is a no-op may still carry an
        // overlay saved by an earlier recalculation pass; clear it so the
        // cache doesn't keep serving a mutation the queue no longer produces.
        for key in &to_clear {
            self.overlays.remove_overlay(tx, key).await?;
        }
        Ok(docs)
    }

    /// §4.4.6.
    pub async fn recalculate_and_save_overlays_for_document_keys(
        &self,
        tx: &mut PersistenceTransaction,
        keys: &[DocumentKey],
    ) -> anyhow::Result<()> {
        let docs = self.remote_documents.get_entries(tx, keys).await?;
        self.recalculate_and_save_overlays(tx, docs).await?;
        Ok(())
    }

    /// §4.4.7.
    pub async fn get_documents_matching_query(
        &self,
        tx: &mut PersistenceTransaction,
        query: &Query,
        offset: QueryOffset,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        match &query.target {
            QueryTarget::Document(key) => {
                let doc = self.get_document(tx, key).await?;
                let mut result = BTreeMap::new();
                if doc.exists() {
                    result.insert(key.clone(), doc);
                }
                Ok(result)
            },
            QueryTarget::CollectionGroup(group) => {
                let parents = self.index_manager.get_collection_parents(tx, group).await?;
                let mut result = BTreeMap::new();
                for parent in parents {
                    let collection_query = query.as_collection_query_at_path(parent.child(group.as_ref()));
                    let matches = self.get_documents_matching_collection_query(tx, &collection_query, offset).await?;
                    result.extend(matches);
                }
                Ok(result)
            },
            QueryTarget::Collection(_) => self.get_documents_matching_collection_query(tx, query, offset).await,
        }
    }

    async fn get_documents_matching_collection_query(
        &self,
        tx: &mut PersistenceTransaction,
        query: &Query,
        offset: QueryOffset,
    ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
        let QueryTarget::Collection(collection) = &query.target else {
            anyhow::bail!("collection query dispatch received a non-collection target");
        };
        let mut remote = self.remote_documents.get_documents_matching_query(tx, query, offset.read_time).await?;
        let overlays = self.overlays.get_overlays_for_collection(tx, collection, offset.largest_batch_id).await?;

        for key in overlays.keys() {
            remote.entry(key.clone()).or_insert_with(|| MaybeDocument::invalid(key.clone()));
        }

        let now = self.now();
        let mut result = BTreeMap::new();
        for (key, mut doc) in remote {
            if let Some(overlay) = overlays.get(&key) {
                doc = overlay.mutation.apply_to_local_view(&doc, now);
            }
            if query_matches(query, &doc) {
                result.insert(key, doc);
            }
        }
        Ok(result)
    }
}
