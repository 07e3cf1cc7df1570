//! Property tests for the quantified overlay cache invariants.
//!
//! Async collaborator calls are driven through a throwaway single-threaded
//! runtime per case rather than `#[tokio::test]`, since `proptest!` expands
//! to plain synchronous `#[test]` functions.
use std::collections::{
    BTreeMap,
    BTreeSet,
};

use proptest::prelude::*;
use serde_json::Value as JsonValue;
use tokio::runtime::Runtime;

use crate::{
    document::ConvexObject,
    mutation::Mutation,
    overlay_cache::{
        MemoryOverlayCache,
        OverlayCache,
    },
    path::{
        DocumentKey,
        ResourcePath,
    },
    transaction::PersistenceTransaction,
};

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    Runtime::new().expect("current-thread runtime").block_on(fut)
}

fn segment() -> impl Strategy<Value = &'static str> {
    prop_oneof!["a", "b", "c"]
}

/// A document path: one to three segments below `rooms/<segment>`, so most
/// generated keys share a collection and collection group.
fn document_key() -> impl Strategy<Value = DocumentKey> {
    (segment(), segment()).prop_map(|(room, doc)| {
        DocumentKey::from_path(ResourcePath::from_segments(["rooms", room, doc])).unwrap()
    })
}

fn set_mutation(key: DocumentKey, value: i32) -> Mutation {
    let mut data = ConvexObject::empty();
    data.set("v".into(), JsonValue::from(value));
    Mutation::Set { key, data }
}

proptest! {
    /// Invariant 1: saveOverlays(b, {k: m}) then getOverlay(k) returns (b, m).
    #[test]
    fn prop_save_then_get_round_trips(
        key in document_key(),
        batch_id in 0i64..1_000,
        value in 0i32..100,
    ) {
        let cache = MemoryOverlayCache::new();
        let mut tx = PersistenceTransaction::new(0);
        let mutation = set_mutation(key.clone(), value);
        block_on(cache.save_overlays(&mut tx, batch_id, BTreeMap::from([(key.clone(), mutation.clone())]))).unwrap();

        let overlay = block_on(cache.get_overlay(&mut tx, &key)).unwrap().expect("overlay present");
        prop_assert_eq!(overlay.largest_batch_id, batch_id);
        prop_assert_eq!(overlay.mutation, mutation);
    }

    /// Invariant 2: removeOverlaysForBatchId(b) clears exactly b's keys.
    #[test]
    fn prop_remove_overlays_for_batch_id_is_exact(
        keys in prop::collection::btree_set(document_key(), 1..6),
        split_at in 0usize..6,
        batch_a in 0i64..500,
        batch_b in 500i64..1_000,
    ) {
        let keys: Vec<_> = keys.into_iter().collect();
        let split_at = split_at.min(keys.len());
        let (group_a, group_b) = keys.split_at(split_at);

        let cache = MemoryOverlayCache::new();
        let mut tx = PersistenceTransaction::new(0);
        if !group_a.is_empty() {
            let mutations = group_a.iter().map(|k| (k.clone(), set_mutation(k.clone(), 1))).collect();
            block_on(cache.save_overlays(&mut tx, batch_a, mutations)).unwrap();
        }
        if !group_b.is_empty() {
            let mutations = group_b.iter().map(|k| (k.clone(), set_mutation(k.clone(), 2))).collect();
            block_on(cache.save_overlays(&mut tx, batch_b, mutations)).unwrap();
        }

        block_on(cache.remove_overlays_for_batch_id(&mut tx, batch_a)).unwrap();

        for k in group_a {
            prop_assert!(block_on(cache.get_overlay(&mut tx, k)).unwrap().is_none());
        }
        for k in group_b {
            prop_assert!(block_on(cache.get_overlay(&mut tx, k)).unwrap().is_some());
        }
    }

    /// Invariant 3: getOverlaysForCollection(c, s) returns exactly the
    /// immediate children of c whose largestBatchId exceeds s.
    #[test]
    fn prop_collection_scan_matches_definition(
        collection_segment in segment(),
        leaf_keys in prop::collection::vec((segment(), 0i64..10), 1..6),
        since in 0i64..10,
    ) {
        let collection = ResourcePath::from_segments(["rooms", collection_segment]);
        let cache = MemoryOverlayCache::new();
        let mut tx = PersistenceTransaction::new(0);
        let mut expected = BTreeSet::new();
        for (leaf, batch_id) in &leaf_keys {
            let key = DocumentKey::from_path(collection.child(*leaf)).unwrap();
            block_on(cache.save_overlays(&mut tx, *batch_id, BTreeMap::from([(key.clone(), set_mutation(key.clone(), 0))]))).unwrap();
            if *batch_id > since {
                expected.insert(key);
            }
        }
        let result = block_on(cache.get_overlays_for_collection(&mut tx, &collection, since)).unwrap();
        let actual: BTreeSet<_> = result.into_keys().collect();
        prop_assert_eq!(actual, expected);
    }

    /// Invariant 5: recalculation assigns each key the highest batch id that
    /// touches it, and the resulting overlay reproduces the fully-replayed
    /// document.
    #[test]
    fn prop_recalculation_picks_max_touching_batch_id(
        batch_ids in prop::collection::btree_set(0i64..1_000, 1..5),
    ) {
        use crate::{
            collaborators::{
                Clock,
                MutationBatch,
                MutationQueue,
                RemoteDocumentCache,
            },
            document::{
                FoundDocument,
                MaybeDocument,
                Timestamp,
            },
            local_documents::LocalDocumentsView,
            overlay_cache::MemoryOverlayCache as Overlays,
        };
        use async_trait::async_trait;
        use parking_lot::Mutex as PlMutex;
        use std::sync::Arc;

        struct FixedClock;
        impl Clock for FixedClock {
            fn now(&self) -> Timestamp {
                Timestamp::new(1)
            }
        }

        struct FakeRemote(PlMutex<BTreeMap<DocumentKey, MaybeDocument>>);
        #[async_trait]
        impl RemoteDocumentCache for FakeRemote {
            async fn get_entry(&self, _tx: &mut PersistenceTransaction, key: &DocumentKey) -> anyhow::Result<MaybeDocument> {
                Ok(self.0.lock().get(key).cloned().unwrap_or_else(|| MaybeDocument::invalid(key.clone())))
            }
            async fn get_documents_matching_query(
                &self,
                _tx: &mut PersistenceTransaction,
                _query: &crate::collaborators::Query,
                _since_read_time: Timestamp,
            ) -> anyhow::Result<BTreeMap<DocumentKey, MaybeDocument>> {
                Ok(self.0.lock().clone())
            }
        }

        struct FakeQueue(Vec<MutationBatch>);
        #[async_trait]
        impl MutationQueue for FakeQueue {
            async fn get_all_mutation_batches_affecting_document_keys(
                &self,
                _tx: &mut PersistenceTransaction,
                keys: &BTreeSet<DocumentKey>,
            ) -> anyhow::Result<Vec<MutationBatch>> {
                Ok(self.0.iter().filter(|b| b.keys().any(|k| keys.contains(k))).cloned().collect())
            }
        }

        struct NoGroups;
        #[async_trait]
        impl crate::collaborators::IndexManager for NoGroups {
            async fn get_collection_parents(&self, _tx: &mut PersistenceTransaction, _group: &str) -> anyhow::Result<Vec<ResourcePath>> {
                Ok(Vec::new())
            }
        }

        let k = DocumentKey::from_path(ResourcePath::from_segments(["rooms", "r1", "x"])).unwrap();
        let remote = Arc::new(FakeRemote(PlMutex::new(BTreeMap::from([(
            k.clone(),
            MaybeDocument::Found(FoundDocument { key: k.clone(), version: Timestamp::new(0), data: ConvexObject::empty(), has_local_mutations: false }),
        )]))));
        let batches: Vec<_> = batch_ids.iter().map(|&batch_id| MutationBatch { batch_id, mutations: vec![set_mutation(k.clone(), batch_id as i32)] }).collect();
        let max_batch_id = *batch_ids.iter().max().unwrap();
        let queue = Arc::new(FakeQueue(batches));
        let overlays = Arc::new(Overlays::new());
        let view = LocalDocumentsView::new(remote, queue, overlays.clone(), Arc::new(NoGroups), Arc::new(FixedClock));
        let mut tx = PersistenceTransaction::new(0);

        block_on(view.recalculate_and_save_overlays_for_document_keys(&mut tx, &[k.clone()])).unwrap();
        let overlay = block_on(overlays.get_overlay(&mut tx, &k)).unwrap().expect("overlay present");
        prop_assert_eq!(overlay.largest_batch_id, max_batch_id);
    }
}
