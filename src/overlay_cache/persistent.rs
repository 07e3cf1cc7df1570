//! The persistent `OverlayCache` (C4): overlays scoped per user, backed by a
//! transactional indexed store with the three secondary indexes fixed by
//! §4.3.2. The store itself is an injected collaborator (see
//! [`IndexedStore`]); this module also ships [`InMemoryIndexedStore`], a
//! reference implementation sufficient to exercise and test the contract
//! without a real page-oriented database, the same way the teacher crate's
//! `TransactionIndex` layers pending updates over an injected
//! `DatabaseIndexSnapshot` rather than owning storage itself
//! (`database/src/transaction_index.rs`).
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

use super::{
    collect_whole_batches,
    OverlayCache,
};
use crate::{
    error::OverlayError,
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

/// Which of the four indexed views of the overlay table a key belongs to.
/// `Primary` supports point lookups and upserts; the rest are secondary
/// indexes whose values are a pointer (the document path) back into
/// `Primary`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexName {
    Primary,
    ByBatch,
    ByCollection,
    ByCollectionGroup,
}

/// The transactional indexed store `PersistentOverlayCache` is built on. A
/// real implementation would be page-oriented and durable; this crate only
/// fixes the contract the overlay cache needs from it.
#[async_trait]
pub trait IndexedStore: Send + Sync {
    async fn get(
        &self,
        tx: &mut PersistenceTransaction,
        index: IndexName,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put(
        &self,
        tx: &mut PersistenceTransaction,
        index: IndexName,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> anyhow::Result<()>;

    async fn delete(
        &self,
        tx: &mut PersistenceTransaction,
        index: IndexName,
        key: &[u8],
    ) -> anyhow::Result<()>;

    /// An ascending scan over `index` within `[lower, upper)`.
    async fn range(
        &self,
        tx: &mut PersistenceTransaction,
        index: IndexName,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// The record stored under the `Primary` index: everything needed to answer
/// a point lookup and to rebuild the secondary index pointers on delete.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct OverlayRecord {
    document_path: ResourcePath,
    collection_path: ResourcePath,
    collection_group: Option<Arc<str>>,
    largest_batch_id: BatchId,
    mutation: Mutation,
}

fn encode_batch_id(batch_id: BatchId) -> [u8; 8] {
    // Order-preserving encoding of a signed integer: flip the sign bit so
    // unsigned big-endian byte order matches numeric order.
    ((batch_id as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn user_prefix(user_id: &str) -> Vec<u8> {
    let mut key = (user_id.len() as u32).to_be_bytes().to_vec();
    key.extend_from_slice(user_id.as_bytes());
    key
}

/// The smallest byte string that sorts strictly after every string with
/// `prefix` as a prefix, or `Bound::Unbounded` if no such string exists
/// (`prefix` is all `0xFF`). Matches the teacher crate's `Interval::prefix`
/// construction used for index-range reads in `database/src/writes.rs`.
fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(&last) = bound.last() {
        if last == 0xFF {
            bound.pop();
        } else {
            let len = bound.len();
            bound[len - 1] += 1;
            return Bound::Excluded(bound);
        }
    }
    Bound::Unbounded
}

fn primary_key(user_id: &str, document_path: &ResourcePath) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(document_path.encode().as_bytes());
    key
}

fn batch_key(user_id: &str, batch_id: BatchId, document_path: &ResourcePath) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(&encode_batch_id(batch_id));
    key.extend_from_slice(document_path.encode().as_bytes());
    key
}

fn collection_prefix(user_id: &str, collection_path: &ResourcePath) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(collection_path.encode().as_bytes());
    key.push(0);
    key
}

fn collection_key(
    user_id: &str,
    collection_path: &ResourcePath,
    largest_batch_id: BatchId,
    document_path: &ResourcePath,
) -> Vec<u8> {
    let mut key = collection_prefix(user_id, collection_path);
    key.extend_from_slice(&encode_batch_id(largest_batch_id));
    key.extend_from_slice(document_path.encode().as_bytes());
    key
}

fn collection_group_prefix(user_id: &str, collection_group: &str) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(collection_group.as_bytes());
    key.push(0);
    key
}

fn collection_group_key(
    user_id: &str,
    collection_group: &str,
    largest_batch_id: BatchId,
    document_path: &ResourcePath,
) -> Vec<u8> {
    let mut key = collection_group_prefix(user_id, collection_group);
    key.extend_from_slice(&encode_batch_id(largest_batch_id));
    key.extend_from_slice(document_path.encode().as_bytes());
    key
}

fn encode_pointer(document_path: &ResourcePath) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(document_path)?)
}

fn decode_pointer(pointer: &[u8]) -> anyhow::Result<ResourcePath> {
    Ok(serde_json::from_slice(pointer)?)
}

/// A plain nested-`BTreeMap` transactional store: sufficient to exercise and
/// test [`PersistentOverlayCache`] without a real page-oriented database.
/// Page management and durability are explicitly out of scope for this
/// crate (see purpose & scope); transactions here are immediate rather than
/// buffered, since the single-threaded cooperative model this crate assumes
/// means there's never a concurrent writer to isolate against.
#[derive(Default)]
pub struct InMemoryIndexedStore {
    tables: Mutex<BTreeMap<IndexName, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryIndexedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexedStore for InMemoryIndexedStore {
    async fn get(
        &self,
        _tx: &mut PersistenceTransaction,
        index: IndexName,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.tables.lock().get(&index).and_then(|t| t.get(key).cloned()))
    }

    async fn put(
        &self,
        _tx: &mut PersistenceTransaction,
        index: IndexName,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.tables.lock().entry(index).or_default().insert(key, value);
        Ok(())
    }

    async fn delete(&self, _tx: &mut PersistenceTransaction, index: IndexName, key: &[u8]) -> anyhow::Result<()> {
        if let Some(table) = self.tables.lock().get_mut(&index) {
            table.remove(key);
        }
        Ok(())
    }

    async fn range(
        &self,
        _tx: &mut PersistenceTransaction,
        index: IndexName,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&index) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// The persistent overlay cache, scoped to a single user id. Two instances
/// with different `user_id`s sharing the same [`IndexedStore`] never
/// observe each other's overlays: the `user_id` prefix partitions every
/// indexed lookup.
pub struct PersistentOverlayCache<S: IndexedStore> {
    user_id: String,
    store: Arc<S>,
}

impl<S: IndexedStore> PersistentOverlayCache<S> {
    pub fn new(user_id: impl Into<String>, store: Arc<S>) -> Self {
        Self { user_id: user_id.into(), store }
    }

    async fn put_record(
        &self,
        tx: &mut PersistenceTransaction,
        document_path: &ResourcePath,
        record: &OverlayRecord,
    ) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(record).map_err(OverlayError::storage_fault)?;
        self.store
            .put(tx, IndexName::Primary, primary_key(&self.user_id, document_path), bytes)
            .await?;
        let pointer = encode_pointer(document_path)?;
        self.store
            .put(
                tx,
                IndexName::ByBatch,
                batch_key(&self.user_id, record.largest_batch_id, document_path),
                pointer.clone(),
            )
            .await?;
        self.store
            .put(
                tx,
                IndexName::ByCollection,
                collection_key(&self.user_id, &record.collection_path, record.largest_batch_id, document_path),
                pointer.clone(),
            )
            .await?;
        if let Some(group) = &record.collection_group {
            self.store
                .put(
                    tx,
                    IndexName::ByCollectionGroup,
                    collection_group_key(&self.user_id, group, record.largest_batch_id, document_path),
                    pointer,
                )
                .await?;
        }
        Ok(())
    }

    async fn delete_record(
        &self,
        tx: &mut PersistenceTransaction,
        document_path: &ResourcePath,
        record: &OverlayRecord,
    ) -> anyhow::Result<()> {
        self.store.delete(tx, IndexName::Primary, &primary_key(&self.user_id, document_path)).await?;
        self.store
            .delete(tx, IndexName::ByBatch, &batch_key(&self.user_id, record.largest_batch_id, document_path))
            .await?;
        self.store
            .delete(
                tx,
                IndexName::ByCollection,
                &collection_key(&self.user_id, &record.collection_path, record.largest_batch_id, document_path),
            )
            .await?;
        if let Some(group) = &record.collection_group {
            self.store
                .delete(
                    tx,
                    IndexName::ByCollectionGroup,
                    &collection_group_key(&self.user_id, group, record.largest_batch_id, document_path),
                )
                .await?;
        }
        Ok(())
    }

    async fn get_record(
        &self,
        tx: &mut PersistenceTransaction,
        document_path: &ResourcePath,
    ) -> anyhow::Result<Option<OverlayRecord>> {
        let Some(bytes) = self.store.get(tx, IndexName::Primary, &primary_key(&self.user_id, document_path)).await?
        else {
            return Ok(None);
        };
        let key = DocumentKey::from_path(document_path.clone()).expect("document_path is never the root");
        let record: OverlayRecord =
            serde_json::from_slice(&bytes).map_err(|e| OverlayError::corrupted_overlay(key, e))?;
        Ok(Some(record))
    }
}

fn to_overlay(record: &OverlayRecord) -> anyhow::Result<Overlay> {
    Ok(Overlay::new(record.largest_batch_id, record.mutation.clone()))
}

#[async_trait]
impl<S: IndexedStore> OverlayCache for PersistentOverlayCache<S> {
    async fn get_overlay(
        &self,
        tx: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> anyhow::Result<Option<Overlay>> {
        match self.get_record(tx, key.path()).await? {
            Some(record) => Ok(Some(to_overlay(&record)?)),
            None => Ok(None),
        }
    }

    async fn save_overlays(
        &self,
        tx: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        mutations: BTreeMap<DocumentKey, Mutation>,
    ) -> anyhow::Result<()> {
        for (key, mutation) in mutations {
            if let Some(old) = self.get_record(tx, key.path()).await? {
                self.delete_record(tx, key.path(), &old).await?;
            }
            let record = OverlayRecord {
                document_path: key.path().clone(),
                collection_path: key.collection_path(),
                collection_group: key.collection_group(),
                largest_batch_id,
                mutation,
            };
            self.put_record(tx, key.path(), &record).await?;
        }
        Ok(())
    }

    async fn remove_overlays_for_batch_id(
        &self,
        tx: &mut PersistenceTransaction,
        batch_id: BatchId,
    ) -> anyhow::Result<()> {
        let prefix = {
            let mut p = user_prefix(&self.user_id);
            p.extend_from_slice(&encode_batch_id(batch_id));
            p
        };
        let upper = prefix_upper_bound(&prefix);
        let pointers = self.store.range(tx, IndexName::ByBatch, Bound::Included(prefix), upper).await?;
        for (_, pointer) in pointers {
            let document_path = decode_pointer(&pointer)?;
            if let Some(record) = self.get_record(tx, &document_path).await? {
                if record.largest_batch_id == batch_id {
                    self.delete_record(tx, &document_path, &record).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove_overlay(&self, tx: &mut PersistenceTransaction, key: &DocumentKey) -> anyhow::Result<()> {
        if let Some(old) = self.get_record(tx, key.path()).await? {
            self.delete_record(tx, key.path(), &old).await?;
        }
        Ok(())
    }

    async fn get_overlays_for_collection(
        &self,
        tx: &mut PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> anyhow::Result<BTreeMap<DocumentKey, Overlay>> {
        let prefix = collection_prefix(&self.user_id, collection);
        let mut lower = prefix.clone();
        lower.extend_from_slice(&encode_batch_id(since_batch_id.saturating_add(1)));
        let upper = prefix_upper_bound(&prefix);
        let pointers = self.store.range(tx, IndexName::ByCollection, Bound::Included(lower), upper).await?;

        let mut result = BTreeMap::new();
        for (_, pointer) in pointers {
            let document_path = decode_pointer(&pointer)?;
            if let Some(record) = self.get_record(tx, &document_path).await? {
                let key = DocumentKey::from_path(document_path)?;
                result.insert(key, to_overlay(&record)?);
            }
        }
        Ok(result)
    }

    async fn get_overlays_for_collection_group(
        &self,
        tx: &mut PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> anyhow::Result<Vec<(DocumentKey, Overlay)>> {
        let prefix = collection_group_prefix(&self.user_id, collection_group);
        let mut lower = prefix.clone();
        lower.extend_from_slice(&encode_batch_id(since_batch_id.saturating_add(1)));
        let upper = prefix_upper_bound(&prefix);
        let pointers = self.store.range(tx, IndexName::ByCollectionGroup, Bound::Included(lower), upper).await?;

        let mut buckets: BTreeMap<BatchId, Vec<(DocumentKey, Overlay)>> = BTreeMap::new();
        for (_, pointer) in pointers {
            let document_path = decode_pointer(&pointer)?;
            if let Some(record) = self.get_record(tx, &document_path).await? {
                let key = DocumentKey::from_path(document_path)?;
                let overlay = to_overlay(&record)?;
                buckets.entry(overlay.largest_batch_id).or_default().push((key, overlay));
            }
        }
        Ok(collect_whole_batches(buckets.into_iter(), count))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        document::ConvexObject,
        transaction::PersistenceTransaction,
    };

    fn key(segs: &[&str]) -> DocumentKey {
        DocumentKey::from_path(ResourcePath::from_segments(segs.iter().copied())).unwrap()
    }

    fn set(key: DocumentKey) -> Mutation {
        Mutation::Set { key, data: ConvexObject::empty() }
    }

    fn cache() -> PersistentOverlayCache<InMemoryIndexedStore> {
        PersistentOverlayCache::new("user-1", Arc::new(InMemoryIndexedStore::new()))
    }

    #[tokio::test]
    async fn test_point_lookup_round_trips() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["users", "a"]);
        cache.save_overlays(&mut tx, 7, BTreeMap::from([(a.clone(), set(a.clone()))])).await?;

        let overlay = cache.get_overlay(&mut tx, &a).await?.expect("overlay present");
        assert_eq!(overlay.largest_batch_id, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_overlays_for_batch_id_is_precise() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["users", "a"]);
        let b = key(&["users", "b"]);
        cache.save_overlays(&mut tx, 1, BTreeMap::from([(a.clone(), set(a.clone()))])).await?;
        cache.save_overlays(&mut tx, 2, BTreeMap::from([(b.clone(), set(b.clone()))])).await?;

        cache.remove_overlays_for_batch_id(&mut tx, 1).await?;

        assert!(cache.get_overlay(&mut tx, &a).await?.is_none());
        assert!(cache.get_overlay(&mut tx, &b).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_overlay_is_scoped_to_one_key() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["users", "a"]);
        let b = key(&["users", "b"]);
        cache
            .save_overlays(&mut tx, 1, BTreeMap::from([(a.clone(), set(a.clone())), (b.clone(), set(b.clone()))]))
            .await?;

        cache.remove_overlay(&mut tx, &a).await?;
        assert!(cache.get_overlay(&mut tx, &a).await?.is_none());
        assert!(cache.get_overlay(&mut tx, &b).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_overlay_on_absent_key_is_a_no_op() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["users", "a"]);
        cache.remove_overlay(&mut tx, &a).await?;
        assert!(cache.get_overlay(&mut tx, &a).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_collection_scan_respects_since_batch_id() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let r1 = key(&["rooms", "r1"]);
        let r2 = key(&["rooms", "r2"]);
        cache.save_overlays(&mut tx, 3, BTreeMap::from([(r1.clone(), set(r1.clone()))])).await?;
        cache.save_overlays(&mut tx, 5, BTreeMap::from([(r2.clone(), set(r2.clone()))])).await?;

        let rooms = ResourcePath::from_segments(["rooms"]);
        let since_4 = cache.get_overlays_for_collection(&mut tx, &rooms, 4).await?;
        assert_eq!(since_4.len(), 1);
        assert!(since_4.contains_key(&r2));

        let since_neg1 = cache.get_overlays_for_collection(&mut tx, &rooms, -1).await?;
        assert_eq!(since_neg1.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_collection_group_returns_whole_batches() -> anyhow::Result<()> {
        let cache = cache();
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["rooms", "r1", "messages", "a"]);
        let b = key(&["rooms", "r1", "messages", "b"]);
        let c = key(&["rooms", "r2", "messages", "c"]);
        cache
            .save_overlays(&mut tx, 3, BTreeMap::from([(a.clone(), set(a.clone())), (b.clone(), set(b.clone()))]))
            .await?;
        cache.save_overlays(&mut tx, 4, BTreeMap::from([(c.clone(), set(c.clone()))])).await?;

        let two = cache.get_overlays_for_collection_group(&mut tx, "messages", 2, 2).await?;
        assert_eq!(two.len(), 2);
        let three = cache.get_overlays_for_collection_group(&mut tx, "messages", 2, 3).await?;
        assert_eq!(three.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_users_are_isolated() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryIndexedStore::new());
        let cache_1 = PersistentOverlayCache::new("user-1", store.clone());
        let cache_2 = PersistentOverlayCache::new("user-2", store);
        let mut tx = PersistenceTransaction::new(0);
        let a = key(&["users", "a"]);
        cache_1.save_overlays(&mut tx, 1, BTreeMap::from([(a.clone(), set(a.clone()))])).await?;

        assert!(cache_2.get_overlay(&mut tx, &a).await?.is_none());
        Ok(())
    }
}
