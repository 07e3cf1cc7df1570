//! An ordered associative container keyed by [`DocumentKey`] (C1).
//!
//! Backed by `imbl::OrdMap`, the same persistent B-tree the teacher crate
//! uses for its own in-memory indexes (`database/src/transaction_index.rs`,
//! `database/src/table_registry.rs`): cheap clones, O(log n) range seeks, and
//! iterators that are snapshot-consistent with the map at the point they
//! were created.
use imbl::OrdMap;

use crate::path::DocumentKey;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SortedDocumentMap<V: Clone> {
    inner: OrdMap<DocumentKey, V>,
}

impl<V: Clone> SortedDocumentMap<V> {
    pub fn new() -> Self {
        Self { inner: OrdMap::new() }
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn insert(&mut self, key: DocumentKey, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ascending iterator over the whole map, snapshot-consistent as of now.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&DocumentKey, &V)> {
        self.inner.iter()
    }

    /// Ascending iterator starting at the first key >= `from`.
    pub fn iter_from<'a>(&'a self, from: &DocumentKey) -> impl Iterator<Item = (&'a DocumentKey, &'a V)> {
        self.inner.range(from.clone()..)
    }

    /// Descending iterator over the whole map.
    pub fn iter_rev(&self) -> impl Iterator<Item = (&DocumentKey, &V)> {
        self.inner.iter().rev()
    }
}
