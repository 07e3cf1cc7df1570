//! Resource paths and document keys.
use std::{
    fmt,
    sync::Arc,
};

use serde::{
    Deserialize,
    Serialize,
};

/// An ordered sequence of path segments, totally ordered component-wise.
///
/// A collection's immediate child documents have a path exactly one segment
/// longer than the collection's own path; that relationship, not the parity
/// of either length, is the invariant the rest of this crate relies on.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<Arc<str>>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Arc<str>] {
        &self.segments
    }

    pub fn child(&self, segment: impl Into<Arc<str>>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The path with its last segment removed, or itself if already empty.
    pub fn parent(&self) -> Self {
        let len = self.segments.len().saturating_sub(1);
        Self {
            segments: self.segments[..len].to_vec(),
        }
    }

    pub fn last_segment(&self) -> Option<&Arc<str>> {
        self.segments.last()
    }

    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(other.segments.iter()).all(|(a, b)| a == b)
    }

    /// Lexicographically-encoded form used as a byte-sortable store key. Segments
    /// are joined with a separator that never appears inside a segment, so the
    /// encoding preserves both prefix and sibling ordering.
    pub fn encode(&self) -> String {
        self.segments.join("\u{1}")
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A canonical path to a document, totally ordered by [`ResourcePath`]'s
/// component-wise comparator.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    /// Builds a key from a document path. `path` must be the immediate child
    /// of some collection path, i.e. non-empty.
    pub fn from_path(path: ResourcePath) -> anyhow::Result<Self> {
        anyhow::ensure!(!path.is_empty(), "a document key cannot be the root path");
        Ok(Self { path })
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The path of the collection this document lives in.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent()
    }

    /// The name of the last collection segment in this document's path, i.e.
    /// the collection-group id used by cross-collection queries.
    pub fn collection_group(&self) -> Option<Arc<str>> {
        self.collection_path().last_segment().cloned()
    }

    /// True iff this key is an immediate child of `collection` (not a
    /// descendant of one of `collection`'s sub-collections).
    pub fn is_immediate_child_of(&self, collection: &ResourcePath) -> bool {
        self.path.len() == collection.len() + 1 && collection.is_prefix_of(&self.path)
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.path, f)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
