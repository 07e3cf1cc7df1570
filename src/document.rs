//! Document values and the local-view representation of a document.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::path::DocumentKey;

/// A dotted or single-segment field path. Mutations in this crate only ever
/// touch top-level fields (see [`crate::mutation::PatchValue`]), so this is
/// an opaque field name rather than a parsed path.
pub type FieldPath = Arc<str>;

/// A document's fields, as a flat map from top-level field name to value.
///
/// Mirrors the teacher crate's `ConvexObject`/`PatchValue` pair
/// (`database/src/patch.rs`): patches replace or delete whole top-level
/// fields rather than deep-merging nested objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvexObject {
    fields: BTreeMap<FieldPath, JsonValue>,
}

impl ConvexObject {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: FieldPath, value: JsonValue) {
        self.fields.insert(field, value);
    }

    pub fn remove(&mut self, field: &str) {
        self.fields.remove(field);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldPath, &JsonValue)> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.keys()
    }
}

impl From<BTreeMap<FieldPath, JsonValue>> for ConvexObject {
    fn from(fields: BTreeMap<FieldPath, JsonValue>) -> Self {
        Self { fields }
    }
}

impl FromIterator<(FieldPath, JsonValue)> for ConvexObject {
    fn from_iter<I: IntoIterator<Item = (FieldPath, JsonValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Monotonic version attached to a document: either the remote read time it
/// was last observed at, or the local-write time the overlay was applied at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    pub fn new(micros_since_epoch: i64) -> Self {
        Self(micros_since_epoch)
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }
}

/// A document that is known to exist, along with its data.
#[derive(Clone, Debug, PartialEq)]
pub struct FoundDocument {
    pub key: DocumentKey,
    pub version: Timestamp,
    pub data: ConvexObject,
    /// Set once a local mutation (as opposed to a remote read) produced this
    /// value, so callers can distinguish acknowledged from pending state.
    pub has_local_mutations: bool,
}

/// The local view of a single document: either found with data, confirmed
/// absent as of some version, or a synthetic placeholder used where the base
/// state doesn't matter (a non-patch mutation is about to overwrite it
/// completely) or isn't known yet.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Found(FoundDocument),
    NoDocument {
        key: DocumentKey,
        version: Timestamp,
        /// Set when a local `Delete` (as opposed to a server-confirmed
        /// tombstone) produced this value. See [`FoundDocument::has_local_mutations`].
        has_local_mutations: bool,
    },
    Invalid { key: DocumentKey },
}

impl MaybeDocument {
    pub fn invalid(key: DocumentKey) -> Self {
        MaybeDocument::Invalid { key }
    }

    pub fn no_document(key: DocumentKey, version: Timestamp, has_local_mutations: bool) -> Self {
        MaybeDocument::NoDocument { key, version, has_local_mutations }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Found(doc) => &doc.key,
            MaybeDocument::NoDocument { key, .. } => key,
            MaybeDocument::Invalid { key } => key,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, MaybeDocument::Found(_))
    }

    pub fn as_found(&self) -> Option<&FoundDocument> {
        match self {
            MaybeDocument::Found(doc) => Some(doc),
            _ => None,
        }
    }

    /// Whether this value was produced by applying a local mutation, as
    /// opposed to being read straight from the remote document cache.
    pub fn has_local_mutations(&self) -> bool {
        match self {
            MaybeDocument::Found(doc) => doc.has_local_mutations,
            MaybeDocument::NoDocument { has_local_mutations, .. } => *has_local_mutations,
            MaybeDocument::Invalid { .. } => false,
        }
    }
}
