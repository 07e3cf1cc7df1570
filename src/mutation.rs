//! Mutations, field masks and the patch semantics they compose under.
use std::collections::{
    BTreeMap,
    BTreeSet,
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    document::{
        ConvexObject,
        FieldPath,
        FoundDocument,
        MaybeDocument,
        Timestamp,
    },
    path::DocumentKey,
};

/// A set of field paths, supporting union. Emitted during overlay
/// recomputation to capture which fields of the base document a composed
/// batch sequence actually touches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// The field mask of a document that was just fully replaced by a `Set`:
    /// every top-level field it carries.
    pub fn from_top_level(data: &ConvexObject) -> Self {
        Self::from_fields(data.field_names().cloned())
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        Self {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }

    pub fn insert(&mut self, field: FieldPath) {
        self.fields.insert(field);
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// `Some(value)` sets a field, `None` deletes it. Mirrors the teacher crate's
/// `MaybeValue` wrapper in `database/src/patch.rs`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaybeValue(pub Option<JsonValue>);

/// A shallow, top-level patch: overwrites or deletes whole fields rather than
/// deep-merging nested objects, matching `PatchValue::apply` in the teacher
/// crate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchValue {
    fields: BTreeMap<FieldPath, MaybeValue>,
}

impl PatchValue {
    pub fn set(&mut self, field: FieldPath, value: Option<JsonValue>) {
        self.fields.insert(field, MaybeValue(value));
    }

    pub fn field_mask(&self) -> FieldMask {
        FieldMask::from_fields(self.fields.keys().cloned())
    }

    pub fn apply(&self, mut original: ConvexObject) -> ConvexObject {
        for (field, maybe_value) in &self.fields {
            match &maybe_value.0 {
                Some(value) => original.set(field.clone(), value.clone()),
                None => original.remove(field),
            }
        }
        original
    }
}

impl From<BTreeMap<FieldPath, MaybeValue>> for PatchValue {
    fn from(fields: BTreeMap<FieldPath, MaybeValue>) -> Self {
        Self { fields }
    }
}

/// Gates whether a `Patch` or `Delete` mutation applies to a given base
/// document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists,
    NotExists,
}

impl Precondition {
    pub fn is_satisfied_by(&self, doc: &MaybeDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists => doc.exists(),
            Precondition::NotExists => !doc.exists(),
        }
    }
}

/// The closed set of mutation variants the overlay cache distinguishes.
/// `Patch` is the only variant whose effect depends on the base document;
/// `Set` and `Delete` overwrite it unconditionally once their (trivial,
/// in this crate's model) precondition is met.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        data: ConvexObject,
    },
    Patch {
        key: DocumentKey,
        precondition: Precondition,
        patch: PatchValue,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Patch { key, .. } => key,
            Mutation::Delete { key, .. } => key,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Mutation::Patch { .. })
    }

    fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { .. } => Precondition::None,
            Mutation::Patch { precondition, .. } => *precondition,
            Mutation::Delete { precondition, .. } => *precondition,
        }
    }

    /// Applies this mutation to `base`, returning the resulting local view.
    /// A precondition that isn't met is not an error: the mutation simply
    /// no-ops and `base` is returned unchanged.
    pub fn apply_to_local_view(&self, base: &MaybeDocument, local_write_time: Timestamp) -> MaybeDocument {
        if !self.precondition().is_satisfied_by(base) {
            return base.clone();
        }
        match self {
            Mutation::Set { key, data } => MaybeDocument::Found(FoundDocument {
                key: key.clone(),
                version: local_write_time,
                data: data.clone(),
                has_local_mutations: true,
            }),
            Mutation::Patch { key, patch, .. } => {
                let existing = match base.as_found() {
                    Some(found) => found.data.clone(),
                    None => ConvexObject::empty(),
                };
                MaybeDocument::Found(FoundDocument {
                    key: key.clone(),
                    version: local_write_time,
                    data: patch.apply(existing),
                    has_local_mutations: true,
                })
            },
            Mutation::Delete { key, .. } => MaybeDocument::no_document(key.clone(), local_write_time, true),
        }
    }

    /// Like [`Mutation::apply_to_local_view`], but also folds the fields this
    /// mutation touches into `mask` (a no-op mutation leaves the mask
    /// unchanged, since it didn't actually write anything).
    pub fn apply_to_local_view_with_field_mask(
        &self,
        base: &mut MaybeDocument,
        mask: FieldMask,
        local_write_time: Timestamp,
    ) -> FieldMask {
        if !self.precondition().is_satisfied_by(base) {
            return mask;
        }
        let new_mask = match self {
            Mutation::Set { data, .. } => FieldMask::from_top_level(data),
            Mutation::Patch { patch, .. } => mask.union(&patch.field_mask()),
            Mutation::Delete { .. } => FieldMask::empty(),
        };
        *base = self.apply_to_local_view(base, local_write_time);
        new_mask
    }
}

/// Derives a single minimal mutation equivalent to the composed effect of a
/// sequence of batches on `doc`, restricted to the fields recorded in `mask`.
/// The resulting mutation always carries [`Precondition::None`]: by
/// construction it is meant to be replayed against whatever base document
/// later turns up, not gated on the base state that produced it.
///
/// Returns `None` when `doc` carries no applied local mutation — every batch
/// touching it no-op'd on a failed precondition — so that no overlay gets
/// saved at all and a later existence-change recalculation still fires (see
/// `LocalDocumentsView::compute_views`'s `is_patch()` check).
pub fn calculate_overlay_mutation(doc: &MaybeDocument, mask: &FieldMask) -> Option<Mutation> {
    if !doc.has_local_mutations() {
        return None;
    }
    match doc {
        MaybeDocument::Found(found) => {
            if mask.is_empty() {
                None
            } else {
                Some(Mutation::Patch {
                    key: found.key.clone(),
                    precondition: Precondition::None,
                    patch: patch_from_mask(found, mask),
                })
            }
        },
        MaybeDocument::NoDocument { key, .. } => Some(Mutation::Delete {
            key: key.clone(),
            precondition: Precondition::None,
        }),
        // `has_local_mutations()` is false for every `Invalid` doc, so the
        // guard above already returns before we get here.
        MaybeDocument::Invalid { .. } => unreachable!("Invalid never has local mutations"),
    }
}

fn patch_from_mask(found: &FoundDocument, mask: &FieldMask) -> PatchValue {
    let mut patch = PatchValue::default();
    for field in mask.fields() {
        patch.set(field.clone(), found.data.get(field).cloned());
    }
    patch
}
