//! Test-only constructors, gated behind the `testing` feature the way the
//! teacher crate's `database/src/test_helpers` is: downstream crates that
//! embed this one can build `DocumentKey`/`Mutation` fixtures without
//! reaching into private construction details.
use serde_json::Value as JsonValue;

use crate::{
    document::ConvexObject,
    mutation::Mutation,
    path::{
        DocumentKey,
        ResourcePath,
    },
};

/// Builds a document key from plain path segments, panicking if `segments`
/// is empty. Intended for test fixtures, where an empty path is a bug.
pub fn test_document_key(segments: &[&str]) -> DocumentKey {
    DocumentKey::from_path(ResourcePath::from_segments(segments.iter().copied()))
        .expect("test_document_key requires at least one segment")
}

/// A `Set` mutation carrying a single `field: value` pair, for tests that
/// don't care about the rest of the document shape.
pub fn test_set_mutation(key: DocumentKey, field: &str, value: impl Into<JsonValue>) -> Mutation {
    let mut data = ConvexObject::empty();
    data.set(field.into(), value.into());
    Mutation::Set { key, data }
}
