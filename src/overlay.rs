//! The overlay entity (C2): a saved mutation plus the batch id it is
//! attached to.
use crate::{
    mutation::Mutation,
    path::DocumentKey,
};

pub type BatchId = i64;

/// A batch id lower than any batch the mutation queue will ever assign;
/// used as the default "since" bound when a caller has no cursor yet.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A mutation paired with the highest batch id among all batches that
/// contribute to its effect on the target document. Immutable after
/// construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self { largest_batch_id, mutation }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
