//! Storage traits and the in-memory backend.
//!
//! The traits define the persistence boundary; [`Stores`] bundles one
//! implementation of each so the engine can be wired in one call.

mod memory;
mod traits;

use std::sync::Arc;

pub use memory::{
    InMemoryCanonicalStore, InMemoryEntryStore, InMemoryFeedbackCaseStore, InMemoryReplayJobStore,
};
pub use traits::{
    CanonicalStore, EntryStore, FeedbackCaseStore, MergeRecord, ReplayJobStore, StorageError,
};

/// One handle per storage concern.
#[derive(Clone)]
pub struct Stores {
    pub canonical: Arc<dyn CanonicalStore>,
    pub entries: Arc<dyn EntryStore>,
    pub cases: Arc<dyn FeedbackCaseStore>,
    pub jobs: Arc<dyn ReplayJobStore>,
}

impl Stores {
    /// Fresh in-memory stores with the default redirect hop limit.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::in_memory_with_hop_limit(crate::redirect::DEFAULT_HOP_LIMIT)
    }

    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory_with_hop_limit(hop_limit: usize) -> Self {
        Self {
            canonical: Arc::new(InMemoryCanonicalStore::with_hop_limit(hop_limit)),
            entries: Arc::new(InMemoryEntryStore::new()),
            cases: Arc::new(InMemoryFeedbackCaseStore::new()),
            jobs: Arc::new(InMemoryReplayJobStore::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
