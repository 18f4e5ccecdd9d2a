//! In-memory snapshot of the identity store used for matching.
//!
//! The snapshot is rebuilt wholesale and swapped in atomically; readers load
//! an `Arc` and never see a half-built gallery or wait on a reload.

use crate::store::{IdentityStore, StoreError};
use crate::types::{CacheEntry, Embedding};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};

pub struct EmbeddingCache {
    snapshot: ArcSwap<Vec<CacheEntry>>,
    /// Serializes reloads so two rebuilds never race on the swap.
    reload_lock: Mutex<()>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            reload_lock: Mutex::new(()),
        }
    }

    /// Rebuild the snapshot from the full store contents.
    ///
    /// Rows whose embedding cannot be parsed are skipped with a warning.
    /// On a store error the previous snapshot stays in place.
    pub fn reload(&self, store: &dyn IdentityStore) -> Result<usize, StoreError> {
        let _guard = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let rows = store.list_all()?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match Embedding::from_json(&row.embedding_json) {
                Ok(embedding) => entries.push(CacheEntry {
                    identity_id: row.identity_id,
                    display_name: row.display_name,
                    embedding,
                }),
                Err(e) => {
                    tracing::warn!(
                        identity = %row.identity_id,
                        error = %e,
                        "skipping identity with unreadable embedding"
                    );
                }
            }
        }

        let count = entries.len();
        self.snapshot.store(Arc::new(entries));
        tracing::debug!(count, "embedding cache reloaded");
        Ok(count)
    }

    /// Current snapshot. May be empty on a cold start.
    pub fn snapshot(&self) -> Arc<Vec<CacheEntry>> {
        self.snapshot.load_full()
    }

    /// Current snapshot, reloading first when it is empty.
    pub fn snapshot_or_reload(
        &self,
        store: &dyn IdentityStore,
    ) -> Result<Arc<Vec<CacheEntry>>, StoreError> {
        let current = self.snapshot();
        if !current.is_empty() {
            return Ok(current);
        }
        self.reload(store)?;
        Ok(self.snapshot())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
