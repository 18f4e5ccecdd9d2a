//! presence-core: Embedding matching and the contracts around it.
//!
//! Holds the cosine matcher, the embedding cache, and the narrow interfaces
//! the engine consumes: the external embedding provider, the identity store
//! and the attendance ledger.

pub mod cache;
pub mod provider;
pub mod store;
pub mod types;

pub use cache::EmbeddingCache;
pub use provider::{EmbeddingProvider, FaceEmbedding, ProviderError};
pub use store::{
    AttendanceLedger, AttendanceRecord, CheckinInsert, IdentityRecord, IdentityStore, StoreError,
    StoredIdentity,
};
pub use types::{BoundingBox, CacheEntry, CosineMatcher, Embedding, MatchResult, Matcher};
