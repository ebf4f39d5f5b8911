//! Versioned key → response cache store.
//!
//! This module provides the storage capability the cache manager runs on:
//! - Named caches, one per deployed version, enumerable and deletable as a whole
//! - Entries keyed by request identity holding an immutable captured response
//! - Network-first and cache-first retrieval over a single version
//! - Best-effort background writes that never block the caller

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
#[cfg(test)]
pub use traits::CacheSource;
pub use traits::{Fetched, RequestKey, Response};
