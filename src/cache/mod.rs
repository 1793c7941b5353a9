//! Named response stores with offline-first fetch strategies.
//!
//! This module provides:
//! - A storage backend keyed by request identity (SQLite, on disk or in memory)
//! - A store manager that is the single mutation path into the backend
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Optional per-store expiration (max entries, max age)

mod layer;
mod storage;
mod stores;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use stores::{CacheStores, Store};
pub use traits::{
  CachedEntry, EntryMeta, ExpirationPolicy, GenerationMarker, Handled, ResponseSource,
};
