//! Versioned response cache.
//!
//! This module provides the storage side of the offline cache:
//! - Request identity (`RequestKey`): method + URL, hashed for storage
//! - Named stores, one per cache version, holding full response payloads
//! - An in-memory backend for tests and ephemeral hosts, and a SQLite backend that survives restarts

mod storage;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheStorage, CachedResponse, RequestKey};
