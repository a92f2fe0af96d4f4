//! Tiered response cache and the strategies that read and fill it.
//!
//! - Tiers are named, capacity-bounded partitions (`static-v2`, `image-v2`, ...)
//! - Eviction is strict insertion order, independent per tier
//! - Strategies never fail an intercepted request; network failures resolve
//!   to a cached entry, the offline document, or a synthetic response

mod layer;
mod storage;
mod store;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use store::{CacheStore, TierHandle};
pub use traits::{CacheEntry, ResponseSource, Served};
