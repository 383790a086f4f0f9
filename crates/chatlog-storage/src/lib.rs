mod cache;
mod error;
mod store;

pub use cache::{CacheBounds, CommitResult, MessageCache};
pub use error::StorageError;
pub use store::{CacheStore, MemoryCacheStore, SqliteCacheStore};
