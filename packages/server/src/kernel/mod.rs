//! Kernel module - server infrastructure and dependencies.

pub mod deps;
pub mod lock;
pub mod progress_cache;
pub mod redis_cache;
pub mod testing;

pub use deps::JobDeps;
pub use lock::{JobLock, LockGuard};
pub use progress_cache::{CacheError, LockStore, ProgressCache, ProgressSnapshot};
pub use redis_cache::RedisJobCache;
pub use testing::{InMemoryCheckpointRepository, InMemoryJobCache, InMemoryJobStore, TestDeps};
