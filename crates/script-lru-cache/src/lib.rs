//! Byte-budgeted LRU cache
//!
//! Keeps compiled script payloads in memory, ordered by recency, and evicts
//! from the least recently used end whenever an insertion would push the
//! resident byte count past the configured budget.

mod cache;
mod types;

pub use cache::ScriptCache;
pub use types::{CacheStats, CachedObject};
