//! Cache types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A cached payload handed back to readers.
///
/// `data` is a shared immutable view; holding it never keeps a cache slot alive
/// or lets the caller mutate what other readers see.
#[derive(Debug, Clone)]
pub struct CachedObject<M> {
    pub data: Bytes,
    pub metadata: M,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            entries: 3,
            total_size: 12345,
            max_size: 100_000,
            hits: 7,
            misses: 2,
            evictions: 1,
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("\"evictions\":1"));

        let deserialized: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.total_size, stats.total_size);
        assert_eq!(deserialized.max_size, stats.max_size);
    }
}
