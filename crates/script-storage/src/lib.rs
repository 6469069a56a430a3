//! Script object storage
//!
//! Persists compressed script objects, their source maps, and per-object
//! metadata behind a small key/hash + pub/sub backend, and fans change and
//! deletion notifications out to local observers.

pub mod backend;
pub mod engine;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metadata;
pub mod notify;
pub mod redis_backend;
pub mod types;

pub use backend::{BusMessage, MessageStream, StorageBackend};
pub use engine::{ObjectWriter, StorageEngine};
pub use error::{Result, StorageError};
pub use ids::{is_full_script_id, is_map_id, new_script_id, pure_id, DECOMPRESSED_PREFIX};
pub use memory::MemoryBackend;
pub use metadata::Metadata;
pub use notify::{NotificationKind, Subscription};
pub use redis_backend::RedisBackend;
pub use types::{ByteStream, ObjectStream, ReadOutcome};
