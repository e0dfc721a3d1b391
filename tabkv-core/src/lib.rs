//! tabkv Core - Value, Pattern and Error Types
//!
//! Pure data structures and predicates shared by the storage facades and
//! the write-coalescing cache. No I/O and no shared state live here.

pub mod config;
pub mod error;
pub mod identity;
pub mod pattern;
pub mod value;

pub use config::CacheSettings;
pub use error::{
    ConfigError, LifecycleError, PatternError, StorageError, TabKvError, TabKvResult,
};
pub use identity::{FacadeIdentity, Timestamp};
pub use pattern::{matches, WILDCARD};
pub use value::{
    record_size, serialize_value, serialized_len, text_units, ChangeEvent, StorageValue,
};
