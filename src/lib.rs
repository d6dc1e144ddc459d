//! Single-node storage engine for a distributed shared log. All reads and
//! writes go through a bounded, weight-aware cache backed by either an
//! ephemeral in-memory log or a segmented file-backed log; a background
//! collector reclaims entries once every stream they belong to has trimmed
//! past their address.

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod gc;
pub mod handler;
pub mod log;

pub use cache::{CacheError, EntryCache, WritePolicy};
pub use entry::{Address, LogEntry, MetadataMap, StreamId};
pub use error::LogUnitError;
pub use gc::{GarbageCollector, TrimMap};
pub use handler::{LogUnit, LogUnitOptions, ReadResult, WriteMode, WriteStatus};
pub use log::{LocalLog, LogError, MemLog, RollingLog};
