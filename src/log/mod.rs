use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::entry::{Address, LogEntry};

mod mem_log;
mod rolling_log;
mod segment_file;

pub use mem_log::MemLog;
pub use rolling_log::RollingLog;

#[derive(Error, Debug, Clone)]
pub enum LogError {
    #[error("address already written")]
    DuplicateAddress,

    #[error("record failed its durability check")]
    CorruptRecord,

    #[error("wrong file path")]
    WrongFilePath,

    #[error("failed to open file")]
    FailedToOpen,
    #[error("failed to read file")]
    FailedToRead,
    #[error("failed to write file")]
    FailedToWrite,
    #[error("failed to seek file")]
    FailedToSeek,
    #[error("failed to sync file")]
    FailedToSync,
    #[error("failed to create new file")]
    FailedToCreateFile,
}

/// Durable storage of entries keyed by address. Implementations must reject
/// a second write to an address the backend already holds.
#[async_trait]
pub trait LocalLog: Send + Sync {
    /// Prepare the backend for use. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Durably store `entry` at its address.
    async fn write(&self, entry: &LogEntry) -> Result<()>;

    /// The stored entry, or `None` if the address was never written or has
    /// been reclaimed.
    async fn read(&self, address: Address) -> Result<Option<LogEntry>>;

    /// Reclamation hook invoked when an address is invalidated upstream.
    /// Physical space reclamation is a compaction concern layered
    /// separately, so both implementations keep this a no-op.
    async fn delete(&self, address: Address) -> Result<()>;

    /// Wipe all stored entries and reinitialize from empty.
    async fn reset(&self) -> Result<()>;
}
