//! mem_log.rs
//! In-memory backend, used for testing and development. Entries vanish when
//! the process exits.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{trace, warn};

use super::{LocalLog, LogError};
use crate::entry::{Address, LogEntry};

pub struct MemLog {
    entries: parking_lot::RwLock<HashMap<Address, LogEntry>>,
}

impl MemLog {
    pub fn new() -> Self {
        warn!(
            "log unit backend opened in memory mode. \
             this should be run for testing purposes only. \
             the unit WILL LOSE ALL DATA if it exits."
        );

        Self {
            entries: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalLog for MemLog {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, entry: &LogEntry) -> Result<()> {
        let mut entries = self.entries.write();

        if entries.contains_key(&entry.address) {
            bail!(LogError::DuplicateAddress);
        }

        let mut stored = entry.clone();
        stored.persisted = true;
        entries.insert(stored.address, stored);

        Ok(())
    }

    async fn read(&self, address: Address) -> Result<Option<LogEntry>> {
        Ok(self.entries.read().get(&address).cloned())
    }

    async fn delete(&self, address: Address) -> Result<()> {
        trace!("delete[{}]: no-op", address);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}
