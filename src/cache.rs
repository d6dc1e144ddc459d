//! cache.rs
//! The bounded, weight-aware entry cache every read and write goes through.
//! It owns resident entry buffers, bridges misses to the durable backend,
//! and enforces address uniqueness: its occupancy check-and-insert is the
//! point where "no entry" becomes "entry present" exactly once, independent
//! of backend latency.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::join_all;
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::entry::{Address, LogEntry};
use crate::log::{LocalLog, LogError};

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("address already written")]
    Overwrite,
}

/// Whether a write is acknowledged before or after it reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Persist synchronously; a backend failure fails the write.
    WriteThrough,
    /// Acknowledge once cached; persist at the latest before eviction.
    WriteBack,
}

type EvictHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct CacheMap {
    entries: BTreeMap<Address, LogEntry>,
    total_weight: u64,
}

impl CacheMap {
    fn insert(&mut self, entry: LogEntry) {
        self.total_weight += entry.weight();
        self.entries.insert(entry.address, entry);
    }

    fn remove(&mut self, address: Address) -> Option<LogEntry> {
        let entry = self.entries.remove(&address)?;
        self.total_weight -= entry.weight();
        Some(entry)
    }
}

pub struct EntryCache {
    inner: parking_lot::Mutex<CacheMap>,

    backend: Arc<dyn LocalLog>,
    policy: WritePolicy,
    max_weight: u64,

    evict_hook: Option<EvictHook>,
}

impl EntryCache {
    pub fn new(backend: Arc<dyn LocalLog>, policy: WritePolicy, max_weight: u64) -> Self {
        assert!(max_weight > 0);

        Self {
            inner: parking_lot::Mutex::new(CacheMap {
                entries: BTreeMap::new(),
                total_weight: 0,
            }),
            backend,
            policy,
            max_weight,
            evict_hook: None,
        }
    }

    /// Install a hook observing every entry that leaves residency. Fired
    /// exactly once per resident entry, outside the cache lock.
    pub fn with_evict_hook(mut self, hook: impl Fn(&LogEntry) + Send + Sync + 'static) -> Self {
        self.evict_hook = Some(Arc::new(hook));
        self
    }

    fn release(&self, entry: &LogEntry) {
        if let Some(hook) = &self.evict_hook {
            hook(entry);
        }
    }

    /// Accept a new entry at its address. Fails with [`CacheError::Overwrite`]
    /// if the address is already occupied, resident or durable. On success
    /// the entry is persisted according to the write policy and the weight
    /// bound is re-enforced.
    pub async fn put(&self, entry: LogEntry) -> Result<()> {
        let address = entry.address;

        // occupancy check-and-insert, atomic wrt concurrent puts
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&address) {
                bail!(CacheError::Overwrite);
            }
            inner.insert(entry.clone());
        }

        // a reloaded entry is already the durable copy, never write it twice
        if !entry.persisted {
            match self.backend.read(address).await {
                Ok(Some(_)) => {
                    self.rollback(address);
                    bail!(CacheError::Overwrite);
                }
                Ok(None) => {}
                Err(e) => {
                    self.rollback(address);
                    return Err(e);
                }
            }

            if self.policy == WritePolicy::WriteThrough {
                if let Err(e) = self.backend.write(&entry).await {
                    self.rollback(address);
                    if let Some(LogError::DuplicateAddress) = e.downcast_ref() {
                        // the cache occupancy check should have caught this
                        error!("backend rejected address {address} the cache believed free");
                        bail!(CacheError::Overwrite);
                    }
                    return Err(e);
                }
                self.mark_persisted(address);
            }
        }

        self.enforce_weight().await;

        Ok(())
    }

    fn rollback(&self, address: Address) {
        let removed = { self.inner.lock().remove(address) };
        if let Some(entry) = removed {
            self.release(&entry);
        }
    }

    fn mark_persisted(&self, address: Address) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&address) {
            entry.persisted = true;
        }
    }

    /// The entry at `address`, loading from the backend and repopulating
    /// residency on a miss. `None` means genuinely unwritten everywhere —
    /// callers must distinguish this from a present hole entry.
    pub async fn get(&self, address: Address) -> Result<Option<LogEntry>> {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(&address) {
                return Ok(Some(entry.clone()));
            }
        }

        let Some(mut loaded) = self.backend.read(address).await? else {
            return Ok(None);
        };
        trace!("retrieved[{}] from backend", address);
        loaded.persisted = true;

        // a concurrent load or put may have won the insert race; theirs is
        // the resident copy then
        let resident = {
            let mut inner = self.inner.lock();
            match inner.entries.get(&address) {
                Some(existing) => existing.clone(),
                None => {
                    inner.insert(loaded.clone());
                    loaded
                }
            }
        };

        self.enforce_weight().await;

        Ok(Some(resident))
    }

    /// Atomic fill-if-absent: once an address has been resolved through
    /// here, every future reader sees the same answer. Present entries are
    /// returned unchanged; an absent address gets a hole entry, persisted
    /// per the write policy so the fill survives eviction and restart.
    pub async fn get_or_insert_hole(&self, address: Address) -> Result<LogEntry> {
        if let Some(existing) = self.get(address).await? {
            return Ok(existing);
        }

        let hole = LogEntry::hole(address);

        let (filled, entry) = {
            let mut inner = self.inner.lock();
            match inner.entries.get(&address) {
                Some(existing) => (false, existing.clone()),
                None => {
                    inner.insert(hole.clone());
                    (true, hole)
                }
            }
        };

        if filled {
            if self.policy == WritePolicy::WriteThrough {
                if let Err(e) = self.backend.write(&entry).await {
                    // hole filling always succeeds; the fill stays resident
                    // and a write-back style flush happens on eviction
                    warn!("failed to persist hole at {address}, err: {e}");
                } else {
                    self.mark_persisted(address);
                }
            }
            self.enforce_weight().await;
        }

        Ok(entry)
    }

    /// Batched lookup. Addresses with no entry anywhere are simply absent
    /// from the result.
    pub async fn get_all(&self, addresses: &[Address]) -> Result<BTreeMap<Address, LogEntry>> {
        let results = join_all(addresses.iter().map(|&address| self.get(address))).await;

        let mut found = BTreeMap::new();
        for (address, result) in addresses.iter().zip(results) {
            if let Some(entry) = result? {
                found.insert(*address, entry);
            }
        }

        Ok(found)
    }

    /// Drop the entry from residency without re-persisting anything and
    /// invoke the backend's reclamation hook. Returns whether an entry was
    /// actually resident.
    pub async fn invalidate(&self, address: Address) -> bool {
        let removed = { self.inner.lock().remove(address) };

        let Some(entry) = removed else {
            return false;
        };
        self.release(&entry);

        if let Err(e) = self.backend.delete(address).await {
            warn!("backend delete hook failed for {address}, err: {e}");
        }

        true
    }

    /// Resident addresses in ascending order. A deterministic scan order
    /// for the collector.
    pub fn resident_addresses(&self) -> Vec<Address> {
        self.inner.lock().entries.keys().copied().collect()
    }

    /// Resident entry without touching the backend.
    pub fn peek(&self, address: Address) -> Option<LogEntry> {
        self.inner.lock().entries.get(&address).cloned()
    }

    pub fn total_weight(&self) -> u64 {
        self.inner.lock().total_weight
    }

    /// Release every resident entry and wipe the backend.
    pub async fn reset(&self) -> Result<()> {
        let drained: Vec<LogEntry> = {
            let mut inner = self.inner.lock();
            inner.total_weight = 0;
            std::mem::take(&mut inner.entries).into_values().collect()
        };
        for entry in &drained {
            self.release(entry);
        }

        self.backend.reset().await?;
        self.backend.initialize().await?;

        Ok(())
    }

    /// Evict entries, lowest address first, until the total weight is back
    /// at or under the maximum. An unpersisted victim is flushed to the
    /// backend before it may leave residency.
    async fn enforce_weight(&self) {
        let mut skipped: HashSet<Address> = HashSet::new();

        loop {
            let victim = {
                let inner = self.inner.lock();
                if inner.total_weight <= self.max_weight {
                    return;
                }
                match inner
                    .entries
                    .values()
                    .find(|e| !skipped.contains(&e.address))
                {
                    Some(entry) => entry.clone(),
                    None => {
                        warn!(
                            "cache weight {} over the {} bound with no evictable entries",
                            inner.total_weight, self.max_weight
                        );
                        return;
                    }
                }
            };

            if !victim.persisted {
                match self.backend.write(&victim).await {
                    Ok(()) => {}
                    Err(e) => {
                        if let Some(LogError::DuplicateAddress) = e.downcast_ref() {
                            // durable copy already exists, safe to drop
                            warn!("flush of {} found a durable copy", victim.address);
                        } else {
                            // cannot evict without losing data, try another
                            error!("failed to flush {} before eviction, err: {e}", victim.address);
                            skipped.insert(victim.address);
                            continue;
                        }
                    }
                }
            }

            let evicted = { self.inner.lock().remove(victim.address) };
            if let Some(entry) = evicted {
                trace!("eviction[{}]", entry.address);
                self.release(&entry);
            }
        }
    }
}
