//! handler.rs
//! The request-level surface of the log unit: thin orchestration over the
//! cache and the GC subsystem, mapping their results onto response codes.
//! Epoch fencing happens in the surrounding router; requests arriving here
//! are assumed epoch-valid.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use itertools::Itertools;
use tracing::{info, trace};
use typed_builder::TypedBuilder;

use crate::cache::{CacheError, EntryCache, WritePolicy};
use crate::config::Configuration;
use crate::entry::{Address, LogEntry, MetadataMap, StreamId, STREAM_MEMBERSHIP_TAG};
use crate::error::LogUnitError;
use crate::gc::{GarbageCollector, TrimMap};
use crate::log::{LocalLog, MemLog, RollingLog};

const DEFAULT_MAX_CACHE_WEIGHT: u64 = 1 << 30;
const DEFAULT_ENTRIES_PER_SEGMENT: u64 = 10_000;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// How a write was routed by the sequencer. Both modes persist uniformly;
/// the distinction is kept on the surface for the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Normal,
    StreamReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    Overwrite,
}

#[derive(Debug, Clone)]
pub enum ReadResult {
    Entry(LogEntry),
    Empty,
    FilledHole,
}

#[derive(TypedBuilder, Debug, Clone)]
pub struct LogUnitOptions {
    #[builder(default, setter(strip_option, into))]
    pub work_directory: Option<PathBuf>,

    #[builder(default = false)]
    pub in_memory: bool,

    /// Write-through when true, write-back otherwise.
    #[builder(default = true)]
    pub sync_write: bool,

    #[builder(default = DEFAULT_MAX_CACHE_WEIGHT)]
    pub max_cache_weight: u64,

    #[builder(default = DEFAULT_ENTRIES_PER_SEGMENT)]
    pub entries_per_segment: u64,

    #[builder(default = Duration::from_secs(DEFAULT_GC_INTERVAL_SECS))]
    pub gc_interval: Duration,
}

impl LogUnitOptions {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            work_directory: config.work_directory.clone().map(PathBuf::from),
            in_memory: config.in_memory.unwrap_or(false),
            sync_write: config.sync_write.unwrap_or(true),
            max_cache_weight: config.max_cache_weight.unwrap_or(DEFAULT_MAX_CACHE_WEIGHT),
            entries_per_segment: config
                .entries_per_segment
                .unwrap_or(DEFAULT_ENTRIES_PER_SEGMENT),
            gc_interval: Duration::from_secs(
                config.gc_interval_secs.unwrap_or(DEFAULT_GC_INTERVAL_SECS),
            ),
        }
    }
}

/// A log unit: durable storage for one unit of the distributed shared log.
pub struct LogUnit {
    cache: Arc<EntryCache>,
    trims: Arc<TrimMap>,
    gc: GarbageCollector,
}

impl LogUnit {
    pub async fn open(options: LogUnitOptions) -> Result<LogUnit> {
        info!("opening log unit, options: {:?}", options);

        let backend: Arc<dyn LocalLog> = if options.in_memory {
            Arc::new(MemLog::new())
        } else {
            let Some(work_dir) = options.work_directory.as_ref() else {
                bail!(LogUnitError::MissingWorkDirectory);
            };
            Arc::new(RollingLog::new(
                work_dir.join("log"),
                options.entries_per_segment,
            ))
        };
        backend.initialize().await?;

        let policy = if options.sync_write {
            WritePolicy::WriteThrough
        } else {
            WritePolicy::WriteBack
        };

        let cache = Arc::new(EntryCache::new(backend, policy, options.max_cache_weight));
        let trims = Arc::new(TrimMap::new());

        let gc = GarbageCollector::new(cache.clone(), trims.clone(), options.gc_interval);
        gc.start();

        Ok(LogUnit { cache, trims, gc })
    }

    /// Store a new entry. The first write to an address wins; every later
    /// one reports [`WriteStatus::Overwrite`]. A backend failure in
    /// write-through mode propagates as an error and the write is not
    /// acknowledged.
    pub async fn write(
        &self,
        address: Address,
        payload: Bytes,
        metadata: MetadataMap,
        streams: BTreeSet<StreamId>,
        mode: WriteMode,
    ) -> Result<WriteStatus> {
        trace!("write[{}] mode {:?}", address, mode);

        if metadata.contains_key(&STREAM_MEMBERSHIP_TAG) {
            bail!(LogUnitError::ReservedMetadataTag(STREAM_MEMBERSHIP_TAG));
        }

        let entry = LogEntry::new(address, payload, metadata, streams);

        match self.cache.put(entry).await {
            Ok(()) => Ok(WriteStatus::Ok),
            Err(e) => {
                if let Some(CacheError::Overwrite) = e.downcast_ref() {
                    return Ok(WriteStatus::Overwrite);
                }
                Err(e)
            }
        }
    }

    pub async fn read(&self, address: Address) -> Result<ReadResult> {
        trace!("read[{}]", address);

        Ok(match self.cache.get(address).await? {
            None => ReadResult::Empty,
            Some(entry) if entry.is_hole => ReadResult::FilledHole,
            Some(entry) => ReadResult::Entry(entry),
        })
    }

    /// Batched read over a set of address ranges, one result per address.
    pub async fn read_range(
        &self,
        ranges: &[RangeInclusive<Address>],
    ) -> Result<BTreeMap<Address, ReadResult>> {
        trace!("read_range[{:?}]", ranges);

        let addresses: Vec<Address> = ranges
            .iter()
            .flat_map(|r| r.clone())
            .sorted()
            .dedup()
            .collect();

        let mut found = self.cache.get_all(&addresses).await?;

        let mut results = BTreeMap::new();
        for address in addresses {
            let result = match found.remove(&address) {
                None => ReadResult::Empty,
                Some(entry) if entry.is_hole => ReadResult::FilledHole,
                Some(entry) => ReadResult::Entry(entry),
            };
            results.insert(address, result);
        }

        Ok(results)
    }

    /// Resolve an address to a hole if nothing was ever written there.
    /// Idempotent; an existing entry is left untouched.
    pub async fn fill_hole(&self, address: Address) -> Result<()> {
        trace!("fill_hole[{}]", address);

        self.cache.get_or_insert_hole(address).await?;
        Ok(())
    }

    /// Advisory: the stream no longer needs entries at or below `prefix`.
    pub fn trim(&self, stream: StreamId, prefix: Address) {
        self.trims.trim(stream, prefix);
    }

    pub fn set_gc_interval(&self, interval: Duration) {
        self.gc.set_interval(interval);
    }

    pub fn force_gc(&self) {
        self.gc.force();
    }

    /// Run one collection pass inline; returns the freed entry count.
    pub async fn run_gc_pass(&self) -> u64 {
        self.gc.run_pass().await
    }

    /// Wipe all cache and backend state and reinitialize from empty.
    /// Bootstrap and testing only.
    pub async fn reset(&self) -> Result<()> {
        info!("resetting log unit ...");

        self.cache.reset().await?;
        self.trims.clear();

        Ok(())
    }

    /// Halt the background collector. No further persistence is attempted.
    pub async fn shutdown(&self) {
        self.gc.stop().await;
    }
}
