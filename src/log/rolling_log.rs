use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use tokio::fs::{self, create_dir_all};
use tracing::{debug, info, trace, warn};

use super::segment_file::SegmentFile;
use super::{LocalLog, LogError};
use crate::entry::{Address, LogEntry};

/// The durable backend. Entries are grouped into fixed-capacity segment
/// files: segment `n` holds the address range
/// `[n * entries_per_segment, (n + 1) * entries_per_segment)`, so segments
/// are ordered by the range they cover and an address names its segment
/// directly.
pub struct RollingLog {
    dir: PathBuf,
    entries_per_segment: u64,

    segments: tokio::sync::RwLock<BTreeMap<u64, SegmentFile>>,
}

impl RollingLog {
    pub fn new(dir: impl AsRef<Path>, entries_per_segment: u64) -> Self {
        assert!(entries_per_segment > 0);

        Self {
            dir: dir.as_ref().to_path_buf(),
            entries_per_segment,
            segments: tokio::sync::RwLock::new(BTreeMap::new()),
        }
    }

    fn segment_no(&self, address: Address) -> u64 {
        address / self.entries_per_segment
    }

    fn segment_path(&self, segment_no: u64) -> PathBuf {
        self.dir.join(format!("segment.{}", segment_no))
    }

    fn segment_suffix(path: impl AsRef<Path>) -> Option<u64> {
        let name = path.as_ref().file_name()?.to_str()?;
        let suffix = name.strip_prefix("segment.")?;
        suffix.parse().ok()
    }
}

#[async_trait]
impl LocalLog for RollingLog {
    async fn initialize(&self) -> Result<()> {
        info!("start load rolling log at {:?} ...", self.dir);

        if let Err(e) = create_dir_all(&self.dir).await {
            warn!("failed to create log directory {:?}, err: {e}", self.dir);
            bail!(LogError::WrongFilePath);
        }
        ensure!(self.dir.is_dir(), LogError::WrongFilePath);

        let mut segment_paths = Vec::new();
        let mut read_dir = fs::read_dir(&self.dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let path = dirent.path();
            match Self::segment_suffix(&path) {
                Some(no) => segment_paths.push((no, path)),
                None => warn!("skipping non-segment file {:?}", path),
            }
        }
        segment_paths.sort_by_key(|(no, _)| *no);

        debug!("segment file count: {}", segment_paths.len());

        let mut segments = self.segments.write().await;
        segments.clear();
        for (no, path) in segment_paths {
            segments.insert(no, SegmentFile::open(&path).await?);
        }

        Ok(())
    }

    async fn write(&self, entry: &LogEntry) -> Result<()> {
        let no = self.segment_no(entry.address);

        let mut segments = self.segments.write().await;

        let segment = match segments.entry(no) {
            MapEntry::Occupied(o) => o.into_mut(),
            MapEntry::Vacant(v) => {
                let path = self.segment_path(no);
                let segment = if path.exists() {
                    SegmentFile::open(&path).await?
                } else {
                    SegmentFile::create(&path).await?
                };
                v.insert(segment)
            }
        };

        segment.append(entry).await
    }

    async fn read(&self, address: Address) -> Result<Option<LogEntry>> {
        let segments = self.segments.read().await;

        let Some(segment) = segments.get(&self.segment_no(address)) else {
            return Ok(None);
        };

        segment.read(address).await
    }

    async fn delete(&self, address: Address) -> Result<()> {
        trace!("delete[{}]: no-op", address);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut segments = self.segments.write().await;

        let paths: Vec<PathBuf> = segments.values().map(|s| s.path.clone()).collect();
        segments.clear();

        for path in paths {
            fs::remove_file(&path).await?;
            info!("removed segment file {:?}", path);
        }

        Ok(())
    }
}
