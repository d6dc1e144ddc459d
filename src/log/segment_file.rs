use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::LogError;
use crate::entry::{decode_metadata, encode_metadata, Address, LogEntry};

const RECORD_MAGIC: [u8; 2] = *b"LE";
const RECORD_HEADER_LEN: usize = 19; // magic 2 | flags 1 | address 8 | payload len 4 | metadata len 4

const FLAG_WRITTEN: u8 = 0x01;
const FLAG_HOLE: u8 = 0x02;

/// One append-only segment file. Records are laid out back to back; the
/// written flag of a record is set only after the rest of it is durable, so
/// a torn append never surfaces as a valid entry on recovery.
pub(crate) struct SegmentFile {
    file: tokio::sync::Mutex<File>,
    pub(crate) path: PathBuf,

    index: HashMap<Address, u64>,
    write_cursor: u64,
}

fn encode_record(entry: &LogEntry) -> Vec<u8> {
    let metadata = encode_metadata(&entry.metadata, &entry.streams);
    let payload: &[u8] = entry.payload.as_deref().unwrap_or(&[]);

    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + metadata.len() + payload.len());
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.push(if entry.is_hole { FLAG_HOLE } else { 0 });
    buf.extend_from_slice(&entry.address.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(payload);

    buf
}

impl SegmentFile {
    pub(crate) async fn create(path: impl AsRef<Path>) -> Result<SegmentFile> {
        info!("create segment file at {:?}", path.as_ref());

        let file = match OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(path.as_ref())
            .await
        {
            Err(e) => {
                error!("failed to create segment file {:?}, err: {e}", path.as_ref());
                bail!(LogError::FailedToCreateFile);
            }
            Ok(v) => v,
        };

        Ok(SegmentFile {
            file: tokio::sync::Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            index: HashMap::new(),
            write_cursor: 0,
        })
    }

    /// Open an existing segment and rebuild its address index by a forward
    /// scan. The scan stops at EOF, at a bad magic, at a truncated record,
    /// or at a record whose written flag was never set; everything from that
    /// offset on is dead space and gets truncated away.
    pub(crate) async fn open(path: impl AsRef<Path>) -> Result<SegmentFile> {
        info!("load segment file at {:?}", path.as_ref());

        let mut file = match OpenOptions::new()
            .write(true)
            .read(true)
            .open(path.as_ref())
            .await
        {
            Err(e) => {
                error!("failed to open segment file {:?}, err: {e}", path.as_ref());
                bail!(LogError::FailedToOpen);
            }
            Ok(v) => v,
        };

        let file_len = file.metadata().await?.len();

        let mut index = HashMap::new();
        let mut cursor = 0u64;

        loop {
            if cursor + RECORD_HEADER_LEN as u64 > file_len {
                break;
            }

            file.seek(SeekFrom::Start(cursor)).await?;

            let mut header = [0u8; RECORD_HEADER_LEN];
            if let Err(e) = file.read_exact(&mut header).await {
                error!("failed to read record header at {cursor}, err: {e}");
                bail!(LogError::FailedToRead);
            }

            if header[0..2] != RECORD_MAGIC {
                debug!("segment scan stopped at {cursor}: bad magic");
                break;
            }

            let flags = header[2];
            let address = u64::from_le_bytes(header[3..11].try_into()?);
            let payload_len = u32::from_le_bytes(header[11..15].try_into()?) as u64;
            let metadata_len = u32::from_le_bytes(header[15..19].try_into()?) as u64;

            let total = RECORD_HEADER_LEN as u64 + metadata_len + payload_len;
            if cursor + total > file_len {
                debug!("segment scan stopped at {cursor}: truncated record");
                break;
            }

            if flags & FLAG_WRITTEN == 0 {
                // torn append, the record never committed
                debug!("segment scan stopped at {cursor}: written flag clear");
                break;
            }

            if index.contains_key(&address) {
                warn!("duplicate record for address {address} in {:?}, keeping the first", path.as_ref());
            } else {
                index.insert(address, cursor);
            }

            cursor += total;
        }

        if cursor < file_len {
            // drop the dead tail so later appends start from clean space
            if let Err(e) = file.set_len(cursor).await {
                error!("failed to truncate segment tail, err: {e}");
                bail!(LogError::FailedToWrite);
            }
        }

        debug!(
            "loaded segment {:?}: {} records, cursor {}",
            path.as_ref(),
            index.len(),
            cursor
        );

        Ok(SegmentFile {
            file: tokio::sync::Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            index,
            write_cursor: cursor,
        })
    }

    pub(crate) fn contains(&self, address: Address) -> bool {
        self.index.contains_key(&address)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Append one entry. Space is reserved by advancing the write cursor
    /// past the full record first; the written flag is set as the last
    /// durable action, after everything else reached the disk.
    pub(crate) async fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.index.contains_key(&entry.address) {
            bail!(LogError::DuplicateAddress);
        }

        let record = encode_record(entry);

        let offset = self.write_cursor;
        self.write_cursor += record.len() as u64;

        if let Err(e) = self.write_record(offset, &record).await {
            // sole appender: nothing was indexed, reuse the space
            self.write_cursor = offset;
            return Err(e);
        }

        self.index.insert(entry.address, offset);

        Ok(())
    }

    async fn write_record(&self, offset: u64, record: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;

        if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
            error!("failed to seek to {offset}, err: {e}");
            bail!(LogError::FailedToSeek);
        }

        if let Err(e) = file.write_all(record).await {
            error!("failed to write record at {offset}, err: {e}");
            bail!(LogError::FailedToWrite);
        }
        file.flush().await.map_err(|_| LogError::FailedToWrite)?;
        file.sync_data().await.map_err(|_| LogError::FailedToSync)?;

        // commit point: flip the written flag once the record body is durable
        if let Err(e) = file.seek(SeekFrom::Start(offset + 2)).await {
            error!("failed to seek to flags byte, err: {e}");
            bail!(LogError::FailedToSeek);
        }
        if let Err(e) = file.write_all(&[record[2] | FLAG_WRITTEN]).await {
            error!("failed to set written flag at {offset}, err: {e}");
            bail!(LogError::FailedToWrite);
        }
        file.flush().await.map_err(|_| LogError::FailedToWrite)?;
        file.sync_data().await.map_err(|_| LogError::FailedToSync)?;

        Ok(())
    }

    pub(crate) async fn read(&self, address: Address) -> Result<Option<LogEntry>> {
        let Some(&offset) = self.index.get(&address) else {
            return Ok(None);
        };

        let mut file = self.file.lock().await;

        if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
            error!("failed to seek to {offset}, err: {e}");
            bail!(LogError::FailedToSeek);
        }

        let mut header = [0u8; RECORD_HEADER_LEN];
        if let Err(e) = file.read_exact(&mut header).await {
            error!("failed to read record header at {offset}, err: {e}");
            bail!(LogError::FailedToRead);
        }

        if header[0..2] != RECORD_MAGIC || header[2] & FLAG_WRITTEN == 0 {
            error!("indexed record at {offset} fails its durability check");
            bail!(LogError::CorruptRecord);
        }

        let flags = header[2];
        let stored_address = u64::from_le_bytes(header[3..11].try_into()?);
        let payload_len = u32::from_le_bytes(header[11..15].try_into()?) as usize;
        let metadata_len = u32::from_le_bytes(header[15..19].try_into()?) as usize;

        if stored_address != address {
            error!("index points address {address} at a record holding {stored_address}");
            bail!(LogError::CorruptRecord);
        }

        let mut metadata_buf = vec![0u8; metadata_len];
        if let Err(e) = file.read_exact(&mut metadata_buf).await {
            error!("failed to read record metadata at {offset}, err: {e}");
            bail!(LogError::FailedToRead);
        }

        let mut payload_buf = vec![0u8; payload_len];
        if let Err(e) = file.read_exact(&mut payload_buf).await {
            error!("failed to read record payload at {offset}, err: {e}");
            bail!(LogError::FailedToRead);
        }

        let (metadata, streams) = decode_metadata(&metadata_buf)?;

        Ok(Some(LogEntry {
            address,
            payload: if flags & FLAG_HOLE != 0 {
                None
            } else {
                Some(payload_buf.into())
            },
            metadata,
            streams,
            is_hole: flags & FLAG_HOLE != 0,
            persisted: true,
        }))
    }
}
