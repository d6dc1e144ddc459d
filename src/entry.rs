//! entry.rs
//! Value types shared by the cache and the durable backends: log addresses,
//! stream identity, and the entry stored at one address. Also holds the
//! metadata tag codec used by the on-disk record format.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use derivative::Derivative;

use crate::log::LogError;

/// A unique 64-bit position in the global log.
pub type Address = u64;

/// Opaque 128-bit identifier of a logical stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StreamId(pub u128);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

pub type MetadataMap = BTreeMap<u8, Bytes>;

/// Tag reserved by the record codec to carry stream membership. Callers may
/// not store user metadata under it.
pub const STREAM_MEMBERSHIP_TAG: u8 = 0;

/// The content stored at one address. Payload buffers are refcounted views;
/// the cache hands out clones and keeps the resident copy as the owner.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct LogEntry {
    pub address: Address,

    #[derivative(Debug = "ignore")]
    pub payload: Option<Bytes>,

    pub metadata: MetadataMap,
    pub streams: BTreeSet<StreamId>,

    pub is_hole: bool,
    pub persisted: bool,
}

impl LogEntry {
    pub fn new(
        address: Address,
        payload: Bytes,
        metadata: MetadataMap,
        streams: BTreeSet<StreamId>,
    ) -> Self {
        Self {
            address,
            payload: Some(payload),
            metadata,
            streams,
            is_hole: false,
            persisted: false,
        }
    }

    /// An entry marking `address` as permanently empty. Distinct from an
    /// address that was never written.
    pub fn hole(address: Address) -> Self {
        Self {
            address,
            payload: None,
            metadata: MetadataMap::new(),
            streams: BTreeSet::new(),
            is_hole: true,
            persisted: false,
        }
    }

    /// Cache weight. Entries without a payload still occupy one unit so the
    /// weight bound also limits the number of resident holes.
    pub fn weight(&self) -> u64 {
        match &self.payload {
            Some(p) if !p.is_empty() => p.len() as u64,
            _ => 1,
        }
    }
}

/// Serialize the metadata map for a record, injecting stream membership
/// under the reserved tag. Layout is repeated (tag u8 | len u32 LE | bytes),
/// tags ascending.
pub(crate) fn encode_metadata(metadata: &MetadataMap, streams: &BTreeSet<StreamId>) -> Bytes {
    debug_assert!(!metadata.contains_key(&STREAM_MEMBERSHIP_TAG));

    let mut buf = BytesMut::new();

    if !streams.is_empty() {
        buf.put_u8(STREAM_MEMBERSHIP_TAG);
        buf.put_u32_le(streams.len() as u32 * 16);
        for stream in streams {
            buf.put_u128(stream.0);
        }
    }

    for (tag, value) in metadata {
        buf.put_u8(*tag);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }

    buf.freeze()
}

/// Inverse of [`encode_metadata`]: strips the reserved tag back out into the
/// stream set.
pub(crate) fn decode_metadata(mut buf: &[u8]) -> Result<(MetadataMap, BTreeSet<StreamId>)> {
    let mut metadata = MetadataMap::new();
    let mut streams = BTreeSet::new();

    while !buf.is_empty() {
        if buf.len() < 5 {
            bail!(LogError::CorruptRecord);
        }
        let tag = buf[0];
        let len = u32::from_le_bytes(buf[1..5].try_into()?) as usize;
        buf = &buf[5..];
        if buf.len() < len {
            bail!(LogError::CorruptRecord);
        }
        let value = &buf[..len];

        if tag == STREAM_MEMBERSHIP_TAG {
            if len % 16 != 0 {
                bail!(LogError::CorruptRecord);
            }
            for chunk in value.chunks_exact(16) {
                streams.insert(StreamId(u128::from_be_bytes(chunk.try_into()?)));
            }
        } else {
            metadata.insert(tag, Bytes::copy_from_slice(value));
        }

        buf = &buf[len..];
    }

    Ok((metadata, streams))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_floor() {
        let e = LogEntry::new(7, Bytes::from_static(b"abc"), MetadataMap::new(), BTreeSet::new());
        assert_eq!(e.weight(), 3);

        let empty = LogEntry::new(8, Bytes::new(), MetadataMap::new(), BTreeSet::new());
        assert_eq!(empty.weight(), 1);

        assert_eq!(LogEntry::hole(9).weight(), 1);
    }

    #[test]
    fn test_hole_shape() {
        let h = LogEntry::hole(42);
        assert_eq!(h.address, 42);
        assert!(h.is_hole);
        assert!(h.payload.is_none());
        assert!(h.streams.is_empty());
        assert!(!h.persisted);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut metadata = MetadataMap::new();
        metadata.insert(2, Bytes::from_static(b"checksum"));
        metadata.insert(5, Bytes::from_static(b""));

        let streams: BTreeSet<StreamId> =
            [StreamId(1), StreamId(u128::MAX)].into_iter().collect();

        let blob = encode_metadata(&metadata, &streams);
        let (decoded_meta, decoded_streams) = decode_metadata(&blob).unwrap();

        assert_eq!(decoded_meta, metadata);
        assert_eq!(decoded_streams, streams);
    }

    #[test]
    fn test_metadata_empty() {
        let blob = encode_metadata(&MetadataMap::new(), &BTreeSet::new());
        assert!(blob.is_empty());

        let (metadata, streams) = decode_metadata(&blob).unwrap();
        assert!(metadata.is_empty());
        assert!(streams.is_empty());
    }

    #[test]
    fn test_metadata_truncated_rejected() {
        let mut metadata = MetadataMap::new();
        metadata.insert(3, Bytes::from_static(b"0123456789"));
        let blob = encode_metadata(&metadata, &BTreeSet::new());

        let truncated = &blob[..blob.len() - 1];
        assert!(decode_metadata(truncated).is_err());
    }
}
