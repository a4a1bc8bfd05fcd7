//! Signal index cache: the server-assigned table mapping dense 32-bit
//! runtime ids to the signals a subscriber receives.
//!
//! Protocol version 2 and later prepend a one-bit cache index (as one byte)
//! so the client can disambiguate packets serialized against either cache
//! generation during a swap; the byte stays plaintext even when the body is
//! gzip-compressed so the publisher can patch it in place.

use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::encoding::TextEncoding;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub signal_id: Uuid,
    pub source: String,
    pub id: u64,
}

/// Ordered mapping of runtime id to measurement identity. Runtime ids are
/// dense from zero and stable for the lifetime of the cache.
#[derive(Clone, Debug, Default)]
pub struct SignalIndexCache {
    records: Vec<CacheRecord>,
    by_signal: HashMap<Uuid, i32>,
}

impl SignalIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, assigning the next runtime id.
    pub fn add_record(&mut self, signal_id: Uuid, source: impl Into<String>, id: u64) -> i32 {
        let runtime_id = self.records.len() as i32;
        self.records.push(CacheRecord {
            signal_id,
            source: source.into(),
            id,
        });
        self.by_signal.insert(signal_id, runtime_id);
        runtime_id
    }

    /// Runtime id for a signal; `-1` when the signal is not in this cache.
    pub fn runtime_id(&self, signal_id: &Uuid) -> i32 {
        self.by_signal.get(signal_id).copied().unwrap_or(-1)
    }

    pub fn record(&self, runtime_id: i32) -> Option<&CacheRecord> {
        usize::try_from(runtime_id)
            .ok()
            .and_then(|index| self.records.get(index))
    }

    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn signal_ids(&self) -> Vec<Uuid> {
        self.records.iter().map(|record| record.signal_id).collect()
    }

    /// Serialize for transmission. For version > 1 the first byte is a
    /// cache-index placeholder the caller overwrites before sending.
    pub fn serialize(
        &self,
        version: u8,
        encoding: TextEncoding,
        compress: bool,
    ) -> Result<Vec<u8>> {
        let mut body = BytesMut::new();
        body.put_u32(self.count());
        for record in &self.records {
            let runtime_id = self.runtime_id(&record.signal_id);
            body.put_i32(runtime_id);
            body.extend_from_slice(record.signal_id.as_bytes());
            let source = encoding.encode(&record.source);
            body.put_u32(source.len() as u32);
            body.extend_from_slice(&source);
            body.put_u64(record.id);
        }

        let mut payload = Vec::with_capacity(body.len() + 8);
        payload.put_u32(body.len() as u32);
        payload.extend_from_slice(&body);

        let payload = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            encoder.finish()?
        } else {
            payload
        };

        if version > 1 {
            let mut framed = Vec::with_capacity(payload.len() + 1);
            framed.push(u8::MAX);
            framed.extend_from_slice(&payload);
            Ok(framed)
        } else {
            Ok(payload)
        }
    }

    /// Decode a serialized cache, returning the cache index byte (zero for
    /// version 1) and the reconstructed cache.
    pub fn deserialize(
        data: &[u8],
        version: u8,
        encoding: TextEncoding,
        compressed: bool,
    ) -> Result<(u8, Self)> {
        let (cache_index, payload) = if version > 1 {
            let (&index, rest) = data
                .split_first()
                .ok_or_else(|| Error::MalformedCache("missing cache index".into()))?;
            (index, rest)
        } else {
            (0, data)
        };

        let decompressed;
        let payload: &[u8] = if compressed {
            let mut decoder = GzDecoder::new(payload);
            let mut buffer = Vec::new();
            decoder.read_to_end(&mut buffer)?;
            decompressed = buffer;
            &decompressed
        } else {
            payload
        };

        let mut buf = Bytes::copy_from_slice(payload);
        if buf.remaining() < 8 {
            return Err(Error::MalformedCache("truncated header".into()));
        }
        let binary_length = buf.get_u32() as usize;
        if buf.remaining() != binary_length {
            return Err(Error::MalformedCache(format!(
                "length field {binary_length} does not match body {}",
                buf.remaining()
            )));
        }
        let count = buf.get_u32();

        let mut cache = SignalIndexCache::new();
        for _ in 0..count {
            if buf.remaining() < 4 + 16 + 4 {
                return Err(Error::MalformedCache("truncated record".into()));
            }
            let runtime_id = buf.get_i32();
            if runtime_id != cache.records.len() as i32 {
                return Err(Error::MalformedCache(format!(
                    "non-contiguous runtime id {runtime_id}"
                )));
            }
            let mut raw_id = [0u8; 16];
            buf.copy_to_slice(&mut raw_id);
            let signal_id = Uuid::from_bytes(raw_id);
            let source_length = buf.get_u32() as usize;
            if buf.remaining() < source_length + 8 {
                return Err(Error::MalformedCache("truncated source".into()));
            }
            let source = encoding.decode(&buf.copy_to_bytes(source_length))?;
            let id = buf.get_u64();
            cache.add_record(signal_id, source, id);
        }

        Ok((cache_index, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> SignalIndexCache {
        let mut cache = SignalIndexCache::new();
        cache.add_record(Uuid::new_v4(), "PPA", 1);
        cache.add_record(Uuid::new_v4(), "PPA", 2);
        cache.add_record(Uuid::new_v4(), "SHELBY", 7);
        cache
    }

    #[test]
    fn runtime_ids_are_dense_and_reversible() {
        let cache = sample_cache();
        assert_eq!(cache.count(), 3);
        for (index, signal_id) in cache.signal_ids().iter().enumerate() {
            assert_eq!(cache.runtime_id(signal_id), index as i32);
        }
        assert_eq!(cache.runtime_id(&Uuid::new_v4()), -1);
        assert_eq!(cache.record(2).map(|record| record.id), Some(7));
        assert!(cache.record(-1).is_none());
    }

    #[test]
    fn version_two_round_trip_with_patched_index() {
        let cache = sample_cache();
        let mut serialized = cache
            .serialize(2, TextEncoding::Utf8, false)
            .expect("serialize");
        assert_eq!(serialized[0], u8::MAX);
        serialized[0] = 1;

        let (index, decoded) =
            SignalIndexCache::deserialize(&serialized, 2, TextEncoding::Utf8, false)
                .expect("deserialize");
        assert_eq!(index, 1);
        assert_eq!(decoded.signal_ids(), cache.signal_ids());
        assert_eq!(decoded.record(2), cache.record(2));
    }

    #[test]
    fn version_one_has_no_index_byte() {
        let cache = sample_cache();
        let serialized = cache
            .serialize(1, TextEncoding::Utf8, false)
            .expect("serialize");
        let (index, decoded) =
            SignalIndexCache::deserialize(&serialized, 1, TextEncoding::Utf8, false)
                .expect("deserialize");
        assert_eq!(index, 0);
        assert_eq!(decoded.count(), 3);
    }

    #[test]
    fn gzip_round_trip_keeps_index_plaintext() {
        let cache = sample_cache();
        let mut serialized = cache
            .serialize(2, TextEncoding::Utf8, true)
            .expect("serialize");
        serialized[0] = 0;
        let (index, decoded) =
            SignalIndexCache::deserialize(&serialized, 2, TextEncoding::Utf8, true)
                .expect("deserialize");
        assert_eq!(index, 0);
        assert_eq!(decoded.signal_ids(), cache.signal_ids());
    }

    #[test]
    fn utf16_source_round_trip() {
        let cache = sample_cache();
        let serialized = cache
            .serialize(2, TextEncoding::Utf16Le, false)
            .expect("serialize");
        let (_, decoded) =
            SignalIndexCache::deserialize(&serialized, 2, TextEncoding::Utf16Le, false)
                .expect("deserialize");
        assert_eq!(decoded.record(0), cache.record(0));
    }

    #[test]
    fn rejects_corrupted_length() {
        let cache = sample_cache();
        let mut serialized = cache
            .serialize(1, TextEncoding::Utf8, false)
            .expect("serialize");
        serialized.truncate(serialized.len() - 4);
        assert!(SignalIndexCache::deserialize(&serialized, 1, TextEncoding::Utf8, false).is_err());
    }
}
