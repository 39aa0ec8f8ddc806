//! Record codec: encode/decode the on-disk record and header framing,
//! compute and verify CRC-32C checksums. Pure — no I/O happens here.

use std::sync::OnceLock;

use prost::Message;

use crate::config::RECORD_DELIMITER;
use crate::error::{Error, Result};
use crate::proto::{LogEntry, LogHeader, Metadata, TrimEntry};

/// Width, in bytes, of an encoded [`Metadata`] block. `Metadata`'s two
/// fields use the fixed-width protobuf wire type, so this is the same for
/// every instance; computed once against a canonical value rather than
/// hard-coded.
pub fn metadata_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let canonical = Metadata {
            checksum: -1,
            length: i32::MAX,
        };
        canonical.encoded_len()
    })
}

/// CRC-32C of `bytes`.
pub fn crc32c(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Encode `entry` as a framed record: `delimiter || metadata || payload`.
pub fn encode_record(entry: &LogEntry) -> Vec<u8> {
    let payload = entry.encode_to_vec();
    let checksum = crc32c(&payload) as i32;
    let metadata = Metadata {
        checksum,
        length: payload.len() as i32,
    };
    let metadata_bytes = metadata.encode_to_vec();
    debug_assert_eq!(metadata_bytes.len(), metadata_size());

    let mut out = Vec::with_capacity(2 + metadata_bytes.len() + payload.len());
    out.extend_from_slice(&RECORD_DELIMITER.to_be_bytes());
    out.extend_from_slice(&metadata_bytes);
    out.extend_from_slice(&payload);
    out
}

/// Encode a segment's leading `metadata || header` block (no delimiter).
pub fn encode_header(version: i32, verify_checksum: bool) -> Vec<u8> {
    let header = LogHeader {
        version,
        verify_checksum,
    };
    let header_bytes = header.encode_to_vec();
    let metadata = Metadata {
        checksum: crc32c(&header_bytes) as i32,
        length: header_bytes.len() as i32,
    };
    let metadata_bytes = metadata.encode_to_vec();
    debug_assert_eq!(metadata_bytes.len(), metadata_size());

    let mut out = Vec::with_capacity(metadata_bytes.len() + header_bytes.len());
    out.extend_from_slice(&metadata_bytes);
    out.extend_from_slice(&header_bytes);
    out
}

/// Parse a [`Metadata`] block. `bytes` must be exactly [`metadata_size`].
pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    Metadata::decode(bytes).map_err(|_| Error::InvalidMetadata("malformed metadata block"))
}

/// Parse a [`LogHeader`] from exactly `metadata.length` bytes and, unless
/// `no_verify`, check its checksum against `metadata.checksum`.
pub fn decode_header(bytes: &[u8], metadata: &Metadata, no_verify: bool) -> Result<LogHeader> {
    if bytes.len() as i32 != metadata.length {
        return Err(Error::InvalidMetadata("header length mismatch"));
    }
    if !no_verify && crc32c(bytes) as i32 != metadata.checksum {
        return Err(Error::DataCorruption {
            segment: 0,
            reason: "file header checksum mismatch",
        });
    }
    LogHeader::decode(bytes).map_err(|_| Error::InvalidMetadata("malformed log header"))
}

/// Parse a [`LogEntry`] payload of exactly `metadata.length` bytes and,
/// unless `no_verify`, check its checksum. Also rejects an entry whose
/// re-serialized length disagrees with `metadata.length` — this catches a
/// metadata block that parsed cleanly but no longer describes the bytes
/// that follow it.
pub fn decode_entry(bytes: &[u8], metadata: &Metadata, segment_id: u64, no_verify: bool) -> Result<LogEntry> {
    if bytes.len() as i32 != metadata.length {
        return Err(Error::DataCorruption {
            segment: segment_id,
            reason: "payload length mismatch",
        });
    }
    if !no_verify && crc32c(bytes) as i32 != metadata.checksum {
        return Err(Error::DataCorruption {
            segment: segment_id,
            reason: "payload checksum mismatch",
        });
    }
    let entry = LogEntry::decode(bytes).map_err(|_| Error::DataCorruption {
        segment: segment_id,
        reason: "malformed log entry",
    })?;
    if entry.encoded_len() as i32 != metadata.length {
        return Err(Error::DataCorruption {
            segment: segment_id,
            reason: "entry re-encodes to a different length than its metadata claims",
        });
    }
    Ok(entry)
}

/// Encode one tombstone as a length-delimited [`TrimEntry`], ready to be
/// appended to a `.trimmed`/`.pending` sidecar.
pub fn encode_trim_entry(address: u64) -> Vec<u8> {
    let entry = TrimEntry {
        checksum: crc32c(&address.to_be_bytes()) as i32,
        address,
    };
    let mut out = Vec::with_capacity(entry.encoded_len() + 4);
    entry.encode_length_delimited(&mut out).expect("buffer has capacity");
    out
}

/// Decode every [`TrimEntry`] in a sidecar file's contents, in order.
///
/// A truncated final entry (partial write interrupted by a crash) is
/// tolerated and simply stops the scan — sidecars are advisory indices
/// rebuilt incrementally, not a source of truth requiring strict
/// all-or-nothing framing.
pub fn decode_trim_entries(mut bytes: &[u8]) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let before = bytes.len();
        let entry = match TrimEntry::decode_length_delimited(&mut bytes) {
            Ok(entry) => entry,
            Err(_) => break,
        };
        if bytes.len() == before {
            break;
        }
        let expected = crc32c(&entry.address.to_be_bytes()) as i32;
        if entry.checksum != expected {
            return Err(Error::DataCorruption {
                segment: 0,
                reason: "trim entry checksum mismatch",
            });
        }
        out.push(entry.address);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LogEntry {
        LogEntry {
            global_address: 42,
            data_type: 0,
            data: b"hello world".to_vec(),
            streams: vec!["stream-a".into()],
            backpointers: Default::default(),
            rank: None,
            checkpoint_entry_type: None,
            checkpoint_id: None,
            checkpointed_stream_id: None,
            checkpointed_stream_start: None,
        }
    }

    #[test]
    fn metadata_size_is_fixed_width() {
        let a = Metadata { checksum: 0, length: 0 };
        let b = Metadata {
            checksum: -1,
            length: i32::MAX,
        };
        assert_eq!(a.encoded_len(), b.encoded_len());
        assert_eq!(a.encoded_len(), metadata_size());
    }

    #[test]
    fn record_round_trip() {
        let entry = sample_entry();
        let framed = encode_record(&entry);

        let delim = u16::from_be_bytes(framed[0..2].try_into().unwrap());
        assert_eq!(delim, RECORD_DELIMITER);

        let meta_bytes = &framed[2..2 + metadata_size()];
        let metadata = decode_metadata(meta_bytes).unwrap();
        let payload = &framed[2 + metadata_size()..];
        assert_eq!(payload.len() as i32, metadata.length);

        let decoded = decode_entry(payload, &metadata, 0, false).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn header_round_trip() {
        let framed = encode_header(1, true);
        let meta_bytes = &framed[0..metadata_size()];
        let metadata = decode_metadata(meta_bytes).unwrap();
        let header_bytes = &framed[metadata_size()..];
        let header = decode_header(header_bytes, &metadata, false).unwrap();
        assert_eq!(header.version, 1);
        assert!(header.verify_checksum);
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let entry = sample_entry();
        let mut framed = encode_record(&entry);
        let payload_start = 2 + metadata_size();
        framed[payload_start] ^= 0xFF;

        let meta_bytes = framed[2..payload_start].to_vec();
        let metadata = decode_metadata(&meta_bytes).unwrap();
        let payload = &framed[payload_start..];
        let err = decode_entry(payload, &metadata, 7, false).unwrap_err();
        assert!(matches!(err, Error::DataCorruption { segment: 7, .. }));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let entry = sample_entry();
        let payload = entry.encode_to_vec();
        let bad_metadata = Metadata {
            checksum: crc32c(&payload) as i32,
            length: payload.len() as i32 + 4,
        };
        // Simulate a reader that (incorrectly) fed only `payload.len()` bytes
        // despite metadata claiming more: length mismatch must be caught.
        let err = decode_entry(&payload, &bad_metadata, 1, true).unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));
    }

    #[test]
    fn trim_entries_round_trip() {
        let mut buf = Vec::new();
        buf.extend(encode_trim_entry(3));
        buf.extend(encode_trim_entry(7));
        buf.extend(encode_trim_entry(11));

        let decoded = decode_trim_entries(&buf).unwrap();
        assert_eq!(decoded, vec![3, 7, 11]);
    }

    #[test]
    fn truncated_trim_stream_stops_cleanly() {
        let mut buf = Vec::new();
        buf.extend(encode_trim_entry(3));
        buf.extend(encode_trim_entry(7));
        buf.truncate(buf.len() - 1);

        let decoded = decode_trim_entries(&buf).unwrap();
        assert_eq!(decoded, vec![3]);
    }
}
