//! A bucket file is a plain concatenation of records, one per cached
//! `(key, value)` pair.  Each record is framed independently:
//!
//! ```text
//! +-------+---------------+--------------------------------+
//! | magic | payload len   | gzip(bincode((key, value)))    |
//! | 2 B   | u32 LE        | payload len bytes              |
//! +-------+---------------+--------------------------------+
//! ```
//!
//! The framing lets appenders add records without rewriting the
//! file, and lets readers tell apart a stream that merely stops early
//! (a writer is still busy, or died mid-write) from one that is
//! garbage.  The gzip trailer's CRC catches bit rot in the payload.
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Every record starts with these two bytes.
pub const RECORD_MAGIC: [u8; 2] = [0x5b, 0xc4];

/// Magic plus the little-endian payload length.
pub const HEADER_LEN: usize = RECORD_MAGIC.len() + std::mem::size_of::<u32>();

/// Payloads larger than this are assumed to be a garbled length
/// field rather than a real record.
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// Why we stopped decoding a record stream early.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The stream ended in the middle of a record.  Someone may still
    /// be appending to the file.
    #[error("record truncated after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },

    /// The stream does not parse as a record at all.
    #[error("corrupt record stream: {0}")]
    Corrupt(String),

    /// We failed to allocate a buffer for the record's payload.
    #[error("could not allocate {0} bytes for a record")]
    MemoryPressure(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads into `buf` until it is full or the reader hits end of
/// stream.  Returns the number of bytes read.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Serialises and compresses `(key, value)` into one framed record.
pub fn encode<K: Serialize, V: Serialize>(key: &K, value: &V) -> bincode::Result<Vec<u8>> {
    let raw = bincode::serialize(&(key, value))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(&raw)?;
    let payload = encoder.finish()?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }

    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&RECORD_MAGIC);
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decodes exactly one record from `reader`.
///
/// Returns `Ok(None)` when the reader is at a clean end of stream,
/// i.e., there isn't a single byte left before the next header.
pub fn decode<K, V>(reader: &mut impl Read) -> Result<Option<(K, V)>, DecodeError>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    match read_fully(reader, &mut header)? {
        0 => return Ok(None),
        n if n < HEADER_LEN => {
            return Err(DecodeError::Truncated {
                read: n,
                expected: HEADER_LEN,
            })
        }
        _ => {}
    }

    if header[..RECORD_MAGIC.len()] != RECORD_MAGIC {
        return Err(DecodeError::Corrupt(format!(
            "bad record magic {:02x}{:02x}",
            header[0], header[1]
        )));
    }

    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::Corrupt(format!(
            "record payload length {} exceeds limit",
            len
        )));
    }

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| DecodeError::MemoryPressure(len))?;

    let read = reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    if read < len {
        return Err(DecodeError::Truncated {
            read: HEADER_LEN + read,
            expected: HEADER_LEN + len,
        });
    }

    let mut raw = Vec::new();
    GzDecoder::new(&payload[..])
        .read_to_end(&mut raw)
        .map_err(|e| DecodeError::Corrupt(format!("bad compressed payload: {}", e)))?;

    let pair = bincode::deserialize::<(K, V)>(&raw)
        .map_err(|e| DecodeError::Corrupt(format!("bad serialised record: {}", e)))?;
    Ok(Some(pair))
}

/// Where a record stream stops being well framed, judging by the
/// frame headers alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tail {
    /// The stream ends right after a complete frame (or is empty).
    Clean,
    /// The last frame is cut short.  The complete frames end at
    /// `boundary`.
    Torn { boundary: u64 },
    /// A frame header at `boundary` is garbage.
    Corrupt { boundary: u64 },
}

/// Walks the frame headers in `reader` without inflating any payload,
/// and reports whether new records can go right after the last byte.
pub fn scan_tail(reader: &mut (impl Read + Seek)) -> std::io::Result<Tail> {
    let end = reader.seek(SeekFrom::End(0))?;
    let mut pos = reader.seek(SeekFrom::Start(0))?;

    while pos < end {
        let mut header = [0u8; HEADER_LEN];
        if read_fully(reader, &mut header)? < HEADER_LEN {
            return Ok(Tail::Torn { boundary: pos });
        }

        if header[..RECORD_MAGIC.len()] != RECORD_MAGIC {
            return Ok(Tail::Corrupt { boundary: pos });
        }

        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as u64;
        if len > MAX_PAYLOAD_LEN as u64 {
            return Ok(Tail::Corrupt { boundary: pos });
        }

        let next = pos + HEADER_LEN as u64 + len;
        if next > end {
            return Ok(Tail::Torn { boundary: pos });
        }

        pos = reader.seek(SeekFrom::Start(next))?;
    }

    Ok(Tail::Clean)
}

/// Decodes records until end of stream or the first error.  Returns
/// everything decoded so far along with the error that stopped us,
/// if any.
pub fn decode_all<K, V>(mut reader: impl Read) -> (Vec<(K, V)>, Option<DecodeError>)
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let mut entries = Vec::new();

    loop {
        if entries.try_reserve(1).is_err() {
            let size = std::mem::size_of::<(K, V)>() * (entries.len() + 1);
            return (entries, Some(DecodeError::MemoryPressure(size)));
        }

        match decode(&mut reader) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => return (entries, None),
            Err(e) => return (entries, Some(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn stream(records: &[(String, Vec<u8>)]) -> (Vec<u8>, Vec<usize>) {
        let mut bytes = Vec::new();
        let mut boundaries = vec![0];

        for (key, value) in records {
            bytes.extend(encode(key, value).expect("encode must succeed"));
            boundaries.push(bytes.len());
        }

        (bytes, boundaries)
    }

    #[test]
    fn smoke_test() {
        let record = encode(&"key".to_string(), &42u64).expect("encode must succeed");
        assert_eq!(&record[..2], &RECORD_MAGIC);

        let mut reader = &record[..];
        let decoded: Option<(String, u64)> = decode(&mut reader).expect("decode must succeed");
        assert_eq!(decoded, Some(("key".to_string(), 42)));

        // And now we're at a clean end of stream.
        let decoded: Option<(String, u64)> = decode(&mut reader).expect("decode must succeed");
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_empty_stream() {
        let (entries, err) = decode_all::<String, String>(&b""[..]);

        assert!(entries.is_empty());
        assert!(err.is_none());
    }

    /// Records concatenated in a stream come back out in order.
    #[test]
    fn test_concatenated() {
        let records = vec![
            ("a".to_string(), b"first".to_vec()),
            ("b".to_string(), Vec::new()),
            ("a".to_string(), b"third".to_vec()),
        ];
        let (bytes, _) = stream(&records);

        let (entries, err) = decode_all::<String, Vec<u8>>(&bytes[..]);
        assert!(err.is_none());
        assert_eq!(entries, records);
    }

    #[test]
    fn test_truncated_header() {
        let record = encode(&1u32, &2u32).expect("encode must succeed");

        let result = decode::<u32, u32>(&mut &record[..3]);
        assert!(matches!(
            result,
            Err(DecodeError::Truncated {
                read: 3,
                expected: HEADER_LEN
            })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let record = encode(&1u32, &"some value".to_string()).expect("encode must succeed");
        let cut = record.len() - 1;

        let result = decode::<u32, String>(&mut &record[..cut]);
        assert!(
            matches!(result, Err(DecodeError::Truncated { read, expected })
                     if read == cut && expected == record.len())
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut record = encode(&1u32, &2u32).expect("encode must succeed");
        record[0] ^= 0xff;

        assert!(matches!(
            decode::<u32, u32>(&mut &record[..]),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_length() {
        let mut record = RECORD_MAGIC.to_vec();
        record.extend_from_slice(&u32::MAX.to_le_bytes());
        record.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            decode::<u32, u32>(&mut &record[..]),
            Err(DecodeError::Corrupt(_))
        ));
    }

    /// Flip a bit in the gzip trailer's CRC: the payload still
    /// inflates, but must not be trusted.
    #[test]
    fn test_bad_checksum() {
        let mut record = encode(&"key".to_string(), &"value".to_string()).expect("must encode");
        let crc_byte = record.len() - 6;
        record[crc_byte] ^= 1;

        assert!(matches!(
            decode::<String, String>(&mut &record[..]),
            Err(DecodeError::Corrupt(_))
        ));
    }

    /// A well-framed payload that decodes to the wrong type is corrupt.
    #[test]
    fn test_type_mismatch() {
        let record = encode(&1u8, &()).expect("encode must succeed");

        assert!(matches!(
            decode::<String, Vec<u64>>(&mut &record[..]),
            Err(DecodeError::Corrupt(_))
        ));
    }

    /// The first record survives even when garbage follows it.
    #[test]
    fn test_prefix_before_garbage() {
        let mut bytes = encode(&"ok".to_string(), &1u64).expect("encode must succeed");
        bytes.extend_from_slice(b"this is not a record");

        let (entries, err) = decode_all::<String, u64>(&bytes[..]);
        assert_eq!(entries, vec![("ok".to_string(), 1)]);
        assert!(matches!(err, Some(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_scan_tail() {
        let (bytes, boundaries) = stream(&[
            ("a".to_string(), b"first".to_vec()),
            ("b".to_string(), b"second".to_vec()),
        ]);

        let scan = |bytes: &[u8]| scan_tail(&mut std::io::Cursor::new(bytes)).expect("scan must succeed");
        assert_eq!(scan(&[]), Tail::Clean);
        assert_eq!(scan(&bytes), Tail::Clean);
        assert_eq!(
            scan(&bytes[..bytes.len() - 1]),
            Tail::Torn {
                boundary: boundaries[1] as u64
            }
        );
        assert_eq!(
            scan(&bytes[..boundaries[1] + 2]),
            Tail::Torn {
                boundary: boundaries[1] as u64
            }
        );

        let mut garbled = bytes.clone();
        garbled[boundaries[1]] ^= 0xff;
        assert_eq!(
            scan(&garbled),
            Tail::Corrupt {
                boundary: boundaries[1] as u64
            }
        );
    }

    /// A length field that promises more than the stream holds is a
    /// truncation, and only the bytes actually there count as read.
    #[test]
    fn test_large_length_short_stream() {
        let len = 1usize << 20;
        let mut record = RECORD_MAGIC.to_vec();
        record.extend_from_slice(&(len as u32).to_le_bytes());
        record.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            decode::<u32, u32>(&mut &record[..]),
            Err(DecodeError::Truncated { read, expected })
                if read == HEADER_LEN + 16 && expected == HEADER_LEN + len
        ));
    }

    proptest! {
        /// Cutting a stream anywhere yields a prefix of the records.
        /// Cuts on a record boundary look like a clean end of stream,
        /// and every other cut is a truncation, never corruption.
        #[test]
        fn test_any_cut_is_a_prefix(records in vec((".{0,8}", vec(any::<u8>(), 0..64)), 0..6usize),
                                    cut_fraction in 0.0..=1.0f64) {
            let (bytes, boundaries) = stream(&records);
            let cut = ((bytes.len() as f64) * cut_fraction) as usize;

            let (entries, err) = decode_all::<String, Vec<u8>>(&bytes[..cut]);
            assert_eq!(&entries[..], &records[..entries.len()]);

            if boundaries.contains(&cut) {
                assert!(err.is_none());
                assert_eq!(boundaries[entries.len()], cut);
            } else {
                assert!(matches!(err, Some(DecodeError::Truncated { .. })));
            }
        }
    }
}
