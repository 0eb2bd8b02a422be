//! On-disk record format with CRC32 checksums.
//!
//! Each record is framed as:
//!
//! ```text
//! magic   u16 | version u8 | flags u8 | length u32 | crc32 u32 | body
//! ```
//!
//! with a little-endian body of
//!
//! ```text
//! offset i64 | timestamp i64 | key_len i32 | key | value_len u32 | value |
//! header_count u16 | (name_len u16 | name | value_len u32 | value)*
//! ```
//!
//! `key_len` is -1 when the message has no key. The CRC covers the body only,
//! so a torn header is detected by the magic/length checks and a torn body by
//! the checksum.

use std::fmt;
use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use rivulet_common::Message;

use crate::error::{LogError, Result};

/// Magic number identifying a Rivulet log record.
const RECORD_MAGIC: u16 = 0x9D4C;

/// Current record format version.
const RECORD_VERSION: u8 = 1;

/// Size of the fixed record header preceding the body.
pub const RECORD_HEADER_LEN: usize = 12;

/// Outcome of reading one record from a byte source.
#[derive(Debug)]
pub enum RecordRead {
    /// A complete, checksum-verified record of `len` total bytes.
    Record { message: Message, len: u32 },
    /// Clean end of data.
    Eof,
    /// A partial or corrupt record. During recovery the log is truncated at
    /// this point; during normal reads this is a hard error.
    Torn { reason: TornReason },
}

/// Why a record could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TornReason {
    PartialHeader,
    PartialBody,
    BadMagic(u16),
    UnsupportedVersion(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for TornReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartialHeader => write!(f, "partial record header"),
            Self::PartialBody => write!(f, "partial record body"),
            Self::BadMagic(magic) => write!(f, "bad magic {magic:#06x}"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported record version {version}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

/// Encode a message into `buf`, returning the total encoded length.
pub fn encode_record(message: &Message, buf: &mut BytesMut) -> u32 {
    let mut body = BytesMut::with_capacity(message.size());
    body.put_i64_le(message.offset);
    body.put_i64_le(message.timestamp);
    match &message.key {
        Some(key) => {
            body.put_i32_le(key.len() as i32);
            body.put_slice(key);
        }
        None => body.put_i32_le(-1),
    }
    body.put_u32_le(message.value.len() as u32);
    body.put_slice(&message.value);
    body.put_u16_le(message.headers.len() as u16);
    for (name, value) in &message.headers {
        body.put_u16_le(name.len() as u16);
        body.put_slice(name.as_bytes());
        body.put_u32_le(value.len() as u32);
        body.put_slice(value);
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    buf.put_u16_le(RECORD_MAGIC);
    buf.put_u8(RECORD_VERSION);
    buf.put_u8(0); // flags, reserved
    buf.put_u32_le(body.len() as u32);
    buf.put_u32_le(crc);
    buf.put_slice(&body);

    (RECORD_HEADER_LEN + body.len()) as u32
}

/// Read one record from `reader`.
///
/// Returns `Eof` on a clean end of data and `Torn` for partial or corrupt
/// trailing bytes so the caller can truncate during recovery.
pub fn read_record(reader: &mut impl Read) -> Result<RecordRead> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match read_exact_or_eof(reader, &mut header)? {
        ReadStatus::Eof => return Ok(RecordRead::Eof),
        ReadStatus::Partial => {
            return Ok(RecordRead::Torn {
                reason: TornReason::PartialHeader,
            })
        }
        ReadStatus::Full => {}
    }

    let mut cursor = Cursor::new(&header[..]);
    let magic = cursor.read_u16::<LittleEndian>()?;
    if magic != RECORD_MAGIC {
        return Ok(RecordRead::Torn {
            reason: TornReason::BadMagic(magic),
        });
    }
    let version = cursor.read_u8()?;
    if version != RECORD_VERSION {
        return Ok(RecordRead::Torn {
            reason: TornReason::UnsupportedVersion(version),
        });
    }
    let _flags = cursor.read_u8()?;
    let length = cursor.read_u32::<LittleEndian>()?;
    let expected_crc = cursor.read_u32::<LittleEndian>()?;

    let mut body = vec![0u8; length as usize];
    match read_exact_or_eof(reader, &mut body)? {
        ReadStatus::Full => {}
        ReadStatus::Eof | ReadStatus::Partial => {
            return Ok(RecordRead::Torn {
                reason: TornReason::PartialBody,
            })
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Ok(RecordRead::Torn {
            reason: TornReason::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            },
        });
    }

    let message = decode_body(&body)?;
    Ok(RecordRead::Record {
        message,
        len: (RECORD_HEADER_LEN + length as usize) as u32,
    })
}

fn decode_body(body: &[u8]) -> Result<Message> {
    let mut cursor = Cursor::new(body);
    let offset = cursor.read_i64::<LittleEndian>()?;
    let timestamp = cursor.read_i64::<LittleEndian>()?;

    let key_len = cursor.read_i32::<LittleEndian>()?;
    let key = if key_len < 0 {
        None
    } else {
        let mut key = vec![0u8; key_len as usize];
        cursor.read_exact(&mut key)?;
        Some(key)
    };

    let value_len = cursor.read_u32::<LittleEndian>()?;
    let mut value = vec![0u8; value_len as usize];
    cursor.read_exact(&mut value)?;

    let header_count = cursor.read_u16::<LittleEndian>()?;
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name_len = cursor.read_u16::<LittleEndian>()?;
        let mut name = vec![0u8; name_len as usize];
        cursor.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| LogError::InvalidFormat("header name is not UTF-8".to_string()))?;
        let header_value_len = cursor.read_u32::<LittleEndian>()?;
        let mut header_value = vec![0u8; header_value_len as usize];
        cursor.read_exact(&mut header_value)?;
        headers.push((name, header_value));
    }

    Ok(Message {
        offset,
        timestamp,
        key,
        value,
        headers,
    })
}

enum ReadStatus {
    Full,
    Partial,
    Eof,
}

/// Fill `buf` from `reader`, distinguishing a clean EOF (no bytes read) from
/// a torn tail (some bytes read).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadStatus> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadStatus::Eof
                } else {
                    ReadStatus::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadStatus::Full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(offset: i64) -> Message {
        Message {
            offset,
            timestamp: 1234,
            key: Some(b"key".to_vec()),
            value: b"value".to_vec(),
            headers: vec![("source".to_string(), b"test".to_vec())],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = make_message(42);
        let mut buf = BytesMut::new();
        let len = encode_record(&message, &mut buf);
        assert_eq!(len as usize, buf.len());

        let mut cursor = Cursor::new(&buf[..]);
        match read_record(&mut cursor).unwrap() {
            RecordRead::Record { message: decoded, len: decoded_len } => {
                assert_eq!(decoded, message);
                assert_eq!(decoded_len, len);
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_keyless_message() {
        let message = Message {
            key: None,
            headers: Vec::new(),
            ..make_message(0)
        };
        let mut buf = BytesMut::new();
        encode_record(&message, &mut buf);

        let mut cursor = Cursor::new(&buf[..]);
        match read_record(&mut cursor).unwrap() {
            RecordRead::Record { message: decoded, .. } => assert_eq!(decoded.key, None),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_eof() {
        let mut cursor = Cursor::new(&[][..]);
        assert!(matches!(read_record(&mut cursor).unwrap(), RecordRead::Eof));
    }

    #[test]
    fn test_torn_header() {
        let mut buf = BytesMut::new();
        encode_record(&make_message(0), &mut buf);
        let mut cursor = Cursor::new(&buf[..5]);
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordRead::Torn {
                reason: TornReason::PartialHeader
            }
        ));
    }

    #[test]
    fn test_torn_body() {
        let mut buf = BytesMut::new();
        encode_record(&make_message(0), &mut buf);
        let truncated = buf.len() - 3;
        let mut cursor = Cursor::new(&buf[..truncated]);
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordRead::Torn {
                reason: TornReason::PartialBody
            }
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::new();
        encode_record(&make_message(0), &mut buf);
        buf[0] = 0xAA;
        buf[1] = 0xAA;
        let mut cursor = Cursor::new(&buf[..]);
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordRead::Torn {
                reason: TornReason::BadMagic(0xAAAA)
            }
        ));
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let mut buf = BytesMut::new();
        encode_record(&make_message(7), &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let mut cursor = Cursor::new(&buf[..]);
        match read_record(&mut cursor).unwrap() {
            RecordRead::Torn {
                reason: TornReason::ChecksumMismatch { expected, actual },
            } => assert_ne!(expected, actual),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }
}
