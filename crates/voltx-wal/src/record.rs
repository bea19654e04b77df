//! Intent log record format
//!
//! ```text
//! | seq u64 | kind u8 | flags u8 | txg u64 | offset u64 | length u64 | data_len u32 | data | crc32c u32 |
//! ```
//!
//! All integers are little-endian. The checksum covers every preceding byte
//! of the record.

use crate::error::{WalError, WalResult};

use bytes::{BufMut, Bytes};
use std::io::Read;

/// Fixed part of a record, before its data
pub const RECORD_HEADER_LEN: usize = 8 + 1 + 1 + 8 + 8 + 8 + 4;

/// Largest data payload accepted when decoding (16 MiB)
const MAX_RECORD_DATA: usize = 16 * 1024 * 1024;

/// Data is not carried; the range is durable in the store
const FLAG_INDIRECT: u8 = 0x01;

/// Record kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    Write = 1,
    Truncate = 2,
    Checkpoint = 3,
}

impl TryFrom<u8> for RecordKind {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Write),
            2 => Ok(Self::Truncate),
            3 => Ok(Self::Checkpoint),
            _ => Err(WalError::Corrupt(format!("invalid record kind: {value}"))),
        }
    }
}

/// Data of a write record as stored in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Data carried inline
    Copied(Bytes),
    /// Data persisted in the store by the record's txg
    Indirect,
}

/// A logged intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Data written to `[offset, offset + length)`
    Write {
        txg: u64,
        offset: u64,
        length: u64,
        payload: Payload,
    },
    /// `[offset, offset + length)` freed
    Truncate { txg: u64, offset: u64, length: u64 },
    /// Everything up to `txg` is durable in the store
    Checkpoint { txg: u64 },
}

impl LogRecord {
    /// Transaction group the intent belongs to
    #[must_use]
    pub const fn txg(&self) -> u64 {
        match self {
            Self::Write { txg, .. } | Self::Truncate { txg, .. } | Self::Checkpoint { txg } => *txg,
        }
    }

    const fn kind(&self) -> RecordKind {
        match self {
            Self::Write { .. } => RecordKind::Write,
            Self::Truncate { .. } => RecordKind::Truncate,
            Self::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }
}

/// A sequence-numbered record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonic sequence number
    pub sequence: u64,
    /// The intent
    pub record: LogRecord,
}

impl LogEntry {
    /// Serialize to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (flags, offset, length, data): (u8, u64, u64, &[u8]) = match &self.record {
            LogRecord::Write {
                offset,
                length,
                payload,
                ..
            } => match payload {
                Payload::Copied(data) => (0, *offset, *length, data.as_ref()),
                Payload::Indirect => (FLAG_INDIRECT, *offset, *length, &[]),
            },
            LogRecord::Truncate { offset, length, .. } => (0, *offset, *length, &[]),
            LogRecord::Checkpoint { .. } => (0, 0, 0, &[]),
        };

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + data.len() + 4);
        buf.put_u64_le(self.sequence);
        buf.put_u8(self.record.kind() as u8);
        buf.put_u8(flags);
        buf.put_u64_le(self.record.txg());
        buf.put_u64_le(offset);
        buf.put_u64_le(length);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(data);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let data_len = match &self.record {
            LogRecord::Write {
                payload: Payload::Copied(data),
                ..
            } => data.len(),
            _ => 0,
        };
        RECORD_HEADER_LEN + data_len + 4
    }

    /// Deserialize one record
    pub fn decode<R: Read>(reader: &mut R) -> WalResult<Self> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|e| WalError::Corrupt(format!("truncated record header: {e}")))?;

        let sequence = le_u64(&header[0..8]);
        let kind = RecordKind::try_from(header[8])?;
        let flags = header[9];
        let txg = le_u64(&header[10..18]);
        let offset = le_u64(&header[18..26]);
        let length = le_u64(&header[26..34]);
        let data_len = u32::from_le_bytes([header[34], header[35], header[36], header[37]]) as usize;
        if data_len > MAX_RECORD_DATA {
            return Err(WalError::Corrupt(format!(
                "record {sequence} claims {data_len} bytes of data"
            )));
        }

        let mut data = vec![0u8; data_len];
        reader
            .read_exact(&mut data)
            .map_err(|e| WalError::Corrupt(format!("truncated record {sequence}: {e}")))?;
        let mut crc_buf = [0u8; 4];
        reader
            .read_exact(&mut crc_buf)
            .map_err(|e| WalError::Corrupt(format!("truncated record {sequence}: {e}")))?;

        let expected = crc32c::crc32c_append(crc32c::crc32c(&header), &data);
        if u32::from_le_bytes(crc_buf) != expected {
            return Err(WalError::Corrupt(format!(
                "checksum mismatch in record {sequence}"
            )));
        }

        let record = match kind {
            RecordKind::Write => {
                let payload = if flags & FLAG_INDIRECT == 0 {
                    if data.len() as u64 != length {
                        return Err(WalError::Corrupt(format!(
                            "record {sequence} carries {} bytes for length {length}",
                            data.len()
                        )));
                    }
                    Payload::Copied(Bytes::from(data))
                } else {
                    Payload::Indirect
                };
                LogRecord::Write {
                    txg,
                    offset,
                    length,
                    payload,
                }
            }
            RecordKind::Truncate => LogRecord::Truncate {
                txg,
                offset,
                length,
            },
            RecordKind::Checkpoint => LogRecord::Checkpoint { txg },
        };

        Ok(Self { sequence, record })
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_copied_write_roundtrip() {
        let entry = LogEntry {
            sequence: 42,
            record: LogRecord::Write {
                txg: 7,
                offset: 4096,
                length: 100,
                payload: Payload::Copied(Bytes::from(vec![0xAB; 100])),
            },
        };
        let data = entry.encode();
        assert_eq!(data.len(), entry.encoded_len());
        let decoded = LogEntry::decode(&mut Cursor::new(data)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_indirect_write_carries_no_data() {
        let entry = LogEntry {
            sequence: 1,
            record: LogRecord::Write {
                txg: 3,
                offset: 0,
                length: 131_072,
                payload: Payload::Indirect,
            },
        };
        let data = entry.encode();
        assert_eq!(data.len(), RECORD_HEADER_LEN + 4);
        let decoded = LogEntry::decode(&mut Cursor::new(data)).unwrap();
        assert_eq!(decoded.record, entry.record);
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let entry = LogEntry {
            sequence: 9,
            record: LogRecord::Truncate {
                txg: 2,
                offset: 512,
                length: 1024,
            },
        };
        let mut data = entry.encode();
        data[20] ^= 0x10;
        let err = LogEntry::decode(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, WalError::Corrupt(_)));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let entry = LogEntry {
            sequence: 9,
            record: LogRecord::Checkpoint { txg: 5 },
        };
        let data = entry.encode();
        let err = LogEntry::decode(&mut Cursor::new(&data[..data.len() - 2])).unwrap_err();
        assert!(matches!(err, WalError::Corrupt(_)));
    }
}
