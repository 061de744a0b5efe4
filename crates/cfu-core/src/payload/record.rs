//! BinRecord framing.
//!
//! A component payload is a plain concatenation of records with no index
//! and no padding:
//!
//! ```text
//! [address: u32 LE][length: u8][data: length bytes] [address]...
//! ```

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::protocol::constants::BIN_RECORD_HEADER_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Truncated record header at offset {offset}: {remaining} bytes left")]
    TruncatedHeader { offset: usize, remaining: usize },
    #[error("Record at offset {offset} declares {declared} bytes, only {available} available")]
    RecordOverrun {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("Zero-length record at offset {offset}")]
    EmptyRecord { offset: usize },
    #[error("Cursor data offset {data_offset} out of range for record at {offset} (length {length})")]
    CursorOutOfRange {
        offset: usize,
        data_offset: usize,
        length: usize,
    },
    #[error(
        "No room for data: buffer {payload_buffer_size}, transport header {header_size}, alignment {alignment}"
    )]
    CapacityTooSmall {
        payload_buffer_size: usize,
        header_size: usize,
        alignment: usize,
    },
}

/// One `address + length + data` unit borrowed from a payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinRecord<'a> {
    /// Byte offset of the record header inside the payload.
    pub offset: usize,
    pub address: u32,
    pub data: &'a [u8],
}

impl<'a> BinRecord<'a> {
    pub const HEADER_SIZE: usize = BIN_RECORD_HEADER_SIZE;

    /// Read the record whose header starts at `offset`.
    pub fn parse(payload: &'a [u8], offset: usize) -> Result<Self, RecordError> {
        let remaining = payload.len().saturating_sub(offset);
        if remaining < Self::HEADER_SIZE {
            return Err(RecordError::TruncatedHeader { offset, remaining });
        }
        let address = LittleEndian::read_u32(&payload[offset..offset + 4]);
        let length = payload[offset + 4] as usize;
        if length == 0 {
            return Err(RecordError::EmptyRecord { offset });
        }
        let start = offset + Self::HEADER_SIZE;
        let available = payload.len() - start;
        if length > available {
            return Err(RecordError::RecordOverrun {
                offset,
                declared: length,
                available,
            });
        }
        Ok(Self {
            offset,
            address,
            data: &payload[start..start + length],
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the byte following this record.
    pub fn end(&self) -> usize {
        self.offset + Self::HEADER_SIZE + self.data.len()
    }

    /// Append the encoded form of a record to `out`.
    pub fn encode_into(address: u32, data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&address.to_le_bytes());
        out.push(data.len() as u8);
        out.extend_from_slice(data);
    }
}

/// Build a payload from `(address, data)` pairs. Data longer than 255 bytes
/// is split into consecutive records.
pub fn encode_records<'d>(records: impl IntoIterator<Item = (u32, &'d [u8])>) -> Vec<u8> {
    let mut out = Vec::new();
    for (address, data) in records {
        let mut addr = address;
        for piece in data.chunks(u8::MAX as usize) {
            BinRecord::encode_into(addr, piece, &mut out);
            addr = addr.wrapping_add(piece.len() as u32);
        }
    }
    out
}

/// Sequential iterator over the records of a payload.
#[derive(Debug, Clone)]
pub struct BinRecords<'a> {
    payload: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> BinRecords<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for BinRecords<'a> {
    type Item = Result<BinRecord<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.payload.len() {
            return None;
        }
        match BinRecord::parse(self.payload, self.offset) {
            Ok(record) => {
                self.offset = record.end();
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence() {
        let payload = encode_records([(0x1000, &[1u8, 2, 3][..]), (0x2000, &[4u8][..])]);
        let records: Vec<_> = BinRecords::new(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address, 0x1000);
        assert_eq!(records[0].data, &[1, 2, 3]);
        assert_eq!(records[1].offset, 8);
        assert_eq!(records[1].end(), payload.len());
    }

    #[test]
    fn test_long_data_is_split() {
        let data = vec![7u8; 300];
        let payload = encode_records([(0x100, &data[..])]);
        let records: Vec<_> = BinRecords::new(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), 255);
        assert_eq!(records[1].address, 0x100 + 255);
        assert_eq!(records[1].len(), 45);
    }

    #[test]
    fn test_overrun_is_reported() {
        let mut payload = encode_records([(0x1000, &[1u8, 2, 3, 4][..])]);
        payload.truncate(payload.len() - 1);
        assert_eq!(
            BinRecord::parse(&payload, 0),
            Err(RecordError::RecordOverrun {
                offset: 0,
                declared: 4,
                available: 3
            })
        );
    }

    #[test]
    fn test_truncated_header() {
        let payload = [0u8; 3];
        assert_eq!(
            BinRecord::parse(&payload, 0),
            Err(RecordError::TruncatedHeader {
                offset: 0,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_empty_record_rejected() {
        let payload = [0, 0x10, 0, 0, 0];
        assert_eq!(
            BinRecord::parse(&payload, 0),
            Err(RecordError::EmptyRecord { offset: 0 })
        );
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut payload = encode_records([(0, &[1u8][..])]);
        payload.extend_from_slice(&[0xFF, 0xFF]);
        let mut iter = BinRecords::new(&payload);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
