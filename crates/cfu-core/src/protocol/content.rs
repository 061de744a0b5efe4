//! Content (payload) request and response messages.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::ProtocolError;

/// One wire-sized unit of payload data.
///
/// Layout on the wire, after the transport header:
///
/// ```text
/// [0]    flags (0x80 first block, 0x40 last block)
/// [1]    data length
/// [2..4] sequence number (u16 LE)
/// [4..8] address (u32 LE)
/// [8..]  data
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferChunk {
    pub flags: u8,
    pub sequence_number: u16,
    pub address: u32,
    pub data: Vec<u8>,
}

impl TransferChunk {
    pub const HEADER_SIZE: usize = CONTENT_HEADER_SIZE;

    pub fn is_first_block(&self) -> bool {
        self.flags & CONTENT_FLAG_FIRST_BLOCK != 0
    }

    pub fn is_last_block(&self) -> bool {
        self.flags & CONTENT_FLAG_LAST_BLOCK != 0
    }

    pub fn data_length(&self) -> u8 {
        self.data.len() as u8
    }

    /// Encoded length (header + data).
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    /// Write the chunk into `buf`. Bytes past the data are left untouched.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if buf.len() < self.encoded_len() {
            return Err(ProtocolError::BufferTooSmall {
                expected: self.encoded_len(),
                actual: buf.len(),
            });
        }
        buf[0] = self.flags;
        buf[1] = self.data_length();
        LittleEndian::write_u16(&mut buf[2..4], self.sequence_number);
        LittleEndian::write_u32(&mut buf[4..8], self.address);
        buf[Self::HEADER_SIZE..self.encoded_len()].copy_from_slice(&self.data);
        Ok(())
    }

    /// Parse a chunk as the device sees it.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                expected: Self::HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let len = buf[1] as usize;
        let end = Self::HEADER_SIZE + len;
        if buf.len() < end {
            return Err(ProtocolError::BufferTooSmall {
                expected: end,
                actual: buf.len(),
            });
        }
        Ok(Self {
            flags: buf[0],
            sequence_number: LittleEndian::read_u16(&buf[2..4]),
            address: LittleEndian::read_u32(&buf[4..8]),
            data: buf[Self::HEADER_SIZE..end].to_vec(),
        })
    }
}

/// Sequence number following `current`. Zero is reserved, so the counter
/// wraps from `u16::MAX` back to 1.
pub fn next_sequence_number(current: u16) -> u16 {
    match current.wrapping_add(1) {
        0 => FIRST_SEQUENCE_NUMBER,
        n => n,
    }
}

/// Device status for one content chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStatus {
    Success,
    ErrorPrepare,
    ErrorWrite,
    ErrorComplete,
    ErrorVerify,
    ErrorCrc,
    ErrorSignature,
    ErrorVersion,
    ErrorSwapPending,
    ErrorInvalidAddr,
    ErrorNoOffer,
    ErrorInvalid,
}

impl PayloadStatus {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        Ok(match v {
            0x00 => Self::Success,
            0x01 => Self::ErrorPrepare,
            0x02 => Self::ErrorWrite,
            0x03 => Self::ErrorComplete,
            0x04 => Self::ErrorVerify,
            0x05 => Self::ErrorCrc,
            0x06 => Self::ErrorSignature,
            0x07 => Self::ErrorVersion,
            0x08 => Self::ErrorSwapPending,
            0x09 => Self::ErrorInvalidAddr,
            0x0A => Self::ErrorNoOffer,
            0x0B => Self::ErrorInvalid,
            other => return Err(ProtocolError::UnknownPayloadStatus(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for PayloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadStatus::Success => "SUCCESS",
            PayloadStatus::ErrorPrepare => "ERROR_PREPARE",
            PayloadStatus::ErrorWrite => "ERROR_WRITE",
            PayloadStatus::ErrorComplete => "ERROR_COMPLETE",
            PayloadStatus::ErrorVerify => "ERROR_VERIFY",
            PayloadStatus::ErrorCrc => "ERROR_CRC",
            PayloadStatus::ErrorSignature => "ERROR_SIGNATURE",
            PayloadStatus::ErrorVersion => "ERROR_VERSION",
            PayloadStatus::ErrorSwapPending => "ERROR_SWAP_PENDING",
            PayloadStatus::ErrorInvalidAddr => "ERROR_INVALID_ADDR",
            PayloadStatus::ErrorNoOffer => "ERROR_NO_OFFER",
            PayloadStatus::ErrorInvalid => "ERROR_INVALID",
        };
        write!(f, "{}", name)
    }
}

/// Parsed content response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadResponse {
    pub sequence_number: u16,
    pub status: PayloadStatus,
}

impl PayloadResponse {
    pub const SIZE: usize = CONTENT_RESPONSE_SIZE;

    pub fn new(sequence_number: u16, status: PayloadStatus) -> Self {
        Self {
            sequence_number,
            status,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            sequence_number: LittleEndian::read_u16(&data[0..2]),
            status: PayloadStatus::from_u8(data[4])?,
        })
    }

    pub fn to_bytes(&self) -> [u8; CONTENT_RESPONSE_SIZE] {
        let mut bytes = [0u8; CONTENT_RESPONSE_SIZE];
        LittleEndian::write_u16(&mut bytes[0..2], self.sequence_number);
        bytes[4] = self.status.as_u8();
        bytes
    }
}
