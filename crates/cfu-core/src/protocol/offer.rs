//! Offer, offer information and offer command messages.
//!
//! All three share the 16-byte offer layout. Word 0 carries the routing:
//!
//! ```text
//! byte0  segment number | information code | command code
//! byte1  flags (bit6 force reset, bit7 force ignore version)
//! byte2  component id (0xFF information, 0xFE command)
//! byte3  token (sender identity)
//! ```

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::ProtocolError;

/// Device verdict on an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    Skip,
    Accept,
    Reject,
    Busy,
    CommandReady,
    CommandNotSupported,
}

impl OfferStatus {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0x00 => Ok(Self::Skip),
            0x01 => Ok(Self::Accept),
            0x02 => Ok(Self::Reject),
            0x03 => Ok(Self::Busy),
            0x04 => Ok(Self::CommandReady),
            0xFF => Ok(Self::CommandNotSupported),
            other => Err(ProtocolError::UnknownOfferStatus(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Skip => 0x00,
            Self::Accept => 0x01,
            Self::Reject => 0x02,
            Self::Busy => 0x03,
            Self::CommandReady => 0x04,
            Self::CommandNotSupported => 0xFF,
        }
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferStatus::Skip => write!(f, "SKIP"),
            OfferStatus::Accept => write!(f, "ACCEPT"),
            OfferStatus::Reject => write!(f, "REJECT"),
            OfferStatus::Busy => write!(f, "BUSY"),
            OfferStatus::CommandReady => write!(f, "COMMAND_READY"),
            OfferStatus::CommandNotSupported => write!(f, "CMD_NOT_SUPPORTED"),
        }
    }
}

/// Reason attached to a rejected (or skipped) offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OldFirmware,
    InvalidMcu,
    SwapPending,
    Mismatch,
    Bank,
    Platform,
    Milestone,
    InvalidProtocolRevision,
    Variant,
    /// Vendor-defined reason in `0xE0..=0xFF`.
    VendorSpecific(u8),
}

impl RejectReason {
    pub const VENDOR_SPECIFIC_FIRST: u8 = 0xE0;

    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0x00 => Ok(Self::OldFirmware),
            0x01 => Ok(Self::InvalidMcu),
            0x02 => Ok(Self::SwapPending),
            0x03 => Ok(Self::Mismatch),
            0x04 => Ok(Self::Bank),
            0x05 => Ok(Self::Platform),
            0x06 => Ok(Self::Milestone),
            0x07 => Ok(Self::InvalidProtocolRevision),
            0x08 => Ok(Self::Variant),
            v if v >= Self::VENDOR_SPECIFIC_FIRST => Ok(Self::VendorSpecific(v)),
            other => Err(ProtocolError::UnknownRejectReason(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::OldFirmware => 0x00,
            Self::InvalidMcu => 0x01,
            Self::SwapPending => 0x02,
            Self::Mismatch => 0x03,
            Self::Bank => 0x04,
            Self::Platform => 0x05,
            Self::Milestone => 0x06,
            Self::InvalidProtocolRevision => 0x07,
            Self::Variant => 0x08,
            Self::VendorSpecific(v) => v,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OldFirmware => write!(f, "OLD_FIRMWARE"),
            RejectReason::InvalidMcu => write!(f, "INVALID_MCU"),
            RejectReason::SwapPending => write!(f, "SWAP_PENDING"),
            RejectReason::Mismatch => write!(f, "MISMATCH"),
            RejectReason::Bank => write!(f, "BANK"),
            RejectReason::Platform => write!(f, "PLATFORM"),
            RejectReason::Milestone => write!(f, "MILESTONE"),
            RejectReason::InvalidProtocolRevision => write!(f, "INVALID_PROTOCOL_REVISION"),
            RejectReason::Variant => write!(f, "VARIANT"),
            RejectReason::VendorSpecific(v) => write!(f, "VENDOR_SPECIFIC(0x{:02X})", v),
        }
    }
}

/// Informational records sent around the offer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferInformationCode {
    StartEntireTransaction = 0x00,
    StartOfferList = 0x01,
    EndOfferList = 0x02,
}

/// Offer commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferCommandCode {
    /// Device answers once it is ready to accept offers again.
    NotifyOnReady = 0x01,
}

/// 16-byte offer proposing an update of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferMessage {
    bytes: [u8; OFFER_MESSAGE_SIZE],
}

impl OfferMessage {
    pub const SIZE: usize = OFFER_MESSAGE_SIZE;

    /// Wrap caller-supplied offer bytes. Anything but 16 bytes is refused.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; OFFER_MESSAGE_SIZE] =
            data.try_into().map_err(|_| ProtocolError::BufferTooSmall {
                expected: OFFER_MESSAGE_SIZE,
                actual: data.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Build an offer information record.
    pub fn information(code: OfferInformationCode, token: u8) -> Self {
        let mut bytes = [0u8; OFFER_MESSAGE_SIZE];
        bytes[0] = code as u8;
        bytes[2] = COMPONENT_ID_OFFER_INFORMATION;
        bytes[3] = token;
        Self { bytes }
    }

    /// Build an offer command.
    pub fn command(code: OfferCommandCode, token: u8) -> Self {
        let mut bytes = [0u8; OFFER_MESSAGE_SIZE];
        bytes[0] = code as u8;
        bytes[2] = COMPONENT_ID_OFFER_COMMAND;
        bytes[3] = token;
        Self { bytes }
    }

    pub fn segment_number(&self) -> u8 {
        self.bytes[0]
    }

    pub fn component_id(&self) -> u8 {
        self.bytes[2]
    }

    pub fn token(&self) -> u8 {
        self.bytes[3]
    }

    pub fn firmware_version(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[4..8])
    }

    pub fn word0(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[0..4])
    }

    pub fn force_immediate_reset(&self) -> bool {
        self.bytes[1] & OFFER_FLAG_FORCE_IMMEDIATE_RESET != 0
    }

    pub fn force_ignore_version(&self) -> bool {
        self.bytes[1] & OFFER_FLAG_FORCE_IGNORE_VERSION != 0
    }

    /// Stamp the sender identity into the top byte of word 0.
    pub fn with_token(mut self, token: u8) -> Self {
        self.bytes[3] = token;
        self
    }

    /// Set the caller-requested flags. Flags already present in the offer are kept.
    pub fn with_flags(mut self, force_immediate_reset: bool, force_ignore_version: bool) -> Self {
        if force_immediate_reset {
            self.bytes[1] |= OFFER_FLAG_FORCE_IMMEDIATE_RESET;
        }
        if force_ignore_version {
            self.bytes[1] |= OFFER_FLAG_FORCE_IGNORE_VERSION;
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8; OFFER_MESSAGE_SIZE] {
        &self.bytes
    }
}

/// Parsed offer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferResponse {
    pub token: u8,
    pub status: OfferStatus,
    pub reject_reason: RejectReason,
}

impl OfferResponse {
    pub const SIZE: usize = OFFER_RESPONSE_SIZE;

    pub fn new(status: OfferStatus, reject_reason: RejectReason) -> Self {
        Self {
            token: 0,
            status,
            reject_reason,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let status = OfferStatus::from_u8(data[12])?;
        // The reason byte is only meaningful for Skip/Reject; devices leave
        // garbage in it otherwise.
        let reject_reason = match status {
            OfferStatus::Skip | OfferStatus::Reject => RejectReason::from_u8(data[8])?,
            _ => RejectReason::from_u8(data[8]).unwrap_or(RejectReason::OldFirmware),
        };
        Ok(Self {
            token: data[3],
            status,
            reject_reason,
        })
    }

    pub fn to_bytes(&self) -> [u8; OFFER_RESPONSE_SIZE] {
        let mut bytes = [0u8; OFFER_RESPONSE_SIZE];
        bytes[3] = self.token;
        bytes[8] = self.reject_reason.as_u8();
        bytes[12] = self.status.as_u8();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offer() -> [u8; 16] {
        let mut offer = [0u8; 16];
        offer[2] = 0x21;
        offer[4..8].copy_from_slice(&0x0102_0304u32.to_le_bytes());
        offer
    }

    #[test]
    fn test_offer_flags_land_in_word0_bits_14_and_15() {
        let offer = OfferMessage::from_bytes(&sample_offer())
            .unwrap()
            .with_flags(true, true)
            .with_token(0xA0);

        assert_eq!(offer.word0() & (1 << 14), 1 << 14);
        assert_eq!(offer.word0() & (1 << 15), 1 << 15);
        assert_eq!(offer.word0() >> 24, 0xA0);
        assert_eq!(offer.component_id(), 0x21);
        assert_eq!(offer.firmware_version(), 0x0102_0304);
    }

    #[test]
    fn test_offer_without_flags_keeps_word0() {
        let offer = OfferMessage::from_bytes(&sample_offer())
            .unwrap()
            .with_flags(false, false);
        assert!(!offer.force_immediate_reset());
        assert!(!offer.force_ignore_version());
    }

    #[test]
    fn test_offer_wrong_length() {
        assert!(matches!(
            OfferMessage::from_bytes(&[0u8; 12]),
            Err(ProtocolError::BufferTooSmall { expected: 16, actual: 12 })
        ));
    }

    #[test]
    fn test_information_record_layout() {
        let info = OfferMessage::information(OfferInformationCode::StartOfferList, 0xA0);
        let bytes = info.as_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[2], 0xFF);
        assert_eq!(bytes[3], 0xA0);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_response_parse_reject() {
        let mut raw = [0u8; 16];
        raw[3] = 0xA0;
        raw[8] = 0x02;
        raw[12] = 0x02;
        let rsp = OfferResponse::from_bytes(&raw).unwrap();
        assert_eq!(rsp.status, OfferStatus::Reject);
        assert_eq!(rsp.reject_reason, RejectReason::SwapPending);
        assert_eq!(rsp.token, 0xA0);
    }

    #[test]
    fn test_response_vendor_reason() {
        let mut raw = [0u8; 16];
        raw[8] = 0xE7;
        raw[12] = 0x00;
        let rsp = OfferResponse::from_bytes(&raw).unwrap();
        assert_eq!(rsp.reject_reason, RejectReason::VendorSpecific(0xE7));
    }

    #[test]
    fn test_response_unknown_status() {
        let mut raw = [0u8; 16];
        raw[12] = 0x42;
        assert_eq!(
            OfferResponse::from_bytes(&raw),
            Err(ProtocolError::UnknownOfferStatus(0x42))
        );
    }

    #[test]
    fn test_response_unknown_reason_on_reject() {
        let mut raw = [0u8; 16];
        raw[8] = 0x30;
        raw[12] = 0x02;
        assert_eq!(
            OfferResponse::from_bytes(&raw),
            Err(ProtocolError::UnknownRejectReason(0x30))
        );
    }
}
