//! Protocol constants for Component Firmware Update (CFU).
//!
//! Values match the published CFU protocol and the HID report layouts
//! shipped by existing CFU devices.

// ============================================================================
// Message Sizes
// ============================================================================

/// Size of an offer, offer information or offer command message.
pub const OFFER_MESSAGE_SIZE: usize = 16;

/// Size of the offer response message.
pub const OFFER_RESPONSE_SIZE: usize = 16;

/// Size of the content (payload) request header: flags, length, sequence, address.
pub const CONTENT_HEADER_SIZE: usize = 8;

/// Size of the content (payload) response message.
pub const CONTENT_RESPONSE_SIZE: usize = 16;

/// Size of the firmware version report header.
pub const VERSION_HEADER_SIZE: usize = 4;

/// Size of one component entry in the firmware version report.
pub const VERSION_ENTRY_SIZE: usize = 8;

/// Size of a BinRecord header (address u32 + length u8).
pub const BIN_RECORD_HEADER_SIZE: usize = 5;

// ============================================================================
// Offer Word 0
// ============================================================================

/// Force immediate reset (word 0 bit 14, byte 1 bit 6).
pub const OFFER_FLAG_FORCE_IMMEDIATE_RESET: u8 = 0x40;

/// Force ignore version (word 0 bit 15, byte 1 bit 7).
pub const OFFER_FLAG_FORCE_IGNORE_VERSION: u8 = 0x80;

/// Component id used by offer information messages.
pub const COMPONENT_ID_OFFER_INFORMATION: u8 = 0xFF;

/// Component id used by offer command messages.
pub const COMPONENT_ID_OFFER_COMMAND: u8 = 0xFE;

/// Default sender identity stamped into the top byte of word 0.
pub const DEFAULT_HOST_TOKEN: u8 = 0xA0;

// ============================================================================
// Content Flags
// ============================================================================

/// First chunk of a component image.
pub const CONTENT_FLAG_FIRST_BLOCK: u8 = 0x80;

/// Last chunk of a component image.
pub const CONTENT_FLAG_LAST_BLOCK: u8 = 0x40;

// ============================================================================
// Sequencing and Retries
// ============================================================================

/// First sequence number of a payload transfer. Zero is never sent.
pub const FIRST_SEQUENCE_NUMBER: u16 = 1;

/// Wake-ups per chunk before giving up on a sequence match.
pub const MAX_RESPONSE_ATTEMPTS: u32 = 3;

/// Offers re-sent after a Busy response (each preceded by NotifyOnReady).
pub const MAX_BUSY_RETRIES: u32 = 3;

/// Default transport wait timeout in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;
