use thiserror::Error;

/// Malformed or unrecognized message from the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Unknown offer status 0x{0:02X}")]
    UnknownOfferStatus(u8),
    #[error("Unknown reject reason 0x{0:02X}")]
    UnknownRejectReason(u8),
    #[error("Unknown payload status 0x{0:02X}")]
    UnknownPayloadStatus(u8),
    #[error("Firmware version report declares {declared} components but carries {available}")]
    TruncatedVersionReport { declared: usize, available: usize },
}
