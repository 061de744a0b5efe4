//! Transport layer abstraction.
//!
//! Defines the `TransportBinding` trait the protocol engine drives,
//! allowing different bus implementations (USB HID, mock, I2C, ...).

use std::time::Duration;

use thiserror::Error;

use crate::protocol::constants::{
    CONTENT_HEADER_SIZE, DEFAULT_WAIT_TIMEOUT_MS, OFFER_MESSAGE_SIZE, VERSION_HEADER_SIZE,
};
use crate::transaction::ResponseSink;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transport not bound")]
    NotBound,

    #[error("Invalid transport parameters: {0}")]
    InvalidParameters(String),
}

/// Parameters negotiated with the bound transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParameters {
    /// How long the engine waits for a response before declaring an interruption.
    pub wait_timeout_ms: u64,
    /// Bytes at the front of every buffer reserved for the transport.
    pub header_size: usize,
    pub offer_buffer_size: usize,
    pub payload_buffer_size: usize,
    pub firmware_version_buffer_size: usize,
    /// Chunk data length must be a multiple of this.
    pub payload_fill_alignment: usize,
}

impl Default for TransportParameters {
    /// Typical HID layout: one report-id byte, 52 data bytes per content report.
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            header_size: 1,
            offer_buffer_size: 1 + OFFER_MESSAGE_SIZE,
            payload_buffer_size: 1 + CONTENT_HEADER_SIZE + 52,
            firmware_version_buffer_size: 61,
            payload_fill_alignment: 4,
        }
    }
}

impl TransportParameters {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |msg: String| Err(TransportError::InvalidParameters(msg));
        if self.payload_fill_alignment == 0 {
            return invalid("payload fill alignment must be at least 1".into());
        }
        if self.offer_buffer_size < self.header_size + OFFER_MESSAGE_SIZE {
            return invalid(format!(
                "offer buffer {} cannot hold header {} + {} byte offer",
                self.offer_buffer_size, self.header_size, OFFER_MESSAGE_SIZE
            ));
        }
        if self.payload_buffer_size
            < self.header_size + CONTENT_HEADER_SIZE + self.payload_fill_alignment
        {
            return invalid(format!(
                "payload buffer {} leaves no aligned room for data",
                self.payload_buffer_size
            ));
        }
        if self.firmware_version_buffer_size < self.header_size + VERSION_HEADER_SIZE {
            return invalid(format!(
                "firmware version buffer {} too small",
                self.firmware_version_buffer_size
            ));
        }
        if self.wait_timeout_ms == 0 {
            return invalid("wait timeout must be non-zero".into());
        }
        Ok(())
    }
}

/// Abstract transport the protocol engine sends through.
///
/// Every `*_send` receives the whole transfer buffer; the engine's message
/// starts at `header_len` and the transport owns the bytes before it.
/// Responses arrive asynchronously through the [`ResponseSink`] handed over
/// at [`bind`](TransportBinding::bind).
pub trait TransportBinding: Send + Sync {
    /// Attach the response sink and report the negotiated parameters.
    fn bind(&self, sink: ResponseSink) -> Result<TransportParameters, TransportError>;

    /// Detach; no response may be delivered afterwards.
    fn unbind(&self);

    /// Open a protocol session on the device.
    fn protocol_start(&self) -> Result<(), TransportError>;

    /// Close the protocol session.
    fn protocol_stop(&self) -> Result<(), TransportError>;

    fn offer_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError>;

    fn offer_command_send(
        &self,
        buffer: &mut [u8],
        header_len: usize,
    ) -> Result<(), TransportError> {
        self.offer_send(buffer, header_len)
    }

    fn offer_information_send(
        &self,
        buffer: &mut [u8],
        header_len: usize,
    ) -> Result<(), TransportError> {
        self.offer_send(buffer, header_len)
    }

    fn payload_send(&self, buffer: &mut [u8], header_len: usize) -> Result<(), TransportError>;

    /// Request the firmware version report; it is delivered through the sink.
    fn firmware_version_get(&self) -> Result<(), TransportError>;
}
