//! Engine error taxonomy.

use thiserror::Error;

use crate::payload::RecordError;
use crate::protocol::{OfferStatus, PayloadStatus, ProtocolError, RejectReason};
use crate::resume::{ResumeCheckpoint, StoreError};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transaction aborted")]
    Aborted,

    #[error("Offer for component 0x{component_id:02X} answered {status}: {reason}")]
    OfferRejected {
        component_id: u8,
        status: OfferStatus,
        reason: RejectReason,
    },

    #[error("Unexpected offer status {status}")]
    UnexpectedOfferStatus { status: OfferStatus },

    #[error("Component 0x{component_id:02X} chunk {sequence_number} failed: {status}")]
    PayloadRejected {
        component_id: u8,
        sequence_number: u16,
        status: PayloadStatus,
    },

    #[error("Device answered sequence {received} while {expected} was outstanding")]
    SequenceAhead { expected: u16, received: u16 },

    #[error("No response matched sequence {expected} after {attempts} attempts")]
    SequenceNeverMatched { expected: u16, attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Payload framing error: {0}")]
    Record(#[from] RecordError),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("Component 0x{component_id:02X} interrupted at sequence {}: {source}", .checkpoint.sequence_number)]
    Interrupted {
        component_id: u8,
        checkpoint: ResumeCheckpoint,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Component 0x{component_id:02X} interrupted ({interruption}) and checkpoint could not be saved: {store}")]
    CheckpointLost {
        component_id: u8,
        interruption: Box<EngineError>,
        store: StoreError,
    },

    #[error("Invalid offer for component index {index}: {source}")]
    InvalidOffer {
        index: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("Firmware source failed for component index {index}: {message}")]
    Source { index: usize, message: String },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidState {
        from: crate::engine::EnginePhase,
        to: crate::engine::EnginePhase,
    },
}

impl EngineError {
    /// Recoverable failures: the device stopped answering or the bus failed.
    pub fn is_io_interruption(&self) -> bool {
        match self {
            EngineError::Transport(_) | EngineError::Timeout { .. } => true,
            EngineError::Interrupted { .. } | EngineError::CheckpointLost { .. } => true,
            _ => false,
        }
    }

    /// Checkpoint saved by an interruption, if any.
    pub fn checkpoint(&self) -> Option<&ResumeCheckpoint> {
        match self {
            EngineError::Interrupted { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ChunkCursor;

    #[test]
    fn test_interruption_classification() {
        assert!(EngineError::Timeout { timeout_ms: 10 }.is_io_interruption());
        assert!(EngineError::Transport(TransportError::Disconnected).is_io_interruption());
        assert!(!EngineError::Aborted.is_io_interruption());
        assert!(
            !EngineError::PayloadRejected {
                component_id: 1,
                sequence_number: 2,
                status: PayloadStatus::ErrorCrc,
            }
            .is_io_interruption()
        );
    }

    #[test]
    fn test_interrupted_message_names_sequence() {
        let err = EngineError::Interrupted {
            component_id: 0x21,
            checkpoint: ResumeCheckpoint {
                cursor: ChunkCursor::new(65, 0),
                sequence_number: 2,
                resume_on_connect: true,
            },
            source: Box::new(EngineError::Timeout { timeout_ms: 50 }),
        };
        assert_eq!(
            err.to_string(),
            "Component 0x21 interrupted at sequence 2: No response within 50ms"
        );
        assert_eq!(err.checkpoint().map(|c| c.sequence_number), Some(2));
    }
}
