//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow an update without being
//! coupled to the engine.

use crate::engine::EnginePhase;
use crate::protocol::{OfferStatus, RejectReason};
use crate::resume::ResumeCheckpoint;

/// Events emitted by the protocol engine.
#[derive(Debug, Clone)]
pub enum CfuEvent {
    /// Phase changed.
    PhaseChanged { from: EnginePhase, to: EnginePhase },
    /// The device reported a component's running firmware version.
    VersionReported { component_id: u8, version: u32 },
    /// An offer went out.
    OfferSent { component_id: u8, version: u32 },
    /// The device answered an offer.
    OfferAnswered {
        component_id: u8,
        status: OfferStatus,
        reason: RejectReason,
    },
    /// The device was busy; waiting for it to become ready.
    DeviceBusy { component_id: u8, attempt: u32 },
    /// Payload transfer continues from a saved checkpoint.
    Resumed {
        component_id: u8,
        checkpoint: ResumeCheckpoint,
    },
    /// A chunk was acknowledged.
    Progress {
        component_id: u8,
        sequence_number: u16,
        current: u64,
        total: u64,
    },
    /// An interruption was recorded for a later resume.
    CheckpointSaved {
        component_id: u8,
        checkpoint: ResumeCheckpoint,
    },
    /// A component finished successfully.
    ComponentComplete { component_id: u8, chunks: u32 },
    /// A component failed.
    ComponentFailed { index: usize, message: String },
    /// The transaction finished.
    Complete,
}

/// Observer trait for receiving engine events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait CfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &CfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl CfuObserver for NullObserver {
    fn on_event(&self, _event: &CfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl CfuObserver for TracingObserver {
    fn on_event(&self, event: &CfuEvent) {
        match event {
            CfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            CfuEvent::VersionReported {
                component_id,
                version,
            } => {
                tracing::info!(
                    component_id = %format!("0x{:02X}", component_id),
                    version = %format!("0x{:08X}", version),
                    "Running firmware"
                );
            }
            CfuEvent::OfferSent {
                component_id,
                version,
            } => {
                tracing::debug!(
                    component_id = %format!("0x{:02X}", component_id),
                    version = %format!("0x{:08X}", version),
                    "Offer sent"
                );
            }
            CfuEvent::OfferAnswered {
                component_id,
                status,
                reason,
            } => match status {
                OfferStatus::Skip | OfferStatus::Reject => {
                    tracing::warn!(component_id = %format!("0x{:02X}", component_id), status = %status, reason = %reason, "Offer declined");
                }
                _ => {
                    tracing::info!(component_id = %format!("0x{:02X}", component_id), status = %status, "Offer answered");
                }
            },
            CfuEvent::DeviceBusy {
                component_id,
                attempt,
            } => {
                tracing::warn!(component_id = %format!("0x{:02X}", component_id), attempt, "Device busy, waiting for ready");
            }
            CfuEvent::Resumed {
                component_id,
                checkpoint,
            } => {
                tracing::info!(
                    component_id = %format!("0x{:02X}", component_id),
                    record_index = checkpoint.cursor.bin_record_start_index,
                    sequence_number = checkpoint.sequence_number,
                    "Resuming transfer"
                );
            }
            CfuEvent::Progress {
                component_id,
                sequence_number,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(component_id = %format!("0x{:02X}", component_id), sequence_number, progress = %format!("{}%", pct), "Progress");
            }
            CfuEvent::CheckpointSaved {
                component_id,
                checkpoint,
            } => {
                tracing::warn!(
                    component_id = %format!("0x{:02X}", component_id),
                    sequence_number = checkpoint.sequence_number,
                    "Transfer interrupted, checkpoint saved"
                );
            }
            CfuEvent::ComponentComplete {
                component_id,
                chunks,
            } => {
                tracing::info!(component_id = %format!("0x{:02X}", component_id), chunks, "Component updated");
            }
            CfuEvent::ComponentFailed { index, message } => {
                tracing::error!(index, "Component failed: {}", message);
            }
            CfuEvent::Complete => {
                tracing::info!("Transaction complete");
            }
        }
    }
}
