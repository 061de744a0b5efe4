//! CFU-Core: Component Firmware Update protocol engine in Rust.
//!
//! This crate implements the host side of the Component Firmware Update
//! (CFU) protocol: offering firmware components to a device and streaming
//! the accepted payloads to it, with resumable transfers.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire messages (offers, content requests/responses, version report)
//! - **Payload**: BinRecord framing and chunk packing
//! - **Transport**: Bus abstraction (`TransportBinding`) with nusb HID and mock implementations
//! - **Transaction**: Completion/cancellation events, response inbox and sequence matching
//! - **Resume**: Persisted checkpoints and update statuses over a key/value store
//! - **Engine**: Offer exchange and the transaction state machine
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cfu_core::{EngineConfig, FirmwareImages, MockTransport, ProtocolEngine};
//!
//! let mut images = FirmwareImages::new();
//! images.push_files("fw.offer.bin", "fw.payload.bin").expect("load firmware");
//!
//! let transport = Arc::new(MockTransport::new());
//! let mut engine = ProtocolEngine::new(transport, EngineConfig::default()).expect("bind");
//! for report in engine.update_all(&images).expect("transaction failed") {
//!     println!("component {}: {:?}", report.index, report.result);
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod resume;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use config::EngineConfig;
pub use engine::{
    ComponentReport, ComponentSummary, EnginePhase, FirmwareComponent, FirmwareImages,
    FirmwareSource, ProtocolEngine, StopHandle,
};
pub use error::EngineError;
pub use events::{CfuEvent, CfuObserver, NullObserver, TracingObserver};
pub use payload::{BinRecord, ChunkCursor, PayloadChunker, RecordError};
pub use protocol::{
    FirmwareVersions, OfferResponse, OfferStatus, PayloadResponse, PayloadStatus, RejectReason,
    TransferChunk,
};
pub use resume::{
    CheckpointStore, MemoryStore, ResumeCheckpoint, ResumeStore, StoreError, TomlFileStore,
    UpdateStatus,
};
pub use transport::{
    HidConfig, HidTransport, MockTransport, PayloadAction, TransportBinding, TransportError,
    TransportParameters,
};
