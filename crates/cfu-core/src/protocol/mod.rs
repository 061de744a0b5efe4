//! Protocol module - CFU message definitions.

pub mod constants;
pub mod content;
pub mod error;
pub mod offer;
pub mod version;

pub use constants::*;
pub use content::{PayloadResponse, PayloadStatus, TransferChunk, next_sequence_number};
pub use error::ProtocolError;
pub use offer::{
    OfferCommandCode, OfferInformationCode, OfferMessage, OfferResponse, OfferStatus,
    RejectReason,
};
pub use version::{ComponentVersion, FirmwareVersions};
