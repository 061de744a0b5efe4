//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockTransport, PayloadAction};
pub use nusb::{HidConfig, HidReportIds, HidTransport};
pub use traits::{TransportBinding, TransportError, TransportParameters};
