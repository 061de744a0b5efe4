//! Transaction synchronization: the event pair, the state shared with the
//! transport's completion path, and response correlation.

pub mod context;
pub mod matcher;
pub mod sync;

pub use context::{ResponseSink, TransactionContext, WaitError};
pub use matcher::{ResponseMatcher, is_stale};
pub use sync::{TransactionSync, WaitOutcome};
