//! Payload handling module.
//!
//! Provides BinRecord parsing and chunk packing for component images.

pub mod chunker;
pub mod record;

pub use chunker::{ChunkCursor, ChunkIterator, PayloadChunker};
pub use record::{BinRecord, BinRecords, RecordError, encode_records};
