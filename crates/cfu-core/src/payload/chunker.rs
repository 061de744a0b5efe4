//! Packing BinRecords into transfer chunks.
//!
//! Each chunk starts at the cursor and takes as much of the current record
//! as fits. When a record is exhausted and room remains, the next record is
//! clumped into the same chunk only if its address continues where the
//! previous data ended.

use crate::protocol::constants::{CONTENT_FLAG_FIRST_BLOCK, CONTENT_FLAG_LAST_BLOCK};
use crate::protocol::content::{TransferChunk, next_sequence_number};

use super::record::{BinRecord, RecordError};

/// Position inside a payload: record header offset plus offset into its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCursor {
    /// Byte offset of the current record header.
    pub bin_record_start_index: u32,
    /// Bytes of the current record already sent. Always below the record length.
    pub bin_record_data_offset: u8,
}

impl ChunkCursor {
    pub fn new(bin_record_start_index: u32, bin_record_data_offset: u8) -> Self {
        Self {
            bin_record_start_index,
            bin_record_data_offset,
        }
    }

    pub fn is_start(&self) -> bool {
        self.bin_record_start_index == 0 && self.bin_record_data_offset == 0
    }

    /// Whether the whole payload has been consumed.
    pub fn is_done(&self, payload: &[u8]) -> bool {
        self.bin_record_start_index as usize >= payload.len()
    }

    /// Check that the cursor sits on a record boundary of `payload` and
    /// inside that record's data.
    pub fn validate(&self, payload: &[u8]) -> Result<(), RecordError> {
        let start = self.bin_record_start_index as usize;
        let data_offset = self.bin_record_data_offset as usize;
        let mut offset = 0;
        while offset < start {
            offset = BinRecord::parse(payload, offset)?.end();
        }
        if offset != start {
            return Err(RecordError::CursorOutOfRange {
                offset: start,
                data_offset,
                length: 0,
            });
        }
        let record = BinRecord::parse(payload, start)?;
        if data_offset >= record.len() {
            return Err(RecordError::CursorOutOfRange {
                offset: start,
                data_offset,
                length: record.len(),
            });
        }
        Ok(())
    }
}

/// Fills transfer chunks from a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadChunker {
    capacity: usize,
    alignment: usize,
}

impl PayloadChunker {
    /// Capacity is the transfer buffer minus the transport header and the
    /// content header, capped to what a u8 length can describe and rounded
    /// down to `alignment`.
    pub fn new(
        payload_buffer_size: usize,
        header_size: usize,
        alignment: usize,
    ) -> Result<Self, RecordError> {
        let too_small = RecordError::CapacityTooSmall {
            payload_buffer_size,
            header_size,
            alignment,
        };
        if alignment == 0 {
            return Err(too_small);
        }
        let raw = payload_buffer_size
            .checked_sub(header_size + TransferChunk::HEADER_SIZE)
            .ok_or_else(|| too_small.clone())?
            .min(u8::MAX as usize);
        let capacity = raw - raw % alignment;
        if capacity == 0 {
            return Err(too_small);
        }
        Ok(Self {
            capacity,
            alignment,
        })
    }

    /// Chunker with an explicit data capacity.
    pub fn with_capacity(capacity: usize, alignment: usize) -> Result<Self, RecordError> {
        Self::new(capacity + TransferChunk::HEADER_SIZE, 0, alignment)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Fill one chunk starting at `cursor` and advance the cursor past the
    /// data taken. On error the cursor is left untouched.
    pub fn fill(
        &self,
        payload: &[u8],
        sequence_number: u16,
        cursor: &mut ChunkCursor,
    ) -> Result<TransferChunk, RecordError> {
        let mut start = cursor.bin_record_start_index as usize;
        let mut offset = cursor.bin_record_data_offset as usize;

        let mut record = BinRecord::parse(payload, start)?;
        if offset >= record.len() {
            return Err(RecordError::CursorOutOfRange {
                offset: start,
                data_offset: offset,
                length: record.len(),
            });
        }

        let mut chunk = TransferChunk {
            flags: 0,
            sequence_number,
            address: record.address.wrapping_add(offset as u32),
            data: Vec::with_capacity(self.capacity),
        };
        if cursor.is_start() {
            chunk.flags |= CONTENT_FLAG_FIRST_BLOCK;
        }

        let mut next_address = chunk.address;
        loop {
            let room = self.capacity - chunk.data.len();
            let take = (record.len() - offset).min(room);
            chunk
                .data
                .extend_from_slice(&record.data[offset..offset + take]);
            offset += take;
            next_address = next_address.wrapping_add(take as u32);

            if offset < record.len() {
                // Chunk is full, record continues in the next one.
                break;
            }

            start = record.end();
            offset = 0;
            if start >= payload.len() {
                chunk.flags |= CONTENT_FLAG_LAST_BLOCK;
                break;
            }
            if chunk.data.len() == self.capacity {
                break;
            }

            let next = BinRecord::parse(payload, start)?;
            if next.address != next_address {
                tracing::trace!(
                    expected = %format!("0x{:08X}", next_address),
                    actual = %format!("0x{:08X}", next.address),
                    "Next record not contiguous, closing chunk"
                );
                break;
            }
            record = next;
        }

        cursor.bin_record_start_index = start as u32;
        cursor.bin_record_data_offset = offset as u8;
        Ok(chunk)
    }

    /// Iterate the chunks of a whole payload, sequence numbers from 1.
    pub fn chunks<'a>(&self, payload: &'a [u8]) -> ChunkIterator<'a> {
        ChunkIterator {
            chunker: *self,
            payload,
            cursor: ChunkCursor::default(),
            sequence_number: crate::protocol::constants::FIRST_SEQUENCE_NUMBER,
            failed: false,
        }
    }
}

/// Iterator over the chunks of a payload.
#[derive(Debug)]
pub struct ChunkIterator<'a> {
    chunker: PayloadChunker,
    payload: &'a [u8],
    cursor: ChunkCursor,
    sequence_number: u16,
    failed: bool,
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = Result<TransferChunk, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_done(self.payload) {
            return None;
        }
        let result = self
            .chunker
            .fill(self.payload, self.sequence_number, &mut self.cursor);
        match result {
            Ok(chunk) => {
                self.sequence_number = next_sequence_number(self.sequence_number);
                Some(Ok(chunk))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::record::encode_records;

    #[test]
    fn test_capacity_rounding() {
        // 64 - 1 (report id) - 8 = 55, aligned to 4 -> 52
        let chunker = PayloadChunker::new(64, 1, 4).unwrap();
        assert_eq!(chunker.capacity(), 52);

        let chunker = PayloadChunker::new(64, 0, 1).unwrap();
        assert_eq!(chunker.capacity(), 56);

        assert!(PayloadChunker::new(8, 0, 1).is_err());
        assert!(PayloadChunker::new(64, 0, 0).is_err());
        assert!(PayloadChunker::new(11, 0, 4).is_err());
    }

    #[test]
    fn test_capacity_capped_by_length_byte() {
        let chunker = PayloadChunker::new(1024, 0, 4).unwrap();
        assert_eq!(chunker.capacity(), 252);
    }

    #[test]
    fn test_contiguous_records_exhausting_capacity() {
        let a = vec![0xA5u8; 60];
        let b = vec![0x5Au8; 10];
        let payload = encode_records([(0x1000, &a[..]), (0x103C, &b[..])]);
        assert_eq!(payload.len(), 80);
        let chunker = PayloadChunker::with_capacity(60, 4).unwrap();

        let mut cursor = ChunkCursor::default();
        let c1 = chunker.fill(&payload, 1, &mut cursor).unwrap();
        assert!(c1.is_first_block());
        assert!(!c1.is_last_block());
        assert_eq!(c1.sequence_number, 1);
        assert_eq!(c1.address, 0x1000);
        assert_eq!(c1.data, a);
        assert_eq!(cursor, ChunkCursor::new(65, 0));

        let c2 = chunker.fill(&payload, 2, &mut cursor).unwrap();
        assert!(!c2.is_first_block());
        assert!(c2.is_last_block());
        assert_eq!(c2.sequence_number, 2);
        assert_eq!(c2.address, 0x103C);
        assert_eq!(c2.data, b);
        assert!(cursor.is_done(&payload));
    }

    #[test]
    fn test_contiguous_records_are_clumped() {
        let payload = encode_records([(0x2000, &[1u8; 8][..]), (0x2008, &[2u8; 8][..])]);
        let chunker = PayloadChunker::with_capacity(32, 4).unwrap();
        let mut cursor = ChunkCursor::default();
        let chunk = chunker.fill(&payload, 1, &mut cursor).unwrap();
        assert_eq!(chunk.data.len(), 16);
        assert!(chunk.is_first_block() && chunk.is_last_block());
    }

    #[test]
    fn test_gap_closes_chunk() {
        let payload = encode_records([(0x2000, &[1u8; 8][..]), (0x3000, &[2u8; 8][..])]);
        let chunker = PayloadChunker::with_capacity(32, 4).unwrap();
        let mut cursor = ChunkCursor::default();

        let c1 = chunker.fill(&payload, 1, &mut cursor).unwrap();
        assert_eq!(c1.data, vec![1u8; 8]);
        assert!(!c1.is_last_block());

        let c2 = chunker.fill(&payload, 2, &mut cursor).unwrap();
        assert_eq!(c2.address, 0x3000);
        assert!(c2.is_last_block());
    }

    #[test]
    fn test_record_split_across_chunks() {
        let data: Vec<u8> = (0..100).collect();
        let payload = encode_records([(0x0, &data[..])]);
        let chunker = PayloadChunker::with_capacity(40, 4).unwrap();
        let chunks: Vec<_> = chunker
            .chunks(&payload)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].address, 40);
        assert_eq!(chunks[2].data.len(), 20);
        assert_eq!(chunks[2].sequence_number, 3);
    }

    #[test]
    fn test_resume_mid_record() {
        let data: Vec<u8> = (0..100).collect();
        let payload = encode_records([(0x4000, &data[..])]);
        let chunker = PayloadChunker::with_capacity(40, 4).unwrap();
        let mut cursor = ChunkCursor::new(0, 40);
        let chunk = chunker.fill(&payload, 7, &mut cursor).unwrap();
        assert!(!chunk.is_first_block());
        assert_eq!(chunk.address, 0x4000 + 40);
        assert_eq!(chunk.data, data[40..80].to_vec());
        assert_eq!(cursor, ChunkCursor::new(0, 80));
    }

    #[test]
    fn test_overrun_leaves_cursor() {
        let mut payload = encode_records([(0x0, &[1u8; 4][..]), (0x4, &[2u8; 8][..])]);
        payload.truncate(payload.len() - 2);
        let chunker = PayloadChunker::with_capacity(32, 4).unwrap();
        let mut cursor = ChunkCursor::default();
        let err = chunker.fill(&payload, 1, &mut cursor).unwrap_err();
        assert!(matches!(err, RecordError::RecordOverrun { offset: 9, .. }));
        assert_eq!(cursor, ChunkCursor::default());
    }

    #[test]
    fn test_cursor_out_of_range() {
        let payload = encode_records([(0x0, &[1u8; 4][..])]);
        let chunker = PayloadChunker::with_capacity(32, 4).unwrap();
        let mut cursor = ChunkCursor::new(0, 4);
        assert!(matches!(
            chunker.fill(&payload, 1, &mut cursor),
            Err(RecordError::CursorOutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_cursor() {
        let payload = encode_records([(0x0, &[1u8; 8][..]), (0x8, &[2u8; 4][..])]);
        assert!(ChunkCursor::default().validate(&payload).is_ok());
        assert!(ChunkCursor::new(13, 3).validate(&payload).is_ok());
        // Past the end, inside a header, and past a record's data.
        assert!(ChunkCursor::new(22, 0).validate(&payload).is_err());
        assert!(ChunkCursor::new(5000, 0).validate(&payload).is_err());
        assert!(ChunkCursor::new(2, 0).validate(&payload).is_err());
        assert!(matches!(
            ChunkCursor::new(13, 4).validate(&payload),
            Err(RecordError::CursorOutOfRange { length: 4, .. })
        ));
    }
}
