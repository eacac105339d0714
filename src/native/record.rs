//! Span records - the fixed-size binary layout the native engine drains into.
//!
//! Layout (20 bytes, packed, little-endian):
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────┬──────────┐
//! │ chunk_ptr (u64)  │ chunk_index  │ offset   │ len      │
//! │ 0..8             │ 8..12 (u32)  │ 12..16   │ 16..20   │
//! └──────────────────┴──────────────┴──────────┴──────────┘
//! ```

use super::ChunkId;

// =============================================================================
// LAYOUT
// =============================================================================

/// Bytes per span record
pub const SPAN_RECORD_SIZE: usize = 20;

pub const R_CHUNK_PTR: usize = 0;
pub const R_CHUNK_INDEX: usize = 8;
pub const R_OFFSET: usize = 12;
pub const R_LEN: usize = 16;

// =============================================================================
// SPAN
// =============================================================================

/// One delivered slice of bytes: `len` bytes at `offset` inside `chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub chunk: ChunkId,
    /// Slot of the chunk in the refcount table.
    pub chunk_index: u32,
    pub offset: u32,
    pub len: u32,
}

impl Span {
    pub fn new(chunk: ChunkId, chunk_index: u32, offset: u32, len: u32) -> Self {
        Self { chunk, chunk_index, offset, len }
    }

    /// Zero-length spans are markers and carry no data.
    #[inline]
    pub fn is_marker(&self) -> bool {
        self.len == 0
    }

    /// Exclusive end of the span, or `None` if it overflows.
    #[inline]
    pub fn end(&self) -> Option<usize> {
        (self.offset as usize).checked_add(self.len as usize)
    }

    /// Decode one record. `bytes` must hold at least `SPAN_RECORD_SIZE` bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record = bytes.get(..SPAN_RECORD_SIZE)?;
        Some(Self {
            chunk: ChunkId(read_u64(record, R_CHUNK_PTR)),
            chunk_index: read_u32(record, R_CHUNK_INDEX),
            offset: read_u32(record, R_OFFSET),
            len: read_u32(record, R_LEN),
        })
    }

    /// Encode into one record slot.
    pub fn encode(&self, out: &mut [u8; SPAN_RECORD_SIZE]) {
        out[R_CHUNK_PTR..R_CHUNK_INDEX].copy_from_slice(&self.chunk.0.to_le_bytes());
        out[R_CHUNK_INDEX..R_OFFSET].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[R_OFFSET..R_LEN].copy_from_slice(&self.offset.to_le_bytes());
        out[R_LEN..SPAN_RECORD_SIZE].copy_from_slice(&self.len.to_le_bytes());
    }
}

#[inline]
fn read_u32(record: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&record[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_u64(record: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&record[at..at + 8]);
    u64::from_le_bytes(raw)
}

// =============================================================================
// BATCH DECODING
// =============================================================================

/// Iterator over the first `count` records of a drain buffer.
pub struct SpanRecords<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
    remaining: usize,
}

impl<'a> SpanRecords<'a> {
    pub fn new(buffer: &'a [u8], count: usize) -> Self {
        Self {
            chunks: buffer.chunks_exact(SPAN_RECORD_SIZE),
            remaining: count,
        }
    }
}

impl Iterator for SpanRecords<'_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.chunks.next().and_then(Span::decode)
    }
}

/// Bytes needed for a drain buffer holding `capacity` records.
#[inline]
pub const fn buffer_len(capacity: usize) -> usize {
    capacity * SPAN_RECORD_SIZE
}

// =============================================================================
// TESTS
// =============================================================================
