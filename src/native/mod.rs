//! Native boundary - the contract the span-producing engine must satisfy.
//!
//! The engine owns every byte this crate reads. The consumer only ever sees:
//!
//! ```text
//! ┌──────────────────────────┐        events (id, arg0, arg1)        ┌──────────────┐
//! │  Native engine           │ ────────────────────────────────────▶ │  Feed        │
//! │  chunks, span ring,      │                                        │  (consumer)  │
//! │  refcount table          │ ◀──── drain_spans / close / destroy ── │              │
//! └──────────────────────────┘                                        └──────────────┘
//! ```
//!
//! All calls are synchronous and return primitive status codes or fixed-size
//! records. Every successful `create` must be paired with exactly one
//! `destroy`.
//!
//! - [`record`] - span record layout
//! - [`memory`] - in-process engine
//! - [`ffi`] - adapter over a C function table

pub mod ffi;
pub mod memory;
pub mod record;

use std::num::NonZeroU64;
use std::rc::Rc;

use bytes::Bytes;

use crate::feed::FeedOptions;

// =============================================================================
// HANDLES
// =============================================================================

/// Opaque handle to a native stream. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(NonZeroU64);

impl StreamHandle {
    /// Wrap a raw handle, rejecting null.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Opaque chunk identifier (the native chunk pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

// =============================================================================
// EVENTS
// =============================================================================

/// Event kinds multiplexed over the single per-stream callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventId {
    ChunkAdded = 2,
    Closed = 5,
    Error = 6,
    DataAvailable = 7,
    StateBuffer = 8,
}

impl EventId {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::ChunkAdded),
            5 => Some(Self::Closed),
            6 => Some(Self::Error),
            7 => Some(Self::DataAvailable),
            8 => Some(Self::StateBuffer),
            _ => None,
        }
    }
}

/// An undecoded callback invocation: `(event_id, arg0, arg1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub id: u32,
    pub arg0: u64,
    pub arg1: u64,
}

impl RawEvent {
    pub fn new(id: EventId, arg0: u64, arg1: u64) -> Self {
        Self { id: id as u32, arg0, arg1 }
    }
}

/// The consumer's callback, registered once per stream.
pub type EventCallback = Box<dyn Fn(RawEvent)>;

// =============================================================================
// REFCOUNT TABLE
// =============================================================================

/// Per-chunk outstanding-reader counters shared with the native producer.
///
/// The consumer only ever decrements. Counters saturate at zero.
pub trait RefcountTable {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Option<u8>;

    /// Decrement the counter at `index`. Out-of-range indices are ignored.
    fn decrement(&self, index: usize);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// ENGINE CONTRACT
// =============================================================================

/// The native side of a span feed.
///
/// Methods take `&self`: engines are driven from one thread and use interior
/// mutability. Implementations must not hold internal borrows while invoking
/// a registered callback, since the callback may call back into the engine.
pub trait NativeEngine {
    /// Allocate a stream. `None` means the engine refused.
    fn create(&self, options: &FeedOptions) -> Option<StreamHandle>;

    /// Attach the consumer. 0 = success.
    fn attach(&self, handle: StreamHandle) -> i32;

    fn register_callback(&self, handle: StreamHandle, callback: EventCallback);

    fn unregister_callback(&self, handle: StreamHandle);

    /// Write up to `capacity` span records into `out`, returning the count.
    fn drain_spans(&self, handle: StreamHandle, out: &mut [u8], capacity: usize) -> usize;

    /// Request close. 0 = success.
    fn close(&self, handle: StreamHandle) -> i32;

    fn destroy(&self, handle: StreamHandle);

    /// Read-only view over `len` bytes of a chunk.
    fn chunk_view(&self, chunk: ChunkId, len: u32) -> Option<Bytes>;

    /// Materialize the refcount table announced by a `StateBuffer` event.
    fn refcount_table(&self, ptr: u64, len: u32) -> Option<Rc<dyn RefcountTable>>;
}

// =============================================================================
// TESTS
// =============================================================================
