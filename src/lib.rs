//! # spark-feed
//!
//! Consumer-side bridge for span feeds produced by a native engine.
//!
//! ## Architecture
//!
//! The native engine owns chunks of bytes and a ring of span descriptors.
//! This crate receives its events through one callback per stream, drains
//! span records in batches, and hands each span to application handlers as a
//! zero-copy [`bytes::Bytes`] slice. Teardown is coordinated so that the
//! native stream is closed and destroyed exactly once, never while a drain or
//! a deferred handler is still using its memory.
//!
//! ```text
//! Native engine (owns memory)                  Rust consumer
//! ───────────────────────────                  ─────────────
//!   ChunkAdded / StateBuffer ───────────────▶  ChunkCache / StateBuffer
//!   DataAvailable ──────────────────────────▶  drain_all
//!        ▲                                        │ drain_spans (20-byte records)
//!        └────────────────────────────────────────┘
//!                                                 ▼
//!                                             on_data handlers (Bytes slices)
//!                                                 │ release chunk reader
//!                                                 ▼
//!   refcount table ◀──────────────────────────  StateBuffer.release
//! ```
//!
//! Everything is single-threaded. Deferred handler work and close retries run
//! on a [`futures::executor::LocalPool`] supplied by the application.
//!
//! ## Modules
//!
//! - [`feed`] - `Feed`, event dispatch, draining, close coordination
//! - [`native`] - engine contract, span records, in-memory and C ABI engines
//! - [`error`] - `FeedError`

pub mod error;
pub mod feed;
pub mod native;

pub use error::{FeedError, Result};
pub use feed::{
    ChunkCache, DataHandler, Delivery, ErrorHandler, Feed, FeedEvent, FeedFlags, FeedOptions,
    FeedState, StateBuffer,
};
pub use native::ffi::{FfiEngine, FfiOptions, NativeApi};
pub use native::memory::{EngineStats, MemoryEngine, RefcountCells};
pub use native::record::{SPAN_RECORD_SIZE, Span};
pub use native::{ChunkId, EventId, NativeEngine, RawEvent, RefcountTable, StreamHandle};
