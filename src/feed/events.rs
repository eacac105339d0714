//! Event dispatch - turns the multiplexed native callback into reactions.

use std::rc::Rc;

use super::{FeedFlags, FeedInner};
use crate::native::{ChunkId, EventId, RawEvent};

// =============================================================================
// FEED EVENT
// =============================================================================

/// A decoded native event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// A chunk of `len` bytes now exists at `chunk`.
    ChunkAdded { chunk: ChunkId, len: u32 },
    /// Spans are waiting in the native ring.
    DataAvailable,
    Error { code: i32 },
    /// The native side closed the stream.
    Closed,
    /// A new refcount table of `len` counters lives at `ptr`.
    StateBuffer { ptr: u64, len: u32 },
}

impl FeedEvent {
    /// Decode a raw callback invocation. `None` for unknown ids and for
    /// lengths that do not fit in `u32`.
    pub fn decode(raw: RawEvent) -> Option<Self> {
        let event = match EventId::from_raw(raw.id)? {
            EventId::ChunkAdded => Self::ChunkAdded {
                chunk: ChunkId(raw.arg0),
                len: u32::try_from(raw.arg1).ok()?,
            },
            EventId::DataAvailable => Self::DataAvailable,
            EventId::Error => Self::Error { code: raw.arg0 as i32 },
            EventId::Closed => Self::Closed,
            EventId::StateBuffer => Self::StateBuffer {
                ptr: raw.arg0,
                len: u32::try_from(raw.arg1).ok()?,
            },
        };
        Some(event)
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

impl FeedInner {
    /// Entry point for the native callback.
    pub(super) fn dispatch(self: &Rc<Self>, raw: RawEvent) {
        if self.has(FeedFlags::DESTROYED) {
            log::trace!("[{}] event {} after destroy ignored", self.name(), raw.id);
            return;
        }
        let Some(event) = FeedEvent::decode(raw) else {
            log::debug!("[{}] ignoring unknown event {:?}", self.name(), raw);
            return;
        };

        let nested = self.has(FeedFlags::IN_CALLBACK);
        self.insert(FeedFlags::IN_CALLBACK);
        self.react(event);
        if !nested {
            self.remove(FeedFlags::IN_CALLBACK);
        }
    }

    fn react(self: &Rc<Self>, event: FeedEvent) {
        match event {
            FeedEvent::StateBuffer { ptr, len } => match self.engine.refcount_table(ptr, len) {
                Some(table) => self.state.borrow_mut().replace(table),
                None => log::warn!("[{}] state buffer {:#x} could not be mapped", self.name(), ptr),
            },
            FeedEvent::ChunkAdded { chunk, len } => self.add_chunk(chunk, len),
            FeedEvent::DataAvailable => {
                if !self.handlers.borrow().has_data_handlers() {
                    self.insert(FeedFlags::PENDING_DATA);
                    return;
                }
                self.remove(FeedFlags::PENDING_DATA);
                if let Err(e) = self.drain_all() {
                    log::error!("[{}] drain failed: {:#}", self.name(), e);
                }
            }
            FeedEvent::Error { code } => {
                let handlers = self.handlers.borrow().error_snapshot();
                for handler in handlers {
                    handler(code);
                }
            }
            FeedEvent::Closed => self.insert(FeedFlags::CLOSED),
        }
    }

    fn add_chunk(&self, chunk: ChunkId, len: u32) {
        let mut chunks = self.chunks.borrow_mut();
        if !chunks.record(chunk, len) {
            return;
        }
        if !self.options.eager_chunk_views {
            return;
        }
        match self.engine.chunk_view(chunk, len) {
            Some(view) => chunks.set_view(chunk, view),
            None => log::trace!("[{}] chunk {:#x} view deferred", self.name(), chunk.0),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
