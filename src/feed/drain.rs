//! Span draining - pull span batches from the engine and fan them out.
//!
//! Each span is delivered to every data handler before the next span starts.
//! Handlers that return [`Delivery::Deferred`] keep the chunk's reader count
//! held until all of their work settles; the drain loop itself never waits.

use std::rc::Rc;

use bytes::Bytes;
use futures::future::{LocalBoxFuture, join_all};

use super::handlers::Delivery;
use super::{FeedFlags, FeedInner};
use crate::error::{FeedError, Result};
use crate::native::ChunkId;
use crate::native::record::{Span, SpanRecords};

impl FeedInner {
    /// Deliver one batch. `Ok(0)` when there was nothing to do or draining is
    /// not allowed right now (already draining, closing, or destroyed).
    pub(super) fn drain_once(self: &Rc<Self>) -> Result<usize> {
        if self.flags().intersects(FeedFlags::DRAINING | FeedFlags::PENDING_CLOSE) {
            return Ok(0);
        }
        let Some(mut buffer) = self.drain_buffer.borrow_mut().take() else {
            return Ok(0);
        };

        let capacity = self.options.effective_capacity();
        let count = self
            .engine
            .drain_spans(self.handle, &mut buffer, capacity)
            .min(capacity);
        if count == 0 {
            self.restore_buffer(buffer);
            return Ok(0);
        }

        self.insert(FeedFlags::DRAINING);
        let mut first_error = None;
        for span in SpanRecords::new(&buffer, count) {
            self.deliver(span, &mut first_error);

            // Close requested by a handler: the rest of the batch is dropped.
            if self.has(FeedFlags::PENDING_CLOSE) {
                log::trace!("[{}] close pending, truncating batch", self.name());
                break;
            }
        }
        self.remove(FeedFlags::DRAINING);
        self.restore_buffer(buffer);

        match first_error {
            Some(e) => Err(FeedError::Handler(e)),
            None => Ok(count),
        }
    }

    /// Drain until the engine reports nothing left. Returns total records.
    pub(super) fn drain_all(self: &Rc<Self>) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.drain_once()? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }

    fn restore_buffer(&self, buffer: Vec<u8>) {
        if !self.has(FeedFlags::DESTROYED) {
            *self.drain_buffer.borrow_mut() = Some(buffer);
        }
    }

    fn resolve_chunk(&self, chunk: ChunkId) -> Option<Bytes> {
        let engine = &self.engine;
        self.chunks
            .borrow_mut()
            .resolve(chunk, |id, len| engine.chunk_view(id, len))
    }

    fn deliver(self: &Rc<Self>, span: Span, first_error: &mut Option<anyhow::Error>) {
        if span.is_marker() {
            return;
        }
        let Some(view) = self.resolve_chunk(span.chunk) else {
            log::trace!("[{}] span on unknown chunk {:#x} dropped", self.name(), span.chunk.0);
            return;
        };
        let Some(end) = span.end().filter(|end| *end <= view.len()) else {
            log::trace!(
                "[{}] span {}+{} exceeds chunk of {} bytes, dropped",
                self.name(),
                span.offset,
                span.len,
                view.len()
            );
            return;
        };
        let slice = view.slice(span.offset as usize..end);

        let handlers = self.handlers.borrow().data_snapshot();
        let mut deferred = Vec::new();
        for handler in handlers {
            match handler(slice.clone()) {
                Ok(Delivery::Complete) => {}
                Ok(Delivery::Deferred(work)) => deferred.push(work),
                Err(e) => {
                    log::warn!("[{}] data handler failed: {:#}", self.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if deferred.is_empty() {
            self.state.borrow().release(span.chunk_index);
        } else {
            self.track_deferred(span.chunk_index, deferred);
        }
    }

    /// Hold the chunk reader until every piece of `work` settles.
    ///
    /// The task keeps the feed alive: dropping the last `Feed` while work is
    /// in flight defers the close-on-drop until the work settles.
    fn track_deferred(
        self: &Rc<Self>,
        chunk_index: u32,
        work: Vec<LocalBoxFuture<'static, anyhow::Result<()>>>,
    ) {
        self.pending_async.set(self.pending_async.get() + 1);

        let inner = Rc::clone(self);
        let task = async move {
            for result in join_all(work).await {
                if let Err(e) = result {
                    log::warn!("[{}] deferred handler failed: {:#}", inner.name(), e);
                }
            }
            inner.settle_deferred(chunk_index);
        };

        if let Err(e) = self.spawn(task) {
            log::error!("[{}] {}; releasing chunk {} now", self.name(), e, chunk_index);
            self.settle_deferred(chunk_index);
        }
    }

    fn settle_deferred(self: &Rc<Self>, chunk_index: u32) {
        self.state.borrow().release(chunk_index);
        self.pending_async
            .set(self.pending_async.get().saturating_sub(1));
        self.resume_close();
    }
}
