//! Close coordination - exactly-once, race-free teardown.
//!
//! A close is only performed when nothing is in flight: no native callback
//! on the stack, no drain running, no deferred handler outstanding. Otherwise
//! the request is parked in `PENDING_CLOSE` and resumed by whichever of
//! these finishes last:
//!
//! - a retry task on the cooperative scheduler (callbacks and drains)
//! - the settlement of the last deferred handler

use std::rc::Rc;

use super::{FeedFlags, FeedInner};

impl FeedInner {
    fn is_safe_to_close(&self) -> bool {
        !self.flags().intersects(FeedFlags::IN_CALLBACK | FeedFlags::DRAINING)
            && self.pending_async.get() == 0
    }

    pub(super) fn request_close(self: &Rc<Self>) {
        if self.has(FeedFlags::DESTROYED) {
            return;
        }
        if self.is_safe_to_close() {
            self.close_now();
            return;
        }

        self.insert(FeedFlags::PENDING_CLOSE);
        self.schedule_close_retry();
    }

    /// Queue at most one retry. Deferred handlers resume the close on their
    /// own, so a close blocked only by them queues nothing.
    fn schedule_close_retry(self: &Rc<Self>) {
        if self.has(FeedFlags::CLOSE_QUEUED) {
            return;
        }
        if !self.flags().intersects(FeedFlags::IN_CALLBACK | FeedFlags::DRAINING) {
            return;
        }

        self.insert(FeedFlags::CLOSE_QUEUED);
        let weak = Rc::downgrade(self);
        let retry = async move {
            if let Some(inner) = weak.upgrade() {
                inner.remove(FeedFlags::CLOSE_QUEUED);
                inner.resume_close();
            }
        };

        if let Err(e) = self.spawn(retry) {
            self.remove(FeedFlags::CLOSE_QUEUED);
            log::warn!("[{}] close retry not scheduled: {}", self.name(), e);
        }
    }

    /// Re-check a parked close request.
    pub(super) fn resume_close(self: &Rc<Self>) {
        if !self.has(FeedFlags::PENDING_CLOSE) || self.has(FeedFlags::DESTROYED) {
            return;
        }
        if self.is_safe_to_close() {
            self.close_now();
        } else {
            self.schedule_close_retry();
        }
    }

    fn close_now(&self) {
        log::debug!("[{}] closing stream {:#x}", self.name(), self.handle.get());
        let status = self.engine.close(self.handle);
        if status != 0 {
            // Stream stays open; the caller may try again.
            log::warn!("[{}] native close failed with status {}", self.name(), status);
            self.remove(FeedFlags::PENDING_CLOSE);
            return;
        }

        self.insert(FeedFlags::CLOSED);
        self.finalize_destroy();
    }

    /// Release every native and local resource. Runs once.
    pub(super) fn finalize_destroy(&self) {
        if self.has(FeedFlags::DESTROYED) {
            return;
        }
        self.insert(FeedFlags::DESTROYED);

        self.engine.unregister_callback(self.handle);
        self.engine.destroy(self.handle);

        self.chunks.borrow_mut().clear();
        self.state.borrow_mut().clear();
        let handlers = std::mem::take(&mut *self.handlers.borrow_mut());
        drop(handlers);
        self.drain_buffer.borrow_mut().take();

        log::debug!("[{}] stream {:#x} destroyed", self.name(), self.handle.get());
    }
}
