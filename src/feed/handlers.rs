//! Handler registry - ordered data and error handler sets.
//!
//! Handlers are identified by a monotonically increasing id so the cleanup
//! closure returned from `Feed::on_data` / `Feed::on_error` can remove
//! exactly the handler it registered. Invocation order is registration order.
//!
//! Dispatch never runs a handler while the registry is borrowed: callers
//! take a snapshot first, so handlers may subscribe or unsubscribe freely.

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::LocalBoxFuture;

// =============================================================================
// TYPES
// =============================================================================

/// What a data handler did with a span.
pub enum Delivery {
    /// Finished synchronously; the chunk reader can be released now.
    Complete,
    /// Still working. The chunk reader is released once this settles,
    /// whether it succeeds or fails.
    Deferred(LocalBoxFuture<'static, anyhow::Result<()>>),
}

impl Delivery {
    pub fn deferred<F>(work: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self::Deferred(work.boxed_local())
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("Complete"),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Handler for span data. Receives a zero-copy slice of the chunk.
pub type DataHandler = Rc<dyn Fn(Bytes) -> anyhow::Result<Delivery>>;

/// Handler for native error codes.
pub type ErrorHandler = Rc<dyn Fn(i32)>;

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    data: Vec<(usize, DataHandler)>,
    error: Vec<(usize, ErrorHandler)>,
    next_id: usize,
}

impl HandlerRegistry {
    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_data(&mut self, handler: DataHandler) -> usize {
        let id = self.next_id();
        self.data.push((id, handler));
        id
    }

    pub fn remove_data(&mut self, id: usize) {
        self.data.retain(|(handler_id, _)| *handler_id != id);
    }

    pub fn add_error(&mut self, handler: ErrorHandler) -> usize {
        let id = self.next_id();
        self.error.push((id, handler));
        id
    }

    pub fn remove_error(&mut self, id: usize) {
        self.error.retain(|(handler_id, _)| *handler_id != id);
    }

    pub fn has_data_handlers(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn data_snapshot(&self) -> Vec<DataHandler> {
        self.data.iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn error_snapshot(&self) -> Vec<ErrorHandler> {
        self.error.iter().map(|(_, h)| h.clone()).collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
