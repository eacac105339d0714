//! Feed - the consumer side of a native span stream.
//!
//! ```text
//! native events ──▶ dispatch (events.rs) ──▶ ChunkCache / StateBuffer
//!                        │
//!                        │ DataAvailable
//!                        ▼
//!                   drain (drain.rs) ──▶ data handlers ──▶ StateBuffer.release
//!                        │
//!                        ▼
//!                   close (close.rs) ──▶ finalize exactly once
//! ```
//!
//! Everything runs on one thread. Reentrancy is controlled by the explicit
//! flags in [`FeedFlags`] rather than by call-stack reasoning:
//!
//! - `IN_CALLBACK` - a native event is being dispatched
//! - `DRAINING` - a span batch is being delivered
//! - `PENDING_CLOSE` / `CLOSE_QUEUED` - close requested / retry scheduled
//! - `CLOSED` / `DESTROYED` - native close succeeded / resources released
//! - `PENDING_DATA` - data arrived before any data handler existed
//!
//! # Example
//!
//! ```ignore
//! let mut pool = LocalPool::new();
//! let engine = Rc::new(MemoryEngine::new());
//! let feed = Feed::create(engine.clone(), pool.spawner(), FeedOptions::default())?;
//!
//! let unsubscribe = feed.on_data(|bytes| {
//!     println!("{} bytes", bytes.len());
//!     Ok(Delivery::Complete)
//! })?;
//!
//! feed.close();
//! pool.run_until_stalled();
//! ```

mod cache;
mod close;
mod drain;
mod events;
mod handlers;
mod options;
mod state;

pub use cache::ChunkCache;
pub use events::FeedEvent;
pub use handlers::{DataHandler, Delivery, ErrorHandler};
pub use options::FeedOptions;
pub use state::StateBuffer;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use bitflags::bitflags;
use bytes::Bytes;
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;

use crate::error::{FeedError, Result};
use crate::native::record::buffer_len;
use crate::native::{NativeEngine, StreamHandle};
use handlers::HandlerRegistry;

// =============================================================================
// FLAGS & STATE
// =============================================================================

bitflags! {
    /// Guard and lifecycle flags of a feed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeedFlags: u8 {
        const IN_CALLBACK = 1 << 0;
        const DRAINING = 1 << 1;
        const PENDING_CLOSE = 1 << 2;
        const CLOSE_QUEUED = 1 << 3;
        const CLOSED = 1 << 4;
        const DESTROYED = 1 << 5;
        const PENDING_DATA = 1 << 6;
    }
}

/// Lifecycle position: `Active → Closing → Closed → Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Active,
    /// Close requested, waiting for drains and deferred handlers.
    Closing,
    /// Native side reported or acknowledged close; not yet finalized.
    Closed,
    Destroyed,
}

impl FeedState {
    fn from_flags(flags: FeedFlags) -> Self {
        if flags.contains(FeedFlags::DESTROYED) {
            Self::Destroyed
        } else if flags.contains(FeedFlags::CLOSED) {
            Self::Closed
        } else if flags.contains(FeedFlags::PENDING_CLOSE) {
            Self::Closing
        } else {
            Self::Active
        }
    }
}

// =============================================================================
// INNER
// =============================================================================

pub(crate) struct FeedInner {
    engine: Rc<dyn NativeEngine>,
    handle: StreamHandle,
    spawner: LocalSpawner,
    options: FeedOptions,
    flags: Cell<FeedFlags>,
    /// Spans whose deferred handlers have not all settled.
    pending_async: Cell<usize>,
    chunks: RefCell<ChunkCache>,
    state: RefCell<StateBuffer>,
    handlers: RefCell<HandlerRegistry>,
    /// Reused across drains. Lent out (`None`) while a drain reads it,
    /// dropped on finalize.
    drain_buffer: RefCell<Option<Vec<u8>>>,
}

impl FeedInner {
    fn new(
        engine: Rc<dyn NativeEngine>,
        handle: StreamHandle,
        spawner: LocalSpawner,
        options: FeedOptions,
    ) -> Self {
        let buffer = vec![0u8; buffer_len(options.effective_capacity())];
        Self {
            engine,
            handle,
            spawner,
            options,
            flags: Cell::new(FeedFlags::empty()),
            pending_async: Cell::new(0),
            chunks: RefCell::new(ChunkCache::new()),
            state: RefCell::new(StateBuffer::new()),
            handlers: RefCell::new(HandlerRegistry::default()),
            drain_buffer: RefCell::new(Some(buffer)),
        }
    }

    #[inline]
    fn flags(&self) -> FeedFlags {
        self.flags.get()
    }

    #[inline]
    fn has(&self, flag: FeedFlags) -> bool {
        self.flags.get().contains(flag)
    }

    #[inline]
    fn insert(&self, flag: FeedFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    #[inline]
    fn remove(&self, flag: FeedFlags) {
        self.flags.set(self.flags.get() - flag);
    }

    /// Run `task` on the cooperative scheduler.
    fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawner.spawn_local(task)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.options.name
    }
}

impl Drop for FeedInner {
    fn drop(&mut self) {
        if self.has(FeedFlags::DESTROYED) {
            return;
        }
        log::debug!("[{}] dropped while live, releasing stream", self.name());
        if !self.has(FeedFlags::CLOSED) {
            let status = self.engine.close(self.handle);
            if status != 0 {
                log::warn!("[{}] close on drop failed with status {}", self.name(), status);
            }
        }
        self.finalize_destroy();
    }
}

// =============================================================================
// FEED
// =============================================================================

/// Handle to a live span feed. Cheap to clone; all clones share one stream.
///
/// A handler that captures a clone keeps the feed alive until `close()`
/// finalizes it. Deferred handler work also keeps it alive: dropping the
/// last clone releases the stream only once that work has settled.
#[derive(Clone)]
pub struct Feed {
    inner: Rc<FeedInner>,
}

impl Feed {
    /// Allocate a new native stream and attach to it.
    ///
    /// On attach failure the callback is unregistered and the stream
    /// destroyed before the error is returned.
    pub fn create(
        engine: Rc<dyn NativeEngine>,
        spawner: LocalSpawner,
        options: FeedOptions,
    ) -> Result<Self> {
        let handle = engine.create(&options).ok_or(FeedError::Create)?;
        log::debug!("[{}] created stream {:#x}", options.name, handle.get());
        Self::open(engine, handle, spawner, options)
    }

    /// Attach to a stream the engine already allocated.
    ///
    /// The feed takes ownership of `handle`: it is destroyed on attach
    /// failure and on close.
    pub fn attach(
        engine: Rc<dyn NativeEngine>,
        handle: StreamHandle,
        spawner: LocalSpawner,
        options: FeedOptions,
    ) -> Result<Self> {
        Self::open(engine, handle, spawner, options)
    }

    fn open(
        engine: Rc<dyn NativeEngine>,
        handle: StreamHandle,
        spawner: LocalSpawner,
        options: FeedOptions,
    ) -> Result<Self> {
        let inner = Rc::new(FeedInner::new(engine.clone(), handle, spawner, options));

        let weak = Rc::downgrade(&inner);
        engine.register_callback(
            handle,
            Box::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(event);
                }
            }),
        );

        let status = engine.attach(handle);
        if status != 0 {
            log::warn!("[{}] attach failed with status {}", inner.name(), status);
            inner.finalize_destroy();
            return Err(FeedError::Attach { status });
        }

        log::debug!("[{}] attached to stream {:#x}", inner.name(), handle.get());
        Ok(Self { inner })
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Subscribe to span data.
    ///
    /// If data arrived while no data handler existed, the pending drain runs
    /// before this returns. Handler errors from that drain are logged, not
    /// returned: `Err` here only means the feed is destroyed. Call
    /// [`Feed::drain_all`] directly to observe handler errors.
    ///
    /// Returns cleanup function.
    pub fn on_data<F>(&self, handler: F) -> Result<impl FnOnce() + use<F>>
    where
        F: Fn(Bytes) -> anyhow::Result<Delivery> + 'static,
    {
        let inner = &self.inner;
        if inner.has(FeedFlags::DESTROYED) {
            return Err(FeedError::Destroyed);
        }

        let id = inner.handlers.borrow_mut().add_data(Rc::new(handler));

        if inner.has(FeedFlags::PENDING_DATA) {
            inner.remove(FeedFlags::PENDING_DATA);
            if let Err(e) = inner.drain_all() {
                log::warn!("[{}] deferred drain failed: {:#}", inner.name(), e);
            }
        }

        let weak = Rc::downgrade(inner);
        Ok(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.borrow_mut().remove_data(id);
            }
        })
    }

    /// Subscribe to native error codes. Returns cleanup function.
    pub fn on_error<F>(&self, handler: F) -> Result<impl FnOnce() + use<F>>
    where
        F: Fn(i32) + 'static,
    {
        let inner = &self.inner;
        if inner.has(FeedFlags::DESTROYED) {
            return Err(FeedError::Destroyed);
        }

        let id = inner.handlers.borrow_mut().add_error(Rc::new(handler));

        let weak = Rc::downgrade(inner);
        Ok(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.borrow_mut().remove_error(id);
            }
        })
    }

    // =========================================================================
    // DRAINING & CLOSING
    // =========================================================================

    /// Deliver one batch of spans. Returns the number of records received.
    pub fn drain_once(&self) -> Result<usize> {
        self.inner.drain_once()
    }

    /// Deliver batches until the engine has none left.
    pub fn drain_all(&self) -> Result<usize> {
        self.inner.drain_all()
    }

    /// Close the stream. Safe to call at any time, including from a handler;
    /// finalization happens exactly once, possibly on a later scheduler tick.
    pub fn close(&self) {
        self.inner.request_close();
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub fn state(&self) -> FeedState {
        FeedState::from_flags(self.inner.flags())
    }

    pub fn flags(&self) -> FeedFlags {
        self.inner.flags()
    }

    pub fn handle(&self) -> StreamHandle {
        self.inner.handle
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.has(FeedFlags::DESTROYED)
    }

    /// Spans still waiting on deferred handlers.
    pub fn pending_async_handlers(&self) -> usize {
        self.inner.pending_async.get()
    }

    /// Number of chunks announced so far.
    pub fn cached_chunks(&self) -> usize {
        self.inner.chunks.borrow().len()
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.inner.options.name)
            .field("handle", &self.inner.handle)
            .field("flags", &self.inner.flags())
            .field("pending_async", &self.inner.pending_async.get())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
