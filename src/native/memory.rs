//! In-process engine - a complete `NativeEngine` backed by ordinary Rust memory.
//!
//! Used by the test suite and by embedders that produce spans from Rust.
//! Producer-side calls (`add_chunk`, `push_span`, `notify_data`, ...) emit
//! events synchronously through the registered callback, the same way a
//! native engine would from inside its own call stack.
//!
//! Fault injection (`fail_next_create`, `set_attach_status`,
//! `set_close_status`) and call counters (`stats`) make lifecycle paths
//! observable.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU64;
use std::rc::Rc;

use bytes::Bytes;

use super::record::{SPAN_RECORD_SIZE, Span};
use super::{ChunkId, EventCallback, EventId, NativeEngine, RawEvent, RefcountTable, StreamHandle};
use crate::feed::FeedOptions;

// =============================================================================
// REFCOUNT CELLS
// =============================================================================

/// Refcount table living in Rust memory.
#[derive(Debug)]
pub struct RefcountCells {
    cells: Box<[Cell<u8>]>,
}

impl RefcountCells {
    pub fn new(counters: &[u8]) -> Self {
        Self {
            cells: counters.iter().copied().map(Cell::new).collect(),
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> Vec<u8> {
        self.cells.iter().map(Cell::get).collect()
    }

    /// Producer side: register another reader of `index`.
    pub fn increment(&self, index: usize) {
        if let Some(cell) = self.cells.get(index) {
            cell.set(cell.get().saturating_add(1));
        }
    }
}

impl RefcountTable for RefcountCells {
    fn len(&self) -> usize {
        self.cells.len()
    }

    fn get(&self, index: usize) -> Option<u8> {
        self.cells.get(index).map(Cell::get)
    }

    fn decrement(&self, index: usize) {
        if let Some(cell) = self.cells.get(index) {
            cell.set(cell.get().saturating_sub(1));
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Number of times each boundary call was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub creates: usize,
    pub attaches: usize,
    pub registers: usize,
    pub unregisters: usize,
    pub drains: usize,
    pub closes: usize,
    pub destroys: usize,
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Default)]
struct MemoryStream {
    callback: Option<Rc<dyn Fn(RawEvent)>>,
    queue: VecDeque<Span>,
    closed: bool,
}

struct EngineState {
    next_handle: u64,
    next_chunk: u64,
    next_table: u64,
    streams: HashMap<StreamHandle, MemoryStream>,
    chunks: HashMap<ChunkId, Bytes>,
    tables: HashMap<u64, Rc<RefcountCells>>,
    fail_next_create: bool,
    attach_status: i32,
    close_status: i32,
    stats: EngineStats,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            next_handle: 0,
            next_chunk: 0x1000,
            next_table: 1,
            streams: HashMap::new(),
            chunks: HashMap::new(),
            tables: HashMap::new(),
            fail_next_create: false,
            attach_status: 0,
            close_status: 0,
            stats: EngineStats::default(),
        }
    }
}

/// In-process span engine.
#[derive(Default)]
pub struct MemoryEngine {
    state: RefCell<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.borrow().stats
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Make the next `create` return a null handle.
    pub fn fail_next_create(&self) {
        self.state.borrow_mut().fail_next_create = true;
    }

    /// Status returned by every subsequent `attach`.
    pub fn set_attach_status(&self, status: i32) {
        self.state.borrow_mut().attach_status = status;
    }

    /// Status returned by every subsequent `close`.
    pub fn set_close_status(&self, status: i32) {
        self.state.borrow_mut().close_status = status;
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// True while a callback is registered for `handle`.
    pub fn is_registered(&self, handle: StreamHandle) -> bool {
        self.state
            .borrow()
            .streams
            .get(&handle)
            .is_some_and(|s| s.callback.is_some())
    }

    /// True until `destroy` is called for `handle`.
    pub fn is_live(&self, handle: StreamHandle) -> bool {
        self.state.borrow().streams.contains_key(&handle)
    }

    /// Spans still waiting to be drained.
    pub fn queued(&self, handle: StreamHandle) -> usize {
        self.state
            .borrow()
            .streams
            .get(&handle)
            .map_or(0, |s| s.queue.len())
    }

    // =========================================================================
    // PRODUCER SIDE
    // =========================================================================

    /// Allocate a stream outside of any consumer, for `Feed::attach`.
    pub fn open_stream(&self) -> StreamHandle {
        let mut state = self.state.borrow_mut();
        Self::allocate(&mut state)
    }

    /// Store a chunk without announcing it.
    pub fn insert_chunk(&self, data: impl Into<Bytes>) -> ChunkId {
        let mut state = self.state.borrow_mut();
        let id = ChunkId(state.next_chunk);
        state.next_chunk += 0x1000;
        state.chunks.insert(id, data.into());
        id
    }

    /// Store a chunk and emit `ChunkAdded` on `handle`.
    pub fn add_chunk(&self, handle: StreamHandle, data: impl Into<Bytes>) -> ChunkId {
        let data = data.into();
        let len = data.len() as u64;
        let id = self.insert_chunk(data);
        self.emit(handle, RawEvent::new(EventId::ChunkAdded, id.0, len));
        id
    }

    /// Queue a span for the next drain. Emits nothing.
    pub fn push_span(&self, handle: StreamHandle, span: Span) {
        if let Some(stream) = self.state.borrow_mut().streams.get_mut(&handle) {
            stream.queue.push_back(span);
        }
    }

    /// Emit `DataAvailable`.
    pub fn notify_data(&self, handle: StreamHandle) {
        self.emit(handle, RawEvent::new(EventId::DataAvailable, 0, 0));
    }

    /// Allocate a refcount table and emit `StateBuffer`.
    pub fn publish_state(&self, handle: StreamHandle, counters: &[u8]) -> Rc<RefcountCells> {
        let table = Rc::new(RefcountCells::new(counters));
        let ptr = {
            let mut state = self.state.borrow_mut();
            let ptr = state.next_table;
            state.next_table += 1;
            state.tables.insert(ptr, table.clone());
            ptr
        };
        self.emit(handle, RawEvent::new(EventId::StateBuffer, ptr, counters.len() as u64));
        table
    }

    pub fn emit_error(&self, handle: StreamHandle, code: i32) {
        self.emit(handle, RawEvent::new(EventId::Error, code as u32 as u64, 0));
    }

    pub fn emit_closed(&self, handle: StreamHandle) {
        self.emit(handle, RawEvent::new(EventId::Closed, 0, 0));
    }

    /// Invoke the registered callback, if any.
    pub fn emit(&self, handle: StreamHandle, event: RawEvent) {
        let callback = self
            .state
            .borrow()
            .streams
            .get(&handle)
            .and_then(|s| s.callback.clone());

        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn allocate(state: &mut EngineState) -> StreamHandle {
        let handle = StreamHandle(NonZeroU64::MIN.saturating_add(state.next_handle));
        state.next_handle += 1;
        state.streams.insert(handle, MemoryStream::default());
        handle
    }
}

impl NativeEngine for MemoryEngine {
    fn create(&self, _options: &FeedOptions) -> Option<StreamHandle> {
        let mut state = self.state.borrow_mut();
        state.stats.creates += 1;
        if std::mem::take(&mut state.fail_next_create) {
            return None;
        }
        Some(Self::allocate(&mut state))
    }

    fn attach(&self, _handle: StreamHandle) -> i32 {
        let mut state = self.state.borrow_mut();
        state.stats.attaches += 1;
        state.attach_status
    }

    fn register_callback(&self, handle: StreamHandle, callback: EventCallback) {
        let mut state = self.state.borrow_mut();
        state.stats.registers += 1;
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.callback = Some(Rc::from(callback));
        }
    }

    fn unregister_callback(&self, handle: StreamHandle) {
        let mut state = self.state.borrow_mut();
        state.stats.unregisters += 1;
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.callback = None;
        }
    }

    fn drain_spans(&self, handle: StreamHandle, out: &mut [u8], capacity: usize) -> usize {
        let mut state = self.state.borrow_mut();
        state.stats.drains += 1;
        let Some(stream) = state.streams.get_mut(&handle) else {
            return 0;
        };
        if stream.closed {
            return 0;
        }

        let mut count = 0;
        for slot in out.chunks_exact_mut(SPAN_RECORD_SIZE).take(capacity) {
            let Some(span) = stream.queue.pop_front() else {
                break;
            };
            if let Ok(slot) = <&mut [u8; SPAN_RECORD_SIZE]>::try_from(slot) {
                span.encode(slot);
                count += 1;
            }
        }
        count
    }

    fn close(&self, handle: StreamHandle) -> i32 {
        let status = {
            let mut state = self.state.borrow_mut();
            state.stats.closes += 1;
            let status = state.close_status;
            if status == 0 {
                if let Some(stream) = state.streams.get_mut(&handle) {
                    stream.closed = true;
                }
            }
            status
        };

        if status == 0 {
            self.emit_closed(handle);
        }
        status
    }

    fn destroy(&self, handle: StreamHandle) {
        let mut state = self.state.borrow_mut();
        state.stats.destroys += 1;
        state.streams.remove(&handle);
    }

    fn chunk_view(&self, chunk: ChunkId, len: u32) -> Option<Bytes> {
        let state = self.state.borrow();
        let data = state.chunks.get(&chunk)?;
        let len = len as usize;
        (len <= data.len()).then(|| data.slice(..len))
    }

    fn refcount_table(&self, ptr: u64, len: u32) -> Option<Rc<dyn RefcountTable>> {
        let state = self.state.borrow();
        let table = state.tables.get(&ptr)?;
        if table.len() != len as usize {
            return None;
        }
        Some(table.clone() as Rc<dyn RefcountTable>)
    }
}

// =============================================================================
// TESTS
// =============================================================================
