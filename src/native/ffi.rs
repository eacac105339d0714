//! C ABI adapter - `NativeEngine` over a table of `extern "C"` functions.
//!
//! A native library exposes its stream API as a [`NativeApi`] function table.
//! Callbacks cross the boundary as a trampoline plus an opaque user pointer;
//! the pointer is an `Rc` reference owned by the native side between
//! `register_callback` and `unregister_callback`.
//!
//! ```text
//! native thread ─▶ trampoline(user, id, a0, a1) ─▶ Rc<EventCallback> ─▶ Feed
//! ```
//!
//! Chunk and refcount memory is read in place. Nothing is copied.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use bytes::Bytes;

use super::record::SPAN_RECORD_SIZE;
use super::{ChunkId, EventCallback, NativeEngine, RawEvent, RefcountTable, StreamHandle};
use crate::feed::FeedOptions;

// =============================================================================
// C TYPES
// =============================================================================

/// Stream options as seen by the native library.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfiOptions {
    pub drain_capacity: u32,
    pub eager_chunk_views: u8,
}

impl From<&FeedOptions> for FfiOptions {
    fn from(options: &FeedOptions) -> Self {
        Self {
            drain_capacity: u32::try_from(options.effective_capacity()).unwrap_or(u32::MAX),
            eager_chunk_views: u8::from(options.eager_chunk_views),
        }
    }
}

/// Signature of the per-stream event callback.
pub type FfiEventFn = unsafe extern "C" fn(user: *mut c_void, event_id: u32, arg0: u64, arg1: u64);

/// Function table exported by the native library.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeApi {
    /// Returns 0 on failure.
    pub create: unsafe extern "C" fn(options: *const FfiOptions) -> u64,
    pub attach: unsafe extern "C" fn(handle: u64) -> i32,
    /// `callback = None` clears the registration.
    pub set_callback:
        unsafe extern "C" fn(handle: u64, callback: Option<FfiEventFn>, user: *mut c_void),
    pub drain_spans: unsafe extern "C" fn(handle: u64, out: *mut u8, capacity: u32) -> u32,
    pub close: unsafe extern "C" fn(handle: u64) -> i32,
    pub destroy: unsafe extern "C" fn(handle: u64),
}

// =============================================================================
// NATIVE MEMORY VIEWS
// =============================================================================

/// Read-only window over native chunk memory, owned by a `Bytes`.
struct NativeMemory {
    ptr: *const u8,
    len: usize,
}

// SAFETY: per the `FfiEngine::new` contract, chunk memory is immutable once
// announced and never freed while a view over it may exist. The view is
// only read, never written, so moving it across threads is sound.
unsafe impl Send for NativeMemory {}

impl AsRef<[u8]> for NativeMemory {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` is non-null and valid for `len` bytes (checked in `chunk_view`)
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Refcount table living in native memory.
pub struct RawRefcountTable {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawRefcountTable {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the table is alive, and only touched from this thread meanwhile.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }
}

impl RefcountTable for RawRefcountTable {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Option<u8> {
        if index >= self.len {
            return None;
        }
        // SAFETY: index is in bounds; see `from_raw`
        Some(unsafe { ptr::read_volatile(self.ptr.as_ptr().add(index)) })
    }

    fn decrement(&self, index: usize) {
        if index >= self.len {
            return;
        }
        // SAFETY: index is in bounds; see `from_raw`
        unsafe {
            let cell = self.ptr.as_ptr().add(index);
            let value = ptr::read_volatile(cell);
            ptr::write_volatile(cell, value.saturating_sub(1));
        }
    }
}

// =============================================================================
// TRAMPOLINE
// =============================================================================

unsafe extern "C" fn trampoline(user: *mut c_void, event_id: u32, arg0: u64, arg1: u64) {
    if user.is_null() {
        return;
    }
    let slot = user as *const EventCallback;
    // SAFETY: `user` came from `Rc::into_raw` in `register_callback` and the
    // native side holds that reference until `set_callback(None)`. Taking our
    // own strong count keeps the callback alive even if it unregisters itself.
    let callback = unsafe {
        Rc::increment_strong_count(slot);
        Rc::from_raw(slot)
    };
    callback(RawEvent { id: event_id, arg0, arg1 });
}

// =============================================================================
// ENGINE
// =============================================================================

/// `NativeEngine` backed by a C function table.
pub struct FfiEngine {
    api: NativeApi,
    /// User pointers handed to the native side, per stream.
    callbacks: RefCell<HashMap<StreamHandle, *const EventCallback>>,
}

impl FfiEngine {
    /// Wrap a native function table.
    ///
    /// # Safety
    /// - every function in `api` must be safe to call with the arguments this
    ///   adapter passes, and must follow the contract documented on
    ///   [`NativeEngine`]
    /// - callbacks must be invoked on the thread that owns this engine
    /// - chunk memory announced in `ChunkAdded` events must stay valid and
    ///   unmodified for the declared length for as long as any `Bytes` view
    ///   over it is alive. Views are `'static` and handlers may keep them
    ///   past `close`, past `destroy` and past this engine, so in practice
    ///   chunk memory must never be freed or reused by the native side
    /// - state buffer pointers must stay valid until replaced or destroyed
    pub unsafe fn new(api: NativeApi) -> Self {
        Self {
            api,
            callbacks: RefCell::new(HashMap::new()),
        }
    }

    fn release_callback(&self, handle: StreamHandle, user: *const EventCallback) {
        // SAFETY: contract of `new`
        unsafe { (self.api.set_callback)(handle.get(), None, ptr::null_mut()) };
        // SAFETY: `user` is the reference leaked in `register_callback`, and
        // the native side just dropped it.
        drop(unsafe { Rc::from_raw(user) });
    }
}

impl NativeEngine for FfiEngine {
    fn create(&self, options: &FeedOptions) -> Option<StreamHandle> {
        let options = FfiOptions::from(options);
        // SAFETY: contract of `new`; `options` outlives the call
        StreamHandle::new(unsafe { (self.api.create)(&options) })
    }

    fn attach(&self, handle: StreamHandle) -> i32 {
        // SAFETY: contract of `new`
        unsafe { (self.api.attach)(handle.get()) }
    }

    fn register_callback(&self, handle: StreamHandle, callback: EventCallback) {
        if let Some(previous) = self.callbacks.borrow_mut().remove(&handle) {
            self.release_callback(handle, previous);
        }

        let user = Rc::into_raw(Rc::new(callback));
        // SAFETY: contract of `new`
        unsafe { (self.api.set_callback)(handle.get(), Some(trampoline), user as *mut c_void) };
        self.callbacks.borrow_mut().insert(handle, user);
    }

    fn unregister_callback(&self, handle: StreamHandle) {
        let user = self.callbacks.borrow_mut().remove(&handle);
        if let Some(user) = user {
            self.release_callback(handle, user);
        }
    }

    fn drain_spans(&self, handle: StreamHandle, out: &mut [u8], capacity: usize) -> usize {
        let capacity = capacity.min(out.len() / SPAN_RECORD_SIZE);
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
        if capacity == 0 {
            return 0;
        }
        // SAFETY: `out` holds at least `capacity` records
        let count = unsafe { (self.api.drain_spans)(handle.get(), out.as_mut_ptr(), capacity) };
        count.min(capacity) as usize
    }

    fn close(&self, handle: StreamHandle) -> i32 {
        // SAFETY: contract of `new`
        unsafe { (self.api.close)(handle.get()) }
    }

    fn destroy(&self, handle: StreamHandle) {
        // SAFETY: contract of `new`
        unsafe { (self.api.destroy)(handle.get()) }
    }

    fn chunk_view(&self, chunk: ChunkId, len: u32) -> Option<Bytes> {
        let ptr = chunk.0 as usize as *const u8;
        if ptr.is_null() {
            return None;
        }
        Some(Bytes::from_owner(NativeMemory {
            ptr,
            len: len as usize,
        }))
    }

    fn refcount_table(&self, ptr: u64, len: u32) -> Option<Rc<dyn RefcountTable>> {
        let ptr = NonNull::new(ptr as usize as *mut u8)?;
        // SAFETY: contract of `new`
        let table = unsafe { RawRefcountTable::from_raw(ptr, len as usize) };
        Some(Rc::new(table))
    }
}

impl Drop for FfiEngine {
    fn drop(&mut self) {
        let callbacks: Vec<_> = self.callbacks.get_mut().drain().collect();
        for (handle, user) in callbacks {
            self.release_callback(handle, user);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
