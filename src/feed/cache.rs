//! Chunk cache - chunk id → declared length and read-only view.
//!
//! Entries live for the lifetime of the feed. The memory behind a view
//! belongs to the native side; dropping an entry never frees it.

use std::collections::HashMap;

use bytes::Bytes;

use crate::native::ChunkId;

#[derive(Debug, Clone)]
struct ChunkEntry {
    length: u32,
    /// `None` until materialized.
    view: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct ChunkCache {
    entries: HashMap<ChunkId, ChunkEntry>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk's declared length. Returns false if it was already known.
    pub fn record(&mut self, id: ChunkId, length: u32) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, ChunkEntry { length, view: None });
        true
    }

    /// Attach a materialized view to a recorded chunk.
    pub fn set_view(&mut self, id: ChunkId, view: Bytes) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.view = Some(view);
        }
    }

    pub fn length(&self, id: ChunkId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.length)
    }

    pub fn is_materialized(&self, id: ChunkId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.view.is_some())
    }

    /// Cached view of `id`, materializing it with `load` if only the size is
    /// known. `None` when the chunk was never announced or `load` fails.
    pub fn resolve<F>(&mut self, id: ChunkId, load: F) -> Option<Bytes>
    where
        F: FnOnce(ChunkId, u32) -> Option<Bytes>,
    {
        let entry = self.entries.get_mut(&id)?;
        if let Some(view) = &entry.view {
            return Some(view.clone());
        }
        let view = load(id, entry.length)?;
        entry.view = Some(view.clone());
        Some(view)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
