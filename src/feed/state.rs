//! State buffer - the refcount table most recently announced by the engine.

use std::rc::Rc;

use crate::native::RefcountTable;

#[derive(Default)]
pub struct StateBuffer {
    table: Option<Rc<dyn RefcountTable>>,
}

impl StateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table. The previous one is dropped.
    pub fn replace(&mut self, table: Rc<dyn RefcountTable>) {
        self.table = Some(table);
    }

    /// Release one reader of `chunk_index`. No-op without a table.
    pub fn release(&self, chunk_index: u32) {
        if let Some(table) = &self.table {
            table.decrement(chunk_index as usize);
        }
    }

    pub fn get(&self, chunk_index: u32) -> Option<u8> {
        self.table.as_ref()?.get(chunk_index as usize)
    }

    pub fn is_loaded(&self) -> bool {
        self.table.is_some()
    }

    pub fn clear(&mut self) {
        self.table = None;
    }
}

impl std::fmt::Debug for StateBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBuffer")
            .field("len", &self.table.as_ref().map(|t| t.len()))
            .finish()
    }
}
