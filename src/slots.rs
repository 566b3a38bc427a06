//! Statement id allocation
//!
//! Prepared statement ids are a per-session resource bounded by the server's
//! `max_prepared_stmt_count`. The allocator always hands out the lowest free
//! id so that sessions preparing and deallocating in a loop keep reusing the
//! same small set of ids instead of growing without bound.
//!
//! Ids are 1-based; id `0` is never handed out.
//!
//! # Example
//!
//! ```
//! use mysqlx_prepared::slots::StatementSlotAllocator;
//!
//! let mut slots = StatementSlotAllocator::new();
//! assert_eq!(slots.allocate(), 1);
//! assert_eq!(slots.allocate(), 2);
//! assert_eq!(slots.allocate(), 3);
//!
//! slots.release(2);
//! assert_eq!(slots.allocate(), 2);
//! ```

/// Tracks which statement ids are currently in use
#[derive(Debug, Clone, Default)]
pub struct StatementSlotAllocator {
    /// Slot `i` holds id `i + 1`
    slots: Vec<bool>,
}

impl StatementSlotAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free id, growing the slot sequence if every slot is taken
    pub fn allocate(&mut self) -> u32 {
        if let Some(index) = self.slots.iter().position(|occupied| !occupied) {
            self.slots[index] = true;
            return slot_to_id(index);
        }

        self.slots.push(true);
        slot_to_id(self.slots.len() - 1)
    }

    /// Take the lowest free id unless `limit` ids are already in use
    pub fn allocate_within(&mut self, limit: Option<usize>) -> Option<u32> {
        match limit {
            Some(limit) if self.in_use() >= limit => None,
            _ => Some(self.allocate()),
        }
    }

    /// Return an id to the free pool
    ///
    /// Releasing an id that is free or was never handed out does nothing.
    pub fn release(&mut self, id: u32) {
        if let Some(index) = id_to_slot(id) {
            if let Some(slot) = self.slots.get_mut(index) {
                *slot = false;
            }
        }
    }

    /// Check whether an id is currently handed out
    pub fn is_allocated(&self, id: u32) -> bool {
        id_to_slot(id)
            .and_then(|index| self.slots.get(index).copied())
            .unwrap_or(false)
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|occupied| **occupied).count()
    }

    /// Forget every slot
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

fn slot_to_id(index: usize) -> u32 {
    // max_prepared_stmt_count keeps this far below u32::MAX
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

fn id_to_slot(id: u32) -> Option<usize> {
    (id as usize).checked_sub(1)
}
