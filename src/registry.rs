//! Per-session statement bookkeeping
//!
//! A [`SessionStatementRegistry`] is owned by a session and shared by every
//! statement created from it. It holds:
//!
//! - the id allocator, behind a mutex so concurrent statements never race
//!   for the same freed id
//! - the capability gate, closed permanently the first time the server
//!   refuses to prepare a statement
//! - the orphan queue: ids whose prepare or deallocate request was
//!   abandoned mid-flight and still need a deallocate before they can be
//!   reused
//! - the epoch, bumped whenever the server side forgets every prepared
//!   statement (session reset or close)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::PreparedStatementConfig;
use crate::slots::StatementSlotAllocator;

#[derive(Debug, Default)]
struct RegistryState {
    slots: StatementSlotAllocator,
    orphans: Vec<u32>,
    epoch: u64,
}

/// Statement id bookkeeping and capability gate for one session
#[derive(Debug)]
pub struct SessionStatementRegistry {
    config: PreparedStatementConfig,
    state: Mutex<RegistryState>,
    prepared_statement_supported: AtomicBool,
}

impl Default for SessionStatementRegistry {
    fn default() -> Self {
        Self::new(PreparedStatementConfig::default())
    }
}

impl SessionStatementRegistry {
    /// Create a registry for a freshly established session
    pub fn new(config: PreparedStatementConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
            prepared_statement_supported: AtomicBool::new(true),
        }
    }

    /// The configuration this registry was created with
    pub fn config(&self) -> &PreparedStatementConfig {
        &self.config
    }

    /// Whether statements in this session may still be prepared
    pub fn prepared_statement_supported(&self) -> bool {
        self.config.enabled() && self.prepared_statement_supported.load(Ordering::SeqCst)
    }

    /// Close the capability gate for the rest of the session
    ///
    /// Returns `true` if this call closed it.
    pub fn mark_prepared_statement_unsupported(&self) -> bool {
        let was_open = self.prepared_statement_supported.swap(false, Ordering::SeqCst);
        if was_open {
            tracing::debug!("prepared statements disabled for the rest of the session");
        }
        was_open
    }

    /// Reserve the lowest free statement id
    ///
    /// Returns `None` when the configured id cap is reached.
    pub fn reserve(&self) -> Option<SlotReservation<'_>> {
        let mut state = self.state();
        let id = state
            .slots
            .allocate_within(self.config.max_statement_ids())?;
        Some(SlotReservation {
            registry: self,
            id,
            epoch: state.epoch,
            armed: true,
        })
    }

    /// Return an id to the free pool if it was handed out in `epoch`
    ///
    /// Ids from an earlier epoch were already dropped by [`reset`](Self::reset)
    /// and may belong to another statement by now.
    pub fn release(&self, id: u32, epoch: u64) {
        let mut state = self.state();
        if state.epoch == epoch {
            state.slots.release(id);
        }
    }

    /// Keep an id occupied until a deallocate has been sent for it
    pub fn orphan(&self, id: u32, epoch: u64) {
        let mut state = self.state();
        if state.epoch == epoch && state.slots.is_allocated(id) && !state.orphans.contains(&id) {
            state.orphans.push(id);
        }
    }

    /// Claim the oldest orphaned id for deallocation
    ///
    /// The id stays occupied until the claim is
    /// [`settle`](OrphanClaim::settle)d. A claim dropped before that puts the
    /// id back on the queue.
    pub fn claim_orphan(&self) -> Option<OrphanClaim<'_>> {
        let mut state = self.state();
        if state.orphans.is_empty() {
            return None;
        }
        let id = state.orphans.remove(0);
        Some(OrphanClaim {
            registry: self,
            id,
            epoch: state.epoch,
            armed: true,
        })
    }

    /// Ids waiting for a deallocate, oldest first
    pub fn orphans(&self) -> Vec<u32> {
        self.state().orphans.clone()
    }

    /// Guard an id whose plan is being deallocated
    ///
    /// The returned reservation behaves like one from
    /// [`reserve`](Self::reserve): release it once the server dropped the
    /// plan, commit it if the plan is still live. Dropping it mid-request
    /// orphans the id.
    pub fn track(&self, id: u32, epoch: u64) -> SlotReservation<'_> {
        SlotReservation {
            registry: self,
            id,
            epoch,
            armed: true,
        }
    }

    /// Check whether an id is currently handed out
    pub fn is_allocated(&self, id: u32) -> bool {
        self.state().slots.is_allocated(id)
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> usize {
        self.state().slots.in_use()
    }

    /// Current epoch; plans prepared under an older epoch no longer exist
    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    /// Forget every id after the server dropped all prepared statements
    ///
    /// The capability gate is left untouched.
    pub fn reset(&self) {
        let mut state = self.state();
        state.slots.clear();
        state.orphans.clear();
        state.epoch += 1;
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A statement id held while a prepare or deallocate request is in flight
///
/// The id is kept when the reservation is [`commit`](Self::commit)ted and
/// freed when it is [`release`](Self::release)d. A reservation dropped in
/// neither state (the request future was abandoned) orphans the id: the
/// server may hold a plan under it, so it stays occupied until a deallocate
/// has been sent.
#[derive(Debug)]
pub struct SlotReservation<'a> {
    registry: &'a SessionStatementRegistry,
    id: u32,
    epoch: u64,
    armed: bool,
}

impl SlotReservation<'_> {
    /// The reserved id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Epoch the id was handed out in
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Keep the id; it now belongs to a prepared plan
    pub fn commit(mut self) -> u32 {
        self.armed = false;
        self.id
    }

    /// Free the id; the server never registered it
    pub fn release(mut self) {
        self.armed = false;
        self.registry.release(self.id, self.epoch);
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(statement_id = self.id, "request abandoned, id queued for deallocation");
            self.registry.orphan(self.id, self.epoch);
        }
    }
}

/// An orphaned id taken off the queue while its deallocate is in flight
#[derive(Debug)]
pub struct OrphanClaim<'a> {
    registry: &'a SessionStatementRegistry,
    id: u32,
    epoch: u64,
    armed: bool,
}

impl OrphanClaim<'_> {
    /// The orphaned id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Free the id; a deallocate has been sent for it
    pub fn settle(mut self) {
        self.armed = false;
        self.registry.release(self.id, self.epoch);
    }
}

impl Drop for OrphanClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.orphan(self.id, self.epoch);
        }
    }
}
