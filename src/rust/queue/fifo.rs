// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bounded slot pool with reservation semantics.
//!
//! A [Fifo] owns a fixed arena of frame slots. Producers reserve a slot,
//! fill it and commit it to the pending chain; consumers take the oldest
//! pending slot out, process it and release it back to the pool. Slots
//! checked out on the consumer side are tracked by `out_taken` so the FIFO
//! is not reported empty while processing is still in flight. No operation
//! blocks: absence of a slot is reported, never awaited.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    frame::{
        Frame,
        CAN_FRAME_MAX_DLEN,
    },
};
use ::slab::Slab;
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// New reservations are rejected.
pub const FIFOF_BLOCK: u32 = 1 << 12;
/// No free slot for a new reservation.
pub const FIFOF_FULL: u32 = 1 << 10;
/// No pending data and no slot checked out for reading.
pub const FIFOF_EMPTY: u32 = 1 << 9;
/// The owning edge is being torn down.
pub const FIFOF_DEAD: u32 = 1 << 8;
/// The owning edge is not on any active scheduling list.
pub const FIFOF_INACTIVE: u32 = 1 << 7;
/// Release the owning edge automatically once the pending chain drains.
pub const FIFOF_FREEONEMPTY: u32 = 1 << 6;
/// The owning edge is fully connected.
pub const FIFOF_READY: u32 = 1 << 5;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to one slot in a [Fifo]'s arena. A reserved or taken-out slot id
/// is exclusively owned by its caller until committed, aborted, released or
/// put back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotId(usize);

/// One reusable frame-sized buffer.
#[derive(Default)]
struct Slot {
    /// Frame stored in this slot.
    frame: Frame,
}

/// State behind the FIFO lock.
struct FifoState {
    /// Slot arena. Vacant entries form the free pool.
    slots: Slab<Slot>,
    /// Committed slots in arrival order, oldest first.
    pending: VecDeque<SlotId>,
    /// Number of slots checked out on the consumer side and not yet
    /// released or put back.
    out_taken: usize,
}

/// Fixed-capacity FIFO of frame slots with backpressure flags.
pub struct Fifo {
    /// FIFOF_* flag bits.
    flags: AtomicU32,
    /// Maximum number of slots simultaneously reserved, pending or checked
    /// out.
    capacity: usize,
    /// Maximum payload length accepted by this FIFO.
    max_data_length: usize,
    /// Lists and counters, serialized by this lock.
    state: Mutex<FifoState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fifo {
    /// Creates a FIFO with `slot_count` preallocated slots accepting
    /// payloads up to `max_data_length` bytes.
    pub fn new(slot_count: usize, max_data_length: usize) -> Result<Self, Fail> {
        if slot_count == 0 {
            return Err(Fail::invalid("fifo requires at least one slot"));
        }
        if max_data_length == 0 || max_data_length > CAN_FRAME_MAX_DLEN {
            return Err(Fail::invalid("fifo maximum data length out of range"));
        }
        Ok(Self {
            flags: AtomicU32::new(FIFOF_EMPTY | FIFOF_INACTIVE),
            capacity: slot_count,
            max_data_length,
            state: Mutex::new(FifoState {
                slots: Slab::with_capacity(slot_count),
                pending: VecDeque::with_capacity(slot_count),
                out_taken: 0,
            }),
        })
    }

    /// Maximum payload length accepted by this FIFO.
    pub fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    /// Number of slots committed and not yet taken out.
    pub fn pending_count(&self) -> usize {
        self.locked().pending.len()
    }

    /// Tests whether a flag bit is set.
    pub fn test_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Sets a flag bit.
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    /// Clears a flag bit.
    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Sets a flag bit and reports whether it was already set.
    pub fn test_and_set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::SeqCst) & flag != 0
    }

    /// Clears a flag bit and reports whether it was set.
    pub fn test_and_clear_flag(&self, flag: u32) -> bool {
        self.flags.fetch_and(!flag, Ordering::SeqCst) & flag != 0
    }

    /// Pops one slot from the free pool without making it visible to the
    /// consumer side. Fails with NoSpace when the arena is exhausted.
    pub fn reserve(&self) -> Result<SlotId, Fail> {
        let mut state: MutexGuard<FifoState> = self.locked();
        if state.slots.len() >= self.capacity {
            return Err(Fail::no_space("no free slot in fifo"));
        }
        let slot: SlotId = SlotId(state.slots.insert(Slot::default()));
        if state.slots.len() >= self.capacity {
            self.set_flag(FIFOF_FULL);
        }
        Ok(slot)
    }

    /// Stores a frame into a reserved slot.
    pub fn fill(&self, slot: SlotId, frame: &Frame) {
        let mut state: MutexGuard<FifoState> = self.locked();
        let entry: &mut Slot = state.slots.get_mut(slot.0).expect("slot must be reserved");
        entry.frame = frame.clone();
    }

    /// Appends a reserved slot to the pending chain. The returned bitmask is
    /// nonzero when the consumer side must be activated: FIFOF_EMPTY when
    /// the empty state was just negated, FIFOF_INACTIVE when the owning edge
    /// is currently off the active lists.
    pub fn commit(&self, slot: SlotId) -> u32 {
        let mut state: MutexGuard<FifoState> = self.locked();
        debug_assert!(state.slots.contains(slot.0), "commit of unreserved slot");
        state.pending.push_back(slot);
        let mut ret: u32 = 0;
        if self.test_and_clear_flag(FIFOF_EMPTY) {
            ret |= FIFOF_EMPTY;
        }
        if self.test_flag(FIFOF_INACTIVE) {
            ret |= FIFOF_INACTIVE;
        }
        ret
    }

    /// Returns a reserved-but-unfilled slot to the free pool. The returned
    /// bitmask carries FIFOF_FULL when the full state was just negated.
    pub fn abort(&self, slot: SlotId) -> u32 {
        let mut state: MutexGuard<FifoState> = self.locked();
        state.slots.remove(slot.0);
        let mut ret: u32 = 0;
        if self.test_and_clear_flag(FIFOF_FULL) {
            ret |= FIFOF_FULL;
        }
        ret
    }

    /// Takes the oldest pending slot out for processing and marks it in
    /// flight. Fails with NoData when the pending chain is empty.
    pub fn take_out(&self) -> Result<SlotId, Fail> {
        let mut state: MutexGuard<FifoState> = self.locked();
        let slot: SlotId = match state.pending.pop_front() {
            Some(slot) => slot,
            None => return Err(Fail::no_data("no pending slot in fifo")),
        };
        state.out_taken += 1;
        Ok(slot)
    }

    /// Copies the frame out of a slot.
    pub fn frame(&self, slot: SlotId) -> Frame {
        let state: MutexGuard<FifoState> = self.locked();
        state.slots.get(slot.0).expect("slot must be checked out").frame.clone()
    }

    /// Returns a processed slot to the free pool. The returned bitmask
    /// carries FIFOF_FULL when the full state was just negated, FIFOF_EMPTY
    /// when the FIFO just drained completely, and FIFOF_INACTIVE when the
    /// pending chain is empty and the owning edge should be re-evaluated for
    /// deactivation.
    pub fn release(&self, slot: SlotId) -> u32 {
        let mut state: MutexGuard<FifoState> = self.locked();
        debug_assert!(state.out_taken > 0, "release without matching take_out");
        state.slots.remove(slot.0);
        state.out_taken -= 1;
        let mut ret: u32 = 0;
        if self.test_and_clear_flag(FIFOF_FULL) {
            ret |= FIFOF_FULL;
        }
        if state.pending.is_empty() {
            ret |= FIFOF_INACTIVE;
            if state.out_taken == 0 && !self.test_and_set_flag(FIFOF_EMPTY) {
                ret |= FIFOF_EMPTY;
            }
        }
        ret
    }

    /// Re-inserts a taken-out slot at the head of the pending chain so it is
    /// processed again first.
    pub fn put_back(&self, slot: SlotId) -> u32 {
        let mut state: MutexGuard<FifoState> = self.locked();
        debug_assert!(state.out_taken > 0, "put_back without matching take_out");
        state.out_taken -= 1;
        state.pending.push_front(slot);
        self.clear_flag(FIFOF_EMPTY);
        0
    }

    /// Moves every pending slot back to the free pool. Checked-out slots
    /// cannot be flushed and stay accounted in `out_taken`; reserved slots
    /// keep their place in the arena, so FULL is cleared only when the
    /// flush actually freed room. The returned bitmask carries
    /// FIFOF_INACTIVE when the chain was non-empty and FIFOF_EMPTY when
    /// the empty state was just asserted.
    pub fn flush(&self) -> u32 {
        let mut state: MutexGuard<FifoState> = self.locked();
        let mut ret: u32 = 0;
        if !state.pending.is_empty() {
            while let Some(slot) = state.pending.pop_front() {
                state.slots.remove(slot.0);
            }
            ret |= FIFOF_INACTIVE;
        }
        if state.slots.len() < self.capacity {
            self.clear_flag(FIFOF_FULL);
        }
        self.set_flag(FIFOF_INACTIVE);
        if state.out_taken == 0 && !self.test_and_set_flag(FIFOF_EMPTY) {
            ret |= FIFOF_EMPTY;
        }
        ret
    }

    /// Reports whether the consumer side has work: pending data present and
    /// the FIFO not blocked.
    pub fn out_ready(&self) -> bool {
        let state: MutexGuard<FifoState> = self.locked();
        !state.pending.is_empty() && !self.test_flag(FIFOF_BLOCK)
    }

    /// Acquires the FIFO lock.
    fn locked(&self) -> MutexGuard<FifoState> {
        self.state.lock().expect("fifo lock poisoned")
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<usize> for SlotId {
    fn from(value: usize) -> Self {
        SlotId(value)
    }
}

impl From<SlotId> for usize {
    fn from(value: SlotId) -> Self {
        value.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
