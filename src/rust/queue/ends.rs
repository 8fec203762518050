// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Hub object holding the scheduling state for its edges.
//!
//! An [Ends] terminates edges on both sides: `inlist` identifies edges it
//! produces into, `outlist` edges it consumes from. Every out-edge also
//! lives on exactly one scheduling list of this ends: one of the `active`
//! lists (per priority class) or the `idle` list. A single lock serializes
//! all four list families. State changes are reported to the owner through
//! the [EndsNotify] sink; the sink is how blocked readers and writers get
//! woken, which is an external concern.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::queue::{
    edge::{
        EdgeRef,
        SchedList,
    },
    fifo::{
        FIFOF_BLOCK,
        FIFOF_EMPTY,
        FIFOF_FREEONEMPTY,
        FIFOF_INACTIVE,
    },
    router,
};
use ::std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of priority classes served by the scheduler.
pub const QUEUE_PRIO_COUNT: usize = 3;

//======================================================================================================================
// Structures
//======================================================================================================================

/// State change reported to an [EndsNotify] sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyEvent {
    /// A new edge has been attached to this ends.
    Attach,
    /// An edge of this ends should be brought down.
    DeadWanted,
    /// All slots of an out-going edge have been processed.
    Empty,
    /// The full state of an out-going edge was negated; there is space for
    /// a new frame.
    Space,
    /// New data is available to read from an in-coming edge.
    Proc,
}

/// Notification sink, invoked per ends with the edge concerned and an event
/// code. Implementations wake blocked readers/writers or react to teardown;
/// they must not call back into routing operations that take this ends'
/// lock.
pub trait EndsNotify: Send + Sync {
    /// Delivers one state-change event.
    fn notify(&self, edge: &EdgeRef, event: NotifyEvent);
}

/// The four list families of an ends, behind its lock.
pub(crate) struct EndsState {
    /// Ready out-edges, one list per priority class, served in rotation.
    pub active: [VecDeque<EdgeRef>; QUEUE_PRIO_COUNT],
    /// Out-edges with nothing to deliver.
    pub idle: VecDeque<EdgeRef>,
    /// Edges this ends produces into.
    pub inlist: Vec<EdgeRef>,
    /// Edges this ends consumes from. Each is also on `active` or `idle`.
    pub outlist: Vec<EdgeRef>,
}

/// Hub terminating edges for one communication entity (an open character
/// device, a chip channel, ...). Never reference-counted itself: the owner
/// must outlive every edge still connected to it.
pub struct Ends {
    /// List families, serialized by this lock.
    state: Mutex<EndsState>,
    /// Notification sink of the owner.
    notify: Option<Box<dyn EndsNotify>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Ends {
    /// Creates an ends with an optional notification sink.
    pub fn new(notify: Option<Box<dyn EndsNotify>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EndsState {
                active: Default::default(),
                idle: VecDeque::new(),
                inlist: Vec::new(),
                outlist: Vec::new(),
            }),
            notify,
        })
    }

    /// Delivers one event to this ends' notification sink, if any.
    pub(crate) fn deliver_notify(&self, edge: &EdgeRef, event: NotifyEvent) {
        trace!("notify edge {} event {:?}", edge.edge_num(), event);
        if let Some(sink) = &self.notify {
            sink.notify(edge, event);
        }
    }

    /// Acquires this ends' lock.
    pub(crate) fn locked(&self) -> MutexGuard<EndsState> {
        self.state.lock().expect("ends lock poisoned")
    }

    /// Number of edges this ends produces into.
    pub fn in_edge_count(&self) -> usize {
        self.locked().inlist.len()
    }

    /// Number of edges this ends consumes from.
    pub fn out_edge_count(&self) -> usize {
        self.locked().outlist.len()
    }

    /// First edge of the inlist, with a user reference taken. The caller
    /// balances it with [router::edge_decref].
    pub(crate) fn first_in_edge(&self) -> Option<EdgeRef> {
        let state: MutexGuard<EndsState> = self.locked();
        state.inlist.first().map(|edge| {
            edge.incref();
            edge.clone()
        })
    }

    /// Snapshot of the inlist with a user reference taken on every edge.
    /// The caller balances each with [router::edge_decref].
    pub(crate) fn snapshot_in_list(&self) -> Vec<EdgeRef> {
        let state: MutexGuard<EndsState> = self.locked();
        state
            .inlist
            .iter()
            .map(|edge| {
                edge.incref();
                edge.clone()
            })
            .collect()
    }

    /// Snapshot of the outlist with a user reference taken on every edge.
    /// The caller balances each with [router::edge_decref].
    pub(crate) fn snapshot_out_list(&self) -> Vec<EdgeRef> {
        let state: MutexGuard<EndsState> = self.locked();
        state
            .outlist
            .iter()
            .map(|edge| {
                edge.incref();
                edge.clone()
            })
            .collect()
    }

    /// Removes an edge from whichever scheduling list currently holds it,
    /// keyed off its membership tag. Callers hold this ends' lock.
    pub(crate) fn unlink_sched_locked(state: &mut EndsState, edge: &EdgeRef) {
        match edge.sched() {
            SchedList::None => return,
            SchedList::Idle => {
                if let Some(pos) = state.idle.iter().position(|e| Arc::ptr_eq(e, edge)) {
                    state.idle.remove(pos);
                }
            },
            SchedList::Active(prio) => {
                if let Some(pos) = state.active[prio].iter().position(|e| Arc::ptr_eq(e, edge)) {
                    state.active[prio].remove(pos);
                }
            },
        }
        edge.set_sched(SchedList::None);
    }

    /// Moves an edge to the tail of its priority's active list. Callers
    /// hold this ends' lock.
    pub(crate) fn edge_to_active_locked(state: &mut EndsState, edge: &EdgeRef) {
        Self::unlink_sched_locked(state, edge);
        state.active[edge.prio()].push_back(edge.clone());
        edge.set_sched(SchedList::Active(edge.prio()));
    }

    /// Moves an edge to the tail of the idle list. Callers hold this ends'
    /// lock.
    pub(crate) fn edge_to_idle_locked(state: &mut EndsState, edge: &EdgeRef) {
        Self::unlink_sched_locked(state, edge);
        state.idle.push_back(edge.clone());
        edge.set_sched(SchedList::Idle);
    }

    /// Blocks slot reservation on every edge this ends produces into.
    pub fn block_in_list(&self) {
        let state: MutexGuard<EndsState> = self.locked();
        for edge in &state.inlist {
            edge.fifo().set_flag(FIFOF_BLOCK);
        }
    }

    /// Blocks slot reservation on every edge this ends consumes from.
    pub fn block_out_list(&self) {
        let state: MutexGuard<EndsState> = self.locked();
        for edge in &state.outlist {
            edge.fifo().set_flag(FIFOF_BLOCK);
        }
    }

    /// Requests teardown of every edge this ends produces into. With
    /// `drain` set, edges holding pending data are left connected and
    /// marked FREEONEMPTY so they release themselves once the consumer
    /// drains them; otherwise every edge becomes immediately eligible for
    /// disconnection. Returns true while the inlist still has members, in
    /// which case the caller must retry before tearing the ends down.
    /// Retrying is safe: an edge already marked by an earlier kill is left
    /// to the mark.
    pub fn kill_in_list(&self, drain: bool) -> bool {
        for edge in self.snapshot_in_list() {
            router::notify_both_ends(&edge, NotifyEvent::DeadWanted);
            if drain {
                Self::kill_edge_drain(&edge);
            } else {
                Self::kill_edge_immediate(&edge);
            }
        }
        !self.locked().inlist.is_empty()
    }

    /// Requests teardown of every edge this ends consumes from. Same drain
    /// contract as [Ends::kill_in_list]. Returns true while the outlist
    /// still has members.
    pub fn kill_out_list(&self, drain: bool) -> bool {
        for edge in self.snapshot_out_list() {
            router::notify_both_ends(&edge, NotifyEvent::DeadWanted);
            if drain {
                Self::kill_edge_drain(&edge);
            } else {
                Self::kill_edge_immediate(&edge);
            }
        }
        !self.locked().outlist.is_empty()
    }

    /// Drain-first teardown step for one killed edge. The snapshot
    /// reference is either transferred to a freshly-set FREEONEMPTY mark
    /// (dropped by whoever drains the FIFO) or dropped here.
    fn kill_edge_drain(edge: &EdgeRef) {
        if !edge.fifo().test_and_set_flag(FIFOF_FREEONEMPTY) {
            if !edge.fifo().test_flag(FIFOF_EMPTY) {
                // Transfer the snapshot reference to the FREEONEMPTY
                // mark; whoever drains the fifo drops it.
                return;
            }
            if !edge.fifo().test_and_clear_flag(FIFOF_FREEONEMPTY) {
                // A concurrent drain took the mark's reference over.
                return;
            }
            router::edge_release_ready(edge);
        }
        // An already-set mark means an earlier kill owns the teardown;
        // dooming the edge here would strand its pending frames.
        router::edge_decref(edge);
    }

    /// Immediate teardown step for one killed edge: cancels an in-progress
    /// drain, drops the connected-state reference and the snapshot
    /// reference.
    fn kill_edge_immediate(edge: &EdgeRef) {
        if edge.fifo().test_and_clear_flag(FIFOF_FREEONEMPTY) {
            // Reference owned by the cancelled mark.
            router::edge_decref(edge);
        }
        router::edge_release_ready(edge);
        router::edge_decref(edge);
    }

    /// Flushes every edge this ends produces into.
    pub fn flush_in_list(&self) {
        for edge in self.snapshot_in_list() {
            router::flush_edge(&edge);
            router::edge_decref(&edge);
        }
    }

    /// Flushes every edge this ends consumes from.
    pub fn flush_out_list(&self) {
        for edge in self.snapshot_out_list() {
            router::flush_edge(&edge);
            router::edge_decref(&edge);
        }
    }

    /// Marks DEAD out-edges inactive and parks them on the idle list. Used
    /// by the scheduler scan. Callers hold this ends' lock.
    pub(crate) fn park_dead_locked(state: &mut EndsState, edge: &EdgeRef) {
        edge.fifo().set_flag(FIFOF_INACTIVE);
        Self::edge_to_idle_locked(state, edge);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
