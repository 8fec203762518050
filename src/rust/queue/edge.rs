// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Directed, filtered, prioritized channel between two [Ends].
//!
//! An edge owns one [Fifo] and a user count that allows it to be discovered
//! through shared list traversals on one thread while concurrently targeted
//! for teardown on another. Any algorithm that hands an edge out of an ends
//! lock increments the count first and balances it with
//! [crate::queue::router::edge_decref] exactly once per discovery.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    filter::FrameFilter,
    queue::{
        ends::{
            Ends,
            QUEUE_PRIO_COUNT,
        },
        fifo::Fifo,
    },
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            AtomicU8,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Scheduling-membership tag: not on any list.
const SCHED_NONE: u8 = u8::MAX;
/// Scheduling-membership tag: on the consumer ends' idle list.
const SCHED_IDLE: u8 = u8::MAX - 1;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Sequential edge numbering for log correlation.
static NEXT_EDGE_NUM: AtomicU64 = AtomicU64::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Shared handle to an edge.
pub type EdgeRef = Arc<Edge>;

/// Which scheduling list currently holds an edge. Only mutated under the
/// consumer ends' lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedList {
    /// Not on any scheduling list (transient, before first connect).
    None,
    /// On the consumer ends' idle list.
    Idle,
    /// On the consumer ends' active list of the given priority class.
    Active(usize),
}

/// Endpoint pointers of an edge. Cleared by a successful disconnect.
#[derive(Default)]
struct Endpoints {
    /// Producer-side hub this edge takes frames from.
    input_ends: Option<Arc<Ends>>,
    /// Consumer-side hub this edge delivers frames to.
    output_ends: Option<Arc<Ends>>,
}

/// A directed, filtered, prioritized, reference-counted channel.
pub struct Edge {
    /// Bounded slot FIFO carrying this edge's frames.
    fifo: Fifo,
    /// Acceptance predicate evaluated during fan-out and priority matching.
    filter: FrameFilter,
    /// Priority class, 0 (lowest) to QUEUE_PRIO_COUNT - 1.
    prio: usize,
    /// Sequential number for log correlation.
    edge_num: u64,
    /// Outstanding users beyond plain list membership. An edge with users
    /// cannot be disconnected.
    users: AtomicUsize,
    /// Scheduling-membership tag, encoded [SchedList].
    sched: AtomicU8,
    /// Endpoint pointers.
    endpoints: Mutex<Endpoints>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Edge {
    /// Creates an unconnected edge whose FIFO has `slot_count` slots of up
    /// to `max_data_length` payload bytes. The creator holds the first user
    /// reference and must balance it with
    /// [crate::queue::router::edge_decref].
    pub fn new(slot_count: usize, max_data_length: usize, filter: FrameFilter, prio: usize) -> Result<EdgeRef, Fail> {
        if prio >= QUEUE_PRIO_COUNT {
            return Err(Fail::invalid("edge priority out of range"));
        }
        let edge_num: u64 = NEXT_EDGE_NUM.fetch_add(1, Ordering::Relaxed);
        trace!("new edge {} prio {}", edge_num, prio);
        Ok(Arc::new(Self {
            fifo: Fifo::new(slot_count, max_data_length)?,
            filter,
            prio,
            edge_num,
            users: AtomicUsize::new(1),
            sched: AtomicU8::new(SCHED_NONE),
            endpoints: Mutex::new(Endpoints::default()),
        }))
    }

    /// This edge's FIFO.
    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    /// This edge's acceptance filter.
    pub fn filter(&self) -> &FrameFilter {
        &self.filter
    }

    /// Priority class of this edge.
    pub fn prio(&self) -> usize {
        self.prio
    }

    /// Sequential number of this edge.
    pub fn edge_num(&self) -> u64 {
        self.edge_num
    }

    /// Registers one more user of this edge.
    pub fn incref(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    /// Current user count.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    /// Drops one user reference and returns the remaining count. Callers go
    /// through [crate::queue::router::edge_decref], which runs the deferred
    /// teardown when the count reaches zero.
    pub(crate) fn decref_users(&self) -> usize {
        let prev: usize = self.users.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "edge user count underflow");
        prev - 1
    }

    /// Scheduling-membership tag of this edge.
    pub(crate) fn sched(&self) -> SchedList {
        match self.sched.load(Ordering::SeqCst) {
            SCHED_NONE => SchedList::None,
            SCHED_IDLE => SchedList::Idle,
            prio => SchedList::Active(prio as usize),
        }
    }

    /// Updates the scheduling-membership tag. Callers hold the consumer
    /// ends' lock.
    pub(crate) fn set_sched(&self, sched: SchedList) {
        let encoded: u8 = match sched {
            SchedList::None => SCHED_NONE,
            SchedList::Idle => SCHED_IDLE,
            SchedList::Active(prio) => {
                debug_assert!(prio < QUEUE_PRIO_COUNT);
                prio as u8
            },
        };
        self.sched.store(encoded, Ordering::SeqCst);
    }

    /// Producer-side hub of this edge, if connected.
    pub fn input_ends(&self) -> Option<Arc<Ends>> {
        self.locked_endpoints().input_ends.clone()
    }

    /// Consumer-side hub of this edge, if connected.
    pub fn output_ends(&self) -> Option<Arc<Ends>> {
        self.locked_endpoints().output_ends.clone()
    }

    /// Installs both endpoint pointers. Callers hold both ends' locks.
    pub(crate) fn set_endpoints(&self, input_ends: Option<Arc<Ends>>, output_ends: Option<Arc<Ends>>) {
        let mut endpoints: MutexGuard<Endpoints> = self.locked_endpoints();
        endpoints.input_ends = input_ends;
        endpoints.output_ends = output_ends;
    }

    /// Reports whether both endpoint pointers are installed.
    pub fn is_connected(&self) -> bool {
        let endpoints: MutexGuard<Endpoints> = self.locked_endpoints();
        endpoints.input_ends.is_some() && endpoints.output_ends.is_some()
    }

    /// Acquires the endpoints lock. This is a leaf lock: no other lock is
    /// taken while it is held.
    fn locked_endpoints(&self) -> MutexGuard<Endpoints> {
        self.endpoints.lock().expect("edge endpoints lock poisoned")
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge {{ num: {}, prio: {} }}", self.edge_num, self.prio)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
