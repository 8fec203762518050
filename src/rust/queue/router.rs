// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Routing algorithms operating across edges and ends.
//!
//! Producers obtain a reservation on an in-edge of their ends, fill the
//! slot and commit it, which activates the edge under its consumer ends.
//! Consumers dequeue the highest-priority ready edge, process the slot and
//! release it, freeing space on the producer side. Teardown runs through
//! connect/disconnect/block/kill with user counting: a discovered edge
//! stays valid until its last user reference is dropped, and disconnection
//! only completes once no user is outstanding.
//!
//! Lock nesting is always ends lock before FIFO lock. Operations taking
//! both ends locks (connect/disconnect) order them by address through
//! [lock_ends_pair].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    frame::{
        Frame,
        FrameHeader,
        CAN_ERR_ID_TAG,
        CAN_FRAME_ECHO,
        CAN_FRAME_ERR,
        CAN_FRAME_TXERR,
    },
    queue::{
        edge::EdgeRef,
        ends::{
            Ends,
            EndsState,
            NotifyEvent,
            QUEUE_PRIO_COUNT,
        },
        fifo::{
            SlotId,
            FIFOF_BLOCK,
            FIFOF_DEAD,
            FIFOF_EMPTY,
            FIFOF_FREEONEMPTY,
            FIFOF_FULL,
            FIFOF_INACTIVE,
            FIFOF_READY,
        },
    },
};
use ::std::sync::{
    Arc,
    MutexGuard,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Locks two ends in a stable global order so concurrent connect and
/// disconnect operations on overlapping pairs cannot deadlock. Ends are
/// totally ordered by address; the lower address locks first and the
/// second lock is skipped when both are the same ends. The returned guards
/// are (input-ends guard, output-ends guard); the second is None when the
/// ends coincide.
fn lock_ends_pair<'a>(
    input_ends: &'a Ends,
    output_ends: &'a Ends,
) -> (MutexGuard<'a, EndsState>, Option<MutexGuard<'a, EndsState>>) {
    let input_addr: usize = input_ends as *const Ends as usize;
    let output_addr: usize = output_ends as *const Ends as usize;
    if input_addr == output_addr {
        (input_ends.locked(), None)
    } else if input_addr < output_addr {
        let input_guard: MutexGuard<EndsState> = input_ends.locked();
        let output_guard: MutexGuard<EndsState> = output_ends.locked();
        (input_guard, Some(output_guard))
    } else {
        let output_guard: MutexGuard<EndsState> = output_ends.locked();
        let input_guard: MutexGuard<EndsState> = input_ends.locked();
        (input_guard, Some(output_guard))
    }
}

/// Delivers an event to the producer-side ends of an edge.
pub(crate) fn notify_input_ends(qedge: &EdgeRef, event: NotifyEvent) {
    if let Some(ends) = qedge.input_ends() {
        ends.deliver_notify(qedge, event);
    }
}

/// Delivers an event to the consumer-side ends of an edge.
pub(crate) fn notify_output_ends(qedge: &EdgeRef, event: NotifyEvent) {
    if let Some(ends) = qedge.output_ends() {
        ends.deliver_notify(qedge, event);
    }
}

/// Delivers an event to both endpoints of an edge.
pub(crate) fn notify_both_ends(qedge: &EdgeRef, event: NotifyEvent) {
    notify_input_ends(qedge, event);
    notify_output_ends(qedge, event);
}

/// Drops one user reference. When the last user is gone and the edge is
/// marked DEAD, completes the deferred teardown by disconnecting it.
pub fn edge_decref(qedge: &EdgeRef) {
    if qedge.decref_users() == 0 && qedge.fifo().test_flag(FIFOF_DEAD) {
        edge_do_dead(qedge);
    }
}

/// Completes teardown of an edge whose last user is gone. A concurrent
/// discovery can still make the disconnect report busy; that user's own
/// decref retries.
fn edge_do_dead(qedge: &EdgeRef) {
    qedge.fifo().set_flag(FIFOF_BLOCK);
    match disconnect_edge(qedge) {
        Ok(()) => trace!("edge {} disconnected after teardown", qedge.edge_num()),
        Err(_) => debug!("edge {} teardown deferred, still busy", qedge.edge_num()),
    }
}

/// Drops the connected-state reference of an edge that is wanted dead.
/// After this, the edge disconnects as soon as its remaining users drain.
pub(crate) fn edge_release_ready(qedge: &EdgeRef) {
    if qedge.fifo().test_and_clear_flag(FIFOF_READY) {
        qedge.fifo().set_flag(FIFOF_DEAD | FIFOF_BLOCK);
        edge_decref(qedge);
    }
}

/// Moves an edge to the tail of its priority's active list under its
/// consumer ends' lock, if it is currently inactive.
pub(crate) fn activate_edge(qedge: &EdgeRef) {
    if let Some(output_ends) = qedge.output_ends() {
        let mut state: MutexGuard<EndsState> = output_ends.locked();
        if qedge.fifo().test_and_clear_flag(FIFOF_INACTIVE) {
            Ends::edge_to_active_locked(&mut state, qedge);
        }
    }
}

/// Re-evaluates the scheduling placement of an edge: moves it to the idle
/// list when its FIFO reports nothing ready.
fn deactivate_edge_if_drained(qedge: &EdgeRef) {
    if let Some(output_ends) = qedge.output_ends() {
        let mut state: MutexGuard<EndsState> = output_ends.locked();
        if !qedge.fifo().out_ready() {
            qedge.fifo().set_flag(FIFOF_INACTIVE);
            Ends::edge_to_idle_locked(&mut state, qedge);
        }
    }
}

/// Takes the first non-blocked in-edge of `qends` and reserves one slot on
/// it. On success the returned edge carries a user reference consumed by
/// [put_in_slot] or [abort_in_slot].
pub fn get_in_slot(qends: &Arc<Ends>) -> Result<(EdgeRef, SlotId), Fail> {
    let edge: EdgeRef = match qends.first_in_edge() {
        Some(edge) => edge,
        None => return Err(Fail::no_match("ends has no in edge")),
    };
    if edge.fifo().test_flag(FIFOF_BLOCK) {
        edge_decref(&edge);
        return Err(Fail::no_match("first in edge is blocked"));
    }
    match edge.fifo().reserve() {
        Ok(slot) => {
            trace!("reserved slot on edge {}", edge.edge_num());
            Ok((edge, slot))
        },
        Err(e) => {
            edge_decref(&edge);
            Err(e)
        },
    }
}

/// Selects the best in-edge of `qends` for a frame header and a desired
/// priority, then reserves one slot on it. Among the non-blocked edges
/// whose filter accepts the header, the edge with the highest priority not
/// above `prio` wins; when every match lies above `prio`, the lowest of
/// them wins. Ties keep the earlier edge.
pub fn get_in_slot_for_prio(
    qends: &Arc<Ends>,
    header: Option<&FrameHeader>,
    prio: usize,
) -> Result<(EdgeRef, SlotId), Fail> {
    let snapshot: Vec<EdgeRef> = qends.snapshot_in_list();
    let mut best: Option<&EdgeRef> = None;
    for edge in &snapshot {
        if edge.fifo().test_flag(FIFOF_BLOCK) {
            continue;
        }
        if let Some(header) = header {
            if !edge.filter().matches(header.can_id, header.flags) {
                continue;
            }
        }
        if let Some(bestedge) = best {
            if bestedge.prio() < edge.prio() {
                if edge.prio() > prio {
                    continue;
                }
            } else if bestedge.prio() <= prio {
                continue;
            }
        }
        best = Some(edge);
    }
    let result: Result<(EdgeRef, SlotId), Fail> = match best {
        None => Err(Fail::no_match("no in edge accepts the frame")),
        Some(edge) => match edge.fifo().reserve() {
            Ok(slot) => {
                trace!("prio {} reservation found edge {}", prio, edge.edge_num());
                edge.incref();
                Ok((edge.clone(), slot))
            },
            Err(e) => Err(e),
        },
    };
    for edge in &snapshot {
        edge_decref(edge);
    }
    result
}

/// Tests whether the first in-edge of `qends` can take a reservation.
pub fn test_in_slot(qends: &Arc<Ends>) -> bool {
    match qends.first_in_edge() {
        None => false,
        Some(edge) => {
            let available: bool =
                !edge.fifo().test_flag(FIFOF_BLOCK) && !edge.fifo().test_flag(FIFOF_FULL);
            edge_decref(&edge);
            available
        },
    }
}

/// Commits a filled slot for processing, activating the edge under its
/// consumer ends and notifying it when the edge just became ready.
/// Consumes the user reference taken by the reservation.
pub fn put_in_slot(qedge: EdgeRef, slot: SlotId) -> u32 {
    let ret: u32 = qedge.fifo().commit(slot);
    if ret != 0 {
        activate_edge(&qedge);
        notify_output_ends(&qedge, NotifyEvent::Proc);
    }
    trace!("put in slot on edge {} returned {:#x}", qedge.edge_num(), ret);
    edge_decref(&qedge);
    ret
}

/// Aborts a reservation whose frame could not be prepared, returning the
/// slot to the free pool and notifying the producer side when space became
/// available. Consumes the user reference taken by the reservation.
pub fn abort_in_slot(qedge: EdgeRef, slot: SlotId) -> u32 {
    let ret: u32 = qedge.fifo().abort(slot);
    if ret != 0 {
        notify_input_ends(&qedge, NotifyEvent::Space);
    }
    trace!("abort in slot on edge {} returned {:#x}", qedge.edge_num(), ret);
    edge_decref(&qedge);
    ret
}

/// Delivers one frame to every non-blocked in-edge of `qends` whose filter
/// accepts it, committing an individual copy into each edge's FIFO.
///
/// ECHO is ORed into the delivered flags when the frame would loop back to
/// its own origin: a source edge was given, the delivery is not a
/// transmit-error delivery and the candidate's consumer ends is the source
/// edge's producer ends. Error frames get their identifier tagged with
/// [CAN_ERR_ID_TAG]. A payload too large for one destination drops the
/// frame for that destination only. Transmit-error frames stop after the
/// first successful delivery. Returns the number of edges delivered to;
/// zero means nobody subscribed, which is not a failure.
pub fn filter_frame_to_edges(
    qends: &Arc<Ends>,
    src_edge: Option<&EdgeRef>,
    frame: &Frame,
    flags2add: u16,
) -> usize {
    debug!(
        "fan out of frame id {:#x} flags {:#x}",
        frame.header.can_id, frame.header.flags
    );
    let is_txerr: bool = (frame.header.flags | flags2add) & CAN_FRAME_TXERR != 0;
    let snapshot: Vec<EdgeRef> = qends.snapshot_in_list();
    let mut destnr: usize = 0;
    for edge in &snapshot {
        if edge.fifo().test_flag(FIFOF_BLOCK) {
            continue;
        }
        let echo: bool = match src_edge {
            Some(src) if !is_txerr => match (edge.output_ends(), src.input_ends()) {
                (Some(output_ends), Some(src_input_ends)) => Arc::ptr_eq(&output_ends, &src_input_ends),
                _ => false,
            },
            _ => false,
        };
        let mut flags: u16 = flags2add;
        if echo {
            flags |= CAN_FRAME_ECHO;
        } else {
            flags &= !CAN_FRAME_ECHO;
        }
        if !edge.filter().matches(frame.header.can_id, frame.header.flags | flags) {
            continue;
        }
        let slot: SlotId = match edge.fifo().reserve() {
            Ok(slot) => slot,
            Err(_) => continue,
        };
        if frame.dlen() > edge.fifo().max_data_length() {
            // Drop for this destination only.
            edge.fifo().abort(slot);
            continue;
        }
        let mut delivered: Frame = frame.clone();
        delivered.header.flags |= flags;
        if delivered.header.flags & CAN_FRAME_ERR != 0 {
            // Tag the identifier so the consumer can tell this is not a
            // regular frame even without a flag check.
            delivered.header.can_id |= CAN_ERR_ID_TAG;
        }
        edge.fifo().fill(slot, &delivered);
        destnr += 1;
        let ret: u32 = edge.fifo().commit(slot);
        if ret != 0 {
            activate_edge(edge);
            notify_output_ends(edge, NotifyEvent::Proc);
        }
        if is_txerr {
            // Transmit-error frames go to one edge only.
            break;
        }
    }
    for edge in &snapshot {
        edge_decref(edge);
    }
    debug!("sent frame id {:#x} to {} edges", frame.header.can_id, destnr);
    destnr
}

/// Dequeues the oldest ready slot from the highest-priority active edge of
/// `qends`. Scans priority classes from highest to lowest; within a class,
/// a successfully served edge that is still ready is re-queued at the tail
/// of its active list so equal-priority peers are served in rotation. DEAD
/// edges are parked on the idle list and skipped. On success the returned
/// edge carries a user reference consumed by [free_out_slot] or
/// [push_back_out_slot].
pub fn take_out_slot(qends: &Arc<Ends>) -> Result<(EdgeRef, SlotId), Fail> {
    let mut prio: usize = QUEUE_PRIO_COUNT;
    while prio > 0 {
        prio -= 1;
        loop {
            let edge: EdgeRef = {
                let mut state: MutexGuard<EndsState> = qends.locked();
                let edge: EdgeRef = match state.active[prio].front() {
                    Some(edge) => edge.clone(),
                    None => break,
                };
                if edge.fifo().test_flag(FIFOF_DEAD) {
                    Ends::park_dead_locked(&mut state, &edge);
                    continue;
                }
                edge.incref();
                edge
            };
            let taken: Result<SlotId, Fail> = edge.fifo().take_out();
            {
                let mut state: MutexGuard<EndsState> = qends.locked();
                if edge.fifo().out_ready() {
                    Ends::edge_to_active_locked(&mut state, &edge);
                    edge.fifo().clear_flag(FIFOF_INACTIVE);
                } else {
                    edge.fifo().set_flag(FIFOF_INACTIVE);
                    Ends::edge_to_idle_locked(&mut state, &edge);
                }
            }
            match taken {
                Ok(slot) => {
                    trace!("take out slot found edge {}", edge.edge_num());
                    return Ok((edge, slot));
                },
                Err(_) => edge_decref(&edge),
            }
        }
    }
    Err(Fail::no_data("no ready out slot for ends"))
}

/// Reports the highest priority class of `qends` with a ready edge, not
/// below `prio_min`, without dequeuing anything. Used by callers that need
/// to know whether higher-priority work appeared before continuing with a
/// lower-priority edge.
pub fn pending_out_slot_prio(qends: &Arc<Ends>, prio_min: usize) -> Option<usize> {
    let mut prio: usize = QUEUE_PRIO_COUNT;
    while prio > prio_min {
        prio -= 1;
        loop {
            let edge: EdgeRef = {
                let mut state: MutexGuard<EndsState> = qends.locked();
                let edge: EdgeRef = match state.active[prio].front() {
                    Some(edge) => edge.clone(),
                    None => break,
                };
                if edge.fifo().test_flag(FIFOF_DEAD) {
                    Ends::park_dead_locked(&mut state, &edge);
                    continue;
                }
                edge.incref();
                edge
            };
            if edge.fifo().out_ready() {
                edge_decref(&edge);
                return Some(prio);
            }
            deactivate_edge_if_drained(&edge);
            edge_decref(&edge);
        }
    }
    None
}

/// Releases a processed slot back to its edge's free pool, re-evaluates
/// the edge's scheduling placement and notifies the producer side of
/// empty/space transitions. Completes a pending drain-first teardown when
/// the FIFO just drained. Consumes the user reference taken by
/// [take_out_slot].
pub fn free_out_slot(qedge: EdgeRef, slot: SlotId) -> u32 {
    let ret: u32 = qedge.fifo().release(slot);
    if ret & FIFOF_EMPTY != 0 {
        notify_input_ends(&qedge, NotifyEvent::Empty);
    }
    if ret & FIFOF_FULL != 0 {
        notify_input_ends(&qedge, NotifyEvent::Space);
    }
    if ret & FIFOF_INACTIVE != 0 {
        deactivate_edge_if_drained(&qedge);
    }
    if ret & FIFOF_EMPTY != 0 && qedge.fifo().test_and_clear_flag(FIFOF_FREEONEMPTY) {
        // Drain-first teardown: drop the connected-state reference and the
        // reference owned by the FREEONEMPTY mark.
        edge_release_ready(&qedge);
        edge_decref(&qedge);
    }
    trace!("free out slot on edge {} returned {:#x}", qedge.edge_num(), ret);
    edge_decref(&qedge);
    ret
}

/// Re-schedules a taken-out slot for later processing at the head of its
/// edge's pending chain and re-activates the edge. Consumes the user
/// reference taken by [take_out_slot].
pub fn push_back_out_slot(qedge: EdgeRef, slot: SlotId) -> u32 {
    let ret: u32 = qedge.fifo().put_back(slot);
    if let Some(output_ends) = qedge.output_ends() {
        let mut state: MutexGuard<EndsState> = output_ends.locked();
        if qedge.fifo().out_ready() {
            Ends::edge_to_active_locked(&mut state, &qedge);
            qedge.fifo().clear_flag(FIFOF_INACTIVE);
        }
    }
    edge_decref(&qedge);
    ret
}

/// Flushes every pending slot of an edge. On a genuine state change the
/// producer side is notified of the empty/space transitions and the edge's
/// scheduling placement is re-evaluated.
pub fn flush_edge(qedge: &EdgeRef) -> u32 {
    let ret: u32 = qedge.fifo().flush();
    if ret != 0 {
        notify_input_ends(qedge, NotifyEvent::Empty);
        notify_input_ends(qedge, NotifyEvent::Space);
        deactivate_edge_if_drained(qedge);
    }
    trace!("flush of edge {} returned {:#x}", qedge.edge_num(), ret);
    ret
}

/// Connects an edge between a producer ends and a consumer ends: the edge
/// joins the producer's inlist, the consumer's outlist and the consumer's
/// idle scheduling list, both endpoints are notified of the attachment and
/// the edge becomes READY holding one connected-state user reference. A
/// duplicate call on an already-connected edge is a no-op.
pub fn connect_edge(qedge: &EdgeRef, input_ends: &Arc<Ends>, output_ends: &Arc<Ends>) -> Result<(), Fail> {
    debug!("connecting edge {}", qedge.edge_num());
    qedge.incref();
    {
        let (mut input_guard, mut output_guard) = lock_ends_pair(input_ends, output_ends);
        if !qedge.is_connected() {
            qedge.set_endpoints(Some(input_ends.clone()), Some(output_ends.clone()));
            input_guard.inlist.push(qedge.clone());
            let output_state: &mut EndsState = match output_guard.as_mut() {
                Some(guard) => &mut *guard,
                None => &mut input_guard,
            };
            output_state.outlist.push(qedge.clone());
            Ends::edge_to_idle_locked(output_state, qedge);
        }
    }
    notify_both_ends(qedge, NotifyEvent::Attach);
    if qedge.fifo().test_and_set_flag(FIFOF_READY) {
        // Duplicate connect: drop the reference taken at entry.
        edge_decref(qedge);
    }
    Ok(())
}

/// Disconnects an edge from its endpoints. Succeeds only when no user
/// reference is outstanding; otherwise reports busy and leaves all state
/// untouched, in which case the caller blocks and kills the edge and
/// retries. Disconnecting an already-disconnected edge succeeds.
pub fn disconnect_edge(qedge: &EdgeRef) -> Result<(), Fail> {
    let input_opt: Option<Arc<Ends>> = qedge.input_ends();
    let output_opt: Option<Arc<Ends>> = qedge.output_ends();
    match (&input_opt, &output_opt) {
        (None, None) => Ok(()),
        (Some(input_ends), Some(output_ends)) => {
            let (mut input_guard, mut output_guard) = lock_ends_pair(input_ends, output_ends);
            if qedge.users() != 0 {
                return Err(Fail::busy("edge still has users"));
            }
            {
                let output_state: &mut EndsState = match output_guard.as_mut() {
                    Some(guard) => &mut *guard,
                    None => &mut input_guard,
                };
                Ends::unlink_sched_locked(output_state, qedge);
                if let Some(pos) = output_state.outlist.iter().position(|e| Arc::ptr_eq(e, qedge)) {
                    output_state.outlist.remove(pos);
                }
            }
            if let Some(pos) = input_guard.inlist.iter().position(|e| Arc::ptr_eq(e, qedge)) {
                input_guard.inlist.remove(pos);
            }
            qedge.set_endpoints(None, None);
            debug!("edge {} disconnected", qedge.edge_num());
            Ok(())
        },
        (Some(input_ends), None) => {
            let mut input_guard: MutexGuard<EndsState> = input_ends.locked();
            if qedge.users() != 0 {
                return Err(Fail::busy("edge still has users"));
            }
            if let Some(pos) = input_guard.inlist.iter().position(|e| Arc::ptr_eq(e, qedge)) {
                input_guard.inlist.remove(pos);
            }
            qedge.set_endpoints(None, None);
            Ok(())
        },
        (None, Some(output_ends)) => {
            let mut output_guard: MutexGuard<EndsState> = output_ends.locked();
            if qedge.users() != 0 {
                return Err(Fail::busy("edge still has users"));
            }
            Ends::unlink_sched_locked(&mut output_guard, qedge);
            if let Some(pos) = output_guard.outlist.iter().position(|e| Arc::ptr_eq(e, qedge)) {
                output_guard.outlist.remove(pos);
            }
            qedge.set_endpoints(None, None);
            Ok(())
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
