// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::canhub::{
    logging,
    router,
    Edge,
    EdgeRef,
    Ends,
    EndsNotify,
    Frame,
    FrameFilter,
    NotifyEvent,
};
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::sync::Arc;

//==============================================================================
// Structures
//==============================================================================

/// Notification sink forwarding every event into a channel.
struct ChannelSink {
    tx: Sender<(u64, NotifyEvent)>,
}

impl EndsNotify for ChannelSink {
    fn notify(&self, edge: &EdgeRef, event: NotifyEvent) {
        let _ = self.tx.send((edge.edge_num(), event));
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Creates an ends whose notifications land in the returned receiver.
fn ends_with_sink() -> (Arc<Ends>, Receiver<(u64, NotifyEvent)>) {
    let (tx, rx) = unbounded();
    (Ends::new(Some(Box::new(ChannelSink { tx }))), rx)
}

/// Creates an edge between two hubs and drops the creator's reference, as
/// an owner handing the edge over to the router would.
fn attach_edge(producer: &Arc<Ends>, consumer: &Arc<Ends>, prio: usize) -> Result<EdgeRef> {
    let edge: EdgeRef = Edge::new(4, 8, FrameFilter::accept_all(), prio)?;
    router::connect_edge(&edge, producer, consumer)?;
    router::edge_decref(&edge);
    Ok(edge)
}

//==============================================================================
// test_lifecycle_close_sequence()
//==============================================================================

/// Tests the full teardown sequence of a hub owner going away: block both
/// lists, flush, then kill until both lists are empty.
#[test]
fn test_lifecycle_close_sequence() -> Result<()> {
    logging::initialize();
    let closing = Ends::new(None);
    let peer_a = Ends::new(None);
    let peer_b = Ends::new(None);
    let to_a: EdgeRef = attach_edge(&closing, &peer_a, 1)?;
    let from_b: EdgeRef = attach_edge(&peer_b, &closing, 2)?;

    anyhow::ensure!(router::filter_frame_to_edges(&closing, None, &Frame::new(0x1, 0, b"x")?, 0) == 1);
    anyhow::ensure!(router::filter_frame_to_edges(&peer_b, None, &Frame::new(0x2, 0, b"y")?, 0) == 1);

    closing.block_in_list();
    closing.block_out_list();
    anyhow::ensure!(router::filter_frame_to_edges(&closing, None, &Frame::new(0x3, 0, b"z")?, 0) == 0);

    closing.flush_in_list();
    closing.flush_out_list();
    anyhow::ensure!(to_a.fifo().pending_count() == 0);
    anyhow::ensure!(from_b.fifo().pending_count() == 0);

    anyhow::ensure!(!closing.kill_in_list(false));
    anyhow::ensure!(!closing.kill_out_list(false));
    anyhow::ensure!(closing.in_edge_count() == 0);
    anyhow::ensure!(closing.out_edge_count() == 0);
    anyhow::ensure!(peer_a.out_edge_count() == 0);
    anyhow::ensure!(peer_b.in_edge_count() == 0);
    anyhow::ensure!(!to_a.is_connected());
    anyhow::ensure!(!from_b.is_connected());
    Ok(())
}

//==============================================================================
// test_lifecycle_kill_drain_keeps_data()
//==============================================================================

/// Tests that killing with drain leaves pending frames readable and tears
/// the edge down on the final release.
#[test]
fn test_lifecycle_kill_drain_keeps_data() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let consumer = Ends::new(None);
    let edge: EdgeRef = attach_edge(&producer, &consumer, 1)?;

    for payload in [b"1", b"2"] {
        anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x5, 0, payload)?, 0) == 1);
    }
    anyhow::ensure!(producer.kill_in_list(true));
    anyhow::ensure!(edge.is_connected());

    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    anyhow::ensure!(&out_edge.fifo().frame(slot).data[..] == b"1");
    router::free_out_slot(out_edge, slot);
    anyhow::ensure!(edge.is_connected());

    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    anyhow::ensure!(&out_edge.fifo().frame(slot).data[..] == b"2");
    router::free_out_slot(out_edge, slot);
    anyhow::ensure!(!edge.is_connected());
    anyhow::ensure!(!producer.kill_in_list(true));
    Ok(())
}

//==============================================================================
// test_lifecycle_kill_drain_retry()
//==============================================================================

/// Tests that a caller polling a drain-first kill until the list empties
/// does not strand the pending data: the frame stays dequeueable after the
/// retries and the edge disconnects once drained.
#[test]
fn test_lifecycle_kill_drain_retry() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let consumer = Ends::new(None);
    let edge: EdgeRef = attach_edge(&producer, &consumer, 1)?;

    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x6, 0, b"q")?, 0) == 1);
    // The owner polls until the inlist drains, as a closing device would.
    anyhow::ensure!(producer.kill_in_list(true));
    anyhow::ensure!(producer.kill_in_list(true));
    anyhow::ensure!(edge.is_connected());
    anyhow::ensure!(edge.fifo().pending_count() == 1);

    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    anyhow::ensure!(&out_edge.fifo().frame(slot).data[..] == b"q");
    router::free_out_slot(out_edge, slot);
    anyhow::ensure!(!edge.is_connected());
    anyhow::ensure!(!producer.kill_in_list(true));
    Ok(())
}

//==============================================================================
// test_lifecycle_kill_notifies_dead_wanted()
//==============================================================================

/// Tests that a kill announces the teardown request to both hubs before
/// releasing anything.
#[test]
fn test_lifecycle_kill_notifies_dead_wanted() -> Result<()> {
    logging::initialize();
    let (producer, producer_rx) = ends_with_sink();
    let (consumer, consumer_rx) = ends_with_sink();
    let edge: EdgeRef = attach_edge(&producer, &consumer, 1)?;
    while producer_rx.try_recv().is_ok() {}
    while consumer_rx.try_recv().is_ok() {}

    anyhow::ensure!(!consumer.kill_out_list(false));
    let mut producer_saw: bool = false;
    while let Ok((num, event)) = producer_rx.try_recv() {
        producer_saw |= num == edge.edge_num() && event == NotifyEvent::DeadWanted;
    }
    let mut consumer_saw: bool = false;
    while let Ok((num, event)) = consumer_rx.try_recv() {
        consumer_saw |= num == edge.edge_num() && event == NotifyEvent::DeadWanted;
    }
    anyhow::ensure!(producer_saw && consumer_saw);
    anyhow::ensure!(!edge.is_connected());
    Ok(())
}

//==============================================================================
// test_lifecycle_disconnect_retry_after_kill()
//==============================================================================

/// Tests the busy-then-retry contract of explicit disconnection.
#[test]
fn test_lifecycle_disconnect_retry_after_kill() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let consumer = Ends::new(None);
    let edge: EdgeRef = attach_edge(&producer, &consumer, 0)?;

    match router::disconnect_edge(&edge) {
        Ok(()) => anyhow::bail!("connected edge should report busy"),
        Err(e) => anyhow::ensure!(e.errno == libc::EBUSY),
    };

    producer.block_in_list();
    anyhow::ensure!(!producer.kill_in_list(false));
    router::disconnect_edge(&edge)?;
    anyhow::ensure!(!edge.is_connected());
    Ok(())
}

//==============================================================================
// test_lifecycle_block_stops_new_reservations()
//==============================================================================

/// Tests that blocking stops reservations but leaves committed frames
/// readable.
#[test]
fn test_lifecycle_block_stops_new_reservations() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let consumer = Ends::new(None);
    let edge: EdgeRef = attach_edge(&producer, &consumer, 1)?;

    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x8, 0, b"k")?, 0) == 1);
    producer.block_in_list();
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x8, 0, b"k")?, 0) == 0);
    anyhow::ensure!(router::get_in_slot(&producer).is_err());

    // Frames committed before the block stay readable.
    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    anyhow::ensure!(&out_edge.fifo().frame(slot).data[..] == b"k");
    router::free_out_slot(out_edge, slot);
    anyhow::ensure!(edge.fifo().pending_count() == 0);
    anyhow::ensure!(router::take_out_slot(&consumer).is_err());
    Ok(())
}
