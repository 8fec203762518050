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
    SlotId,
};
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::{
    sync::Arc,
    thread,
};

//==============================================================================
// Constants
//==============================================================================

/// Number of frames pushed through each edge by the threaded test.
const STRESS_FRAME_COUNT: usize = 256;

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

/// Drains a notification channel into a vector.
fn drain(rx: &Receiver<(u64, NotifyEvent)>) -> Vec<(u64, NotifyEvent)> {
    let mut events: Vec<(u64, NotifyEvent)> = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

//==============================================================================
// test_delivery_notifications()
//==============================================================================

/// Tests that attach, data-ready and drained events reach the right hubs.
#[test]
fn test_delivery_notifications() -> Result<()> {
    logging::initialize();
    let (producer, producer_rx) = ends_with_sink();
    let (consumer, consumer_rx) = ends_with_sink();
    let edge: EdgeRef = Edge::new(4, 8, FrameFilter::accept_all(), 1)?;
    router::connect_edge(&edge, &producer, &consumer)?;

    let attach: Vec<(u64, NotifyEvent)> = drain(&producer_rx);
    anyhow::ensure!(attach == vec![(edge.edge_num(), NotifyEvent::Attach)]);
    let attach: Vec<(u64, NotifyEvent)> = drain(&consumer_rx);
    anyhow::ensure!(attach == vec![(edge.edge_num(), NotifyEvent::Attach)]);

    let frame: Frame = Frame::new(0x123, 0, b"hi")?;
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &frame, 0) == 1);
    let ready: Vec<(u64, NotifyEvent)> = drain(&consumer_rx);
    anyhow::ensure!(ready == vec![(edge.edge_num(), NotifyEvent::Proc)]);
    anyhow::ensure!(drain(&producer_rx).is_empty());

    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    router::free_out_slot(out_edge, slot);
    let drained: Vec<(u64, NotifyEvent)> = drain(&producer_rx);
    anyhow::ensure!(drained == vec![(edge.edge_num(), NotifyEvent::Empty)]);

    router::edge_decref(&edge);
    Ok(())
}

//==============================================================================
// test_delivery_space_notification()
//==============================================================================

/// Tests that releasing a slot of a full edge reports space to the producer.
#[test]
fn test_delivery_space_notification() -> Result<()> {
    logging::initialize();
    let (producer, producer_rx) = ends_with_sink();
    let consumer = Ends::new(None);
    let edge: EdgeRef = Edge::new(1, 8, FrameFilter::accept_all(), 1)?;
    router::connect_edge(&edge, &producer, &consumer)?;
    let _ = drain(&producer_rx);

    let frame: Frame = Frame::new(0x1, 0, b"F")?;
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &frame, 0) == 1);
    // The single slot is taken; a second delivery finds no space.
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &frame, 0) == 0);

    let (out_edge, slot) = router::take_out_slot(&consumer)?;
    router::free_out_slot(out_edge, slot);
    let events: Vec<(u64, NotifyEvent)> = drain(&producer_rx);
    anyhow::ensure!(events.contains(&(edge.edge_num(), NotifyEvent::Space)));
    anyhow::ensure!(events.contains(&(edge.edge_num(), NotifyEvent::Empty)));

    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &frame, 0) == 1);
    router::edge_decref(&edge);
    Ok(())
}

//==============================================================================
// test_delivery_filtered_fan_out()
//==============================================================================

/// Tests that one producer hub feeds multiple consumer hubs through
/// per-edge identifier filters.
#[test]
fn test_delivery_filtered_fan_out() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let motor = Ends::new(None);
    let sensor = Ends::new(None);
    let monitor = Ends::new(None);

    let motor_filter: FrameFilter = FrameFilter {
        id: 0x100,
        id_mask: 0x700,
        flags: 0,
        flags_mask: 0,
    };
    let sensor_filter: FrameFilter = FrameFilter {
        id: 0x200,
        id_mask: 0x700,
        flags: 0,
        flags_mask: 0,
    };
    let motor_edge: EdgeRef = Edge::new(8, 8, motor_filter, 1)?;
    router::connect_edge(&motor_edge, &producer, &motor)?;
    let sensor_edge: EdgeRef = Edge::new(8, 8, sensor_filter, 1)?;
    router::connect_edge(&sensor_edge, &producer, &sensor)?;
    let monitor_edge: EdgeRef = Edge::new(8, 8, FrameFilter::accept_all(), 0)?;
    router::connect_edge(&monitor_edge, &producer, &monitor)?;

    // The monitor sees everything; the class hubs see their class only.
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x101, 0, b"m")?, 0) == 2);
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x205, 0, b"s")?, 0) == 2);
    anyhow::ensure!(router::filter_frame_to_edges(&producer, None, &Frame::new(0x300, 0, b"x")?, 0) == 1);

    anyhow::ensure!(motor_edge.fifo().pending_count() == 1);
    anyhow::ensure!(sensor_edge.fifo().pending_count() == 1);
    anyhow::ensure!(monitor_edge.fifo().pending_count() == 3);

    let (edge, slot) = router::take_out_slot(&motor)?;
    anyhow::ensure!(edge.fifo().frame(slot).header.can_id == 0x101);
    router::free_out_slot(edge, slot);

    for edge in [&motor_edge, &sensor_edge, &monitor_edge] {
        router::edge_decref(edge);
    }
    Ok(())
}

//==============================================================================
// test_delivery_loopback_same_ends()
//==============================================================================

/// Tests an edge connected from a hub back to itself.
#[test]
fn test_delivery_loopback_same_ends() -> Result<()> {
    logging::initialize();
    let hub = Ends::new(None);
    let edge: EdgeRef = Edge::new(4, 8, FrameFilter::accept_all(), 1)?;
    router::connect_edge(&edge, &hub, &hub)?;
    anyhow::ensure!(hub.in_edge_count() == 1);
    anyhow::ensure!(hub.out_edge_count() == 1);

    anyhow::ensure!(router::filter_frame_to_edges(&hub, None, &Frame::new(0x11, 0, b"L")?, 0) == 1);
    let (out_edge, slot) = router::take_out_slot(&hub)?;
    anyhow::ensure!(&out_edge.fifo().frame(slot).data[..] == b"L");
    router::free_out_slot(out_edge, slot);
    router::edge_decref(&edge);
    Ok(())
}

//==============================================================================
// test_delivery_threaded_producer_consumer()
//==============================================================================

/// Tests frame ordering and completeness with a producer thread and a
/// consumer thread racing over one edge.
#[test]
fn test_delivery_threaded_producer_consumer() -> Result<()> {
    logging::initialize();
    let producer = Ends::new(None);
    let consumer = Ends::new(None);
    let edge: EdgeRef = Edge::new(4, 8, FrameFilter::accept_all(), 1)?;
    router::connect_edge(&edge, &producer, &consumer)?;

    let producer_ends: Arc<Ends> = producer.clone();
    let writer = thread::spawn(move || {
        for i in 0..STRESS_FRAME_COUNT {
            loop {
                match router::get_in_slot(&producer_ends) {
                    Ok((in_edge, slot)) => {
                        let payload: [u8; 2] = [(i >> 8) as u8, i as u8];
                        let frame: Frame = Frame::new(0x20, 0, &payload).expect("valid stress frame");
                        in_edge.fifo().fill(slot, &frame);
                        router::put_in_slot(in_edge, slot);
                        break;
                    },
                    Err(_) => thread::yield_now(),
                }
            }
        }
    });

    let consumer_ends: Arc<Ends> = consumer.clone();
    let reader = thread::spawn(move || -> Vec<usize> {
        let mut received: Vec<usize> = Vec::with_capacity(STRESS_FRAME_COUNT);
        while received.len() < STRESS_FRAME_COUNT {
            match router::take_out_slot(&consumer_ends) {
                Ok((out_edge, slot)) => {
                    let frame: Frame = out_edge.fifo().frame(slot);
                    received.push(((frame.data[0] as usize) << 8) | frame.data[1] as usize);
                    router::free_out_slot(out_edge, slot);
                },
                Err(_) => thread::yield_now(),
            }
        }
        received
    });

    writer.join().expect("writer thread panicked");
    let received: Vec<usize> = reader.join().expect("reader thread panicked");
    anyhow::ensure!(received.len() == STRESS_FRAME_COUNT);
    for (expected, got) in received.iter().enumerate() {
        anyhow::ensure!(*got == expected, "frame {} arrived out of order", expected);
    }
    router::edge_decref(&edge);
    Ok(())
}

//==============================================================================
// test_delivery_slot_id_roundtrip()
//==============================================================================

/// Tests that slot handles convert to and from indices for embedding in
/// caller bookkeeping.
#[test]
fn test_delivery_slot_id_roundtrip() -> Result<()> {
    let slot: SlotId = SlotId::from(3_usize);
    anyhow::ensure!(usize::from(slot) == 3);
    Ok(())
}
