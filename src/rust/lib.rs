// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Frame-routing core for a CAN/CAN-FD bus stack.
//!
//! This crate connects producers and consumers of fixed-format CAN frames
//! through prioritized, filtered, flow-controlled channels ([queue::Edge]s)
//! terminated at hub objects ([queue::Ends]). It owns the bounded FIFO
//! reservation protocol, the priority/round-robin scheduler, filter-based
//! fan-out and the connect/disconnect/block/kill lifecycle. Chip register
//! access, character-device syscalls and the CAN wire protocol itself live
//! outside this crate and talk to it through [queue::EndsNotify].

#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod fail;
pub mod filter;
pub mod frame;
pub mod logging;
pub mod queue;

pub use self::{
    fail::Fail,
    filter::FrameFilter,
    frame::{
        Frame,
        FrameHeader,
    },
    queue::{
        router,
        Edge,
        EdgeRef,
        Ends,
        EndsNotify,
        Fifo,
        NotifyEvent,
        SlotId,
        QUEUE_PRIO_COUNT,
    },
};
