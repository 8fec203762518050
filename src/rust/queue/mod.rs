// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod edge;
pub mod ends;
pub mod fifo;
pub mod router;

pub use self::{
    edge::{
        Edge,
        EdgeRef,
    },
    ends::{
        Ends,
        EndsNotify,
        NotifyEvent,
        QUEUE_PRIO_COUNT,
    },
    fifo::{
        Fifo,
        SlotId,
    },
};
