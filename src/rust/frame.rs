// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::fail::Fail;
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Maximum payload length of a CAN FD frame.
pub const CAN_FRAME_MAX_DLEN: usize = 64;

/// Maximum payload length of a classical CAN frame.
pub const CAN_FRAME_STANDARD_DLEN: usize = 8;

/// Frame uses an extended (29-bit) identifier.
pub const CAN_FRAME_IDE: u16 = 1 << 0;
/// Remote transmission request.
pub const CAN_FRAME_RTR: u16 = 1 << 1;
/// Frame is an echo of a locally transmitted frame looping back to its
/// originator.
pub const CAN_FRAME_ECHO: u16 = 1 << 2;
/// Frame originates from a local sender.
pub const CAN_FRAME_LOCAL: u16 = 1 << 3;
/// Transmit-error pseudo frame. Delivered to a single destination only.
pub const CAN_FRAME_TXERR: u16 = 1 << 4;
/// Error pseudo frame. Its identifier is tagged with [CAN_ERR_ID_TAG] on
/// delivery.
pub const CAN_FRAME_ERR: u16 = 1 << 5;
/// Receive FIFO overflowed before this frame was queued.
pub const CAN_FRAME_FIFO_OVERFLOW: u16 = 1 << 6;
/// CAN FD frame format.
pub const CAN_FRAME_FDF: u16 = 1 << 7;
/// CAN FD bit rate switch.
pub const CAN_FRAME_BRS: u16 = 1 << 8;
/// CAN FD error state indicator.
pub const CAN_FRAME_ESI: u16 = 1 << 9;

/// ORed into the identifier of committed error frames so consumers can tell
/// pseudo error frames apart without inspecting flags.
pub const CAN_ERR_ID_TAG: u32 = 1 << 29;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fixed-format header of one CAN frame: identifier plus flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// CAN identifier.
    pub can_id: u32,
    /// Flag bits (CAN_FRAME_*).
    pub flags: u16,
}

/// One CAN/CAN-FD frame: header plus payload bytes. The payload length is
/// carried by the payload buffer itself.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload bytes.
    pub data: ArrayVec<u8, CAN_FRAME_MAX_DLEN>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Frame {
    /// Builds a frame from an identifier, flag bits and payload bytes.
    pub fn new(can_id: u32, flags: u16, data: &[u8]) -> Result<Self, Fail> {
        if data.len() > CAN_FRAME_MAX_DLEN {
            return Err(Fail::too_large("payload exceeds maximum CAN FD data length"));
        }
        let mut payload: ArrayVec<u8, CAN_FRAME_MAX_DLEN> = ArrayVec::new();
        payload.try_extend_from_slice(data).expect("length checked above");
        Ok(Self {
            header: FrameHeader { can_id, flags },
            data: payload,
        })
    }

    /// Payload length in bytes.
    pub fn dlen(&self) -> usize {
        self.data.len()
    }

    /// Is this an error pseudo frame?
    pub fn is_err(&self) -> bool {
        self.header.flags & CAN_FRAME_ERR != 0
    }

    /// Is this a transmit-error pseudo frame?
    pub fn is_txerr(&self) -> bool {
        self.header.flags & CAN_FRAME_TXERR != 0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
