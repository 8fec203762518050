// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Mask/value predicate over a frame header, configured per edge at connect
/// time. A candidate matches when its identifier bits selected by `id_mask`
/// equal `id` and its flag bits selected by `flags_mask` equal `flags`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameFilter {
    /// Expected identifier bits.
    pub id: u32,
    /// Identifier bits to compare.
    pub id_mask: u32,
    /// Expected flag bits.
    pub flags: u16,
    /// Flag bits to compare.
    pub flags_mask: u16,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FrameFilter {
    /// A filter that accepts every frame.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// A filter that accepts exactly one identifier, any flags.
    pub fn exact_id(can_id: u32) -> Self {
        Self {
            id: can_id,
            id_mask: u32::MAX,
            flags: 0,
            flags_mask: 0,
        }
    }

    /// Evaluates this filter against a frame header.
    pub fn matches(&self, can_id: u32, flags: u16) -> bool {
        ((can_id ^ self.id) & self.id_mask) == 0 && ((flags ^ self.flags) & self.flags_mask) == 0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
