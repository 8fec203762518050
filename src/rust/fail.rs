// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EBUSY,
    EINVAL,
    EIO,
    EMSGSIZE,
    ENOBUFS,
    ENODEV,
    EWOULDBLOCK,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure
///
/// Routing outcomes are discriminated by `errno`: [Fail::no_space] when a
/// FIFO has no free slot, [Fail::no_data] when a pending chain is empty,
/// [Fail::no_match] when no non-blocked edge satisfies the constraints,
/// [Fail::too_large] when a payload exceeds an edge's capacity and
/// [Fail::busy] when an edge still has outstanding users.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// A FIFO has no free slot for a new reservation.
    pub fn no_space(cause: &str) -> Self {
        Self::new(ENOBUFS, cause)
    }

    /// A FIFO pending chain holds no slot ready for processing.
    pub fn no_data(cause: &str) -> Self {
        Self::new(EWOULDBLOCK, cause)
    }

    /// No non-blocked edge satisfies the filter/priority constraints.
    pub fn no_match(cause: &str) -> Self {
        Self::new(ENODEV, cause)
    }

    /// A payload exceeds the maximum data length of a specific edge.
    pub fn too_large(cause: &str) -> Self {
        Self::new(EMSGSIZE, cause)
    }

    /// An edge cannot be disconnected while it has outstanding users.
    pub fn busy(cause: &str) -> Self {
        Self::new(EBUSY, cause)
    }

    /// Malformed edge or ends state. A contract violation, not a runtime
    /// condition a correct caller can provoke.
    pub fn invalid(cause: &str) -> Self {
        Self::new(EINVAL, cause)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(_: io::Error) -> Self {
        Self {
            errno: EIO,
            cause: "I/O error".to_string(),
        }
    }
}
