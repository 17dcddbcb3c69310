//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown message type
    #[error("unknown message type {0:#06x}")]
    Type(u16),

    /// Declared route length disagrees with the route bytes
    #[error("route length mismatch: declared {declared}, actual {actual}")]
    RouteLength {
        /// Length carried in the header
        declared: u32,
        /// Length of the route actually present
        actual: usize,
    },

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// The frame sink is no longer accepting frames
    #[error("frame sink closed")]
    SinkClosed,
}
