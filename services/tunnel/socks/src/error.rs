//! Proxy-session error types.

use crate::{NodeId, Seq};
use thiserror::Error;

/// Broad failure categories shared by every manager operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node, session or sequence does not currently exist
    NotFound,
    /// The resource is already registered
    AlreadyExists,
    /// The resource exists but cannot serve this request
    InvalidState,
    /// The manager, a channel or the link is gone
    Unavailable,
}

/// Errors reported by the proxy-session manager and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocksError {
    /// No proxy instance for the node
    #[error("no proxy running for node {0}")]
    ProxyNotFound(NodeId),

    /// A proxy instance already exists for the node
    #[error("proxy already running for node {0}")]
    ProxyExists(NodeId),

    /// No session for the sequence number
    #[error("no session for sequence {0}")]
    SessionNotFound(Seq),

    /// A session is already attached under the sequence number
    #[error("session {0} already attached")]
    SessionExists(Seq),

    /// The sequence number is not mapped to any node
    #[error("sequence {0} is not registered")]
    SequenceNotFound(Seq),

    /// The sequence number was issued to another node
    #[error("sequence {seq} belongs to node {owner}")]
    ForeignSequence {
        /// Sequence number
        seq: Seq,
        /// Node it was allocated for
        owner: NodeId,
    },

    /// UDP operation on a session that was never associated
    #[error("session {0} has no udp association")]
    NotUdp(Seq),

    /// The session already carries a UDP association
    #[error("session {0} already has a udp association")]
    UdpAlreadyAttached(Seq),

    /// The receiving end of the data channel was already handed out
    #[error("data channel of session {0} already claimed")]
    ChannelClaimed(Seq),

    /// The data channel's consumer is gone
    #[error("data channel of session {0} is closed")]
    ChannelClosed(Seq),

    /// A leased send did not complete in time
    #[error("leased send on session {0} timed out")]
    LeaseTimeout(Seq),

    /// The topology has no route to the node
    #[error("node {node} is unroutable: {reason}")]
    Unroutable {
        /// Target node
        node: NodeId,
        /// Topology failure
        reason: String,
    },

    /// The tunnel link refused the frame
    #[error("tunnel link error: {0}")]
    Link(String),

    /// Local socket failure
    #[error("io error: {0}")]
    Io(String),

    /// The manager task is not running
    #[error("socks manager is not running")]
    ManagerUnavailable,
}

impl SocksError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SocksError::ProxyNotFound(_)
            | SocksError::SessionNotFound(_)
            | SocksError::SequenceNotFound(_)
            | SocksError::Unroutable { .. } => ErrorKind::NotFound,
            SocksError::ProxyExists(_)
            | SocksError::SessionExists(_)
            | SocksError::UdpAlreadyAttached(_) => ErrorKind::AlreadyExists,
            SocksError::NotUdp(_)
            | SocksError::ChannelClaimed(_)
            | SocksError::ForeignSequence { .. } => ErrorKind::InvalidState,
            SocksError::ChannelClosed(_)
            | SocksError::LeaseTimeout(_)
            | SocksError::Link(_)
            | SocksError::Io(_)
            | SocksError::ManagerUnavailable => ErrorKind::Unavailable,
        }
    }

    /// Whether this is a clean lookup miss
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<std::io::Error> for SocksError {
    fn from(e: std::io::Error) -> Self {
        SocksError::Io(e.to_string())
    }
}

impl From<tunnel_wire::WireError> for SocksError {
    fn from(e: tunnel_wire::WireError) -> Self {
        SocksError::Link(e.to_string())
    }
}
