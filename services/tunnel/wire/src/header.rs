//! Routing header carried by every tunnel frame.
//!
//! The header names who sent the frame, who must accept it and the hop path
//! the intermediate agents use to forward it. Nothing in the header is
//! interpreted by the admin beyond the message type.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// UUID the admin uses as sender on every frame it originates
pub const ADMIN_UUID: &str = "admin";

/// Maximum route string length in bytes
pub const MAX_ROUTE_LEN: usize = 16 * 1024;

/// Message types understood by the admin
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Liveness heartbeat
    Keep = 0x0001,
    /// Start a proxy service on the accepter
    SocksStart = 0x0010,
    /// Accepter reports whether the proxy service is ready
    SocksReady = 0x0011,
    /// TCP bytes belonging to one proxied session
    SocksTcpData = 0x0012,
    /// One proxied TCP session ended
    SocksTcpFin = 0x0013,
    /// Framed UDP datagram belonging to one proxied session
    SocksUdpData = 0x0014,
    /// Accepter asks the admin to open a UDP relay for a session
    UdpAssociateStart = 0x0015,
    /// Admin answers a UDP relay request
    UdpAssociateReply = 0x0016,
}

impl TryFrom<u16> for MessageType {
    type Error = crate::WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(MessageType::Keep),
            0x0010 => Ok(MessageType::SocksStart),
            0x0011 => Ok(MessageType::SocksReady),
            0x0012 => Ok(MessageType::SocksTcpData),
            0x0013 => Ok(MessageType::SocksTcpFin),
            0x0014 => Ok(MessageType::SocksUdpData),
            0x0015 => Ok(MessageType::UdpAssociateStart),
            0x0016 => Ok(MessageType::UdpAssociateReply),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// UUID of the originating component
    pub sender: String,
    /// UUID of the component that must accept the frame
    pub accepter: String,
    /// Type of the payload that follows
    pub message_type: MessageType,
    /// Length of `route` in bytes
    pub route_len: u32,
    /// Hop path to the accepter
    pub route: String,
}

impl Header {
    /// Create a header; `route_len` is derived from `route`
    pub fn new(
        sender: impl Into<String>,
        accepter: impl Into<String>,
        message_type: MessageType,
        route: impl Into<String>,
    ) -> Self {
        let route = route.into();
        Self {
            sender: sender.into(),
            accepter: accepter.into(),
            message_type,
            route_len: route.len() as u32,
            route,
        }
    }

    /// Number of bytes `encode` writes
    pub fn encoded_len(&self) -> usize {
        2 + self.sender.len() + 2 + self.accepter.len() + 2 + 4 + self.route.len()
    }

    /// Check that every field fits its length prefix
    pub fn validate(&self) -> Result<(), crate::WireError> {
        check_short_str(&self.sender)?;
        check_short_str(&self.accepter)?;
        if self.route.len() > MAX_ROUTE_LEN {
            return Err(crate::WireError::Size(self.route.len()));
        }
        if self.route_len as usize != self.route.len() {
            return Err(crate::WireError::RouteLength {
                declared: self.route_len,
                actual: self.route.len(),
            });
        }
        Ok(())
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        put_short_str(buf, &self.sender);
        put_short_str(buf, &self.accepter);
        buf.put_u16(self.message_type as u16);
        buf.put_u32(self.route_len);
        buf.put_slice(self.route.as_bytes());
    }

    /// Decode a header from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        let sender = get_short_str(buf, "sender")?;
        let accepter = get_short_str(buf, "accepter")?;

        if buf.remaining() < 6 {
            return Err(crate::WireError::Incomplete);
        }
        let message_type = MessageType::try_from(buf.get_u16())?;
        let route_len = buf.get_u32();

        if route_len as usize > MAX_ROUTE_LEN {
            return Err(crate::WireError::Size(route_len as usize));
        }
        if buf.remaining() < route_len as usize {
            return Err(crate::WireError::RouteLength {
                declared: route_len,
                actual: buf.remaining(),
            });
        }
        let route = String::from_utf8(buf.split_to(route_len as usize).to_vec())
            .map_err(|_| crate::WireError::Utf8("route"))?;

        Ok(Self {
            sender,
            accepter,
            message_type,
            route_len,
            route,
        })
    }
}

/// Reject strings a u16 length prefix cannot describe
pub(crate) fn check_short_str(value: &str) -> Result<(), crate::WireError> {
    if value.len() > u16::MAX as usize {
        return Err(crate::WireError::Size(value.len()));
    }
    Ok(())
}

/// Write a u16-length-prefixed string
pub(crate) fn put_short_str(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

/// Read a u16-length-prefixed string
pub(crate) fn get_short_str(
    buf: &mut Bytes,
    field: &'static str,
) -> Result<String, crate::WireError> {
    if buf.remaining() < 2 {
        return Err(crate::WireError::Incomplete);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(crate::WireError::Incomplete);
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| crate::WireError::Utf8(field))
}
