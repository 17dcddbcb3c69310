//! Typed payloads carried after the frame header.

use crate::header::{check_short_str, get_short_str, put_short_str, MessageType};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Heartbeat payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepMsg {
    /// Heartbeat counter
    pub ping: u64,
}

/// Payload of a tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness heartbeat
    Keep(KeepMsg),
    /// Start a proxy service; empty credentials mean unauthenticated
    SocksStart {
        /// Required username
        username: String,
        /// Required password
        password: String,
    },
    /// Proxy service start result
    SocksReady {
        /// Whether the service started
        ok: bool,
    },
    /// TCP bytes for a session
    SocksTcpData {
        /// Session sequence number
        seq: u64,
        /// Raw bytes
        data: Bytes,
    },
    /// TCP session finished
    SocksTcpFin {
        /// Session sequence number
        seq: u64,
    },
    /// Framed UDP datagram for a session
    SocksUdpData {
        /// Session sequence number
        seq: u64,
        /// Datagram including its SOCKS5 UDP header
        data: Bytes,
    },
    /// Request to open a UDP relay for a session
    UdpAssociateStart {
        /// Session sequence number
        seq: u64,
    },
    /// Answer to a UDP relay request
    UdpAssociateReply {
        /// Session sequence number
        seq: u64,
        /// Whether the relay is open
        ok: bool,
        /// Relay address the client must send datagrams to
        addr: String,
    },
}

impl Message {
    /// Message type announced in the header for this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keep(_) => MessageType::Keep,
            Message::SocksStart { .. } => MessageType::SocksStart,
            Message::SocksReady { .. } => MessageType::SocksReady,
            Message::SocksTcpData { .. } => MessageType::SocksTcpData,
            Message::SocksTcpFin { .. } => MessageType::SocksTcpFin,
            Message::SocksUdpData { .. } => MessageType::SocksUdpData,
            Message::UdpAssociateStart { .. } => MessageType::UdpAssociateStart,
            Message::UdpAssociateReply { .. } => MessageType::UdpAssociateReply,
        }
    }

    /// Session sequence number, for payloads that belong to a session
    pub fn seq(&self) -> Option<u64> {
        match self {
            Message::SocksTcpData { seq, .. }
            | Message::SocksTcpFin { seq }
            | Message::SocksUdpData { seq, .. }
            | Message::UdpAssociateStart { seq }
            | Message::UdpAssociateReply { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Number of bytes `encode` writes
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Keep(_) => 8,
            Message::SocksStart { username, password } => 4 + username.len() + password.len(),
            Message::SocksReady { .. } => 1,
            Message::SocksTcpData { data, .. } | Message::SocksUdpData { data, .. } => {
                8 + 4 + data.len()
            }
            Message::SocksTcpFin { .. } | Message::UdpAssociateStart { .. } => 8,
            Message::UdpAssociateReply { addr, .. } => 8 + 1 + 2 + addr.len(),
        }
    }

    /// Check that every field fits its length prefix
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Message::SocksStart { username, password } => {
                check_short_str(username)?;
                check_short_str(password)
            }
            Message::SocksTcpData { data, .. } | Message::SocksUdpData { data, .. }
                if data.len() > u32::MAX as usize =>
            {
                Err(WireError::Size(data.len()))
            }
            Message::UdpAssociateReply { addr, .. } => check_short_str(addr),
            _ => Ok(()),
        }
    }

    /// Encode the payload (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Keep(keep) => buf.put_u64(keep.ping),
            Message::SocksStart { username, password } => {
                put_short_str(buf, username);
                put_short_str(buf, password);
            }
            Message::SocksReady { ok } => buf.put_u8(*ok as u8),
            Message::SocksTcpData { seq, data } | Message::SocksUdpData { seq, data } => {
                buf.put_u64(*seq);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Message::SocksTcpFin { seq } | Message::UdpAssociateStart { seq } => buf.put_u64(*seq),
            Message::UdpAssociateReply { seq, ok, addr } => {
                buf.put_u64(*seq);
                buf.put_u8(*ok as u8);
                put_short_str(buf, addr);
            }
        }
    }

    /// Decode a payload of the given type; the whole of `buf` must be consumed
    pub fn decode(message_type: MessageType, buf: &mut Bytes) -> Result<Self, WireError> {
        let message = match message_type {
            MessageType::Keep => Message::Keep(KeepMsg { ping: get_u64(buf)? }),
            MessageType::SocksStart => Message::SocksStart {
                username: get_short_str(buf, "username")?,
                password: get_short_str(buf, "password")?,
            },
            MessageType::SocksReady => Message::SocksReady { ok: get_bool(buf)? },
            MessageType::SocksTcpData => {
                let seq = get_u64(buf)?;
                Message::SocksTcpData {
                    seq,
                    data: get_blob(buf)?,
                }
            }
            MessageType::SocksTcpFin => Message::SocksTcpFin { seq: get_u64(buf)? },
            MessageType::SocksUdpData => {
                let seq = get_u64(buf)?;
                Message::SocksUdpData {
                    seq,
                    data: get_blob(buf)?,
                }
            }
            MessageType::UdpAssociateStart => Message::UdpAssociateStart { seq: get_u64(buf)? },
            MessageType::UdpAssociateReply => Message::UdpAssociateReply {
                seq: get_u64(buf)?,
                ok: get_bool(buf)?,
                addr: get_short_str(buf, "addr")?,
            },
        };

        if buf.has_remaining() {
            return Err(WireError::Malformed);
        }
        Ok(message)
    }
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_u64())
}

fn get_bool(buf: &mut Bytes) -> Result<bool, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Incomplete);
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::Malformed),
    }
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Incomplete);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Incomplete);
    }
    Ok(buf.split_to(len))
}
