//! Resource records owned by the manager.

use crate::handle::SocketHandle;
use crate::Seq;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Username/password pair required by a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Required username
    pub username: String,
    /// Required password
    pub password: String,
}

impl Credentials {
    /// Build credentials; an empty username and password means no authentication
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Option<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() && password.is_empty() {
            None
        } else {
            Some(Self { username, password })
        }
    }
}

/// Byte conduit between a socket-facing task and the tunnel-facing side
#[derive(Debug)]
pub(crate) struct DataChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl DataChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx: Some(rx) }
    }

    /// Hand out the receiving end; `None` once it has been claimed
    pub(crate) fn claim(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.rx.take()
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }
}

/// TCP half of a session
#[derive(Debug)]
pub(crate) struct TcpSubsession {
    pub(crate) socket: SocketHandle,
    pub(crate) channel: DataChannel,
}

/// UDP association of a session
#[derive(Debug)]
pub(crate) struct UdpSubsession {
    pub(crate) listener: SocketHandle,
    pub(crate) channel: DataChannel,
}

/// One proxied client connection
///
/// The TCP connection carries the control signalling of any UDP association,
/// so the UDP part never outlives it.
#[derive(Debug)]
pub(crate) enum Session {
    Tcp(TcpSubsession),
    TcpWithUdp {
        tcp: TcpSubsession,
        udp: UdpSubsession,
    },
}

impl Session {
    pub(crate) fn new(socket: SocketHandle, capacity: usize) -> Self {
        Session::Tcp(TcpSubsession {
            socket,
            channel: DataChannel::new(capacity),
        })
    }

    pub(crate) fn is_udp(&self) -> bool {
        matches!(self, Session::TcpWithUdp { .. })
    }

    pub(crate) fn tcp(&self) -> &TcpSubsession {
        match self {
            Session::Tcp(tcp) | Session::TcpWithUdp { tcp, .. } => tcp,
        }
    }

    pub(crate) fn tcp_mut(&mut self) -> &mut TcpSubsession {
        match self {
            Session::Tcp(tcp) | Session::TcpWithUdp { tcp, .. } => tcp,
        }
    }

    pub(crate) fn udp(&self) -> Option<&UdpSubsession> {
        match self {
            Session::Tcp(_) => None,
            Session::TcpWithUdp { udp, .. } => Some(udp),
        }
    }

    pub(crate) fn udp_mut(&mut self) -> Option<&mut UdpSubsession> {
        match self {
            Session::Tcp(_) => None,
            Session::TcpWithUdp { udp, .. } => Some(udp),
        }
    }

    /// Add a UDP association; an already associated session is returned untouched
    pub(crate) fn with_udp(
        self,
        listener: SocketHandle,
        capacity: usize,
    ) -> Result<Self, (Self, SocketHandle)> {
        match self {
            Session::Tcp(tcp) => Ok(Session::TcpWithUdp {
                tcp,
                udp: UdpSubsession {
                    listener,
                    channel: DataChannel::new(capacity),
                },
            }),
            associated => Err((associated, listener)),
        }
    }

    /// Close every resource of the session
    ///
    /// Dropping the channels' senders ends the consumers' streams.
    pub(crate) fn close(self) {
        match self {
            Session::Tcp(tcp) => tcp.socket.close(),
            Session::TcpWithUdp { tcp, udp } => {
                tcp.socket.close();
                udp.listener.close();
            }
        }
    }
}

/// A running proxy for one node
#[derive(Debug)]
pub(crate) struct ProxyInstance {
    pub(crate) port: u16,
    pub(crate) credentials: Option<crate::Credentials>,
    pub(crate) listener: SocketHandle,
    pub(crate) sessions: HashMap<Seq, Session>,
}

impl ProxyInstance {
    pub(crate) fn new(port: u16, credentials: Option<Credentials>, listener: SocketHandle) -> Self {
        Self {
            port,
            credentials,
            listener,
            sessions: HashMap::new(),
        }
    }

    /// Close the listener and every session; returns the closed sequence numbers
    pub(crate) fn close(self) -> Vec<Seq> {
        self.listener.close();
        self.sessions
            .into_iter()
            .map(|(seq, session)| {
                session.close();
                seq
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_credentials_mean_open_proxy() {
        assert_eq!(Credentials::new("", ""), None);
        let creds = Credentials::new("alice", "").unwrap();
        assert_eq!(creds.username, "alice");
        assert!(creds.password.is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_single_use() {
        let mut channel = DataChannel::new(1);
        let mut rx = channel.claim().unwrap();
        assert!(channel.claim().is_none());

        channel.sender().send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));

        drop(channel);
        assert!(rx.recv().await.is_none());
    }
}
