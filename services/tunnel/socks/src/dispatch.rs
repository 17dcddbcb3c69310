//! Tunnel-side demultiplexing of proxy traffic.
//!
//! Inbound payloads only carry a sequence number; the manager's sequence
//! registry tells which session, and which node, they belong to.

use crate::forward;
use crate::handle::SocketHandle;
use crate::listener::ProxyContext;
use crate::manager::UdpStartInfo;
use crate::{Seq, SocksError};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tunnel_wire::Message;

/// Routes inbound tunnel messages to proxy sessions
#[derive(Clone)]
pub struct SocksDispatcher {
    ctx: ProxyContext,
}

impl SocksDispatcher {
    /// Create a dispatcher over the shared proxy context
    pub fn new(ctx: ProxyContext) -> Self {
        Self { ctx }
    }

    /// Handle one inbound message
    ///
    /// Traffic for sessions that no longer exist is dropped. Errors are
    /// returned only when the manager or the tunnel itself fails.
    pub async fn handle(&self, message: Message) -> Result<(), SocksError> {
        match message {
            Message::SocksTcpData { seq, data } => self.deliver(seq, data, false).await,
            Message::SocksUdpData { seq, data } => self.deliver(seq, data, true).await,
            Message::SocksTcpFin { seq } => {
                let closed = self.ctx.manager.close_session(seq).await?;
                debug!("Remote fin for session {} (live: {})", seq, closed);
                Ok(())
            }
            Message::UdpAssociateStart { seq } => self.associate_udp(seq).await,
            Message::SocksReady { ok } => {
                if ok {
                    info!("Remote socks service is ready");
                } else {
                    warn!("Remote socks service failed to start");
                }
                Ok(())
            }
            other => {
                debug!("Ignoring {:?} message", other.message_type());
                Ok(())
            }
        }
    }

    async fn deliver(&self, seq: Seq, data: Bytes, udp: bool) -> Result<(), SocksError> {
        let leased = if udp {
            self.ctx.manager.fetch_udp_channel_by_seq(seq).await
        } else {
            self.ctx.manager.fetch_tcp_channel_by_seq(seq).await
        };
        let lease = match leased {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => {
                debug!("Dropping {} bytes for session {}: {}", data.len(), seq, e);
                return Ok(());
            }
            Err(SocksError::NotUdp(_)) => {
                debug!("Dropping datagram for tcp-only session {}", seq);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match lease.send(data).await {
            Ok(()) => Ok(()),
            Err(SocksError::LeaseTimeout(_)) => {
                warn!("Session {} stalled, closing it", seq);
                self.close_and_notify(seq).await
            }
            Err(SocksError::ChannelClosed(_)) => {
                debug!("Consumer of session {} is gone", seq);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close_and_notify(&self, seq: Seq) -> Result<(), SocksError> {
        let owner = self.ctx.manager.sequence_owner(seq).await?;
        if self.ctx.manager.close_session(seq).await? {
            if let Some(node) = owner {
                self.ctx.send_to(node, Message::SocksTcpFin { seq }).await?;
            }
        }
        Ok(())
    }

    async fn associate_udp(&self, seq: Seq) -> Result<(), SocksError> {
        let info = match self.ctx.manager.udp_start_info(seq).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                debug!("Udp association for unknown session {} ignored", seq);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reply = match self.open_relay(seq, info).await {
            Ok(addr) => Message::UdpAssociateReply {
                seq,
                ok: true,
                addr: addr.to_string(),
            },
            Err(e) => {
                warn!("Udp relay for session {} not opened: {}", seq, e);
                Message::UdpAssociateReply {
                    seq,
                    ok: false,
                    addr: String::new(),
                }
            }
        };
        self.ctx.send_to(info.node, reply).await
    }

    async fn open_relay(&self, seq: Seq, info: UdpStartInfo) -> Result<SocketAddr, SocksError> {
        let socket = UdpSocket::bind((info.local_ip, 0)).await?;
        let addr = socket.local_addr()?;
        let mut handle = SocketHandle::from_udp_socket(&socket)?;
        let closed = handle.watch_close();

        self.ctx.manager.attach_udp(info.node, seq, handle).await?;
        let downstream = self.ctx.manager.fetch_udp_channel(info.node, seq).await?;
        forward::spawn_udp(self.ctx.clone(), info.node, seq, socket, downstream, closed);

        debug!("Session {} of node {} relays udp on {}", seq, info.node, addr);
        Ok(addr)
    }
}
