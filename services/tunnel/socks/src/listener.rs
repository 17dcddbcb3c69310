//! Local proxy listeners.
//!
//! Each node's proxy is a TCP listener on all interfaces. Accepted clients
//! become manager sessions and their bytes are relayed through the tunnel;
//! the SOCKS handshake itself is spoken by the remote agent.

use crate::forward;
use crate::handle::SocketHandle;
use crate::manager::SocksManager;
use crate::record::Credentials;
use crate::{NodeId, SocksError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use tunnel_topology::Topology;
use tunnel_wire::{Frame, FrameSink, Message};

/// Everything a proxy component needs to reach the manager and the tunnel
#[derive(Clone)]
pub struct ProxyContext {
    /// Session manager handle
    pub manager: SocksManager,
    /// Outbound tunnel frames
    pub sink: Arc<dyn FrameSink>,
    /// Node resolution
    pub topology: Arc<dyn Topology>,
}

impl ProxyContext {
    /// Bundle the collaborators
    pub fn new(
        manager: SocksManager,
        sink: Arc<dyn FrameSink>,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Self {
            manager,
            sink,
            topology,
        }
    }

    /// Send one message from the admin to a node along its current route
    pub async fn send_to(&self, node: NodeId, message: Message) -> Result<(), SocksError> {
        let resolved = self
            .topology
            .resolve(node)
            .await
            .map_err(|e| SocksError::Unroutable {
                node,
                reason: e.to_string(),
            })?;
        self.sink
            .send_frame(Frame::from_admin(resolved.uuid, resolved.route, message))
            .await?;
        Ok(())
    }
}

/// Start the proxy of a node on `0.0.0.0:port` and announce it to the node
///
/// Port 0 picks an ephemeral port. Returns the bound address.
pub async fn start_proxy(
    ctx: ProxyContext,
    node: NodeId,
    port: u16,
    credentials: Option<Credentials>,
) -> Result<SocketAddr, SocksError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    let local_addr = listener.local_addr()?;
    let mut handle = SocketHandle::from_tcp_listener(&listener)?;
    let closed = handle.watch_close();

    ctx.manager
        .register_proxy(node, local_addr.port(), credentials.clone(), handle)
        .await?;

    let (username, password) = credentials
        .map(|creds| (creds.username, creds.password))
        .unwrap_or_default();
    if let Err(e) = ctx
        .send_to(node, Message::SocksStart { username, password })
        .await
    {
        let _ = ctx.manager.teardown_proxy(node).await;
        return Err(e);
    }

    info!("Proxy for node {} started on {}", node, local_addr);
    tokio::spawn(accept_loop(ctx, node, listener, closed));
    Ok(local_addr)
}

async fn accept_loop(
    ctx: ProxyContext,
    node: NodeId,
    listener: TcpListener,
    mut closed: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut closed => {
                debug!("Listener of node {} closed", node);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = admit(&ctx, node, stream).await {
                        warn!("Rejected client {} of node {}: {}", peer, node, e);
                    }
                }
                Err(e) => {
                    debug!("Accept on node {} proxy stopped: {}", node, e);
                    break;
                }
            }
        }
    }
}

async fn admit(ctx: &ProxyContext, node: NodeId, stream: TcpStream) -> Result<(), SocksError> {
    let handle = SocketHandle::from_tcp_stream(&stream)?;
    let seq = ctx.manager.allocate_sequence(node).await?;

    let claimed = match ctx.manager.attach_session(node, seq, handle).await {
        Ok(()) => ctx.manager.fetch_tcp_channel(node, seq).await,
        Err(e) => Err(e),
    };

    match claimed {
        Ok(downstream) => {
            debug!("Node {} session {} opened", node, seq);
            forward::spawn_tcp(ctx.clone(), node, seq, stream, downstream);
            Ok(())
        }
        Err(e) => {
            let _ = ctx.manager.close_session(seq).await;
            Err(e)
        }
    }
}
