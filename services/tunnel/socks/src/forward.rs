//! Byte pumps between local sockets and the tunnel.

use crate::listener::ProxyContext;
use crate::{NodeId, Seq};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use tunnel_wire::Message;

const TCP_READ_BUFFER: usize = 16 * 1024;
const UDP_READ_BUFFER: usize = 64 * 1024;

/// Relay a proxied TCP client through the tunnel
pub(crate) fn spawn_tcp(
    ctx: ProxyContext,
    node: NodeId,
    seq: Seq,
    stream: TcpStream,
    downstream: mpsc::Receiver<Bytes>,
) {
    let (reader, writer) = stream.into_split();
    tokio::spawn(drain_downstream(seq, writer, downstream));
    tokio::spawn(pump_upstream(ctx, node, seq, reader));
}

async fn drain_downstream(seq: Seq, mut writer: OwnedWriteHalf, mut downstream: mpsc::Receiver<Bytes>) {
    while let Some(data) = downstream.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!("Write to client of session {} failed: {}", seq, e);
            break;
        }
    }
    trace!("Downstream of session {} finished", seq);
}

async fn pump_upstream(ctx: ProxyContext, node: NodeId, seq: Seq, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; TCP_READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = ctx.send_to(node, Message::SocksTcpData { seq, data }).await {
                    warn!("Session {} lost its tunnel: {}", seq, e);
                    break;
                }
            }
            Err(e) => {
                debug!("Read from client of session {} failed: {}", seq, e);
                break;
            }
        }
    }

    // A session already closed from the tunnel side needs no fin
    match ctx.manager.close_session(seq).await {
        Ok(true) => {
            if let Err(e) = ctx.send_to(node, Message::SocksTcpFin { seq }).await {
                debug!("Fin for session {} not sent: {}", seq, e);
            }
        }
        Ok(false) => {}
        Err(e) => debug!("Close of session {} failed: {}", seq, e),
    }
    trace!("Upstream of session {} finished", seq);
}

/// Relay datagrams of a session's UDP association through the tunnel
pub(crate) fn spawn_udp(
    ctx: ProxyContext,
    node: NodeId,
    seq: Seq,
    socket: UdpSocket,
    downstream: mpsc::Receiver<Bytes>,
    closed: oneshot::Receiver<()>,
) {
    tokio::spawn(relay_udp(ctx, node, seq, socket, downstream, closed));
}

async fn relay_udp(
    ctx: ProxyContext,
    node: NodeId,
    seq: Seq,
    socket: UdpSocket,
    mut downstream: mpsc::Receiver<Bytes>,
    mut closed: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; UDP_READ_BUFFER];
    let mut client: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            _ = &mut closed => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    client = Some(from);
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if let Err(e) = ctx.send_to(node, Message::SocksUdpData { seq, data }).await {
                        warn!("Udp relay of session {} lost its tunnel: {}", seq, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Udp relay of session {} failed: {}", seq, e);
                    break;
                }
            },
            datagram = downstream.recv() => match datagram {
                Some(datagram) => match client {
                    Some(addr) => {
                        if let Err(e) = socket.send_to(&datagram, addr).await {
                            debug!("Datagram to {} for session {} dropped: {}", addr, seq, e);
                        }
                    }
                    None => debug!("Datagram for session {} dropped, no client yet", seq),
                },
                None => break,
            },
        }
    }
    trace!("Udp relay of session {} finished", seq);
}
