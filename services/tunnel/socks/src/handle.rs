//! OS-level socket handles owned by the manager.
//!
//! A [`SocketHandle`] is an independent duplicate of a socket descriptor.
//! The task that uses the socket keeps the tokio object; the manager keeps
//! the handle and is the only party that ever closes it. Closing shuts the
//! socket down in both directions, which wakes every task blocked on it,
//! and fires the optional close signal.

use socket2::{SockRef, Socket};
use std::io;
use std::net::{Shutdown, SocketAddr};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tracing::trace;

/// What kind of socket a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Accepted client connection
    TcpStream,
    /// Local proxy listener
    TcpListener,
    /// UDP relay socket
    Udp,
}

/// Owned duplicate of a socket, closed only by the manager
#[derive(Debug)]
pub struct SocketHandle {
    socket: Socket,
    kind: HandleKind,
    local_addr: SocketAddr,
    close_signal: Option<oneshot::Sender<()>>,
}

impl SocketHandle {
    /// Duplicate an accepted TCP connection
    pub fn from_tcp_stream(stream: &TcpStream) -> io::Result<Self> {
        Self::duplicate(SockRef::from(stream), HandleKind::TcpStream)
    }

    /// Duplicate a TCP listener
    pub fn from_tcp_listener(listener: &TcpListener) -> io::Result<Self> {
        Self::duplicate(SockRef::from(listener), HandleKind::TcpListener)
    }

    /// Duplicate a UDP socket
    pub fn from_udp_socket(socket: &UdpSocket) -> io::Result<Self> {
        Self::duplicate(SockRef::from(socket), HandleKind::Udp)
    }

    fn duplicate(sock: SockRef<'_>, kind: HandleKind) -> io::Result<Self> {
        let socket = sock.try_clone()?;
        let local_addr = socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket")
        })?;

        Ok(Self {
            socket,
            kind,
            local_addr,
            close_signal: None,
        })
    }

    /// Receiver that resolves once the handle is closed
    ///
    /// Only one watcher is kept; calling this again replaces the previous one.
    pub fn watch_close(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.close_signal = Some(tx);
        rx
    }

    /// Socket kind
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Local address captured when the handle was created
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the socket down and release the duplicate; failures are ignored
    pub(crate) fn close(mut self) {
        // Unconnected UDP sockets report ENOTCONN here but are still woken
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!("Shutdown of {:?} {} reported {}", self.kind, self.local_addr, e);
        }
        if let Some(signal) = self.close_signal.take() {
            let _ = signal.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_close_reaches_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let handle = SocketHandle::from_tcp_stream(&server).unwrap();
        assert_eq!(handle.kind(), HandleKind::TcpStream);
        assert_eq!(handle.local_addr(), server.local_addr().unwrap());

        handle.close();

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_signal_fires() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut handle = SocketHandle::from_udp_socket(&socket).unwrap();
        let closed = handle.watch_close();

        handle.close();
        assert!(closed.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_socket_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = SocketHandle::from_tcp_listener(&listener).unwrap();
        assert_eq!(handle.local_addr(), addr);
        drop(handle);

        let connect = TcpStream::connect(addr);
        let (client, accepted) = tokio::join!(connect, listener.accept());
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }
}
