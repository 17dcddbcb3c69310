//! Proxy-session manager actor.
//!
//! One task owns every proxy instance, session and data channel. Callers
//! submit requests through a bounded queue; each request carries its own
//! reply sender, so a response can only ever reach the caller that asked.
//! The worker finishes one request, including the release of any channel
//! lease it handed out, before it receives the next.

use crate::handle::SocketHandle;
use crate::lease::ChannelLease;
use crate::record::{Credentials, ProxyInstance, Session};
use crate::{NodeId, Seq, SocksError};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Depth of the request queue
    pub request_queue_depth: usize,
    /// Capacity of every session data channel
    pub data_channel_capacity: usize,
    /// Upper bound on a single leased send
    pub lease_send_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_queue_depth: 32,
            data_channel_capacity: 1,
            lease_send_timeout: Duration::from_secs(10),
        }
    }
}

/// Operator-facing state of a node's proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStatus {
    /// A proxy instance is registered
    Running {
        /// Listening port
        port: u16,
        /// Required credentials, if any
        credentials: Option<Credentials>,
    },
    /// No proxy instance for the node
    NotRunning,
}

impl ProxyStatus {
    /// Whether a proxy instance exists
    pub fn is_running(&self) -> bool {
        matches!(self, ProxyStatus::Running { .. })
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyStatus::Running { port, credentials } => {
                let (username, password) = match credentials {
                    Some(creds) => (creds.username.as_str(), creds.password.as_str()),
                    None => ("<null>", "<null>"),
                };
                write!(
                    f,
                    "Socks Info ---> ListenAddr: 0.0.0.0:{}    Username: {}    Password: {}",
                    port, username, password
                )
            }
            ProxyStatus::NotRunning => write!(f, "Socks service isn't running!"),
        }
    }
}

/// Where a UDP relay for a session should be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpStartInfo {
    /// Node owning the session
    pub node: NodeId,
    /// Local IP of the session's TCP connection
    pub local_ip: IpAddr,
}

type Reply<T> = oneshot::Sender<Result<T, SocksError>>;

enum Request {
    RegisterProxy {
        node: NodeId,
        port: u16,
        credentials: Option<Credentials>,
        listener: SocketHandle,
        reply: Reply<()>,
    },
    AllocateSequence {
        node: NodeId,
        reply: oneshot::Sender<Seq>,
    },
    AttachSession {
        node: NodeId,
        seq: Seq,
        socket: SocketHandle,
        reply: Reply<()>,
    },
    AttachUdp {
        node: NodeId,
        seq: Seq,
        listener: SocketHandle,
        reply: Reply<()>,
    },
    FetchTcpChannel {
        node: NodeId,
        seq: Seq,
        reply: Reply<mpsc::Receiver<Bytes>>,
    },
    FetchUdpChannel {
        node: NodeId,
        seq: Seq,
        reply: Reply<mpsc::Receiver<Bytes>>,
    },
    FetchTcpChannelBySeq {
        seq: Seq,
        reply: Reply<ChannelLease>,
    },
    FetchUdpChannelBySeq {
        seq: Seq,
        reply: Reply<ChannelLease>,
    },
    UdpStartInfo {
        seq: Seq,
        reply: Reply<UdpStartInfo>,
    },
    DescribeProxy {
        node: NodeId,
        reply: oneshot::Sender<ProxyStatus>,
    },
    CloseSession {
        seq: Seq,
        reply: oneshot::Sender<bool>,
    },
    TeardownProxy {
        node: NodeId,
        reply: Reply<()>,
    },
    SequenceOwner {
        seq: Seq,
        reply: oneshot::Sender<Option<NodeId>>,
    },
    ListSessions {
        node: NodeId,
        reply: Reply<Vec<Seq>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the manager task
#[derive(Debug, Clone)]
pub struct SocksManager {
    sender: mpsc::Sender<Request>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Request::RegisterProxy { .. } => "RegisterProxy",
            Request::AllocateSequence { .. } => "AllocateSequence",
            Request::AttachSession { .. } => "AttachSession",
            Request::AttachUdp { .. } => "AttachUdp",
            Request::FetchTcpChannel { .. } => "FetchTcpChannel",
            Request::FetchUdpChannel { .. } => "FetchUdpChannel",
            Request::FetchTcpChannelBySeq { .. } => "FetchTcpChannelBySeq",
            Request::FetchUdpChannelBySeq { .. } => "FetchUdpChannelBySeq",
            Request::UdpStartInfo { .. } => "UdpStartInfo",
            Request::DescribeProxy { .. } => "DescribeProxy",
            Request::CloseSession { .. } => "CloseSession",
            Request::TeardownProxy { .. } => "TeardownProxy",
            Request::SequenceOwner { .. } => "SequenceOwner",
            Request::ListSessions { .. } => "ListSessions",
            Request::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SocksManager {
    /// Start the manager task
    pub fn spawn(config: ManagerConfig) -> Self {
        let (sender, requests) = mpsc::channel(config.request_queue_depth.max(1));
        let state = ManagerState::new(config);
        tokio::spawn(state.run(requests));
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SocksError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| SocksError::ManagerUnavailable)?;
        response.await.map_err(|_| SocksError::ManagerUnavailable)
    }

    /// Register the proxy instance of a node
    pub async fn register_proxy(
        &self,
        node: NodeId,
        port: u16,
        credentials: Option<Credentials>,
        listener: SocketHandle,
    ) -> Result<(), SocksError> {
        self.request(|reply| Request::RegisterProxy {
            node,
            port,
            credentials,
            listener,
            reply,
        })
        .await?
    }

    /// Allocate a fresh sequence number owned by `node`
    pub async fn allocate_sequence(&self, node: NodeId) -> Result<Seq, SocksError> {
        self.request(|reply| Request::AllocateSequence { node, reply })
            .await
    }

    /// Attach an accepted client connection as session `seq`
    pub async fn attach_session(
        &self,
        node: NodeId,
        seq: Seq,
        socket: SocketHandle,
    ) -> Result<(), SocksError> {
        self.request(|reply| Request::AttachSession {
            node,
            seq,
            socket,
            reply,
        })
        .await?
    }

    /// Add a UDP association with the given relay socket to session `seq`
    pub async fn attach_udp(
        &self,
        node: NodeId,
        seq: Seq,
        listener: SocketHandle,
    ) -> Result<(), SocksError> {
        self.request(|reply| Request::AttachUdp {
            node,
            seq,
            listener,
            reply,
        })
        .await?
    }

    /// Claim the receiving end of a session's TCP channel
    pub async fn fetch_tcp_channel(
        &self,
        node: NodeId,
        seq: Seq,
    ) -> Result<mpsc::Receiver<Bytes>, SocksError> {
        self.request(|reply| Request::FetchTcpChannel { node, seq, reply })
            .await?
    }

    /// Claim the receiving end of a session's UDP channel
    pub async fn fetch_udp_channel(
        &self,
        node: NodeId,
        seq: Seq,
    ) -> Result<mpsc::Receiver<Bytes>, SocksError> {
        self.request(|reply| Request::FetchUdpChannel { node, seq, reply })
            .await?
    }

    /// Lease the sending end of a session's TCP channel
    ///
    /// The manager is blocked until the lease is released.
    pub async fn fetch_tcp_channel_by_seq(&self, seq: Seq) -> Result<ChannelLease, SocksError> {
        self.request(|reply| Request::FetchTcpChannelBySeq { seq, reply })
            .await?
    }

    /// Lease the sending end of a session's UDP channel
    ///
    /// The manager is blocked until the lease is released.
    pub async fn fetch_udp_channel_by_seq(&self, seq: Seq) -> Result<ChannelLease, SocksError> {
        self.request(|reply| Request::FetchUdpChannelBySeq { seq, reply })
            .await?
    }

    /// Owner and local IP of a session, for opening its UDP relay
    pub async fn udp_start_info(&self, seq: Seq) -> Result<UdpStartInfo, SocksError> {
        self.request(|reply| Request::UdpStartInfo { seq, reply })
            .await?
    }

    /// Describe the proxy of a node
    pub async fn describe_proxy(&self, node: NodeId) -> Result<ProxyStatus, SocksError> {
        self.request(|reply| Request::DescribeProxy { node, reply })
            .await
    }

    /// Close session `seq`; returns whether a session was closed
    pub async fn close_session(&self, seq: Seq) -> Result<bool, SocksError> {
        self.request(|reply| Request::CloseSession { seq, reply })
            .await
    }

    /// Close a node's listener and every one of its sessions
    pub async fn teardown_proxy(&self, node: NodeId) -> Result<(), SocksError> {
        self.request(|reply| Request::TeardownProxy { node, reply })
            .await?
    }

    /// Node owning a sequence number
    pub async fn sequence_owner(&self, seq: Seq) -> Result<Option<NodeId>, SocksError> {
        self.request(|reply| Request::SequenceOwner { seq, reply })
            .await
    }

    /// Live session sequence numbers of a node, ascending
    pub async fn list_sessions(&self, node: NodeId) -> Result<Vec<Seq>, SocksError> {
        self.request(|reply| Request::ListSessions { node, reply })
            .await?
    }

    /// Tear every proxy down and stop the manager task
    pub async fn shutdown(&self) -> Result<(), SocksError> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}

struct ManagerState {
    config: ManagerConfig,
    next_seq: Seq,
    seq_owners: HashMap<Seq, NodeId>,
    proxies: HashMap<NodeId, ProxyInstance>,
}

impl ManagerState {
    fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            next_seq: 0,
            seq_owners: HashMap::new(),
            proxies: HashMap::new(),
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        debug!("Socks manager started");

        while let Some(request) = requests.recv().await {
            debug!("Handling {:?}", request);
            match request {
                Request::RegisterProxy {
                    node,
                    port,
                    credentials,
                    listener,
                    reply,
                } => {
                    let result = self.register_proxy(node, port, credentials, listener);
                    deliver(reply, result);
                }
                Request::AllocateSequence { node, reply } => {
                    deliver(reply, self.allocate_sequence(node));
                }
                Request::AttachSession {
                    node,
                    seq,
                    socket,
                    reply,
                } => {
                    deliver(reply, self.attach_session(node, seq, socket));
                }
                Request::AttachUdp {
                    node,
                    seq,
                    listener,
                    reply,
                } => {
                    deliver(reply, self.attach_udp(node, seq, listener));
                }
                Request::FetchTcpChannel { node, seq, reply } => {
                    deliver(reply, self.claim_channel(node, seq, false));
                }
                Request::FetchUdpChannel { node, seq, reply } => {
                    deliver(reply, self.claim_channel(node, seq, true));
                }
                Request::FetchTcpChannelBySeq { seq, reply } => {
                    hand_out(reply, self.lease_channel(seq, false)).await;
                }
                Request::FetchUdpChannelBySeq { seq, reply } => {
                    hand_out(reply, self.lease_channel(seq, true)).await;
                }
                Request::UdpStartInfo { seq, reply } => {
                    deliver(reply, self.udp_start_info(seq));
                }
                Request::DescribeProxy { node, reply } => {
                    deliver(reply, self.describe_proxy(node));
                }
                Request::CloseSession { seq, reply } => {
                    deliver(reply, self.close_session(seq));
                }
                Request::TeardownProxy { node, reply } => {
                    deliver(reply, self.teardown_proxy(node));
                }
                Request::SequenceOwner { seq, reply } => {
                    deliver(reply, self.seq_owners.get(&seq).copied());
                }
                Request::ListSessions { node, reply } => {
                    deliver(reply, self.list_sessions(node));
                }
                Request::Shutdown { reply } => {
                    self.teardown_all();
                    deliver(reply, ());
                    break;
                }
            }
        }

        self.teardown_all();
        debug!("Socks manager stopped");
    }

    fn register_proxy(
        &mut self,
        node: NodeId,
        port: u16,
        credentials: Option<Credentials>,
        listener: SocketHandle,
    ) -> Result<(), SocksError> {
        if self.proxies.contains_key(&node) {
            return Err(SocksError::ProxyExists(node));
        }
        info!(
            "Proxy for node {} listening on port {} ({})",
            node,
            port,
            if credentials.is_some() { "authenticated" } else { "open" }
        );
        self.proxies
            .insert(node, ProxyInstance::new(port, credentials, listener));
        Ok(())
    }

    fn allocate_sequence(&mut self, node: NodeId) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_owners.insert(seq, node);
        debug!("Allocated sequence {} for node {}", seq, node);
        seq
    }

    fn proxy_mut(&mut self, node: NodeId) -> Result<&mut ProxyInstance, SocksError> {
        self.proxies
            .get_mut(&node)
            .ok_or(SocksError::ProxyNotFound(node))
    }

    fn attach_session(
        &mut self,
        node: NodeId,
        seq: Seq,
        socket: SocketHandle,
    ) -> Result<(), SocksError> {
        if let Some(&owner) = self.seq_owners.get(&seq) {
            if owner != node {
                return Err(SocksError::ForeignSequence { seq, owner });
            }
        }
        let capacity = self.config.data_channel_capacity;
        let proxy = self.proxy_mut(node)?;
        if proxy.sessions.contains_key(&seq) {
            return Err(SocksError::SessionExists(seq));
        }
        debug!("Attached session {} ({}) to node {}", seq, socket.local_addr(), node);
        proxy.sessions.insert(seq, Session::new(socket, capacity));

        // A session is always reachable by seq, allocated or not
        self.seq_owners.insert(seq, node);
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
        Ok(())
    }

    fn attach_udp(
        &mut self,
        node: NodeId,
        seq: Seq,
        listener: SocketHandle,
    ) -> Result<(), SocksError> {
        let capacity = self.config.data_channel_capacity;
        let proxy = self.proxy_mut(node)?;
        let session = proxy
            .sessions
            .remove(&seq)
            .ok_or(SocksError::SessionNotFound(seq))?;

        let relay = listener.local_addr();
        match session.with_udp(listener, capacity) {
            Ok(session) => {
                proxy.sessions.insert(seq, session);
                debug!("Session {} of node {} relays udp on {}", seq, node, relay);
                Ok(())
            }
            Err((session, _rejected)) => {
                proxy.sessions.insert(seq, session);
                Err(SocksError::UdpAlreadyAttached(seq))
            }
        }
    }

    fn session_mut(&mut self, node: NodeId, seq: Seq) -> Result<&mut Session, SocksError> {
        self.proxy_mut(node)?
            .sessions
            .get_mut(&seq)
            .ok_or(SocksError::SessionNotFound(seq))
    }

    fn claim_channel(
        &mut self,
        node: NodeId,
        seq: Seq,
        udp: bool,
    ) -> Result<mpsc::Receiver<Bytes>, SocksError> {
        let session = self.session_mut(node, seq)?;
        let channel = if udp {
            &mut session.udp_mut().ok_or(SocksError::NotUdp(seq))?.channel
        } else {
            &mut session.tcp_mut().channel
        };
        channel.claim().ok_or(SocksError::ChannelClaimed(seq))
    }

    fn owned_session(&self, seq: Seq) -> Result<(NodeId, &Session), SocksError> {
        let node = *self
            .seq_owners
            .get(&seq)
            .ok_or(SocksError::SequenceNotFound(seq))?;
        let session = self
            .proxies
            .get(&node)
            .ok_or(SocksError::ProxyNotFound(node))?
            .sessions
            .get(&seq)
            .ok_or(SocksError::SessionNotFound(seq))?;
        Ok((node, session))
    }

    fn lease_channel(
        &self,
        seq: Seq,
        udp: bool,
    ) -> Result<(ChannelLease, oneshot::Receiver<()>), SocksError> {
        let (_, session) = self.owned_session(seq)?;
        let sender = if udp {
            session.udp().ok_or(SocksError::NotUdp(seq))?.channel.sender()
        } else {
            session.tcp().channel.sender()
        };
        Ok(ChannelLease::new(
            seq,
            sender,
            self.config.lease_send_timeout,
        ))
    }

    fn udp_start_info(&self, seq: Seq) -> Result<UdpStartInfo, SocksError> {
        let (node, session) = self.owned_session(seq)?;
        Ok(UdpStartInfo {
            node,
            local_ip: session.tcp().socket.local_addr().ip(),
        })
    }

    fn describe_proxy(&self, node: NodeId) -> ProxyStatus {
        match self.proxies.get(&node) {
            Some(proxy) => ProxyStatus::Running {
                port: proxy.port,
                credentials: proxy.credentials.clone(),
            },
            None => ProxyStatus::NotRunning,
        }
    }

    fn close_session(&mut self, seq: Seq) -> bool {
        let Some(node) = self.seq_owners.remove(&seq) else {
            debug!("Close of unknown sequence {} ignored", seq);
            return false;
        };
        let session = self
            .proxies
            .get_mut(&node)
            .and_then(|proxy| proxy.sessions.remove(&seq));

        match session {
            Some(session) => {
                let udp = session.is_udp();
                session.close();
                debug!("Closed session {} of node {} (udp: {})", seq, node, udp);
                true
            }
            None => false,
        }
    }

    fn teardown_proxy(&mut self, node: NodeId) -> Result<(), SocksError> {
        let proxy = self
            .proxies
            .remove(&node)
            .ok_or(SocksError::ProxyNotFound(node))?;
        let closed = proxy.close();
        self.seq_owners.retain(|_, owner| *owner != node);
        info!("Proxy for node {} torn down, {} sessions closed", node, closed.len());
        Ok(())
    }

    fn list_sessions(&self, node: NodeId) -> Result<Vec<Seq>, SocksError> {
        let proxy = self
            .proxies
            .get(&node)
            .ok_or(SocksError::ProxyNotFound(node))?;
        let mut seqs: Vec<Seq> = proxy.sessions.keys().copied().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn teardown_all(&mut self) {
        let nodes: Vec<NodeId> = self.proxies.keys().copied().collect();
        for node in nodes {
            let _ = self.teardown_proxy(node);
        }
        self.seq_owners.clear();
    }
}

fn deliver<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        warn!("Socks manager caller went away before its reply");
    }
}

/// Reply with a lease and wait until the holder is done with it
async fn hand_out(
    reply: Reply<ChannelLease>,
    outcome: Result<(ChannelLease, oneshot::Receiver<()>), SocksError>,
) {
    match outcome {
        Ok((lease, released)) => {
            let seq = lease.seq();
            if reply.send(Ok(lease)).is_err() {
                warn!("Lease on session {} was not collected", seq);
                return;
            }
            // Resolves with an error once the lease is dropped
            let _ = released.await;
        }
        Err(e) => deliver(reply, Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{listener_handle, tcp_pair};
    use crate::ErrorKind;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;
    use tokio::net::UdpSocket;

    async fn manager_with_proxy(node: NodeId) -> SocksManager {
        let manager = SocksManager::spawn(ManagerConfig::default());
        let (_listener, handle) = listener_handle().await;
        manager
            .register_proxy(node, 1080, None, handle)
            .await
            .unwrap();
        manager
    }

    async fn udp_handle() -> (UdpSocket, SocketHandle) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handle = SocketHandle::from_udp_socket(&socket).unwrap();
        (socket, handle)
    }

    #[tokio::test]
    async fn test_register_once_until_teardown() {
        let manager = manager_with_proxy(1).await;

        let (_listener, handle) = listener_handle().await;
        let err = manager
            .register_proxy(1, 1081, None, handle)
            .await
            .unwrap_err();
        assert_eq!(err, SocksError::ProxyExists(1));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        manager.teardown_proxy(1).await.unwrap();

        let (_listener, handle) = listener_handle().await;
        manager
            .register_proxy(1, 1082, None, handle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequences_increase_per_caller() {
        let manager = manager_with_proxy(1).await;

        let mut previous = None;
        for i in 0..5 {
            let node = i % 2 + 1;
            let seq = manager.allocate_sequence(node).await.unwrap();
            if let Some(previous) = previous {
                assert!(seq > previous);
            }
            assert_eq!(manager.sequence_owner(seq).await.unwrap(), Some(node));
            previous = Some(seq);
        }
    }

    #[tokio::test]
    async fn test_tcp_session_lifecycle() {
        let manager = manager_with_proxy(1).await;
        let (_client, server) = tcp_pair().await;

        let seq = manager.allocate_sequence(1).await.unwrap();
        assert_eq!(seq, 0);
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();
        let mut rx = manager.fetch_tcp_channel(1, seq).await.unwrap();

        let lease = manager.fetch_tcp_channel_by_seq(seq).await.unwrap();
        assert_eq!(lease.seq(), seq);
        lease.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        assert!(manager.close_session(seq).await.unwrap());
        assert!(rx.recv().await.is_none());

        let err = manager.fetch_tcp_channel_by_seq(seq).await.unwrap_err();
        assert_eq!(err, SocksError::SequenceNotFound(seq));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_udp_on_unattached_sequence_fails() {
        let manager = manager_with_proxy(1).await;
        let (_udp, handle) = udp_handle().await;

        let err = manager.attach_udp(1, 1, handle).await.unwrap_err();
        assert_eq!(err, SocksError::SessionNotFound(1));

        let (_udp, handle) = udp_handle().await;
        let err = manager.attach_udp(2, 1, handle).await.unwrap_err();
        assert_eq!(err, SocksError::ProxyNotFound(2));
    }

    #[tokio::test]
    async fn test_udp_association_and_cascade() {
        let manager = manager_with_proxy(1).await;
        let (mut client, server) = tcp_pair().await;
        let local_ip = server.local_addr().unwrap().ip();

        let seq = manager.allocate_sequence(1).await.unwrap();
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();

        assert_eq!(
            manager.fetch_udp_channel_by_seq(seq).await.unwrap_err(),
            SocksError::NotUdp(seq)
        );
        assert_eq!(
            manager.fetch_udp_channel(1, seq).await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        let (_udp, handle) = udp_handle().await;
        manager.attach_udp(1, seq, handle).await.unwrap();
        let (_udp2, handle) = udp_handle().await;
        assert_eq!(
            manager.attach_udp(1, seq, handle).await.unwrap_err(),
            SocksError::UdpAlreadyAttached(seq)
        );

        let info = manager.udp_start_info(seq).await.unwrap();
        assert_eq!(info, UdpStartInfo { node: 1, local_ip });

        let mut tcp_rx = manager.fetch_tcp_channel(1, seq).await.unwrap();
        let mut udp_rx = manager.fetch_udp_channel(1, seq).await.unwrap();
        assert_eq!(
            manager.fetch_udp_channel(1, seq).await.unwrap_err(),
            SocksError::ChannelClaimed(seq)
        );

        assert!(manager.close_session(seq).await.unwrap());
        assert!(tcp_rx.recv().await.is_none());
        assert!(udp_rx.recv().await.is_none());
        assert_eq!(manager.sequence_owner(seq).await.unwrap(), None);
        assert!(manager.udp_start_info(seq).await.unwrap_err().is_not_found());

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_teardown_clears_everything() {
        let manager = manager_with_proxy(1).await;
        let (_listener, handle) = listener_handle().await;
        manager.register_proxy(2, 2080, None, handle).await.unwrap();

        let mut clients = Vec::new();
        let mut node1_seqs = Vec::new();
        for _ in 0..3 {
            let (client, server) = tcp_pair().await;
            let seq = manager.allocate_sequence(1).await.unwrap();
            manager
                .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
                .await
                .unwrap();
            clients.push((client, server));
            node1_seqs.push(seq);
        }
        let orphan = manager.allocate_sequence(1).await.unwrap();
        let other = manager.allocate_sequence(2).await.unwrap();

        assert_eq!(manager.list_sessions(1).await.unwrap(), node1_seqs);

        manager.teardown_proxy(1).await.unwrap();

        for seq in node1_seqs.iter().chain([&orphan]) {
            assert_eq!(manager.sequence_owner(*seq).await.unwrap(), None);
        }
        assert_eq!(manager.sequence_owner(other).await.unwrap(), Some(2));
        assert_eq!(manager.describe_proxy(1).await.unwrap(), ProxyStatus::NotRunning);
        assert_eq!(
            manager.list_sessions(1).await.unwrap_err(),
            SocksError::ProxyNotFound(1)
        );
        assert!(manager.describe_proxy(2).await.unwrap().is_running());

        for (client, _server) in clients.iter_mut() {
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_teardown_unknown_node_is_clean() {
        let manager = manager_with_proxy(1).await;
        let seq = manager.allocate_sequence(1).await.unwrap();

        assert_eq!(
            manager.teardown_proxy(9).await.unwrap_err(),
            SocksError::ProxyNotFound(9)
        );
        assert!(manager.describe_proxy(1).await.unwrap().is_running());
        assert_eq!(manager.sequence_owner(seq).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = manager_with_proxy(1).await;
        let (_client, server) = tcp_pair().await;
        let seq = manager.allocate_sequence(1).await.unwrap();
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();

        assert!(manager.close_session(seq).await.unwrap());
        assert!(!manager.close_session(seq).await.unwrap());
        assert!(!manager.close_session(12345).await.unwrap());

        let unattached = manager.allocate_sequence(1).await.unwrap();
        assert!(!manager.close_session(unattached).await.unwrap());
        assert_eq!(manager.sequence_owner(unattached).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_attach_rejected() {
        let manager = manager_with_proxy(1).await;
        let (_c1, s1) = tcp_pair().await;
        let (_c2, s2) = tcp_pair().await;
        let seq = manager.allocate_sequence(1).await.unwrap();

        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&s1).unwrap())
            .await
            .unwrap();
        assert_eq!(
            manager
                .attach_session(1, seq, SocketHandle::from_tcp_stream(&s2).unwrap())
                .await
                .unwrap_err(),
            SocksError::SessionExists(seq)
        );
        assert_eq!(
            manager
                .attach_session(3, seq + 1, SocketHandle::from_tcp_stream(&s2).unwrap())
                .await
                .unwrap_err(),
            SocksError::ProxyNotFound(3)
        );
    }

    #[tokio::test]
    async fn test_attach_under_wrong_node_rejected() {
        let manager = manager_with_proxy(1).await;
        let (_listener, handle) = listener_handle().await;
        manager.register_proxy(2, 1081, None, handle).await.unwrap();
        let (_client, server) = tcp_pair().await;

        let seq = manager.allocate_sequence(2).await.unwrap();
        let err = manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, SocksError::ForeignSequence { seq, owner: 2 });
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(manager.list_sessions(1).await.unwrap().is_empty());
        assert_eq!(manager.sequence_owner(seq).await.unwrap(), Some(2));

        assert!(!manager.close_session(seq).await.unwrap());
        assert!(manager.list_sessions(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unallocated_attach_is_closable_by_seq() {
        let manager = manager_with_proxy(1).await;
        let (_client, server) = tcp_pair().await;

        manager
            .attach_session(1, 7, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();
        assert_eq!(manager.sequence_owner(7).await.unwrap(), Some(1));
        assert_eq!(manager.allocate_sequence(1).await.unwrap(), 8);

        assert!(manager.close_session(7).await.unwrap());
        assert_eq!(manager.list_sessions(1).await.unwrap(), Vec::<Seq>::new());
        assert_eq!(manager.sequence_owner(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_describe_proxy_text() {
        let manager = SocksManager::spawn(ManagerConfig::default());
        let (_l1, h1) = listener_handle().await;
        let (_l2, h2) = listener_handle().await;
        manager.register_proxy(1, 1080, None, h1).await.unwrap();
        manager
            .register_proxy(2, 7777, Credentials::new("user", "secret"), h2)
            .await
            .unwrap();

        assert_eq!(
            manager.describe_proxy(1).await.unwrap().to_string(),
            "Socks Info ---> ListenAddr: 0.0.0.0:1080    Username: <null>    Password: <null>"
        );
        assert_eq!(
            manager.describe_proxy(2).await.unwrap().to_string(),
            "Socks Info ---> ListenAddr: 0.0.0.0:7777    Username: user    Password: secret"
        );
        assert_eq!(
            manager.describe_proxy(3).await.unwrap().to_string(),
            "Socks service isn't running!"
        );
    }

    #[tokio::test]
    async fn test_outstanding_lease_holds_back_close() {
        let manager = manager_with_proxy(1).await;
        let (_client, server) = tcp_pair().await;
        let seq = manager.allocate_sequence(1).await.unwrap();
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();
        let mut rx = manager.fetch_tcp_channel(1, seq).await.unwrap();

        let lease = manager.fetch_tcp_channel_by_seq(seq).await.unwrap();

        let closer = manager.clone();
        let close = tokio::spawn(async move { closer.close_session(seq).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!close.is_finished());

        lease.send(Bytes::from_static(b"last")).await.unwrap();
        assert!(close.await.unwrap().unwrap());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stuck_consumer_times_out_lease() {
        let manager = SocksManager::spawn(ManagerConfig {
            lease_send_timeout: Duration::from_millis(50),
            ..ManagerConfig::default()
        });
        let (_listener, handle) = listener_handle().await;
        manager.register_proxy(1, 1080, None, handle).await.unwrap();
        let (_client, server) = tcp_pair().await;
        let seq = manager.allocate_sequence(1).await.unwrap();
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();
        let _rx = manager.fetch_tcp_channel(1, seq).await.unwrap();

        let lease = manager.fetch_tcp_channel_by_seq(seq).await.unwrap();
        lease.send(Bytes::from_static(b"fills")).await.unwrap();
        let lease = manager.fetch_tcp_channel_by_seq(seq).await.unwrap();
        assert_eq!(
            lease.send(Bytes::from_static(b"stuck")).await,
            Err(SocksError::LeaseTimeout(seq))
        );

        assert!(manager.close_session(seq).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_their_own_replies() {
        let manager = SocksManager::spawn(ManagerConfig::default());
        for node in 0..4u64 {
            let (_listener, handle) = listener_handle().await;
            manager
                .register_proxy(node, 1000 + node as u16, None, handle)
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for caller in 0..64u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let node = caller % 4;
                let mut seqs = Vec::new();
                for _ in 0..20 {
                    let seq = manager.allocate_sequence(node).await.unwrap();
                    assert_eq!(manager.sequence_owner(seq).await.unwrap(), Some(node));
                    match manager.describe_proxy(node).await.unwrap() {
                        ProxyStatus::Running { port, .. } => {
                            assert_eq!(port, 1000 + node as u16)
                        }
                        ProxyStatus::NotRunning => panic!("node {} lost its proxy", node),
                    }
                    seqs.push(seq);
                }
                seqs
            }));
        }

        let mut all = HashSet::new();
        for task in tasks {
            let seqs = task.await.unwrap();
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
            for seq in seqs {
                assert!(all.insert(seq));
            }
        }
        assert_eq!(all.len(), 64 * 20);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_manager() {
        let manager = manager_with_proxy(1).await;
        let (mut client, server) = tcp_pair().await;
        let seq = manager.allocate_sequence(1).await.unwrap();
        manager
            .attach_session(1, seq, SocketHandle::from_tcp_stream(&server).unwrap())
            .await
            .unwrap();

        manager.shutdown().await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(
            manager.allocate_sequence(1).await.unwrap_err(),
            SocksError::ManagerUnavailable
        );
    }
}
