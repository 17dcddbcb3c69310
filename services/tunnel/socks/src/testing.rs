//! Shared fixtures for the crate's tests.

use crate::SocketHandle;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tunnel_topology::{NodeId, Resolved, Topology, TopologyError};
use tunnel_wire::{Frame, FrameSink, Message, WireError};

/// Frame sink that keeps everything it is given
#[derive(Default)]
pub(crate) struct Recorder {
    frames: Mutex<Vec<Frame>>,
}

impl Recorder {
    pub(crate) async fn messages(&self) -> Vec<Message> {
        self.frames
            .lock()
            .await
            .iter()
            .map(|frame| frame.message.clone())
            .collect()
    }

    pub(crate) async fn frames(&self) -> Vec<Frame> {
        self.frames.lock().await.clone()
    }
}

#[async_trait]
impl FrameSink for Recorder {
    async fn send_frame(&self, frame: Frame) -> Result<(), WireError> {
        self.frames.lock().await.push(frame);
        Ok(())
    }
}

/// Topology where every node `n` is `node-n` one hop behind `relay`
pub(crate) struct FlatTopology;

#[async_trait]
impl Topology for FlatTopology {
    async fn resolve(&self, node: NodeId) -> Result<Resolved, TopologyError> {
        if node >= 8 {
            return Err(TopologyError::UnknownNode(node));
        }
        Ok(Resolved {
            uuid: format!("node-{}", node),
            route: "relay".to_string(),
        })
    }

    async fn nodes(&self) -> Vec<NodeId> {
        (0..8).collect()
    }
}

/// Connected loopback pair: (client side, accepted side)
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Bound loopback listener and its handle
pub(crate) async fn listener_handle() -> (TcpListener, SocketHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = SocketHandle::from_tcp_listener(&listener).unwrap();
    (listener, handle)
}

/// Poll `check` until it yields `Some`, failing the test after two seconds
pub(crate) async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
