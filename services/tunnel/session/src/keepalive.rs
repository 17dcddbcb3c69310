//! Heartbeats from the admin to every known node.
//!
//! Each cycle re-resolves every node's UUID and route, so heartbeats follow
//! topology changes without restarting the loop. Nodes come back to life in
//! the next cycle as soon as they become routable again.

use anyhow::Context;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use tunnel_topology::{Resolved, Topology};
use tunnel_wire::{Frame, FrameSink, KeepMsg, Message};

/// Default time between heartbeat cycles
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Build the heartbeat frame for one resolved node
pub fn build_keep_frame(resolved: &Resolved, ping: u64) -> Frame {
    Frame::from_admin(
        resolved.uuid.clone(),
        resolved.route.clone(),
        Message::Keep(KeepMsg { ping }),
    )
}

/// Send one heartbeat cycle; returns how many nodes were reached
///
/// Unroutable nodes are skipped. A sink failure aborts the cycle.
pub async fn send_heartbeats<T, S>(topology: &T, sink: &S, ping: u64) -> anyhow::Result<usize>
where
    T: Topology + ?Sized,
    S: FrameSink + ?Sized,
{
    let mut sent = 0;
    for node in topology.nodes().await {
        let resolved = match topology.resolve(node).await {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!("Skipping heartbeat to node {}: {}", node, e);
                continue;
            }
        };
        sink.send_frame(build_keep_frame(&resolved, ping))
            .await
            .with_context(|| format!("heartbeat to node {} failed", node))?;
        sent += 1;
    }
    Ok(sent)
}

/// Send heartbeats every `interval` until the sink fails
///
/// The first cycle runs one interval after start. The ping counter starts
/// at 1 and grows by one per cycle.
pub async fn run_keepalive<T, S>(topology: &T, sink: &S, interval: Duration) -> anyhow::Result<()>
where
    T: Topology + ?Sized,
    S: FrameSink + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping: u64 = 0;

    loop {
        ticker.tick().await;
        ping += 1;
        let sent = send_heartbeats(topology, sink, ping).await?;
        trace!("Heartbeat {} sent to {} nodes", ping, sent);
    }
}
