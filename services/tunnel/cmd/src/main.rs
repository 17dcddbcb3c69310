//! Tunnel admin binary.
//!
//! Waits for the first agent to connect, then runs the session manager,
//! the configured proxies, the heartbeat loop and the inbound dispatcher
//! over that single tunnel connection.

use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnel_session::{run_keepalive, LinkConfig, TunnelLink};
use tunnel_socks::{start_proxy, Credentials, ProxyContext, SocksDispatcher, SocksError, SocksManager};
use tunnel_topology::SharedTopology;
use tunnel_wire::FrameSink;

mod config;
mod logging;

use config::{AdminConfig, ProxyConfig};
use logging::TunnelLogFormatter;

/// Tunnel admin: local SOCKS proxies tunneled to remote agents
#[derive(Parser, Debug)]
#[command(name = "tunnel-admin", version, about = "Admin side of a multi-hop tunnel")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "tunnel.yaml")]
    config: PathBuf,

    /// Address to wait for the agent on, e.g. 0.0.0.0:9999
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Heartbeat interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Upper bound on a single delivery into a session, e.g. 10s
    #[arg(long)]
    lease_timeout: Option<humantime::Duration>,

    /// Start a proxy to the first agent on this local port
    #[arg(long)]
    socks_port: Option<u16>,

    /// Username required by the --socks-port proxy
    #[arg(long, default_value = "", requires = "socks_port")]
    socks_username: String,

    /// Password required by the --socks-port proxy
    #[arg(long, default_value = "", requires = "socks_port")]
    socks_password: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "tunnel_admin",
        "tunnel_socks",
        "tunnel_session",
        "tunnel_wire",
        "tunnel_topology",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(TunnelLogFormatter::new("tunnel-admin"))
        .init();

    info!("Starting tunnel admin v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AdminConfig::load_from_file(&args.config)?;
    apply_args(&mut config, &args);

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let listener = TcpListener::bind(config.listen_addr).await?;
    component_info!("link", "Waiting for agent on {}", config.listen_addr);

    let (stream, peer) = tokio::select! {
        accepted = listener.accept() => accepted?,
        _ = sigterm.recv() => return Ok(()),
        _ = sigint.recv() => return Ok(()),
    };
    drop(listener);

    let topology = SharedTopology::default();
    let (node, uuid) = topology.write().await.add_node(None)?;
    component_info!("link", "Agent {} connected as node {} ({})", peer, node, uuid);

    let mut link = TunnelLink::spawn(stream, LinkConfig::default());
    let sink: Arc<dyn FrameSink> = Arc::new(link.sender.clone());

    let manager = SocksManager::spawn(config.manager_config());
    let ctx = ProxyContext::new(manager.clone(), sink.clone(), Arc::new(topology.clone()));

    let mut keepalive = {
        let topology = topology.clone();
        let sink = sink.clone();
        let interval = config.heartbeat_interval();
        tokio::spawn(async move { run_keepalive(&topology, sink.as_ref(), interval).await })
    };

    for proxy in &config.proxies {
        launch_proxy(&ctx, proxy).await;
    }

    let dispatcher = SocksDispatcher::new(ctx);
    info!("Tunnel admin started. Waiting for frames...");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            finished = &mut keepalive => {
                match finished {
                    Ok(Err(e)) => component_error!("keepalive", "Heartbeats stopped: {:#}", e),
                    Ok(Ok(())) => {}
                    Err(e) => component_error!("keepalive", "Heartbeat task failed: {}", e),
                }
                break;
            }
            frame = link.reader.next_frame() => match frame {
                Ok(Some(frame)) => {
                    component_debug!(
                        "link",
                        "Received {:?} from {}",
                        frame.header.message_type,
                        frame.header.sender
                    );
                    match dispatcher.handle(frame.message).await {
                        Ok(()) => {}
                        Err(SocksError::ManagerUnavailable) => {
                            component_error!("socks", "Session manager stopped");
                            break;
                        }
                        Err(e) => component_warn!("socks", "Dispatch failed: {}", e),
                    }
                }
                Ok(None) => {
                    component_info!("link", "Agent {} closed the tunnel", peer);
                    break;
                }
                Err(e) => {
                    component_error!("link", "Tunnel read failed: {:#}", e);
                    break;
                }
            }
        }
    }

    if let Err(e) = manager.shutdown().await {
        component_warn!("socks", "Session manager shutdown: {}", e);
    }
    keepalive.abort();
    drop(dispatcher);
    drop(sink);

    let TunnelLink { sender, writer, .. } = link;
    drop(sender);
    match tokio::time::timeout(Duration::from_secs(5), writer).await {
        Ok(Ok(Ok(stats))) => info!(
            "Tunnel writer flushed {} frames ({} bytes)",
            stats.frames_sent, stats.bytes_out
        ),
        Ok(Ok(Err(e))) => component_warn!("link", "Tunnel writer failed: {:#}", e),
        Ok(Err(e)) => component_warn!("link", "Tunnel writer task failed: {}", e),
        Err(_) => component_warn!("link", "Tunnel writer did not stop in time"),
    }

    info!("Tunnel admin shutdown complete");
    Ok(())
}

/// Command-line flags override the file and the environment
fn apply_args(config: &mut AdminConfig, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(interval) = &args.heartbeat_interval {
        config.heartbeat_secs = interval.as_secs();
    }
    if let Some(timeout) = &args.lease_timeout {
        config.lease_timeout_secs = timeout.as_secs();
    }
    if let Some(port) = args.socks_port {
        config.proxies.push(ProxyConfig {
            node: 0,
            port,
            username: args.socks_username.clone(),
            password: args.socks_password.clone(),
        });
    }
}

async fn launch_proxy(ctx: &ProxyContext, proxy: &ProxyConfig) {
    let credentials: Option<Credentials> = proxy.credentials();
    match start_proxy(ctx.clone(), proxy.node, proxy.port, credentials).await {
        Ok(addr) => {
            let status = ctx
                .manager
                .describe_proxy(proxy.node)
                .await
                .map(|status| status.to_string())
                .unwrap_or_else(|e| e.to_string());
            component_info!("socks", "Node {} proxy on {}: {}", proxy.node, addr, status);
        }
        Err(e) => component_warn!(
            "socks",
            "Proxy for node {} on port {} not started: {}",
            proxy.node,
            proxy.port,
            e
        ),
    }
}
