//! Configuration handling for the tunnel admin.
//!
//! Settings come from a YAML file, then environment variables, then the
//! command line (applied in `main`). A missing or unreadable file falls back
//! to defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tunnel_socks::{Credentials, ManagerConfig, NodeId};

/// Tunnel admin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Address the first agent connects to
    pub listen_addr: SocketAddr,
    /// Seconds between heartbeat cycles
    pub heartbeat_secs: u64,
    /// Depth of the session manager's request queue
    pub request_queue_depth: usize,
    /// Capacity of every session data channel
    pub data_channel_capacity: usize,
    /// Upper bound in seconds on a single leased send
    pub lease_timeout_secs: u64,
    /// Proxies started once the agent is connected
    pub proxies: Vec<ProxyConfig>,
}

/// One configured proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Node the proxy tunnels to
    pub node: NodeId,
    /// Local listening port
    pub port: u16,
    /// Required username; empty with an empty password means open
    #[serde(default)]
    pub username: String,
    /// Required password
    #[serde(default)]
    pub password: String,
}

impl ProxyConfig {
    /// Credential policy of this proxy
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            heartbeat_secs: 10,
            request_queue_depth: manager.request_queue_depth,
            data_channel_capacity: manager.data_channel_capacity,
            lease_timeout_secs: manager.lease_send_timeout.as_secs(),
            proxies: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    admin: Option<AdminSection>,
    manager: Option<ManagerSection>,
    proxies: Option<Vec<ProxyConfig>>,
}

#[derive(Debug, Deserialize)]
struct AdminSection {
    listen: Option<SocketAddr>,
    heartbeat_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ManagerSection {
    request_queue_depth: Option<usize>,
    data_channel_capacity: Option<usize>,
    lease_timeout_secs: Option<u64>,
}

impl AdminConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final admin configuration: listen={}, heartbeat={}s, lease_timeout={}s, proxies={}",
            config.listen_addr,
            config.heartbeat_secs,
            config.lease_timeout_secs,
            config.proxies.len()
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(admin) = root_config.admin {
            if let Some(listen) = admin.listen {
                self.listen_addr = listen;
            }
            if let Some(secs) = admin.heartbeat_secs {
                self.heartbeat_secs = secs;
            }
        }

        if let Some(manager) = root_config.manager {
            if let Some(depth) = manager.request_queue_depth {
                self.request_queue_depth = depth;
            }
            if let Some(capacity) = manager.data_channel_capacity {
                self.data_channel_capacity = capacity;
            }
            if let Some(secs) = manager.lease_timeout_secs {
                self.lease_timeout_secs = secs;
            }
        }

        if let Some(proxies) = root_config.proxies {
            self.proxies = proxies;
        }
    }

    /// Apply `TUNNEL_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("TUNNEL_LISTEN_ADDR") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen_addr = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid TUNNEL_LISTEN_ADDR {:?}", listen),
            }
        }

        if let Some(secs) = lookup("TUNNEL_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
            self.heartbeat_secs = secs;
            info!("Heartbeat interval overridden by environment: {}s", secs);
        }

        if let Some(secs) = lookup("TUNNEL_LEASE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.lease_timeout_secs = secs;
            info!("Lease timeout overridden by environment: {}s", secs);
        }
    }

    /// Time between heartbeat cycles
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Session manager settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            request_queue_depth: self.request_queue_depth,
            data_channel_capacity: self.data_channel_capacity,
            lease_send_timeout: Duration::from_secs(self.lease_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AdminConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));

        let manager = config.manager_config();
        assert_eq!(manager.request_queue_depth, 32);
        assert_eq!(manager.data_channel_capacity, 1);
        assert_eq!(manager.lease_send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
admin:
  listen: 127.0.0.1:7000
  heartbeat_secs: 5

manager:
  lease_timeout_secs: 3

proxies:
  - node: 0
    port: 1080
  - node: 2
    port: 7777
    username: user
    password: secret
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = AdminConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.heartbeat_secs, 5);
        assert_eq!(config.lease_timeout_secs, 3);
        assert_eq!(config.request_queue_depth, 32);
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.proxies[0].credentials(), None);
        assert_eq!(
            config.proxies[1].credentials(),
            Credentials::new("user", "secret")
        );
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"admin: [not, a, map").unwrap();

        let config = AdminConfig::load_from_file(temp_file.path()).unwrap();
        assert!(config.proxies.is_empty());
        assert_eq!(config.heartbeat_secs, AdminConfig::default().heartbeat_secs);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("TUNNEL_LISTEN_ADDR", "127.0.0.1:8000"),
            ("TUNNEL_HEARTBEAT_SECS", "30"),
            ("TUNNEL_LEASE_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = AdminConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listen_addr, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.lease_timeout_secs, 10);
    }
}
