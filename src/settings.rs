//! kvflood application settings
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kvstore::filter::KvFilter;
use crate::kvstore::record::TTL_INFINITY;
use crate::node::NodeName;
use crate::config_error;

pub const STANDARD_PORT_HTTP: u16 = 8410;
pub const DEFAULT_PORT_HTTP: &str = "8410";
pub const STANDARD_PORT_TCP: u16 = 8411;
pub const DEFAULT_PORT_TCP: &str = "8411";

pub const DEFAULT_AREA: &str = "0";
pub const DEFAULT_KEY_TTL_MS: i64 = 300_000;
pub const DEFAULT_TTL_DECREMENT_MS: i64 = 1;
pub const DEFAULT_TTL_TICK_MS: u64 = 200;
pub const DEFAULT_FLOOD_TICK_MS: u64 = 100;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PEER_RETRY_MS: u64 = 1_000;
pub const DEFAULT_PEER_RETRY_MAX_MS: u64 = 30_000;
pub const DEFAULT_PEER_RETRY_LIMIT: u32 = 8;
pub const DEFAULT_SUBSCRIBER_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_PEER_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 1000;

/// Flood messages per second and burst size
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodRate {
    pub flood_msg_per_sec: u32,
    pub flood_msg_burst_size: u32,
}

/// A statically configured peer: its name and its transport address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub name: NodeName,
    pub addr: String,
}

impl std::str::FromStr for PeerSpec {
    type Err = String;

    /// Parses `name@address`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, addr)) if !name.is_empty() && !addr.is_empty() => Ok(PeerSpec {
                name: NodeName::from(name),
                addr: addr.to_string(),
            }),
            _ => Err(format!("Invalid peer '{}', expected name@address", s)),
        }
    }
}

/// Per-area configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaSettings {
    pub area_id: String,

    // Restrict flooding to a spanning tree
    #[serde(default)]
    pub enable_flood_optimization: bool,

    // When set, this node is a flood root for the area at this priority
    // (lower wins)
    #[serde(default)]
    pub flood_root_priority: Option<u32>,

    // Leaf-node filter: only records matching it are accepted from peers
    #[serde(default)]
    pub flood_filter: Option<KvFilter>,

    // Token bucket for outbound floods; unlimited when absent
    #[serde(default)]
    pub flood_rate: Option<FloodRate>,

    // Peers added at startup
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
}

impl AreaSettings {
    pub fn new(area_id: &str) -> Self {
        Self {
            area_id: area_id.to_string(),
            enable_flood_optimization: false,
            flood_root_priority: None,
            flood_filter: None,
            flood_rate: None,
            peers: Vec::new(),
        }
    }
}

/// Store behaviour shared by every area
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvStoreSettings {
    pub key_ttl_ms: i64,
    pub ttl_decrement_ms: i64,
    pub ttl_tick_ms: u64,
    pub flood_tick_ms: u64,
    pub sync_timeout_ms: u64,
    /// First retry delay for an idle peer, doubled on every failure
    pub peer_retry_ms: u64,
    pub peer_retry_max_ms: u64,
    /// Timer retries before an idle peer waits for it to call in or be re-added
    pub peer_retry_limit: u32,
    pub subscriber_queue_size: usize,
    pub peer_queue_size: usize,
    pub command_queue_size: usize,
}

impl Default for KvStoreSettings {
    fn default() -> Self {
        Self {
            key_ttl_ms: DEFAULT_KEY_TTL_MS,
            ttl_decrement_ms: DEFAULT_TTL_DECREMENT_MS,
            ttl_tick_ms: DEFAULT_TTL_TICK_MS,
            flood_tick_ms: DEFAULT_FLOOD_TICK_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            peer_retry_ms: DEFAULT_PEER_RETRY_MS,
            peer_retry_max_ms: DEFAULT_PEER_RETRY_MAX_MS,
            peer_retry_limit: DEFAULT_PEER_RETRY_LIMIT,
            subscriber_queue_size: DEFAULT_SUBSCRIBER_QUEUE_SIZE,
            peer_queue_size: DEFAULT_PEER_QUEUE_SIZE,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    // Name of this node, used as originator id
    pub node_name: NodeName,

    // Server listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    // HTTP API listen port
    #[serde(default = "default_http_port")]
    pub listen_port: u16,

    // TCP listen port for peer traffic
    #[serde(default = "default_tcp_port")]
    pub listen_port_tcp: u16,

    #[serde(default)]
    pub kvstore: KvStoreSettings,

    pub areas: Vec<AreaSettings>,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    STANDARD_PORT_HTTP
}

fn default_tcp_port() -> u16 {
    STANDARD_PORT_TCP
}

impl Settings {
    /// Single default area, everything else defaulted
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: NodeName::from(node_name),
            listen_address: default_listen_address(),
            listen_port: STANDARD_PORT_HTTP,
            listen_port_tcp: STANDARD_PORT_TCP,
            kvstore: KvStoreSettings::default(),
            areas: vec![AreaSettings::new(DEFAULT_AREA)],
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn area(&self, area_id: &str) -> Option<&AreaSettings> {
        self.areas.iter().find(|a| a.area_id == area_id)
    }

    pub fn listen_ip(&self) -> Result<IpAddr> {
        self.listen_address
            .parse::<IpAddr>()
            .map_err(|e| config_error!("Invalid listen address {}: {}", self.listen_address, e))
    }

    pub fn http_socket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.listen_ip()?, self.listen_port)))
    }

    pub fn tcp_socket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.listen_ip()?, self.listen_port_tcp)))
    }

    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(config_error!("node name must not be empty"));
        }
        if self.areas.is_empty() {
            return Err(config_error!("at least one area must be configured"));
        }
        let mut seen = HashSet::new();
        for area in self.areas.iter() {
            if area.area_id.is_empty() {
                return Err(config_error!("area id must not be empty"));
            }
            if !seen.insert(area.area_id.as_str()) {
                return Err(config_error!("duplicate area id: {}", area.area_id));
            }
            if let Some(filter) = &area.flood_filter {
                filter.compile().map_err(|e| {
                    config_error!("invalid flood filter for area {}: {}", area.area_id, e)
                })?;
            }
            if let Some(rate) = &area.flood_rate {
                if rate.flood_msg_per_sec == 0 {
                    return Err(config_error!(
                        "flood_msg_per_sec should be > 0 in area {}",
                        area.area_id
                    ));
                }
                if rate.flood_msg_burst_size == 0 {
                    return Err(config_error!(
                        "flood_msg_burst_size should be > 0 in area {}",
                        area.area_id
                    ));
                }
            }
            let mut peer_names = HashSet::new();
            for peer in area.peers.iter() {
                if peer.name == self.node_name {
                    return Err(config_error!(
                        "area {} names this node as its own peer",
                        area.area_id
                    ));
                }
                if !peer_names.insert(&peer.name) {
                    return Err(config_error!(
                        "duplicate peer {} in area {}",
                        peer.name,
                        area.area_id
                    ));
                }
            }
        }

        let kv = &self.kvstore;
        if kv.key_ttl_ms == TTL_INFINITY {
            return Err(config_error!("key ttl must not be infinite"));
        }
        if kv.key_ttl_ms <= 0 {
            return Err(config_error!("key ttl must be positive, got {}", kv.key_ttl_ms));
        }
        if kv.ttl_decrement_ms < 0 || kv.ttl_decrement_ms >= kv.key_ttl_ms {
            return Err(config_error!(
                "ttl decrement {} must be in [0, key ttl)",
                kv.ttl_decrement_ms
            ));
        }
        if kv.ttl_tick_ms == 0 || kv.flood_tick_ms == 0 || kv.sync_timeout_ms == 0 {
            return Err(config_error!("tick intervals and sync timeout must be > 0"));
        }
        if kv.peer_retry_ms == 0 || kv.peer_retry_max_ms < kv.peer_retry_ms {
            return Err(config_error!(
                "peer retry {}ms must be > 0 and not above its maximum {}ms",
                kv.peer_retry_ms,
                kv.peer_retry_max_ms
            ));
        }
        if kv.subscriber_queue_size == 0 || kv.peer_queue_size == 0 || kv.command_queue_size == 0
        {
            return Err(config_error!("queue sizes must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KvError;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(Settings::new("node1").validate().is_ok());
    }

    #[test]
    fn test_duplicate_area_rejected() {
        let mut settings = Settings::new("node1");
        settings.areas.push(AreaSettings::new(DEFAULT_AREA));
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, KvError::Config(_)));
        assert!(err.to_string().contains("duplicate area id"));
    }

    #[test]
    fn test_infinite_key_ttl_rejected() {
        let mut settings = Settings::new("node1");
        settings.kvstore.key_ttl_ms = TTL_INFINITY;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_flood_rate_rejected() {
        let mut settings = Settings::new("node1");
        settings.areas[0].flood_rate = Some(FloodRate {
            flood_msg_per_sec: 0,
            flood_msg_burst_size: 10,
        });
        assert!(settings.validate().is_err());
        settings.areas[0].flood_rate = Some(FloodRate {
            flood_msg_per_sec: 10,
            flood_msg_burst_size: 0,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_self_peer_rejected() {
        let mut settings = Settings::new("node1");
        settings.areas[0].peers.push("node1@127.0.0.1:8411".parse().unwrap());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_peer_spec_parse() {
        let spec: PeerSpec = "node2@10.0.0.2:8411".parse().unwrap();
        assert_eq!(spec.name.as_str(), "node2");
        assert_eq!(spec.addr, "10.0.0.2:8411");
        assert!("node2".parse::<PeerSpec>().is_err());
    }

    #[test]
    fn test_settings_from_json() {
        let raw = r#"{
            "node_name": "node1",
            "kvstore": { "key_ttl_ms": 60000 },
            "areas": [
                { "area_id": "spine", "enable_flood_optimization": true, "flood_root_priority": 1 },
                {
                    "area_id": "leaf",
                    "flood_filter": { "keys": ["adj:"] },
                    "flood_rate": { "flood_msg_per_sec": 50, "flood_msg_burst_size": 10 }
                }
            ]
        }"#;
        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.kvstore.key_ttl_ms, 60_000);
        assert_eq!(settings.kvstore.ttl_tick_ms, DEFAULT_TTL_TICK_MS);
        assert_eq!(settings.listen_port, STANDARD_PORT_HTTP);
        assert_eq!(settings.areas.len(), 2);
        assert!(settings.area("spine").unwrap().flood_rate.is_none());
        assert_eq!(
            settings.area("leaf").unwrap().flood_rate,
            Some(FloodRate {
                flood_msg_per_sec: 50,
                flood_msg_burst_size: 10
            })
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_peer_retry_bounds() {
        let mut settings = Settings::new("node1");
        settings.kvstore.peer_retry_max_ms = settings.kvstore.peer_retry_ms - 1;
        assert!(settings.validate().is_err());
        settings.kvstore.peer_retry_ms = 0;
        assert!(settings.validate().is_err());
    }
}
