//! CLI for this application
//!
use std::path::PathBuf;

use crate::error::Result;
use crate::settings::{self, AreaSettings, FloodRate, PeerSpec};
use crate::config_error;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A static peer for one area: `area:name@address`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AreaPeer {
    pub area: String,
    pub peer: PeerSpec,
}

impl std::str::FromStr for AreaPeer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (area, peer) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid peer '{}', expected area:name@address", s))?;
        if area.is_empty() {
            return Err(format!("Invalid peer '{}', missing area", s));
        }
        Ok(AreaPeer {
            area: area.to_string(),
            peer: peer.parse()?,
        })
    }
}

#[derive(Clone, Debug, clap::Parser)]
pub struct Cli {
    // Name of this node
    #[clap(long, env("KVFLOOD_NODE_NAME"), help = "Unique name of this node")]
    pub node_name: Option<String>,

    // JSON settings file; command-line values are ignored when set
    #[clap(
        long,
        env("KVFLOOD_CONFIG_FILE"),
        help = "Path to a JSON settings file"
    )]
    pub config_file: Option<PathBuf>,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("KVFLOOD_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("KVFLOOD_HTTP_LISTEN_PORT"),
        help = "Port to bind kvflood HTTP API server to"
    )]
    pub listen_port: u16,

    // TCP listen port for peer traffic
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_TCP,
        env("KVFLOOD_TCP_LISTEN_PORT"),
        help = "Port to bind kvflood peer TCP server to"
    )]
    pub listen_port_tcp: u16,

    #[clap(
        long = "area",
        env("KVFLOOD_AREAS"),
        value_delimiter = ',',
        help = "Areas to join (repeatable). Defaults to a single area '0'"
    )]
    pub areas: Vec<String>,

    #[clap(
        long = "peer",
        env("KVFLOOD_PEERS"),
        value_delimiter = ',',
        help = "Static peers as area:name@address (repeatable)"
    )]
    pub peers: Vec<AreaPeer>,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_KEY_TTL_MS,
        env("KVFLOOD_KEY_TTL_MS"),
        help = "TTL in milliseconds for keys set by this node"
    )]
    pub key_ttl_ms: i64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_TTL_DECREMENT_MS,
        env("KVFLOOD_TTL_DECREMENT_MS"),
        help = "Milliseconds subtracted from a record's TTL on every hop"
    )]
    pub ttl_decrement_ms: i64,

    #[clap(
        long,
        env("KVFLOOD_FLOOD_MSG_PER_SEC"),
        requires = "flood_msg_burst_size",
        help = "Flood rate limit applied to every area, messages per second"
    )]
    pub flood_msg_per_sec: Option<u32>,

    #[clap(
        long,
        env("KVFLOOD_FLOOD_MSG_BURST_SIZE"),
        requires = "flood_msg_per_sec",
        help = "Flood rate limit applied to every area, burst size"
    )]
    pub flood_msg_burst_size: Option<u32>,

    #[clap(
        long,
        env("KVFLOOD_FLOOD_OPTIMIZATION"),
        help = "Flood over a spanning tree in every area"
    )]
    pub flood_optimization: bool,

    #[clap(
        long,
        env("KVFLOOD_FLOOD_ROOT_PRIORITY"),
        help = "Act as a flood root with this priority (lower wins)"
    )]
    pub flood_root_priority: Option<u32>,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SYNC_TIMEOUT_MS,
        env("KVFLOOD_SYNC_TIMEOUT_MS"),
        help = "Full sync deadline and peer request timeout in milliseconds"
    )]
    pub sync_timeout_ms: u64,
}

impl Cli {
    pub fn into_settings(self) -> Result<settings::Settings> {
        if let Some(path) = self.config_file.as_ref() {
            return settings::Settings::from_json_file(path);
        }
        let node_name = self
            .node_name
            .ok_or_else(|| config_error!("--node-name is required without --config-file"))?;

        let mut area_ids = self.areas;
        if area_ids.is_empty() {
            area_ids.push(settings::DEFAULT_AREA.to_string());
        }
        let flood_rate = match (self.flood_msg_per_sec, self.flood_msg_burst_size) {
            (Some(flood_msg_per_sec), Some(flood_msg_burst_size)) => Some(FloodRate {
                flood_msg_per_sec,
                flood_msg_burst_size,
            }),
            _ => None,
        };
        let mut areas: Vec<AreaSettings> = area_ids
            .iter()
            .map(|area_id| {
                let mut area = AreaSettings::new(area_id);
                area.enable_flood_optimization = self.flood_optimization;
                area.flood_root_priority = self.flood_root_priority;
                area.flood_rate = flood_rate.clone();
                area
            })
            .collect();
        for AreaPeer { area, peer } in self.peers {
            let target = areas
                .iter_mut()
                .find(|a| a.area_id == area)
                .ok_or_else(|| config_error!("peer {} refers to unknown area {}", peer.name, area))?;
            target.peers.push(peer);
        }

        let mut settings = settings::Settings::new(&node_name);
        settings.listen_address = self.listen_address;
        settings.listen_port = self.listen_port;
        settings.listen_port_tcp = self.listen_port_tcp;
        settings.areas = areas;
        settings.kvstore.key_ttl_ms = self.key_ttl_ms;
        settings.kvstore.ttl_decrement_ms = self.ttl_decrement_ms;
        settings.kvstore.sync_timeout_ms = self.sync_timeout_ms;
        Ok(settings)
    }
}
