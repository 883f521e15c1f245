#!/usr/bin/env cargo
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};

use kvflood::api::paths;

#[derive(Parser)]
#[command(name = "kvflood-admin")]
#[command(about = "kvflood node administration tool")]
struct Cli {
    /// HTTP address of the node to talk to
    #[arg(long, default_value = "http://127.0.0.1:8410")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check node health
    Health,
    /// Read keys from an area
    Get {
        #[arg(long, default_value = "0")]
        area: String,
        /// Keys to read (e.g., "adj:node1,prefix:node1")
        #[arg(long)]
        keys: String,
    },
    /// Dump an area, optionally restricted to key prefixes
    Dump {
        #[arg(long, default_value = "0")]
        area: String,
        #[arg(long)]
        prefix: Vec<String>,
        /// Show hashes only
        #[arg(long)]
        hashes: bool,
    },
    /// Set a key owned and refreshed by the node
    SetLocal {
        #[arg(long, default_value = "0")]
        area: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// Stop refreshing a local key
    UnsetLocal {
        #[arg(long, default_value = "0")]
        area: String,
        #[arg(long)]
        key: String,
    },
    /// Per-area counters
    Summary {
        /// Areas to show (e.g., "0,spine"); all when empty
        #[arg(long, default_value = "")]
        areas: String,
    },
    /// List peers of an area
    Peers {
        #[arg(long, default_value = "0")]
        area: String,
    },
    /// Add a peer to an area
    AddPeer {
        #[arg(long, default_value = "0")]
        area: String,
        #[arg(long)]
        name: String,
        /// Peer transport address (e.g., "10.0.0.2:8411")
        #[arg(long)]
        addr: String,
    },
    /// Remove a peer from an area
    DelPeer {
        #[arg(long, default_value = "0")]
        area: String,
        #[arg(long)]
        name: String,
    },
    /// Show the flooding spanning tree of an area
    Spt {
        #[arg(long, default_value = "0")]
        area: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.node.trim_end_matches('/').to_string();

    let response: Value = match cli.command {
        Commands::Health => {
            let body = client
                .get(format!("{}{}", base, paths::base::HEALTH))
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            println!("{}", body);
            return Ok(());
        }
        Commands::Get { area, keys } => {
            client
                .get(format!("{}{}", base, paths::keys_path(&area)))
                .query(&[("keys", keys)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::Dump {
            area,
            prefix,
            hashes,
        } => {
            let path = if hashes {
                paths::hashes_filtered_path(&area)
            } else {
                paths::keys_filtered_path(&area)
            };
            client
                .post(format!("{}{}", base, path))
                .json(&json!({ "keys": prefix }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::SetLocal { area, key, value } => {
            client
                .put(format!("{}{}", base, paths::local_key_path(&area, &key)))
                .json(&json!({ "value": value }))
                .send()
                .await?
                .error_for_status()?;
            json!({ "key": key, "set": true })
        }
        Commands::UnsetLocal { area, key } => {
            client
                .delete(format!("{}{}", base, paths::local_key_path(&area, &key)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::Summary { areas } => {
            client
                .get(format!("{}{}", base, paths::kvstore::SUMMARY))
                .query(&[("areas", areas)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::Peers { area } => {
            client
                .get(format!("{}{}", base, paths::peers_path(&area)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::AddPeer { area, name, addr } => {
            client
                .post(format!("{}{}", base, paths::peers_path(&area)))
                .json(&json!({ "name": name, "addr": addr }))
                .send()
                .await?
                .error_for_status()?;
            json!({ "name": name, "added": true })
        }
        Commands::DelPeer { area, name } => {
            client
                .delete(format!("{}{}", base, paths::peer_path(&area, &name)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
        Commands::Spt { area } => {
            client
                .get(format!("{}{}", base, paths::spanning_tree_path(&area)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
