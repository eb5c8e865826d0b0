use std::{
    collections::HashMap,
    fs::{read_to_string, write},
    path::Path,
    str::FromStr,
};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::ledger::StorageKind;

/// Default port shared by the UDP socket pair and the TCP listeners.
pub const DEFAULT_P2P_PORT: u16 = 6641;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// The port shared by the UDP sockets and TCP listeners, bound on
    /// both `0.0.0.0` and `::`.
    ///
    #[serde(default = "Network::p2p_port")]
    pub p2p_port: u16,
    ///
    /// Backlog of the TCP listeners.
    ///
    #[serde(default = "Network::max_connections")]
    pub max_connections: u32,
}

impl Network {
    fn p2p_port() -> u16 {
        DEFAULT_P2P_PORT
    }

    fn max_connections() -> u32 {
        32
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            p2p_port: Self::p2p_port(),
            max_connections: Self::max_connections(),
        }
    }
}

/// Persistent per-domain configuration.
///
/// Identifiers are hex strings; node addresses are `[ipv4, ipv6, port]`
/// triples with the empty string standing in for an unknown family.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DomainConfig {
    pub node_id: Option<String>,
    ///
    /// Name of the overlay module driving this domain.
    ///
    #[serde(default = "DomainConfig::module")]
    pub module: String,
    ///
    /// A special domain carries no application storage; the global
    /// overlay is the usual case.
    ///
    #[serde(default)]
    pub special_domain: bool,
    #[serde(default)]
    pub storage_type: Option<StorageKind>,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub advertise_in_domain0: bool,
    ///
    /// Peers joined unconditionally at boot.
    ///
    #[serde(default)]
    pub static_nodes: HashMap<String, (String, String, u16)>,
    ///
    /// Snapshot of the live peer table, written back by
    /// `save_all_peer_lists`.
    ///
    #[serde(default)]
    pub peer_list: HashMap<String, (String, String, u16)>,
    #[serde(default)]
    pub asset_group_ids: HashMap<String, AssetGroupConfig>,
}

impl DomainConfig {
    fn module() -> String {
        "simple".to_string()
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AssetGroupConfig {}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub log: Log,
    ///
    /// Domains joined at boot, keyed by domain id in hex.
    ///
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: mesh-node --config /etc/mesh-node/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<(Self, String)> {
        let path = Cli::parse().config;
        Ok((toml::from_str::<Self>(&read_to_string(&path)?)?, path))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The configuration entry for a domain, created on first access.
    pub fn domain_mut(&mut self, domain_id_hex: &str) -> &mut DomainConfig {
        self.domains.entry(domain_id_hex.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.network.p2p_port, DEFAULT_P2P_PORT);
        assert!(config.domains.is_empty());
    }

    #[test]
    fn domain_entries_round_trip() {
        let mut config = Config::default();
        {
            let domain = config.domain_mut("aa");
            domain.node_id = Some("bb".to_string());
            domain
                .static_nodes
                .insert("cc".to_string(), ("127.0.0.1".into(), "".into(), 6641));
        }

        let parsed: Config = toml::from_str(&toml::to_string_pretty(&config).unwrap()).unwrap();
        let domain = &parsed.domains["aa"];
        assert_eq!(domain.module, "simple");
        assert_eq!(domain.node_id.as_deref(), Some("bb"));
        assert_eq!(
            domain.static_nodes["cc"],
            ("127.0.0.1".to_string(), String::new(), 6641)
        );
    }
}
