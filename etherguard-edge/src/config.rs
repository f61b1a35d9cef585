//! Edge configuration: the `EdgeConfig` YAML schema.
//!
//! Field names follow the established config file format, so existing
//! deployments' YAML parses unchanged.

use anyhow::{Context, Result};
use etherguard_core::graph::GraphRecalculateSetting;
use etherguard_core::types::{LoggerInfo, NextHopTable, Vertex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// TAP interface block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceConf {
    /// Interface type: "dummy" here; the kernel/socket variants are provided
    /// by external collaborators.
    #[serde(rename = "IType")]
    pub itype: String,
    pub name: String,
    /// First four MAC bytes of every node, e.g. "AA:BB:CC:DD".
    pub mac_addr_prefix: String,
    #[serde(rename = "MTU")]
    pub mtu: usize,
}

impl Default for InterfaceConf {
    fn default() -> Self {
        Self {
            itype: "dummy".to_string(),
            name: "tap1".to_string(),
            mac_addr_prefix: "AA:BB:CC:DD".to_string(),
            mtu: 1416,
        }
    }
}

/// Supernode client block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SuperInfo {
    pub use_super_node: bool,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    #[serde(rename = "ConnURLV4", default)]
    pub conn_url_v4: String,
    #[serde(default)]
    pub pub_key_v4: String,
    #[serde(rename = "ConnURLV6", default)]
    pub conn_url_v6: String,
    #[serde(default)]
    pub pub_key_v6: String,
    #[serde(rename = "APIUrl", default)]
    pub api_url: String,
    /// Seconds a pushed next-hop table stays fresh without re-push.
    #[serde(default = "default_supernode_info_timeout")]
    pub super_node_info_timeout: f64,
    /// Do not report local socket addresses in Register messages.
    #[serde(rename = "SkipLocalIP", default)]
    pub skip_local_ip: bool,
}

fn default_supernode_info_timeout() -> f64 {
    50.0
}

/// P2P mode block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct P2pInfo {
    #[serde(rename = "UseP2P", default)]
    pub use_p2p: bool,
    /// Seconds between peer-gossip rounds.
    #[serde(default = "default_send_peer_interval")]
    pub send_peer_interval: f64,
    #[serde(default)]
    pub graph_recalculate_setting: GraphRecalculateSetting,
}

fn default_send_peer_interval() -> f64 {
    20.0
}

impl Default for P2pInfo {
    fn default() -> Self {
        Self {
            use_p2p: false,
            send_peer_interval: default_send_peer_interval(),
            graph_recalculate_setting: GraphRecalculateSetting::default(),
        }
    }
}

/// NTP block. The time-skew estimator itself is an external collaborator;
/// the block is carried so configs round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NtpInfo {
    #[serde(rename = "UseNTP", default)]
    pub use_ntp: bool,
    #[serde(default = "default_max_server_use")]
    pub max_server_use: usize,
    #[serde(default = "default_sync_time_interval")]
    pub sync_time_interval: f64,
    #[serde(default)]
    pub servers: Vec<String>,
}

fn default_max_server_use() -> usize {
    8
}
fn default_sync_time_interval() -> f64 {
    3600.0
}

impl Default for NtpInfo {
    fn default() -> Self {
        Self {
            use_ntp: false,
            max_server_use: default_max_server_use(),
            sync_time_interval: default_sync_time_interval(),
            servers: Vec::new(),
        }
    }
}

/// Dynamic routing block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DynamicRouteInfo {
    /// Seconds between latency probes (and Register refreshes).
    #[serde(default = "default_send_ping_interval")]
    pub send_ping_interval: f64,
    /// Seconds without traffic before a peer counts as gone.
    #[serde(default = "default_peer_alive_timeout")]
    pub peer_alive_timeout: f64,
    /// Accept peers learned from gossip.
    #[serde(default)]
    pub save_new_peers: bool,
    #[serde(default)]
    pub super_node: SuperInfo,
    #[serde(rename = "P2P", default)]
    pub p2p: P2pInfo,
    #[serde(rename = "NTPConfig", default)]
    pub ntp_config: NtpInfo,
}

fn default_send_ping_interval() -> f64 {
    16.0
}
fn default_peer_alive_timeout() -> f64 {
    70.0
}

impl Default for DynamicRouteInfo {
    fn default() -> Self {
        Self {
            send_ping_interval: default_send_ping_interval(),
            peer_alive_timeout: default_peer_alive_timeout(),
            save_new_peers: false,
            super_node: SuperInfo::default(),
            p2p: P2pInfo::default(),
            ntp_config: NtpInfo::default(),
        }
    }
}

/// One statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    #[serde(rename = "NodeID")]
    pub node_id: Vertex,
    pub pub_key: String,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    #[serde(default)]
    pub end_point: String,
    /// When true the endpoint is never replaced by a learned source address.
    #[serde(default)]
    pub r#static: bool,
    /// Additional routing cost toward this peer, seconds.
    #[serde(default)]
    pub additional_cost: f64,
}

/// Complete edge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EdgeConfig {
    pub interface: InterfaceConf,
    #[serde(rename = "NodeID")]
    pub node_id: Vertex,
    pub node_name: String,
    #[serde(default)]
    pub post_script: String,
    #[serde(rename = "DefaultTTL", default = "default_ttl")]
    pub default_ttl: u8,
    pub priv_key: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub log_level: LoggerInfo,
    #[serde(default)]
    pub dynamic_route: DynamicRouteInfo,
    /// Static seed table, used until (unless) dynamic routing replaces it.
    #[serde(default)]
    pub next_hop_table: NextHopTable,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

fn default_ttl() -> u8 {
    200
}

pub fn load(path: &Path) -> Result<EdgeConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: EdgeConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse YAML: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &EdgeConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    let raw = serde_yaml::to_string(cfg).context("failed to serialize config to YAML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// A complete example configuration, for `--example`.
pub fn example_config() -> EdgeConfig {
    EdgeConfig {
        interface: InterfaceConf::default(),
        node_id: Vertex(1),
        node_name: "Node01".to_string(),
        post_script: String::new(),
        default_ttl: 200,
        priv_key: "6GyDagZKhbm5WNqMiRHhkf43RlbMJ34IieTlIuvfJ1M=".to_string(),
        listen_port: 0,
        log_level: LoggerInfo {
            log_level: "error".to_string(),
            log_transit: true,
            log_control: true,
            log_normal: true,
            log_internal: true,
        },
        dynamic_route: DynamicRouteInfo {
            send_ping_interval: 16.0,
            peer_alive_timeout: 70.0,
            save_new_peers: true,
            super_node: SuperInfo {
                use_super_node: true,
                psk: "iPM8FXfnHVzwjguZHRW9bLNY+h7+B1O2oTJtktptQkI=".to_string(),
                conn_url_v4: "127.0.0.1:3000".to_string(),
                pub_key_v4: "LJ8KKacUcIoACTGB/9Ed9w0osrJ3WWeelzpL2u4oUic=".to_string(),
                conn_url_v6: "[::1]:3000".to_string(),
                pub_key_v6: "HCfL6YJtpJEGHTlJ2LgVXIWKB/K95P57LHTJ42ZG8VI=".to_string(),
                api_url: "http://127.0.0.1:3000/api".to_string(),
                super_node_info_timeout: 50.0,
                skip_local_ip: false,
            },
            p2p: P2pInfo {
                use_p2p: false,
                send_peer_interval: 20.0,
                graph_recalculate_setting: GraphRecalculateSetting {
                    static_mode: false,
                    jitter_tolerance: 20.0,
                    jitter_tolerance_multiplier: 1.1,
                    node_report_timeout: 70.0,
                    timeout_check_interval: 5.0,
                    recalculate_cool_down: 5.0,
                },
            },
            ntp_config: NtpInfo {
                use_ntp: true,
                max_server_use: 8,
                sync_time_interval: 3600.0,
                servers: vec![
                    "time.google.com".to_string(),
                    "time.cloudflare.com".to_string(),
                    "time.apple.com".to_string(),
                    "time.windows.com".to_string(),
                ],
            },
        },
        next_hop_table: NextHopTable::new(),
        peers: vec![PeerInfo {
            node_id: Vertex(2),
            pub_key: "dHeWQtlTPQGy87WdbUARS4CtwVaR2y7IQ1qcX4GKSXk=".to_string(),
            psk: "juJMQaGAaeSy8aDsXSKNsPZv/nFiPj4h/1G70tGYygs=".to_string(),
            end_point: "127.0.0.1:3002".to_string(),
            r#static: true,
            additional_cost: 0.0,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_yaml_roundtrip() {
        let cfg = example_config();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: EdgeConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(back.node_id, cfg.node_id);
        assert_eq!(back.default_ttl, cfg.default_ttl);
        assert_eq!(back.interface.itype, cfg.interface.itype);
        assert_eq!(back.interface.mtu, cfg.interface.mtu);
        assert_eq!(
            back.dynamic_route.super_node.conn_url_v4,
            cfg.dynamic_route.super_node.conn_url_v4
        );
        assert_eq!(
            back.dynamic_route.p2p.graph_recalculate_setting.jitter_tolerance,
            cfg.dynamic_route.p2p.graph_recalculate_setting.jitter_tolerance
        );
        assert_eq!(back.peers.len(), 1);
        assert_eq!(back.peers[0].end_point, cfg.peers[0].end_point);
        assert!(back.peers[0].r#static);
    }

    #[test]
    fn test_established_field_names_parse() {
        let yaml = r#"
Interface:
  IType: dummy
  Name: tap1
  MacAddrPrefix: "AA:BB:CC:DD"
  MTU: 1416
NodeID: 5
NodeName: EdgeFive
PrivKey: "6GyDagZKhbm5WNqMiRHhkf43RlbMJ34IieTlIuvfJ1M="
DefaultTTL: 100
DynamicRoute:
  SendPingInterval: 8
  SuperNode:
    UseSuperNode: true
    ConnURLV4: "127.0.0.1:3000"
    PubKeyV4: "LJ8KKacUcIoACTGB/9Ed9w0osrJ3WWeelzpL2u4oUic="
    APIUrl: "http://127.0.0.1:3000/api"
  P2P:
    UseP2P: false
Peers: []
"#;
        let cfg: EdgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.node_id, Vertex(5));
        assert_eq!(cfg.default_ttl, 100);
        assert_eq!(cfg.dynamic_route.send_ping_interval, 8.0);
        assert!(cfg.dynamic_route.super_node.use_super_node);
        assert!(!cfg.dynamic_route.p2p.use_p2p);
    }
}
