//! Supernode configuration: the `SuperConfig` YAML schema.

use anyhow::{Context, Result};
use etherguard_core::graph::GraphRecalculateSetting;
use etherguard_core::types::{LoggerInfo, NextHopTable, Vertex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The three administrative shared secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Passwords {
    pub show_state: String,
    pub add_peer: String,
    pub del_peer: String,
}

/// One registered edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SuperPeerInfo {
    #[serde(rename = "NodeID")]
    pub node_id: Vertex,
    #[serde(default)]
    pub name: String,
    pub pub_key: String,
    #[serde(rename = "PSKey", default)]
    pub psk: String,
    /// Additive routing cost toward this edge, seconds.
    #[serde(default)]
    pub additional_cost: f64,
}

/// Complete supernode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SuperConfig {
    pub node_name: String,
    #[serde(default)]
    pub post_script: String,
    /// Private key of the IPv4-only transport ("" disables the family).
    #[serde(default)]
    pub priv_key_v4: String,
    /// Private key of the IPv6-only transport ("" disables the family).
    #[serde(default)]
    pub priv_key_v6: String,
    pub listen_port: u16,
    #[serde(default)]
    pub log_level: LoggerInfo,
    /// Seconds between unconditional re-pushes of the current state.
    #[serde(default = "default_re_push_interval")]
    pub re_push_config_interval: f64,
    #[serde(default)]
    pub passwords: Passwords,
    #[serde(default)]
    pub graph_recalculate_setting: GraphRecalculateSetting,
    /// Static seed table (checked against the peer list in static mode).
    #[serde(default)]
    pub next_hop_table: NextHopTable,
    /// Edge config template served to freshly added peers.
    #[serde(default)]
    pub edge_template: String,
    /// Distribute per-edge PSKs through the peer-info payload.
    #[serde(rename = "UsePSKForInterEdge", default)]
    pub use_psk_for_inter_edge: bool,
    #[serde(default)]
    pub peers: Vec<SuperPeerInfo>,
}

fn default_re_push_interval() -> f64 {
    30.0
}

pub fn load(path: &Path) -> Result<SuperConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: SuperConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse YAML: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &SuperConfig, overwrite: bool) -> Result<()> {
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
pub fn example_config() -> SuperConfig {
    SuperConfig {
        node_name: "NodeSuper".to_string(),
        post_script: String::new(),
        priv_key_v4: "mL5IW0GuqbjgDeOJuPHBU2iJzBPNKhaNEXbIGwwYWWk=".to_string(),
        priv_key_v6: "+EdOKIoBp/EvIusHDsvXhV1RJYbyN3Qr8nxlz35wl3I=".to_string(),
        listen_port: 3000,
        log_level: LoggerInfo {
            log_level: "normal".to_string(),
            log_transit: true,
            log_control: true,
            log_normal: false,
            log_internal: true,
        },
        re_push_config_interval: 30.0,
        passwords: Passwords {
            show_state: "passwd".to_string(),
            add_peer: "passwd_addpeer".to_string(),
            del_peer: "passwd_delpeer".to_string(),
        },
        graph_recalculate_setting: GraphRecalculateSetting {
            static_mode: false,
            jitter_tolerance: 5.0,
            jitter_tolerance_multiplier: 1.01,
            node_report_timeout: 70.0,
            timeout_check_interval: 5.0,
            recalculate_cool_down: 5.0,
        },
        next_hop_table: NextHopTable::new(),
        edge_template: "example_config/super_mode/n1.yaml".to_string(),
        use_psk_for_inter_edge: true,
        peers: vec![
            SuperPeerInfo {
                node_id: Vertex(1),
                name: "Node_01".to_string(),
                pub_key: "ZqzLVSbXzjppERslwbf2QziWruW3V/UIx9oqwU8Fn3I=".to_string(),
                psk: "iPM8FXfnHVzwjguZHRW9bLNY+h7+B1O2oTJtktptQkI=".to_string(),
                additional_cost: 0.0,
            },
            SuperPeerInfo {
                node_id: Vertex(2),
                name: "Node_02".to_string(),
                pub_key: "dHeWQtlTPQGy87WdbUARS4CtwVaR2y7IQ1qcX4GKSXk=".to_string(),
                psk: "juJMQaGAaeSy8aDsXSKNsPZv/nFiPj4h/1G70tGYygs=".to_string(),
                additional_cost: 0.0,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_yaml_roundtrip() {
        let cfg = example_config();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: SuperConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(back.node_name, cfg.node_name);
        assert_eq!(back.listen_port, cfg.listen_port);
        assert_eq!(back.passwords.add_peer, cfg.passwords.add_peer);
        assert_eq!(back.peers.len(), 2);
        assert_eq!(back.peers[1].node_id, Vertex(2));
        assert!(back.use_psk_for_inter_edge);
        assert_eq!(
            back.graph_recalculate_setting.node_report_timeout,
            cfg.graph_recalculate_setting.node_report_timeout
        );
    }

    #[test]
    fn test_established_field_names_parse() {
        let yaml = r#"
NodeName: NodeSuper
PrivKeyV4: "mL5IW0GuqbjgDeOJuPHBU2iJzBPNKhaNEXbIGwwYWWk="
ListenPort: 3000
RePushConfigInterval: 10
Passwords:
  ShowState: a
  AddPeer: b
  DelPeer: c
GraphRecalculateSetting:
  JitterTolerance: 5
  JitterToleranceMultiplier: 1.01
  NodeReportTimeout: 40
  TimeoutCheckInterval: 5
  RecalculateCoolDown: 5
UsePSKForInterEdge: true
Peers:
  - NodeID: 1
    Name: Node_01
    PubKey: "ZqzLVSbXzjppERslwbf2QziWruW3V/UIx9oqwU8Fn3I="
"#;
        let cfg: SuperConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.listen_port, 3000);
        assert_eq!(cfg.re_push_config_interval, 10.0);
        assert_eq!(cfg.graph_recalculate_setting.node_report_timeout, 40.0);
        assert_eq!(cfg.peers[0].node_id, Vertex(1));
        assert!(cfg.priv_key_v6.is_empty());
    }
}
