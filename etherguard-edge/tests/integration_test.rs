//! End-to-end convergence over loopback: a supernode and one edge exchange
//! Register/Push/Pull until the edge holds the published next-hop table.

use anyhow::Result;
use etherguard_core::peer::key_to_base64;
use etherguard_core::transport::pubkey_from_private;
use etherguard_core::types::Vertex;
use etherguard_edge::config::EdgeConfig;
use etherguard_edge::runtime::run_edge;
use etherguard_super::config::{SuperConfig, SuperPeerInfo};
use etherguard_super::runtime::run_super;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const EDGE_PRIV: [u8; 32] = [3u8; 32];
const SUPER_PRIV_V4: [u8; 32] = [5u8; 32];
const SUPER_PRIV_V6: [u8; 32] = [6u8; 32];

fn pick_port() -> u16 {
    50000
        + (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u16
            % 1000)
}

fn super_config(port: u16) -> SuperConfig {
    let mut cfg = etherguard_super::config::example_config();
    cfg.listen_port = port;
    cfg.priv_key_v4 = key_to_base64(&SUPER_PRIV_V4);
    cfg.priv_key_v6 = key_to_base64(&SUPER_PRIV_V6);
    cfg.re_push_config_interval = 2.0;
    cfg.graph_recalculate_setting.jitter_tolerance = 0.0;
    cfg.graph_recalculate_setting.jitter_tolerance_multiplier = 1.0;
    cfg.graph_recalculate_setting.recalculate_cool_down = 0.0;
    cfg.graph_recalculate_setting.timeout_check_interval = 1.0;
    cfg.edge_template = String::new();
    cfg.peers = vec![SuperPeerInfo {
        node_id: Vertex(1),
        name: "Node_01".to_string(),
        pub_key: key_to_base64(&pubkey_from_private(&EDGE_PRIV)),
        psk: String::new(),
        additional_cost: 0.0,
    }];
    cfg
}

fn edge_config(port: u16) -> EdgeConfig {
    let mut cfg = etherguard_edge::config::example_config();
    cfg.node_id = Vertex(1);
    cfg.priv_key = key_to_base64(&EDGE_PRIV);
    cfg.listen_port = 0;
    cfg.peers = Vec::new();
    cfg.dynamic_route.send_ping_interval = 1.0;
    cfg.dynamic_route.super_node.use_super_node = true;
    cfg.dynamic_route.super_node.psk = String::new();
    cfg.dynamic_route.super_node.conn_url_v4 = format!("127.0.0.1:{port}");
    cfg.dynamic_route.super_node.pub_key_v4 = key_to_base64(&pubkey_from_private(&SUPER_PRIV_V4));
    cfg.dynamic_route.super_node.conn_url_v6 = String::new();
    cfg.dynamic_route.super_node.pub_key_v6 = String::new();
    cfg.dynamic_route.super_node.api_url = format!("http://127.0.0.1:{port}/api");
    cfg.dynamic_route.p2p.use_p2p = false;
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edge_converges_on_pushed_table() -> Result<()> {
    let port = pick_port();

    let (super_stop_tx, super_stop_rx) = watch::channel(false);
    let super_handle = tokio::spawn(run_super(super_config(port), super_stop_rx));

    // Give the supernode a moment to bind.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (edge_stop_tx, edge_stop_rx) = watch::channel(false);
    let edge_handle = tokio::spawn(run_edge(edge_config(port), edge_stop_rx));

    // Poll the administrative state endpoint until the edge has echoed the
    // published hashes back.
    let state_url = format!("http://127.0.0.1:{port}/api/state?Password=passwd");
    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut synced = false;
    while Instant::now() < deadline {
        if let Ok(resp) = client.get(&state_url).send().await {
            if resp.status().is_success() {
                if let Ok(state) = resp.json::<serde_json::Value>().await {
                    let peer = &state["Peers"][0];
                    if peer["NhTableInSync"] == true
                        && peer["PeerInfoInSync"] == true
                        && !peer["LastSeenSecsAgo"].is_null()
                    {
                        synced = true;
                        break;
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = edge_stop_tx.send(true);
    let _ = super_stop_tx.send(true);
    let _ = edge_handle.await;
    let _ = super_handle.await;

    assert!(synced, "edge never converged on the supernode's state");
    Ok(())
}
