//! Supernode HTTP API.
//!
//! Pushes over the tunnel only announce state hashes; edges pull the actual
//! payloads here. `State` must match the currently published hash — a
//! mismatch means the edge raced a newer push and should wait for it.
//! Administrative endpoints are guarded by the three shared secrets.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use etherguard_core::msg::ApiPeerInfo;
use etherguard_core::types::NextHopTable;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::config::SuperPeerInfo;
use crate::runtime::{Coordinator, SuperState};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/nhtable", get(get_nhtable))
        .route("/api/peerinfo", get(get_peerinfo))
        .route("/api/state", get(get_state))
        .route("/api/peer/add", post(peer_add))
        .route("/api/peer/del", post(peer_del))
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(rename = "PubKey")]
    pubkey: String,
    #[serde(rename = "State")]
    state: String,
}

fn check_pull(
    coordinator: &Coordinator,
    q: &PullQuery,
    current: [u8; 32],
) -> Result<(), (StatusCode, String)> {
    if !coordinator.knows_pubkey(&q.pubkey) {
        return Err((StatusCode::NOT_FOUND, "unknown PubKey".to_string()));
    }
    if q.state.as_bytes() != &current[..] {
        return Err((StatusCode::BAD_REQUEST, "state hash mismatch".to_string()));
    }
    Ok(())
}

/// GET /api/nhtable?PubKey=…&State=… — the full next-hop table as JSON.
async fn get_nhtable(
    State(coordinator): State<Arc<Coordinator>>,
    Query(q): Query<PullQuery>,
) -> Result<Json<NextHopTable>, (StatusCode, String)> {
    check_pull(&coordinator, &q, coordinator.nh_table_hash())?;
    Ok(Json(coordinator.nh_table()))
}

/// GET /api/peerinfo?PubKey=…&State=… — the current peer list.
async fn get_peerinfo(
    State(coordinator): State<Arc<Coordinator>>,
    Query(q): Query<PullQuery>,
) -> Result<Json<Vec<ApiPeerInfo>>, (StatusCode, String)> {
    check_pull(&coordinator, &q, coordinator.peer_info_hash())?;
    Ok(Json(coordinator.api_peers()))
}

#[derive(Debug, Deserialize)]
struct PasswordQuery {
    #[serde(rename = "Password")]
    password: String,
}

/// GET /api/state?Password=… — liveness and sync report.
async fn get_state(
    State(coordinator): State<Arc<Coordinator>>,
    Query(q): Query<PasswordQuery>,
) -> Result<Json<SuperState>, (StatusCode, String)> {
    if q.password != coordinator.passwords.show_state {
        return Err((StatusCode::UNAUTHORIZED, "bad password".to_string()));
    }
    Ok(Json(coordinator.state_report()))
}

#[derive(Debug, Deserialize)]
struct PeerAddQuery {
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "NodeID")]
    node_id: u16,
    #[serde(rename = "PubKey")]
    pubkey: String,
    #[serde(rename = "PSKey", default)]
    psk: Option<String>,
    #[serde(rename = "AdditionalCost", default)]
    additional_cost: Option<f64>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
}

/// POST /api/peer/add — register a new edge; responds with the edge config
/// template when one is configured.
async fn peer_add(
    State(coordinator): State<Arc<Coordinator>>,
    Query(q): Query<PeerAddQuery>,
) -> Result<String, (StatusCode, String)> {
    if q.password != coordinator.passwords.add_peer {
        return Err((StatusCode::UNAUTHORIZED, "bad password".to_string()));
    }
    let info = SuperPeerInfo {
        node_id: etherguard_core::types::Vertex(q.node_id),
        name: q.name.unwrap_or_default(),
        pub_key: q.pubkey,
        psk: q.psk.unwrap_or_default(),
        additional_cost: q.additional_cost.unwrap_or(0.0),
    };
    coordinator
        .peer_add(info)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    coordinator.refresh_api_peers();
    info!(node = q.node_id, "peer added via API");

    if coordinator.edge_template.is_empty() {
        return Ok(String::new());
    }
    match tokio::fs::read_to_string(&coordinator.edge_template).await {
        Ok(template) => Ok(template),
        Err(_) => Ok(String::new()),
    }
}

#[derive(Debug, Deserialize)]
struct PeerDelQuery {
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "NodeID", default)]
    node_id: Option<u16>,
    #[serde(rename = "PubKey", default)]
    pubkey: Option<String>,
}

/// POST /api/peer/del — dismiss an edge by NodeID or PubKey.
async fn peer_del(
    State(coordinator): State<Arc<Coordinator>>,
    Query(q): Query<PeerDelQuery>,
) -> Result<String, (StatusCode, String)> {
    if q.password != coordinator.passwords.del_peer {
        return Err((StatusCode::UNAUTHORIZED, "bad password".to_string()));
    }
    let id = match (q.node_id, q.pubkey.as_deref()) {
        (Some(id), _) => etherguard_core::types::Vertex(id),
        (None, Some(pk)) => coordinator
            .node_id_of_pubkey(pk)
            .ok_or((StatusCode::NOT_FOUND, "unknown PubKey".to_string()))?,
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "NodeID or PubKey required".to_string(),
            ))
        }
    };
    coordinator.peer_del(id).await;
    Ok(String::new())
}
