//! Supernode coordinator: the authoritative graph and the push machinery.
//!
//! One event task drains the bounded register and pong queues, which
//! serializes every write to the graph and the peer maps. Two background
//! loops push settings and re-inject synthetic events so staleness is
//! reassessed even when the mesh goes quiet. The HTTP API serves the
//! payloads that pushes merely announce.

use anyhow::{Context, Result};
use etherguard_core::graph::Graph;
use etherguard_core::msg::{
    ApiPeerInfo, PongMsg, RegisterMsg, UpdateErrorMsg, UpdateNhTableMsg, UpdatePeerMsg,
};
use etherguard_core::msg::ErrorAction;
use etherguard_core::peer::{key_from_base64, PeerConfig, PeerTable};
use etherguard_core::proto::{EgHeader, Packet, Usage};
use etherguard_core::router::{RouteEvent, RoutingController};
use etherguard_core::transport::{Bind, BindMode, NoisePublicKey};
use etherguard_core::types::{NextHopTable, StateHash, Vertex, SUPERNODE, ZERO_HASH};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Passwords, SuperConfig, SuperPeerInfo};

const EVENT_QUEUE: usize = 32;
const UDP_RECV_BUF_SIZE: usize = 2048;

/// One transport identity (v4-only or v6-only socket plus its peer table).
pub struct Device {
    pub label: &'static str,
    pub table: PeerTable,
    pub bind: Arc<Bind>,
}

/// Per-edge bookkeeping mirroring what the edge last told us.
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    pub last_seen: Option<Instant>,
    /// Next-hop table hash the edge last echoed in a Register.
    pub nh_table_state: StateHash,
    /// Peer-info hash the edge last echoed.
    pub peer_info_state: StateHash,
    pub local_v4: String,
    pub local_v6: String,
}

/// Row of the `/api/state` report.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStateReport {
    #[serde(rename = "NodeID")]
    pub node_id: Vertex,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "LastSeenSecsAgo")]
    pub last_seen_secs_ago: Option<f64>,
    #[serde(rename = "NhTableInSync")]
    pub nh_table_in_sync: bool,
    #[serde(rename = "PeerInfoInSync")]
    pub peer_info_in_sync: bool,
}

/// Full `/api/state` payload.
#[derive(Debug, Clone, Serialize)]
pub struct SuperState {
    #[serde(rename = "Peers")]
    pub peers: Vec<PeerStateReport>,
    #[serde(rename = "NextHopTable")]
    pub next_hop_table: NextHopTable,
    #[serde(rename = "Edges")]
    pub edges: BTreeMap<Vertex, BTreeMap<Vertex, f64>>,
}

pub struct Coordinator {
    node_report_timeout: Duration,
    timeout_check_interval: Duration,
    re_push_interval: Duration,
    use_psk_for_inter_edge: bool,
    pub passwords: Passwords,
    pub edge_template: String,
    graph: Arc<Graph>,
    controller: RoutingController,
    devices: Vec<Arc<Device>>,
    peer_info: RwLock<BTreeMap<Vertex, SuperPeerInfo>>,
    peer_keys: RwLock<HashMap<Vertex, NoisePublicKey>>,
    peer_state: RwLock<HashMap<NoisePublicKey, PeerState>>,
    peer_info_hash: RwLock<StateHash>,
    api_peers: RwLock<Vec<ApiPeerInfo>>,
}

impl Coordinator {
    pub fn new(cfg: &SuperConfig, devices: Vec<Arc<Device>>) -> Result<Arc<Self>> {
        let graph = Arc::new(Graph::new(true, &cfg.graph_recalculate_setting));
        let (controller, _hash_rx) = RoutingController::new(graph.clone());

        if cfg.graph_recalculate_setting.static_mode {
            check_nh_table(&cfg.next_hop_table, &cfg.peers)?;
        }
        if !cfg.next_hop_table.is_empty() {
            graph.set_nh_table(cfg.next_hop_table.clone(), ZERO_HASH);
        }
        // Publish the starting hash (possibly of an empty table) so edges
        // have something to converge on before the first measurement.
        controller.publish();

        let coordinator = Arc::new(Self {
            node_report_timeout: graph.node_report_timeout(),
            timeout_check_interval: graph.timeout_check_interval(),
            re_push_interval: Duration::from_secs_f64(cfg.re_push_config_interval.max(1.0)),
            use_psk_for_inter_edge: cfg.use_psk_for_inter_edge,
            passwords: cfg.passwords.clone(),
            edge_template: cfg.edge_template.clone(),
            graph,
            controller,
            devices,
            peer_info: RwLock::new(BTreeMap::new()),
            peer_keys: RwLock::new(HashMap::new()),
            peer_state: RwLock::new(HashMap::new()),
            peer_info_hash: RwLock::new(ZERO_HASH),
            api_peers: RwLock::new(Vec::new()),
        });
        for peer in &cfg.peers {
            coordinator.peer_add(peer.clone())?;
        }
        coordinator.refresh_api_peers();
        Ok(coordinator)
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn nh_table_hash(&self) -> StateHash {
        self.controller.current_hash()
    }

    pub fn peer_info_hash(&self) -> StateHash {
        *self.peer_info_hash.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn api_peers(&self) -> Vec<ApiPeerInfo> {
        self.api_peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn nh_table(&self) -> NextHopTable {
        self.graph.tables().next.clone()
    }

    /// True when `pubkey` (base64) belongs to a registered edge.
    pub fn knows_pubkey(&self, pubkey_b64: &str) -> bool {
        match key_from_base64(pubkey_b64) {
            Ok(pk) => self
                .peer_state
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&pk),
            Err(_) => false,
        }
    }

    /// NodeID registered for a base64 public key.
    pub fn node_id_of_pubkey(&self, pubkey_b64: &str) -> Option<Vertex> {
        let pk = key_from_base64(pubkey_b64).ok()?;
        let keys = self.peer_keys.read().unwrap_or_else(|e| e.into_inner());
        keys.iter().find(|(_, v)| **v == pk).map(|(id, _)| *id)
    }

    /// Register a new edge on every transport and in the maps.
    pub fn peer_add(&self, info: SuperPeerInfo) -> Result<()> {
        if !info.node_id.is_normal() {
            anyhow::bail!("NodeID {} is reserved or invalid", info.node_id);
        }
        if info.additional_cost < 0.0 {
            anyhow::bail!("AdditionalCost can't be smaller than zero");
        }
        let pubkey = key_from_base64(&info.pub_key)
            .with_context(|| format!("bad PubKey for peer {}", info.node_id))?;
        let psk = if info.psk.is_empty() {
            None
        } else {
            Some(
                key_from_base64(&info.psk)
                    .with_context(|| format!("bad PSKey for peer {}", info.node_id))?,
            )
        };
        for dev in &self.devices {
            dev.table.add_peer(PeerConfig {
                node_id: info.node_id,
                pubkey,
                psk,
                endpoint: None,
                conn_url: String::new(),
                static_conn: false,
                additional_cost: info.additional_cost,
            });
        }
        self.peer_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.node_id, pubkey);
        self.peer_state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pubkey, PeerState::default());
        self.peer_info
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.node_id, info);
        Ok(())
    }

    /// Dismiss an edge: ten Shutdown directives at 100 ms spacing on both
    /// transports, then remove peer, vertex, and map entries.
    pub async fn peer_del(&self, id: Vertex) {
        let pk = {
            let keys = self.peer_keys.read().unwrap_or_else(|e| e.into_inner());
            match keys.get(&id) {
                Some(pk) => *pk,
                None => return,
            }
        };
        let goodbye = UpdateErrorMsg {
            node_id: id,
            action: ErrorAction::Shutdown,
            error_code: 410,
            error_msg: "You've been removed from supernode.".to_string(),
        };
        let plain = EgHeader::seal_body(Usage::UpdateError, 0, SUPERNODE, id, &goodbye.encode());
        for _ in 0..10 {
            for dev in &self.devices {
                if let Some((wire, dst)) = dev.table.seal_for(&pk, &plain) {
                    if let Err(e) = dev.bind.send_to(&wire, dst).await {
                        debug!(error = %e, "shutdown notice send failed");
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for dev in &self.devices {
            dev.table.remove_by_id(id);
        }
        self.graph.remove_virt(id, true, false);
        self.controller.publish();
        self.peer_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.peer_state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pk);
        self.peer_info
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.refresh_api_peers();
        info!(node = %id, "peer removed");
    }

    /// Rebuild the peer-info payload; returns whether its hash rolled.
    pub fn refresh_api_peers(&self) -> bool {
        let infos: Vec<ApiPeerInfo> = {
            let peer_info = self.peer_info.read().unwrap_or_else(|e| e.into_inner());
            let peer_keys = self.peer_keys.read().unwrap_or_else(|e| e.into_inner());
            peer_info
                .values()
                .map(|spi| {
                    let pk = peer_keys.get(&spi.node_id);
                    let (conn_v4, conn_v6) = match pk {
                        Some(pk) => (
                            self.endpoint_string(0, pk),
                            self.endpoint_string(1, pk),
                        ),
                        None => (String::new(), String::new()),
                    };
                    ApiPeerInfo {
                        node_id: spi.node_id,
                        pubkey: spi.pub_key.clone(),
                        psk: if self.use_psk_for_inter_edge && !spi.psk.is_empty() {
                            Some(spi.psk.clone())
                        } else {
                            None
                        },
                        conn_v4,
                        conn_v6,
                    }
                })
                .collect()
        };
        let hash = self.controller.hash_state(&infos);
        let mut stored = self.peer_info_hash.write().unwrap_or_else(|e| e.into_inner());
        if *stored == hash {
            return false;
        }
        *stored = hash;
        drop(stored);
        *self.api_peers.write().unwrap_or_else(|e| e.into_inner()) = infos;
        true
    }

    fn endpoint_string(&self, dev_index: usize, pk: &NoisePublicKey) -> String {
        self.devices
            .get(dev_index)
            .and_then(|dev| dev.table.snapshot(pk))
            .and_then(|snap| snap.endpoint)
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    /// Register handler: refresh liveness, compare the echoed hashes against
    /// the currently published ones, absorb local IPs, and trigger targeted
    /// pushes where the edge lags.
    pub async fn handle_register(&self, msg: RegisterMsg) {
        let mut should_push_nh = false;
        let mut should_push_peer = false;
        if msg.node_id.is_normal() {
            let pk = {
                let keys = self.peer_keys.read().unwrap_or_else(|e| e.into_inner());
                keys.get(&msg.node_id).copied()
            };
            let Some(pk) = pk else {
                debug!(node = %msg.node_id, "register from unknown node");
                return;
            };
            let current_nh = self.controller.current_hash();
            let current_pi = self.peer_info_hash();
            let mut states = self.peer_state.write().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get_mut(&pk) {
                state.last_seen = Some(Instant::now());
                state.nh_table_state = msg.nh_state_hash;
                state.peer_info_state = msg.peer_state_hash;
                if msg.nh_state_hash != current_nh {
                    should_push_nh = true;
                }
                if msg.peer_state_hash != current_pi {
                    should_push_peer = true;
                }
                state.local_v4 = msg.local_v4;
                state.local_v6 = msg.local_v6;
            }
        }
        let peers_changed = self.refresh_api_peers();
        if should_push_peer || peers_changed {
            self.push_peerinfo(false).await;
        }
        if should_push_nh {
            self.push_nh_table(false).await;
        }
    }

    /// Pong handler: feed the measurement in (or, for synthetic self-pongs,
    /// just reassess staleness) and broadcast-push on any table change.
    pub async fn handle_pong(&self, msg: PongMsg) {
        let changed = if msg.src.is_normal() && msg.dst.is_normal() {
            let cost = {
                let info = self.peer_info.read().unwrap_or_else(|e| e.into_inner());
                info.get(&msg.dst).map(|p| p.additional_cost).unwrap_or(0.0)
            };
            self.controller.handle(RouteEvent::Pong {
                src: msg.src,
                dst: msg.dst,
                seconds: msg.time_diff_secs,
                additional_cost: cost,
            })
        } else {
            self.controller.handle(RouteEvent::Tick)
        };
        if changed {
            self.push_nh_table(false).await;
        }
    }

    fn alive(&self, state: &PeerState) -> bool {
        state
            .last_seen
            .map(|t| t.elapsed() < self.node_report_timeout)
            .unwrap_or(false)
    }

    /// Announce the current next-hop table hash to every live edge that does
    /// not hold it yet (all live edges when `force`).
    pub async fn push_nh_table(&self, force: bool) {
        let hash = self.controller.current_hash();
        let body = UpdateNhTableMsg { state_hash: hash }.encode();
        let plain = EgHeader::seal_body(Usage::UpdateNhTable, 0, SUPERNODE, SUPERNODE, &body);
        let sends = self.collect_pushes(&plain, |state| {
            force || state.nh_table_state != hash
        });
        self.send_all(sends).await;
    }

    /// Same for the peer-info hash.
    pub async fn push_peerinfo(&self, force: bool) {
        let hash = self.peer_info_hash();
        let body = UpdatePeerMsg { state_hash: hash }.encode();
        let plain = EgHeader::seal_body(Usage::UpdatePeer, 0, SUPERNODE, SUPERNODE, &body);
        let sends = self.collect_pushes(&plain, |state| {
            force || state.peer_info_state != hash
        });
        self.send_all(sends).await;
    }

    fn collect_pushes(
        &self,
        plain: &[u8],
        wants: impl Fn(&PeerState) -> bool,
    ) -> Vec<(Arc<Bind>, Vec<u8>, SocketAddr)> {
        let targets: Vec<NoisePublicKey> = {
            let states = self.peer_state.read().unwrap_or_else(|e| e.into_inner());
            states
                .iter()
                .filter(|(_, state)| self.alive(state) && wants(state))
                .map(|(pk, _)| *pk)
                .collect()
        };
        let mut sends = Vec::new();
        for pk in targets {
            for dev in &self.devices {
                if let Some((wire, dst)) = dev.table.seal_for(&pk, plain) {
                    sends.push((dev.bind.clone(), wire, dst));
                }
            }
        }
        sends
    }

    async fn send_all(&self, sends: Vec<(Arc<Bind>, Vec<u8>, SocketAddr)>) {
        for (bind, wire, dst) in sends {
            if let Err(e) = bind.send_to(&wire, dst).await {
                debug!(error = %e, %dst, "push send failed");
            }
        }
    }

    /// The `/api/state` report.
    pub fn state_report(&self) -> SuperState {
        let nh_hash = self.controller.current_hash();
        let pi_hash = self.peer_info_hash();
        let peer_info = self.peer_info.read().unwrap_or_else(|e| e.into_inner());
        let peer_keys = self.peer_keys.read().unwrap_or_else(|e| e.into_inner());
        let states = self.peer_state.read().unwrap_or_else(|e| e.into_inner());
        let peers = peer_info
            .values()
            .map(|spi| {
                let state = peer_keys.get(&spi.node_id).and_then(|pk| states.get(pk));
                PeerStateReport {
                    node_id: spi.node_id,
                    name: spi.name.clone(),
                    last_seen_secs_ago: state
                        .and_then(|s| s.last_seen)
                        .map(|t| t.elapsed().as_secs_f64()),
                    nh_table_in_sync: state.map(|s| s.nh_table_state == nh_hash).unwrap_or(false),
                    peer_info_in_sync: state
                        .map(|s| s.peer_info_state == pi_hash)
                        .unwrap_or(false),
                }
            })
            .collect();
        SuperState {
            peers,
            next_hop_table: self.nh_table(),
            edges: self.graph.get_edges(false),
        }
    }
}

/// In static mode every pair of configured peers must already have a next
/// hop, and that hop must itself be a configured peer.
fn check_nh_table(table: &NextHopTable, peers: &[SuperPeerInfo]) -> Result<()> {
    let ids: Vec<Vertex> = peers.iter().map(|p| p.node_id).collect();
    for &a in &ids {
        for &b in &ids {
            if a == b {
                continue;
            }
            let hop = table
                .get(&a)
                .and_then(|row| row.get(&b))
                .copied()
                .with_context(|| format!("NextHopTable[{a}][{b}] not found"))?;
            if !ids.contains(&hop) {
                anyhow::bail!("NextHopTable[{a}][{b}]={hop} which is not in the peer list");
            }
        }
    }
    Ok(())
}

/// Receive task for one device: authenticate, parse, and queue events.
async fn device_recv_loop(
    dev: Arc<Device>,
    register_tx: mpsc::Sender<RegisterMsg>,
    pong_tx: mpsc::Sender<PongMsg>,
    mut stop: watch::Receiver<bool>,
) {
    let receivers = dev.bind.receivers();
    let Some((_, sock)) = receivers.into_iter().next() else {
        return;
    };
    let mut buf = [0u8; UDP_RECV_BUF_SIZE];
    loop {
        tokio::select! {
            recv = sock.recv_from(&mut buf) => {
                let (n, src) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, family = dev.label, "socket receive error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let Ok(packet) = Packet::decode(&buf[..n]) else {
                    continue;
                };
                let Some((_pk, plain)) = dev.table.open_from(&packet, src) else {
                    debug!(%src, family = dev.label, "unauthenticated packet");
                    continue;
                };
                let Ok((hdr, body)) = EgHeader::open_body(&plain) else {
                    continue;
                };
                match hdr.usage {
                    Usage::Register => {
                        if let Ok(msg) = RegisterMsg::decode(body) {
                            // Bounded queue: drop on overflow, the next
                            // periodic tick restores correctness.
                            if register_tx.try_send(msg).is_err() {
                                warn!("register queue full, dropping");
                            }
                        }
                    }
                    Usage::Pong => {
                        if let Ok(msg) = PongMsg::decode(body) {
                            if pong_tx.try_send(msg).is_err() {
                                warn!("pong queue full, dropping");
                            }
                        }
                    }
                    other => debug!(usage = %other, family = dev.label, "ignoring payload"),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

fn run_post_script(cfg: &SuperConfig) -> Result<()> {
    if cfg.post_script.is_empty() {
        return Ok(());
    }
    let mut args = cfg.post_script.split_whitespace();
    let prog = args.next().context("PostScript is blank")?;
    let output = std::process::Command::new(prog)
        .args(args)
        .env("EG_MODE", "super")
        .env("EG_NODE_NAME", &cfg.node_name)
        .output()
        .with_context(|| format!("PostScript '{}' failed to start", cfg.post_script))?;
    if !output.status.success() {
        anyhow::bail!(
            "PostScript exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    info!(script = %cfg.post_script, "PostScript finished");
    Ok(())
}

/// Run a supernode until shutdown.
pub async fn run_super(cfg: SuperConfig, mut stop: watch::Receiver<bool>) -> Result<()> {
    if cfg.node_name.len() > 32 {
        anyhow::bail!("node name can't be longer than 32: {}", cfg.node_name);
    }

    let mut devices = Vec::new();
    if !cfg.priv_key_v4.is_empty() {
        let priv4 = key_from_base64(&cfg.priv_key_v4).context("bad PrivKeyV4")?;
        let bind = Bind::open(BindMode::V4Only, cfg.listen_port)
            .await
            .context("failed to bind IPv4 socket")?;
        devices.push(Arc::new(Device {
            label: "v4",
            table: PeerTable::new(SUPERNODE, &priv4),
            bind: Arc::new(bind),
        }));
    }
    if !cfg.priv_key_v6.is_empty() {
        let priv6 = key_from_base64(&cfg.priv_key_v6).context("bad PrivKeyV6")?;
        match Bind::open(BindMode::V6Only, cfg.listen_port).await {
            Ok(bind) => devices.push(Arc::new(Device {
                label: "v6",
                table: PeerTable::new(SUPERNODE, &priv6),
                bind: Arc::new(bind),
            })),
            // v4 alone still carries the control plane.
            Err(e) if !devices.is_empty() => {
                error!(error = %e, "failed to bind IPv6 socket, continuing v4-only");
            }
            Err(e) => return Err(e).context("failed to bind IPv6 socket"),
        }
    }
    if devices.is_empty() {
        anyhow::bail!("no private key configured for either address family");
    }
    info!(port = cfg.listen_port, devices = devices.len(), "supernode transports bound");

    let coordinator = Coordinator::new(&cfg, devices.clone())?;

    let (register_tx, mut register_rx) = mpsc::channel::<RegisterMsg>(EVENT_QUEUE);
    let (pong_tx, mut pong_rx) = mpsc::channel::<PongMsg>(EVENT_QUEUE);

    for dev in &devices {
        tokio::spawn(device_recv_loop(
            dev.clone(),
            register_tx.clone(),
            pong_tx.clone(),
            stop.clone(),
        ));
    }

    // Single event task: all graph and map writes happen here, in arrival
    // order.
    {
        let coordinator = coordinator.clone();
        let mut stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = register_rx.recv() => coordinator.handle_register(msg).await,
                    Some(msg) = pong_rx.recv() => coordinator.handle_pong(msg).await,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Push settings loop: every second, forced on the re-push interval.
    {
        let coordinator = coordinator.clone();
        let mut stop = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            let mut last_force = Instant::now();
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let force = last_force.elapsed() >= coordinator.re_push_interval;
                        if force {
                            last_force = Instant::now();
                        }
                        coordinator.push_nh_table(force).await;
                        coordinator.push_peerinfo(force).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Timeout check loop: synthetic self events through the same queues the
    // event task drains. A saturated queue delays the tick rather than losing
    // it, and the tick is what reassesses staleness.
    {
        let interval = coordinator.timeout_check_interval.max(Duration::from_secs(1));
        let register_tx = register_tx.clone();
        let pong_tx = pong_tx.clone();
        let mut stop = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let _ = register_tx.try_send(RegisterMsg {
                            node_id: SUPERNODE,
                            version: "dummy".to_string(),
                            nh_state_hash: ZERO_HASH,
                            peer_state_hash: ZERO_HASH,
                            local_v4: String::new(),
                            local_v6: String::new(),
                        });
                        let _ = pong_tx.try_send(PongMsg {
                            request_id: 0,
                            src: SUPERNODE,
                            dst: SUPERNODE,
                            time_diff_secs: 0.0,
                        });
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // HTTP API on the same port number, TCP side.
    let api_router = crate::api::router(coordinator.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("failed to bind HTTP API on port {}", cfg.listen_port))?;
    {
        let mut stop = stop.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                loop {
                    if stop.changed().await.is_err() || *stop.borrow() {
                        return;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, api_router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "HTTP API server failed");
            }
        });
    }

    run_post_script(&cfg)?;
    info!("supernode started");

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("stop requested");
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::example_config;
    use etherguard_core::peer::key_to_base64;
    use etherguard_core::transport::pubkey_from_private;

    async fn test_coordinator(peers: Vec<SuperPeerInfo>) -> Arc<Coordinator> {
        let mut cfg = example_config();
        cfg.peers = peers;
        cfg.graph_recalculate_setting.jitter_tolerance = 0.0;
        cfg.graph_recalculate_setting.jitter_tolerance_multiplier = 1.0;
        cfg.graph_recalculate_setting.recalculate_cool_down = 0.0;

        let priv4 = key_from_base64(&cfg.priv_key_v4).unwrap();
        let bind = Bind::open(BindMode::V4Only, 0).await.unwrap();
        let devices = vec![Arc::new(Device {
            label: "v4",
            table: PeerTable::new(SUPERNODE, &priv4),
            bind: Arc::new(bind),
        })];
        Coordinator::new(&cfg, devices).unwrap()
    }

    fn edge_peer(id: u16, private: &[u8; 32]) -> SuperPeerInfo {
        SuperPeerInfo {
            node_id: Vertex(id),
            name: format!("Node_{id:02}"),
            pub_key: key_to_base64(&pubkey_from_private(private)),
            psk: String::new(),
            additional_cost: 0.0,
        }
    }

    fn register_for(coordinator: &Coordinator, id: u16) -> RegisterMsg {
        RegisterMsg {
            node_id: Vertex(id),
            version: "test".to_string(),
            nh_state_hash: coordinator.nh_table_hash(),
            peer_state_hash: coordinator.peer_info_hash(),
            local_v4: String::new(),
            local_v6: String::new(),
        }
    }

    #[tokio::test]
    async fn test_pong_builds_graph_and_rolls_hash() {
        let coordinator = test_coordinator(vec![
            edge_peer(1, &[11u8; 32]),
            edge_peer(2, &[12u8; 32]),
        ])
        .await;
        let before = coordinator.nh_table_hash();

        coordinator
            .handle_pong(PongMsg {
                request_id: 1,
                src: Vertex(1),
                dst: Vertex(2),
                time_diff_secs: 0.5,
            })
            .await;

        assert_ne!(coordinator.nh_table_hash(), before);
        let table = coordinator.nh_table();
        assert_eq!(table[&Vertex(1)][&Vertex(2)], Vertex(2));
    }

    #[tokio::test]
    async fn test_supernode_convergence_cycle() {
        let coordinator = test_coordinator(vec![
            edge_peer(1, &[11u8; 32]),
            edge_peer(2, &[12u8; 32]),
        ])
        .await;

        // Latency reports build the graph and roll the published hash; both
        // edges still echo stale hashes.
        coordinator
            .handle_pong(PongMsg {
                request_id: 1,
                src: Vertex(1),
                dst: Vertex(2),
                time_diff_secs: 0.5,
            })
            .await;
        coordinator
            .handle_pong(PongMsg {
                request_id: 2,
                src: Vertex(2),
                dst: Vertex(1),
                time_diff_secs: 0.5,
            })
            .await;

        let report = coordinator.state_report();
        assert!(report.peers.iter().all(|p| !p.nh_table_in_sync));

        // One register cycle echoing the current hashes converges both.
        coordinator.handle_register(register_for(&coordinator, 1)).await;
        coordinator.handle_register(register_for(&coordinator, 2)).await;

        let report = coordinator.state_report();
        assert!(report.peers.iter().all(|p| p.nh_table_in_sync));
        assert!(report.peers.iter().all(|p| p.peer_info_in_sync));
        assert!(report.peers.iter().all(|p| p.last_seen_secs_ago.is_some()));
    }

    #[tokio::test]
    async fn test_synthetic_pong_reassesses_without_vertices() {
        let coordinator = test_coordinator(vec![edge_peer(1, &[11u8; 32])]).await;
        let before = coordinator.nh_table_hash();
        coordinator
            .handle_pong(PongMsg {
                request_id: 0,
                src: SUPERNODE,
                dst: SUPERNODE,
                time_diff_secs: 0.0,
            })
            .await;
        assert_eq!(coordinator.nh_table_hash(), before);
        assert!(coordinator.graph().vertices().is_empty());
    }

    #[tokio::test]
    async fn test_peer_add_rejects_bad_input() {
        let coordinator = test_coordinator(vec![]).await;
        let mut bad_cost = edge_peer(3, &[13u8; 32]);
        bad_cost.additional_cost = -1.0;
        assert!(coordinator.peer_add(bad_cost).is_err());

        let mut bad_key = edge_peer(3, &[13u8; 32]);
        bad_key.pub_key = "not base64!".to_string();
        assert!(coordinator.peer_add(bad_key).is_err());

        let mut reserved = edge_peer(3, &[13u8; 32]);
        reserved.node_id = SUPERNODE;
        assert!(coordinator.peer_add(reserved).is_err());
    }

    #[tokio::test]
    async fn test_peer_del_removes_everything() {
        let coordinator = test_coordinator(vec![
            edge_peer(1, &[11u8; 32]),
            edge_peer(2, &[12u8; 32]),
        ])
        .await;
        coordinator
            .handle_pong(PongMsg {
                request_id: 1,
                src: Vertex(1),
                dst: Vertex(2),
                time_diff_secs: 0.5,
            })
            .await;

        // No endpoint is known for the dismissed edge, so the shutdown burst
        // has nothing to send; removal must still be total. Paused time
        // fast-forwards through the 10 × 100 ms spacing.
        tokio::time::pause();
        coordinator.peer_del(Vertex(2)).await;
        tokio::time::resume();

        assert!(!coordinator.graph().vertices().contains(&Vertex(2)));
        assert!(coordinator.api_peers().iter().all(|p| p.node_id != Vertex(2)));
        let report = coordinator.state_report();
        assert_eq!(report.peers.len(), 1);
    }

    #[test]
    fn test_check_nh_table() {
        let peers = vec![edge_peer(1, &[11u8; 32]), edge_peer(2, &[12u8; 32])];
        let mut table = NextHopTable::new();
        assert!(check_nh_table(&table, &peers).is_err());

        table.entry(Vertex(1)).or_default().insert(Vertex(2), Vertex(2));
        table.entry(Vertex(2)).or_default().insert(Vertex(1), Vertex(1));
        assert!(check_nh_table(&table, &peers).is_ok());

        table.entry(Vertex(1)).or_default().insert(Vertex(2), Vertex(9));
        assert!(check_nh_table(&table, &peers).is_err());
    }
}
