//! Edge runtime: the loops of one mesh participant.
//!
//! Layout mirrors the rest of the system: one receive task per bound socket
//! and a TAP reader thread feed bounded channels; a single select loop owns
//! all mutable state, so control handling needs no extra locking. Shutdown is
//! a watch channel observed at every suspension point.

use anyhow::{Context, Result};
use etherguard_core::forward::{dispatch_forward, dispatch_from_tap, Dispatch};
use etherguard_core::graph::Graph;
use etherguard_core::msg::{
    ApiPeerInfo, BroadcastPeerMsg, ErrorAction, PingMsg, PongMsg, RegisterMsg, UpdateErrorMsg,
    UpdateNhTableMsg, UpdatePeerMsg,
};
use etherguard_core::peer::{key_from_base64, key_to_base64, parse_endpoint_af, PeerConfig, PeerTable};
use etherguard_core::proto::{EgHeader, Packet, Usage};
use etherguard_core::router::{RouteEvent, RoutingController};
use etherguard_core::tap::{dst_node_of_frame, DummyTap, FrameIo};
use etherguard_core::transport::{Bind, BindMode};
use etherguard_core::types::{NextHopTable, StateHash, Vertex, SUPERNODE, ZERO_HASH};

use crate::config::EdgeConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const NET_QUEUE: usize = 1024;
const TAP_QUEUE: usize = 1024;
const UDP_RECV_BUF_SIZE: usize = 2048;

pub const VERSION: &str = concat!("etherguard-rs ", env!("CARGO_PKG_VERSION"));

/// Seconds since the Unix epoch. The NTP skew estimator is an external
/// collaborator; without it the raw wall clock is used.
fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn parse_mac_prefix(s: &str) -> Result<[u8; 4]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 4 {
        anyhow::bail!("MacAddrPrefix must have exactly 4 bytes, got '{s}'");
    }
    let mut out = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .with_context(|| format!("invalid MacAddrPrefix byte '{part}'"))?;
    }
    if out[0] & 0x01 != 0 {
        anyhow::bail!("MacAddrPrefix must not set the multicast bit");
    }
    Ok(out)
}

fn open_tap(cfg: &EdgeConfig) -> Result<Box<dyn FrameIo>> {
    match cfg.interface.itype.as_str() {
        "dummy" => Ok(Box::new(DummyTap)),
        other => anyhow::bail!("unknown interface type: {other}"),
    }
}

enum LoopAction {
    Continue,
    Shutdown,
    Fail(String),
}

struct EdgeRuntime {
    node_id: Vertex,
    default_ttl: u8,
    use_super: bool,
    use_p2p: bool,
    save_new_peers: bool,
    skip_local_ip: bool,
    api_url: String,
    graph: Arc<Graph>,
    controller: RoutingController,
    peers: Arc<PeerTable>,
    bind: Arc<Bind>,
    http: reqwest::Client,
    net_to_tap: mpsc::Sender<Vec<u8>>,
    /// Peer-info hash last applied from the supernode.
    peer_info_hash: StateHash,
    /// Reporting divider; doubled on every ThrottleOnly directive.
    throttle: u32,
    request_counter: u64,
}

impl EdgeRuntime {
    async fn send_sealed(&self, wire: Vec<u8>, dst: SocketAddr) {
        if let Err(e) = self.bind.send_to(&wire, dst).await {
            debug!(error = %e, %dst, "send failed, dropping packet");
        }
    }

    /// Seal `plain` toward node `to` and send it.
    async fn send_plain_to_id(&self, to: Vertex, plain: &[u8]) {
        match self.peers.seal_for_id(to, plain) {
            Some((wire, dst)) => self.send_sealed(wire, dst).await,
            None => debug!(%to, "no usable peer for destination, dropping"),
        }
    }

    /// Send a control body to every key registered for the supernode.
    async fn send_control_to_super(&self, usage: Usage, body: &[u8]) {
        let plain = EgHeader::seal_body(usage, 0, self.node_id, SUPERNODE, body);
        for pk in self.peers.pubkeys_of(SUPERNODE) {
            if let Some((wire, dst)) = self.peers.seal_for(&pk, &plain) {
                self.send_sealed(wire, dst).await;
            }
        }
    }

    async fn handle_tap_frame(&mut self, frame: Vec<u8>) {
        let Some(dst) = dst_node_of_frame(&frame) else {
            return;
        };
        let tables = self.graph.tables();
        match dispatch_from_tap(&tables, self.node_id, dst) {
            Dispatch::Unicast(hop) => {
                let plain =
                    EgHeader::seal_body(Usage::Normal, self.default_ttl, self.node_id, dst, &frame);
                self.send_plain_to_id(hop, &plain).await;
            }
            Dispatch::Multicast(hops) => {
                let plain =
                    EgHeader::seal_body(Usage::Normal, self.default_ttl, self.node_id, dst, &frame);
                for hop in hops {
                    self.send_plain_to_id(hop, &plain).await;
                }
            }
            Dispatch::Drop(reason) => debug!(?reason, %dst, "dropping TAP frame"),
            Dispatch::ToTap | Dispatch::TapAndRelay(_) => {}
        }
    }

    async fn handle_packet(&mut self, buf: Vec<u8>, src: SocketAddr) -> LoopAction {
        let packet = match Packet::decode(&buf) {
            Ok(p) => p,
            Err(e) => {
                debug!(%src, error = %e, "invalid packet");
                return LoopAction::Continue;
            }
        };
        let Some((_pk, plain)) = self.peers.open_from(&packet, src) else {
            debug!(%src, sender = %packet.header.sender, "unauthenticated packet");
            return LoopAction::Continue;
        };
        let (hdr, body) = match EgHeader::open_body(&plain) {
            Ok(v) => v,
            Err(e) => {
                debug!(%src, error = %e, "bad EG header");
                return LoopAction::Continue;
            }
        };
        let in_id = packet.header.sender;

        match hdr.usage {
            Usage::Normal => self.handle_normal(&hdr, body, in_id).await,
            Usage::Ping => self.handle_ping(body).await,
            Usage::Pong => self.handle_pong(body),
            Usage::UpdateNhTable => self.handle_update_nhtable(body).await,
            Usage::UpdatePeer => self.handle_update_peer(body).await,
            Usage::UpdateError => return self.handle_update_error(body),
            Usage::BroadcastPeer => self.handle_broadcast_peer(body),
            Usage::Register => {} // supernode business, edges ignore it
        }
        LoopAction::Continue
    }

    async fn handle_normal(&mut self, hdr: &EgHeader, body: &[u8], in_id: Vertex) {
        let tables = self.graph.tables();
        match dispatch_forward(&tables, self.node_id, hdr, in_id) {
            Dispatch::ToTap => {
                if self.net_to_tap.try_send(body.to_vec()).is_err() {
                    debug!("TAP queue full, dropping frame");
                }
            }
            Dispatch::TapAndRelay(relays) => {
                if self.net_to_tap.try_send(body.to_vec()).is_err() {
                    debug!("TAP queue full, dropping frame");
                }
                if hdr.ttl > 0 {
                    let plain =
                        EgHeader::seal_body(Usage::Normal, hdr.ttl - 1, hdr.src, hdr.dst, body);
                    for hop in relays {
                        self.send_plain_to_id(hop, &plain).await;
                    }
                }
            }
            Dispatch::Unicast(hop) => {
                let plain = EgHeader::seal_body(Usage::Normal, hdr.ttl - 1, hdr.src, hdr.dst, body);
                self.send_plain_to_id(hop, &plain).await;
            }
            Dispatch::Drop(reason) => debug!(?reason, src = %hdr.src, dst = %hdr.dst, "dropping frame"),
            Dispatch::Multicast(_) => {}
        }
    }

    async fn handle_ping(&mut self, body: &[u8]) {
        let ping = match PingMsg::decode(body) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "bad ping");
                return;
            }
        };
        let diff = (epoch_now() - ping.sent_at_secs).max(0.0);
        let pong = PongMsg {
            request_id: ping.request_id,
            src: ping.src,
            dst: self.node_id,
            time_diff_secs: diff,
        };
        if self.use_p2p {
            self.controller.handle(RouteEvent::Pong {
                src: ping.src,
                dst: self.node_id,
                seconds: diff,
                additional_cost: 0.0,
            });
            // Share the measurement so the rest of the mesh converges too.
            let body = pong.encode();
            for id in self.peers.node_ids() {
                if id.is_normal() && id != ping.src {
                    let plain = EgHeader::seal_body(Usage::Pong, 0, self.node_id, id, &body);
                    self.send_plain_to_id(id, &plain).await;
                }
            }
        }
        if self.use_super {
            self.send_control_to_super(Usage::Pong, &pong.encode()).await;
        }
    }

    fn handle_pong(&mut self, body: &[u8]) {
        if !self.use_p2p {
            return;
        }
        let pong = match PongMsg::decode(body) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "bad pong");
                return;
            }
        };
        self.controller.handle(RouteEvent::Pong {
            src: pong.src,
            dst: pong.dst,
            seconds: pong.time_diff_secs,
            additional_cost: self.peers.additional_cost_of(pong.dst),
        });
    }

    async fn handle_update_nhtable(&mut self, body: &[u8]) {
        if !self.use_super {
            return;
        }
        let msg = match UpdateNhTableMsg::decode(body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "bad nhtable update");
                return;
            }
        };
        if self.graph.nh_table_hash() == msg.state_hash {
            return;
        }
        let state = String::from_utf8_lossy(&msg.state_hash).to_string();
        let url = format!("{}/nhtable", self.api_url);
        let pubkey = key_to_base64(&self.peers.local_pubkey());
        let resp = self
            .http
            .get(&url)
            .query(&[("PubKey", pubkey.as_str()), ("State", state.as_str())])
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => match resp.json::<NextHopTable>().await {
                Ok(table) => {
                    info!("installing pushed next-hop table");
                    self.controller.apply_pushed_table(table, msg.state_hash);
                }
                Err(e) => warn!(error = %e, "bad next-hop table payload"),
            },
            Ok(resp) => warn!(status = %resp.status(), "next-hop table fetch rejected"),
            Err(e) => warn!(error = %e, "next-hop table fetch failed"),
        }
    }

    async fn handle_update_peer(&mut self, body: &[u8]) {
        if !self.use_super {
            return;
        }
        let msg = match UpdatePeerMsg::decode(body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "bad peer update");
                return;
            }
        };
        if self.peer_info_hash == msg.state_hash {
            return;
        }
        let state = String::from_utf8_lossy(&msg.state_hash).to_string();
        let url = format!("{}/peerinfo", self.api_url);
        let pubkey = key_to_base64(&self.peers.local_pubkey());
        let resp = self
            .http
            .get(&url)
            .query(&[("PubKey", pubkey.as_str()), ("State", state.as_str())])
            .send()
            .await;
        let infos: Vec<ApiPeerInfo> = match resp {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "bad peer-info payload");
                    return;
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "peer-info fetch rejected");
                return;
            }
            Err(e) => {
                warn!(error = %e, "peer-info fetch failed");
                return;
            }
        };
        for info in infos {
            if info.node_id == self.node_id || !info.node_id.is_normal() {
                continue;
            }
            let Ok(pubkey) = key_from_base64(&info.pubkey) else {
                warn!(node = %info.node_id, "peer info carries a bad public key");
                continue;
            };
            let psk = info.psk.as_deref().and_then(|s| key_from_base64(s).ok());
            let (endpoint, conn_url) = if !info.conn_v4.is_empty() {
                (parse_endpoint_af(&info.conn_v4, 4).ok(), info.conn_v4.clone())
            } else if !info.conn_v6.is_empty() {
                (parse_endpoint_af(&info.conn_v6, 6).ok(), info.conn_v6.clone())
            } else {
                (None, String::new())
            };
            self.peers.add_peer(PeerConfig {
                node_id: info.node_id,
                pubkey,
                psk,
                endpoint,
                conn_url,
                static_conn: false,
                additional_cost: 0.0,
            });
        }
        self.peer_info_hash = msg.state_hash;
        info!("installed pushed peer list");
    }

    fn handle_update_error(&mut self, body: &[u8]) -> LoopAction {
        let msg = match UpdateErrorMsg::decode(body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "bad error directive");
                return LoopAction::Continue;
            }
        };
        match msg.action {
            ErrorAction::Shutdown => {
                info!(code = msg.error_code, msg = %msg.error_msg, "supernode requested shutdown");
                LoopAction::Shutdown
            }
            ErrorAction::Panic => {
                error!(code = msg.error_code, msg = %msg.error_msg, "supernode reported a fatal error");
                LoopAction::Fail(msg.error_msg)
            }
            ErrorAction::ThrottleOnly => {
                self.throttle = (self.throttle * 2).max(2);
                warn!(
                    code = msg.error_code,
                    divider = self.throttle,
                    "supernode requested throttling"
                );
                LoopAction::Continue
            }
        }
    }

    fn handle_broadcast_peer(&mut self, body: &[u8]) {
        if !self.use_p2p {
            return;
        }
        let msg = match BroadcastPeerMsg::decode(body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "bad peer gossip");
                return;
            }
        };
        if !msg.node_id.is_normal() || msg.node_id == self.node_id {
            return;
        }
        if self.peers.contains(&msg.pubkey) || !self.save_new_peers {
            return;
        }
        let endpoint = parse_endpoint_af(&msg.conn_url, 0).ok();
        info!(node = %msg.node_id, "learning gossiped peer");
        self.peers.add_peer(PeerConfig {
            node_id: msg.node_id,
            pubkey: msg.pubkey,
            psk: None,
            endpoint,
            conn_url: msg.conn_url,
            static_conn: false,
            additional_cost: 0.0,
        });
    }

    async fn send_pings(&mut self) {
        let now = epoch_now();
        for id in self.peers.node_ids() {
            if !id.is_normal() {
                continue;
            }
            self.request_counter += 1;
            let ping = PingMsg {
                request_id: self.request_counter,
                src: self.node_id,
                dst: id,
                sent_at_secs: now,
            };
            let plain = EgHeader::seal_body(Usage::Ping, 0, self.node_id, id, &ping.encode());
            self.send_plain_to_id(id, &plain).await;
        }
    }

    async fn send_register(&mut self) {
        let (local_v4, local_v6) = if self.skip_local_ip {
            (String::new(), String::new())
        } else {
            (
                self.bind.local_v4().map(|a| a.to_string()).unwrap_or_default(),
                self.bind.local_v6().map(|a| a.to_string()).unwrap_or_default(),
            )
        };
        let reg = RegisterMsg {
            node_id: self.node_id,
            version: VERSION.to_string(),
            nh_state_hash: self.graph.nh_table_hash(),
            peer_state_hash: self.peer_info_hash,
            local_v4,
            local_v6,
        };
        self.send_control_to_super(Usage::Register, &reg.encode())
            .await;
    }

    async fn send_peer_gossip(&mut self) {
        self.request_counter += 1;
        let request_id = self.request_counter;
        let snapshots = self.peers.snapshots();
        for announce in &snapshots {
            if !announce.node_id.is_normal() {
                continue;
            }
            let msg = BroadcastPeerMsg {
                request_id,
                node_id: announce.node_id,
                pubkey: announce.pubkey,
                conn_url: announce
                    .endpoint
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| announce.conn_url.clone()),
            };
            let body = msg.encode();
            for peer in &snapshots {
                if peer.node_id.is_normal() && peer.node_id != announce.node_id {
                    let plain =
                        EgHeader::seal_body(Usage::BroadcastPeer, 0, self.node_id, peer.node_id, &body);
                    self.send_plain_to_id(peer.node_id, &plain).await;
                }
            }
        }
    }
}

fn run_post_script(cfg: &EdgeConfig) -> Result<()> {
    if cfg.post_script.is_empty() {
        return Ok(());
    }
    let mut args = cfg.post_script.split_whitespace();
    let prog = args.next().context("PostScript is blank")?;
    let nid = cfg.node_id.0.to_le_bytes();
    let output = std::process::Command::new(prog)
        .args(args)
        .env("EG_MODE", "edge")
        .env("EG_NODE_NAME", &cfg.node_name)
        .env("EG_NODE_ID_INT_DEC", cfg.node_id.0.to_string())
        .env("EG_NODE_ID_BYTE0_DEC", nid[0].to_string())
        .env("EG_NODE_ID_BYTE1_DEC", nid[1].to_string())
        .env("EG_NODE_ID_INT_HEX", format!("{:x}", cfg.node_id.0))
        .env("EG_NODE_ID_BYTE0_HEX", format!("{:X}", nid[0]))
        .env("EG_NODE_ID_BYTE1_HEX", format!("{:X}", nid[1]))
        .env("EG_INTERFACE_NAME", &cfg.interface.name)
        .env("EG_INTERFACE_TYPE", &cfg.interface.itype)
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

/// Run an edge until shutdown is requested or the supernode dismisses it.
pub async fn run_edge(cfg: EdgeConfig, mut stop: watch::Receiver<bool>) -> Result<()> {
    if !cfg.node_id.is_normal() {
        anyhow::bail!("NodeID {} is reserved or invalid", cfg.node_id);
    }
    if cfg.default_ttl == 0 {
        anyhow::bail!("DefaultTTL must be > 0");
    }
    let _mac_prefix = parse_mac_prefix(&cfg.interface.mac_addr_prefix)?;

    let dr = &cfg.dynamic_route;
    let use_super = dr.super_node.use_super_node;
    let use_p2p = dr.p2p.use_p2p;

    let graph = Arc::new(Graph::new(false, &dr.p2p.graph_recalculate_setting));
    if !cfg.next_hop_table.is_empty() {
        graph.set_nh_table(cfg.next_hop_table.clone(), ZERO_HASH);
    }
    let (controller, _hash_rx) = RoutingController::new(graph.clone());

    let priv_key = key_from_base64(&cfg.priv_key).context("bad PrivKey")?;
    let peers = Arc::new(PeerTable::new(cfg.node_id, &priv_key));

    for p in &cfg.peers {
        let pubkey = key_from_base64(&p.pub_key)
            .with_context(|| format!("bad PubKey for peer {}", p.node_id))?;
        let psk = if p.psk.is_empty() {
            None
        } else {
            Some(key_from_base64(&p.psk).with_context(|| format!("bad PSKey for peer {}", p.node_id))?)
        };
        let endpoint = if p.end_point.is_empty() {
            None
        } else {
            Some(
                parse_endpoint_af(&p.end_point, 0)
                    .with_context(|| format!("bad EndPoint for peer {}", p.node_id))?,
            )
        };
        peers.add_peer(PeerConfig {
            node_id: p.node_id,
            pubkey,
            psk,
            endpoint,
            conn_url: p.end_point.clone(),
            static_conn: p.r#static,
            additional_cost: p.additional_cost,
        });
    }

    if use_super {
        let sn = &dr.super_node;
        let psk = if sn.psk.is_empty() {
            None
        } else {
            Some(key_from_base64(&sn.psk).context("bad supernode PSKey")?)
        };
        let mut s4 = false;
        let mut s6 = false;
        if !sn.conn_url_v4.is_empty() {
            let pubkey = key_from_base64(&sn.pub_key_v4).context("bad PubKeyV4")?;
            match parse_endpoint_af(&sn.conn_url_v4, 4) {
                Ok(endpoint) => {
                    peers.add_peer(PeerConfig {
                        node_id: SUPERNODE,
                        pubkey,
                        psk,
                        endpoint: Some(endpoint),
                        conn_url: sn.conn_url_v4.clone(),
                        static_conn: false,
                        additional_cost: 0.0,
                    });
                    s4 = true;
                }
                Err(e) => error!(error = %e, url = %sn.conn_url_v4, "failed to set v4 supernode endpoint"),
            }
        }
        if !sn.conn_url_v6.is_empty() {
            let pubkey = key_from_base64(&sn.pub_key_v6).context("bad PubKeyV6")?;
            match parse_endpoint_af(&sn.conn_url_v6, 6) {
                Ok(endpoint) => {
                    peers.add_peer(PeerConfig {
                        node_id: SUPERNODE,
                        pubkey,
                        psk,
                        endpoint: Some(endpoint),
                        conn_url: sn.conn_url_v6.clone(),
                        static_conn: false,
                        additional_cost: 0.0,
                    });
                    s6 = true;
                }
                // Tolerated when v4 already succeeded; the v4 path carries
                // the control plane alone.
                Err(e) => error!(error = %e, url = %sn.conn_url_v6, "failed to set v6 supernode endpoint"),
            }
        }
        if !s4 && !s6 {
            anyhow::bail!("failed to configure any supernode endpoint");
        }
    }

    let bind = Arc::new(
        Bind::open(BindMode::Both, cfg.listen_port)
            .await
            .context("failed to bind UDP sockets")?,
    );
    info!(
        node = %cfg.node_id,
        v4 = ?bind.local_v4(),
        v6 = ?bind.local_v6(),
        "edge sockets bound"
    );

    // Receive tasks, labeled per family by construction.
    let (udp_tx, mut udp_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(NET_QUEUE);
    for (label, sock) in bind.receivers() {
        let tx = udp_tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; UDP_RECV_BUF_SIZE];
            loop {
                match sock.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        if tx.send((buf[..n].to_vec(), peer)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, family = label, "socket receive error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // TAP pump thread: drain outbound, poll inbound, 1 ms idle.
    let tap = open_tap(&cfg)?;
    let (tap_to_net_tx, mut tap_to_net_rx) = mpsc::channel::<Vec<u8>>(TAP_QUEUE);
    let (net_to_tap_tx, mut net_to_tap_rx) = mpsc::channel::<Vec<u8>>(TAP_QUEUE);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_thread = stop_flag.clone();
    let mtu = cfg.interface.mtu;
    let tap_thread = thread::spawn(move || {
        let mut tap = tap;
        let mut buf = vec![0u8; mtu.clamp(1500, 65535)];
        while !stop_flag_thread.load(Ordering::Relaxed) {
            loop {
                match net_to_tap_rx.try_recv() {
                    Ok(frame) => {
                        if let Err(e) = tap.write_frame(&frame) {
                            debug!(error = %e, "TAP write error");
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }
            match tap.read_frame(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if tap_to_net_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        return;
                    }
                }
                Err(e) => debug!(error = %e, "TAP read error"),
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    run_post_script(&cfg)?;

    let mut rt = EdgeRuntime {
        node_id: cfg.node_id,
        default_ttl: cfg.default_ttl,
        use_super,
        use_p2p,
        save_new_peers: dr.save_new_peers,
        skip_local_ip: dr.super_node.skip_local_ip,
        api_url: dr.super_node.api_url.trim_end_matches('/').to_string(),
        graph,
        controller,
        peers,
        bind,
        http: reqwest::Client::new(),
        net_to_tap: net_to_tap_tx,
        peer_info_hash: ZERO_HASH,
        throttle: 1,
        request_counter: 0,
    };

    let ping_period = Duration::from_secs_f64(dr.send_ping_interval.max(1.0));
    let mut ping_tick = tokio::time::interval(ping_period);
    let gossip_period = Duration::from_secs_f64(dr.p2p.send_peer_interval.max(1.0));
    let mut gossip_tick = tokio::time::interval(gossip_period);
    let mut check_tick = tokio::time::interval(rt.graph.timeout_check_interval().max(Duration::from_secs(1)));
    let mut ping_rounds: u32 = 0;

    let result = loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                ping_rounds = ping_rounds.wrapping_add(1);
                if ping_rounds % rt.throttle == 0 {
                    rt.send_pings().await;
                    if rt.use_super {
                        rt.send_register().await;
                    }
                }
            }
            _ = gossip_tick.tick(), if rt.use_p2p => {
                rt.send_peer_gossip().await;
            }
            _ = check_tick.tick(), if rt.use_p2p => {
                rt.controller.handle(RouteEvent::Tick);
            }
            maybe_frame = tap_to_net_rx.recv() => {
                let Some(frame) = maybe_frame else { break Ok(()) };
                rt.handle_tap_frame(frame).await;
            }
            recv = udp_rx.recv() => {
                let Some((buf, src)) = recv else { break Ok(()) };
                match rt.handle_packet(buf, src).await {
                    LoopAction::Continue => {}
                    LoopAction::Shutdown => break Ok(()),
                    LoopAction::Fail(msg) => break Err(anyhow::anyhow!(msg)),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("stop requested");
                    break Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break Ok(());
            }
        }
    };

    stop_flag.store(true, Ordering::Relaxed);
    drop(rt);
    let _ = tap_thread.join();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_prefix() {
        assert_eq!(parse_mac_prefix("AA:BB:CC:DD").unwrap(), [0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(parse_mac_prefix("AA:BB:CC").is_err());
        assert!(parse_mac_prefix("ZZ:BB:CC:DD").is_err());
        // Multicast bit must stay clear.
        assert!(parse_mac_prefix("01:BB:CC:DD").is_err());
    }

    #[test]
    fn test_epoch_now_is_monotonic_enough() {
        let a = epoch_now();
        let b = epoch_now();
        assert!(b >= a);
        assert!(a > 1_000_000_000.0);
    }
}
