//! Weighted directed latency graph and all-pairs shortest paths.
//!
//! This is the routing plane's source of truth: directed edges carry measured
//! RTTs, a jitter hysteresis decides which measurements are allowed to trigger
//! recomputation, and Floyd–Warshall produces the `(dist, next)` tables that
//! the forwarding engine reads.
//!
//! Locking: one readers-writer lock protects the edge map and vertex set.
//! Weight reads take the read lock; latency updates take the write lock. The
//! route tables themselves are an immutable [`Arc`] snapshot swapped under a
//! separate lock, so forwarding readers never block on a recompute.

use crate::types::{DistTable, NextHopTable, StateHash, Vertex, INFINITY, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Hysteresis and recomputation policy, straight from the YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GraphRecalculateSetting {
    /// When true the next-hop table is supplied externally and never computed.
    #[serde(default)]
    pub static_mode: bool,
    /// Jitter tolerance `t`, milliseconds.
    #[serde(default = "default_jitter_tolerance")]
    pub jitter_tolerance: f64,
    /// Jitter tolerance multiplier `r` (≥ 1).
    #[serde(default = "default_jitter_multiplier")]
    pub jitter_tolerance_multiplier: f64,
    /// Seconds after which an unreported edge is treated as unreachable.
    #[serde(default = "default_node_report_timeout")]
    pub node_report_timeout: f64,
    /// Seconds between the periodic staleness/recompute ticks.
    #[serde(default = "default_timeout_check_interval")]
    pub timeout_check_interval: f64,
    /// Minimum seconds between two APSP runs.
    #[serde(default = "default_recalculate_cool_down")]
    pub recalculate_cool_down: f64,
}

fn default_jitter_tolerance() -> f64 {
    5.0
}
fn default_jitter_multiplier() -> f64 {
    1.01
}
fn default_node_report_timeout() -> f64 {
    70.0
}
fn default_timeout_check_interval() -> f64 {
    5.0
}
fn default_recalculate_cool_down() -> f64 {
    5.0
}

impl Default for GraphRecalculateSetting {
    fn default() -> Self {
        Self {
            static_mode: false,
            jitter_tolerance: default_jitter_tolerance(),
            jitter_tolerance_multiplier: default_jitter_multiplier(),
            node_report_timeout: default_node_report_timeout(),
            timeout_check_interval: default_timeout_check_interval(),
            recalculate_cool_down: default_recalculate_cool_down(),
        }
    }
}

/// Convert a configuration value in seconds to a [`Duration`].
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

/// One directed latency record.
#[derive(Debug, Clone, Copy)]
struct Latency {
    /// Current measured RTT in seconds.
    ping: f64,
    /// Weight (ping + additional cost) used by the last completed APSP.
    ping_old: f64,
    /// Additive cost of the destination, seconds, from its configuration.
    additional_cost: f64,
    /// When `ping` was last refreshed.
    updated_at: Instant,
}

/// Immutable APSP result snapshot.
#[derive(Debug, Clone, Default)]
pub struct RouteTables {
    pub dist: DistTable,
    pub next: NextHopTable,
}

/// Combined tables as emitted by the `solve` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fullroute {
    #[serde(rename = "NextHopTable")]
    pub next: NextHopTable,
    #[serde(rename = "DistanceTable")]
    pub dist: DistTable,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("negative cycle detected after repair; routing tables emptied")]
    PersistentNegativeCycle,
}

#[derive(Default)]
struct EdgeMap {
    verts: BTreeSet<Vertex>,
    edges: BTreeMap<Vertex, BTreeMap<Vertex, Latency>>,
    /// `None` both before the first run and after a new vertex appears, so
    /// the cooldown never delays a brand-new node.
    recalculated_at: Option<Instant>,
}

/// The latency graph plus cached routing tables.
pub struct Graph {
    super_mode: bool,
    static_mode: bool,
    jitter_tolerance: f64,
    jitter_tolerance_multiplier: f64,
    node_report_timeout: Duration,
    recalculate_cooldown: Duration,
    timeout_check_interval: Duration,
    inner: RwLock<EdgeMap>,
    tables: RwLock<Arc<RouteTables>>,
    nh_table_hash: RwLock<StateHash>,
}

impl Graph {
    /// `super_mode` selects the additive+multiplicative jitter tolerance;
    /// edge (P2P) mode uses the quantizing variant.
    pub fn new(super_mode: bool, setting: &GraphRecalculateSetting) -> Self {
        Self {
            super_mode,
            static_mode: setting.static_mode,
            jitter_tolerance: setting.jitter_tolerance,
            jitter_tolerance_multiplier: setting.jitter_tolerance_multiplier,
            node_report_timeout: secs_to_duration(setting.node_report_timeout),
            recalculate_cooldown: secs_to_duration(setting.recalculate_cool_down),
            timeout_check_interval: secs_to_duration(setting.timeout_check_interval),
            inner: RwLock::new(EdgeMap::default()),
            tables: RwLock::new(Arc::new(RouteTables::default())),
            nh_table_hash: RwLock::new(ZERO_HASH),
        }
    }

    pub fn is_static(&self) -> bool {
        self.static_mode
    }

    pub fn node_report_timeout(&self) -> Duration {
        self.node_report_timeout
    }

    pub fn timeout_check_interval(&self) -> Duration {
        self.timeout_check_interval
    }

    /// Snapshot of the active vertex set.
    pub fn vertices(&self) -> BTreeSet<Vertex> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.verts.clone()
    }

    /// Vertices `v` has an outgoing edge to.
    pub fn neighbors(&self, v: Vertex) -> Vec<Vertex> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .edges
            .get(&v)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Current routing weight of (u, v): 0 on the diagonal, the measured ping
    /// plus the destination's additional cost while fresh, otherwise
    /// [`INFINITY`].
    pub fn weight(&self, u: Vertex, v: Vertex) -> f64 {
        if u == v {
            return 0.0;
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.edges.get(&u).and_then(|m| m.get(&v)) {
            Some(lat) if lat.updated_at.elapsed() <= self.node_report_timeout => {
                lat.ping + lat.additional_cost
            }
            _ => INFINITY,
        }
    }

    /// Weight used by the last completed APSP. No staleness filter: this is
    /// the reference the jitter policy compares fresh measurements against.
    pub fn old_weight(&self, u: Vertex, v: Vertex) -> f64 {
        if u == v {
            return 0.0;
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.edges.get(&u).and_then(|m| m.get(&v)) {
            Some(lat) => lat.ping_old,
            None => INFINITY,
        }
    }

    /// Quantize a weight (milliseconds) into its jitter class:
    /// `Q(v) = ceil((v/t)^(1/r))^r * t`. Small differences collapse into the
    /// same class at short RTTs and spread out at long ones.
    fn weight_class(&self, x: f64) -> f64 {
        let x = x.abs();
        let t = self.jitter_tolerance;
        let r = self.jitter_tolerance_multiplier;
        if t > 0.001 && r > 1.0 {
            (x / t).powf(1.0 / r).ceil().powf(r) * t
        } else {
            x
        }
    }

    /// Whether a fresh weight for (u, v) differs enough from the value used
    /// by the last APSP to justify recomputation. Inputs are scaled to
    /// milliseconds to keep the quantization in a comfortable range.
    pub fn should_update(&self, u: Vertex, v: Vertex, new_weight: f64) -> bool {
        let oldval = (self.old_weight(u, v) * 1000.0).abs();
        let newval = (new_weight * 1000.0).abs();
        if self.super_mode {
            let t = self.jitter_tolerance;
            let r = self.jitter_tolerance_multiplier;
            if t > 0.001 && r >= 1.0 {
                let diff = (newval - oldval).abs();
                let x = oldval.max(newval);
                diff > t + x * (r - 1.0)
            } else {
                oldval != newval
            }
        } else {
            self.weight_class(oldval) != self.weight_class(newval)
        }
    }

    /// True when any pair's current weight has drifted out of its jitter
    /// class since the last APSP.
    pub fn should_calculate(&self) -> bool {
        let verts = self.vertices();
        for &u in &verts {
            for &v in &verts {
                if u != v && self.should_update(u, v, self.weight(u, v)) {
                    return true;
                }
            }
        }
        false
    }

    /// Record a latency measurement for the directed edge u → v.
    ///
    /// Vertices appear on first reference. Returns whether the next-hop table
    /// changed (only possible when `recalculate` and `checkchange` are set).
    pub fn update_latency(
        &self,
        u: Vertex,
        v: Vertex,
        seconds: f64,
        additional_cost: f64,
        recalculate: bool,
        checkchange: bool,
    ) -> bool {
        if u == v {
            return false;
        }
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.verts.insert(u);
            inner.verts.insert(v);
            if !inner.edges.contains_key(&u) {
                // A node we have never routed for: bypass the cooldown.
                inner.recalculated_at = None;
            }
        }
        let should = self.should_update(u, v, seconds + additional_cost);
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let row = inner.edges.entry(u).or_default();
            match row.get_mut(&v) {
                Some(lat) => {
                    lat.ping = seconds;
                    lat.additional_cost = additional_cost;
                    lat.updated_at = Instant::now();
                }
                None => {
                    row.insert(
                        v,
                        Latency {
                            ping: seconds,
                            ping_old: INFINITY,
                            additional_cost,
                            updated_at: Instant::now(),
                        },
                    );
                }
            }
        }
        if should && recalculate {
            self.recalculate_nh_table(checkchange)
        } else {
            false
        }
    }

    /// Remove a vertex and every edge touching it. The published hash is
    /// invalidated; edges to other vertices are untouched.
    ///
    /// Removal recomputes unconditionally: no weight changed, so the jitter
    /// guard would otherwise leave routes through the dead vertex in place.
    pub fn remove_virt(&self, v: Vertex, recalculate: bool, checkchange: bool) -> bool {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.verts.remove(&v);
            inner.edges.remove(&v);
            for row in inner.edges.values_mut() {
                row.remove(&v);
            }
            inner.recalculated_at = None;
        }
        self.set_nh_table_hash(ZERO_HASH);
        if recalculate && !self.static_mode {
            self.install_fresh_tables(checkchange)
        } else {
            false
        }
    }

    fn set_weight(&self, u: Vertex, v: Vertex, weight: f64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(lat) = inner.edges.get_mut(&u).and_then(|m| m.get_mut(&v)) {
            lat.ping = weight;
        }
    }

    fn set_old_weight(&self, u: Vertex, v: Vertex, weight: f64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(lat) = inner.edges.get_mut(&u).and_then(|m| m.get_mut(&v)) {
            lat.ping_old = weight;
        }
    }

    /// Clamp every negative current weight to zero (negative-cycle repair).
    fn remove_all_negative_values(&self) {
        let verts = self.vertices();
        for &u in &verts {
            for &v in &verts {
                if self.weight(u, v) < 0.0 {
                    warn!(%u, %v, "clamping negative edge weight to 0");
                    self.set_weight(u, v, 0.0);
                }
            }
        }
    }

    /// All-pairs shortest paths over the current live weights.
    ///
    /// Refreshes every live edge's `ping_old` to the weight actually fed into
    /// the run. A negative diagonal triggers one clamp-and-retry; a second
    /// detection empties the tables and reports a hard error.
    pub fn floyd_warshall(&self) -> Result<RouteTables, GraphError> {
        match self.floyd_warshall_once() {
            Ok(tables) => Ok(tables),
            Err(_) => {
                warn!("negative cycle detected, clamping negative weights and retrying");
                self.remove_all_negative_values();
                match self.floyd_warshall_once() {
                    Ok(tables) => Ok(tables),
                    Err(e) => {
                        error!("negative cycle persisted after repair");
                        Err(e)
                    }
                }
            }
        }
    }

    fn floyd_warshall_once(&self) -> Result<RouteTables, GraphError> {
        let verts: Vec<Vertex> = self.vertices().into_iter().collect();
        let n = verts.len();

        // Snapshot the weights under the read lock, then compute outside it.
        let mut weights: Vec<(usize, usize, f64)> = Vec::new();
        for (ui, &u) in verts.iter().enumerate() {
            for v in self.neighbors(u) {
                let w = self.weight(u, v);
                self.set_old_weight(u, v, w);
                if w < INFINITY {
                    if let Ok(vi) = verts.binary_search(&v) {
                        weights.push((ui, vi, w));
                    }
                }
            }
        }

        let mut dist = vec![vec![INFINITY; n]; n];
        let mut next: Vec<Vec<Option<usize>>> = vec![vec![None; n]; n];
        for i in 0..n {
            dist[i][i] = 0.0;
        }
        for &(ui, vi, w) in &weights {
            dist[ui][vi] = w;
            next[ui][vi] = Some(vi);
        }

        for k in 0..n {
            for i in 0..n {
                if dist[i][k] >= INFINITY {
                    continue;
                }
                for j in 0..n {
                    if dist[k][j] < INFINITY && dist[i][j] > dist[i][k] + dist[k][j] {
                        dist[i][j] = dist[i][k] + dist[k][j];
                        next[i][j] = next[i][k];
                    }
                }
            }
        }

        for i in 0..n {
            if dist[i][i] < 0.0 {
                return Err(GraphError::PersistentNegativeCycle);
            }
        }

        let mut out = RouteTables::default();
        for (i, &u) in verts.iter().enumerate() {
            let drow = out.dist.entry(u).or_default();
            for (j, &v) in verts.iter().enumerate() {
                drow.insert(v, dist[i][j]);
            }
            let nrow = out.next.entry(u).or_default();
            for (j, &v) in verts.iter().enumerate() {
                if i != j {
                    if let Some(h) = next[i][j] {
                        nrow.insert(v, verts[h]);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Recompute and install the routing tables if the policy allows it.
    ///
    /// Guards, in order: static mode, at least one measurement drifted out of
    /// its jitter class, and the recalculation cooldown. Returns whether the
    /// next-hop table changed (`checkchange` only).
    pub fn recalculate_nh_table(&self, checkchange: bool) -> bool {
        if self.static_mode {
            // A statically configured table counts as "changed" until its
            // hash has been published once.
            return checkchange && self.nh_table_hash() == ZERO_HASH;
        }
        if !self.should_calculate() {
            return false;
        }
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = inner.recalculated_at {
                if at.elapsed() < self.recalculate_cooldown {
                    return false;
                }
            }
        }
        self.install_fresh_tables(checkchange)
    }

    /// Run APSP and swap the snapshot in, skipping every guard.
    fn install_fresh_tables(&self, checkchange: bool) -> bool {
        let new_tables = match self.floyd_warshall() {
            Ok(tables) => tables,
            Err(e) => {
                error!(error = %e, "APSP failed, installing empty routing tables");
                RouteTables::default()
            }
        };

        let changed = {
            let current = self.tables.read().unwrap_or_else(|e| e.into_inner());
            checkchange && current.next != new_tables.next
        };

        {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            *tables = Arc::new(new_tables);
        }
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.recalculated_at = Some(Instant::now());
        }
        self.set_nh_table_hash(ZERO_HASH);
        changed
    }

    /// Install an externally supplied next-hop table (static mode, or a
    /// supernode push) together with its hash. The distance table is kept.
    pub fn set_nh_table(&self, next: NextHopTable, hash: StateHash) {
        {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let dist = tables.dist.clone();
            *tables = Arc::new(RouteTables { dist, next });
        }
        self.set_nh_table_hash(hash);
    }

    /// Cheap snapshot of the current routing tables.
    pub fn tables(&self) -> Arc<RouteTables> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn nh_table_hash(&self) -> StateHash {
        *self.nh_table_hash.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_nh_table_hash(&self, hash: StateHash) {
        *self.nh_table_hash.write().unwrap_or_else(|e| e.into_inner()) = hash;
    }

    /// Dump of current (or last-APSP) weights, for diagnostics and `solve`.
    pub fn get_edges(&self, old: bool) -> BTreeMap<Vertex, BTreeMap<Vertex, f64>> {
        let verts = self.vertices();
        let mut out: BTreeMap<Vertex, BTreeMap<Vertex, f64>> = BTreeMap::new();
        for &u in &verts {
            let row = out.entry(u).or_default();
            for &v in &verts {
                if u != v {
                    let w = if old {
                        self.old_weight(u, v)
                    } else {
                        self.weight(u, v)
                    };
                    row.insert(v, w);
                }
            }
        }
        out
    }
}

/// First hop from `u` toward `v`, or `None` if unreachable.
pub fn next_hop(tables: &RouteTables, u: Vertex, v: Vertex) -> Option<Vertex> {
    tables.next.get(&u).and_then(|row| row.get(&v)).copied()
}

/// The shortest path u → … → v, or empty when unreachable. Bounded by the
/// vertex count so a corrupt table can never loop.
pub fn path(tables: &RouteTables, u: Vertex, v: Vertex) -> Vec<Vertex> {
    if next_hop(tables, u, v).is_none() {
        return Vec::new();
    }
    let max_hops = tables.next.len() + 1;
    let mut out = vec![u];
    let mut cur = u;
    while cur != v {
        match next_hop(tables, cur, v) {
            Some(hop) => {
                cur = hop;
                out.push(cur);
            }
            None => return Vec::new(),
        }
        if out.len() > max_hops {
            return Vec::new();
        }
    }
    out
}

/// The set of first hops `id` uses to reach anyone — the recipients of a
/// locally originated broadcast.
pub fn broadcast_list(tables: &RouteTables, id: Vertex) -> BTreeSet<Vertex> {
    tables
        .next
        .get(&id)
        .map(|row| row.values().copied().collect())
        .unwrap_or_default()
}

/// Neighbors a relayed broadcast should be re-emitted to: those first hops of
/// `self_id` that sit downstream of `self_id` on the shortest path from the
/// flood's origin `src_id`, excluding the ingress peer `in_id`. Keeps the
/// global flood loop-free.
pub fn broadcast_through_list(
    tables: &RouteTables,
    self_id: Vertex,
    in_id: Vertex,
    src_id: Vertex,
) -> BTreeSet<Vertex> {
    let mut tosend = BTreeSet::new();
    for check in broadcast_list(tables, self_id) {
        if check == in_id {
            continue;
        }
        if path(tables, src_id, check).contains(&self_id) {
            tosend.insert(check);
        }
    }
    tosend
}

/// Salted digest of a JSON-serializable state: lowercase hex of
/// `MD5(json ‖ salt)`, 32 ASCII bytes.
pub fn hash_json_state<T: serde::Serialize>(value: &T, salt: &[u8]) -> StateHash {
    let mut input = serde_json::to_vec(value).unwrap_or_default();
    input.extend_from_slice(salt);
    let digest = md5::compute(&input);
    let hex_str = hex::encode(digest.0);
    let mut out = ZERO_HASH;
    out.copy_from_slice(hex_str.as_bytes());
    out
}

/// Salted digest of the serialized next-hop table.
pub fn hash_nh_table(next: &NextHopTable, salt: &[u8]) -> StateHash {
    hash_json_state(next, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> GraphRecalculateSetting {
        GraphRecalculateSetting {
            static_mode: false,
            jitter_tolerance: 0.0,
            jitter_tolerance_multiplier: 1.0,
            node_report_timeout: 9999.0,
            timeout_check_interval: 5.0,
            recalculate_cool_down: 0.0,
        }
    }

    fn add_both(g: &Graph, a: Vertex, b: Vertex, w: f64) {
        g.update_latency(a, b, w, 0.0, false, false);
        g.update_latency(b, a, w, 0.0, false, false);
    }

    #[test]
    fn test_three_node_line() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        add_both(&g, Vertex(2), Vertex(3), 0.5);

        let tables = g.floyd_warshall().expect("apsp");
        assert_eq!(next_hop(&tables, Vertex(1), Vertex(3)), Some(Vertex(2)));
        let d = tables.dist[&Vertex(1)][&Vertex(3)];
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_diagonal_is_zero_and_selfless() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.3);
        let tables = g.floyd_warshall().expect("apsp");
        for &u in tables.dist.keys() {
            assert_eq!(tables.dist[&u][&u], 0.0);
            assert_eq!(next_hop(&tables, u, u), None);
        }
    }

    #[test]
    fn test_path_is_loop_free_and_bounded() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        add_both(&g, Vertex(2), Vertex(3), 0.5);
        add_both(&g, Vertex(3), Vertex(4), 0.5);
        let tables = g.floyd_warshall().expect("apsp");

        let p = path(&tables, Vertex(1), Vertex(4));
        assert_eq!(p, vec![Vertex(1), Vertex(2), Vertex(3), Vertex(4)]);
        assert!(p.len() <= 4);
        let unique: BTreeSet<_> = p.iter().collect();
        assert_eq!(unique.len(), p.len());

        assert!(path(&tables, Vertex(1), Vertex(9)).is_empty());
    }

    #[test]
    fn test_symmetric_matrix_gives_symmetric_dist() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.4);
        add_both(&g, Vertex(2), Vertex(3), 0.7);
        add_both(&g, Vertex(1), Vertex(3), 2.0);
        let tables = g.floyd_warshall().expect("apsp");
        for &u in tables.dist.keys() {
            for &v in tables.dist.keys() {
                assert_eq!(tables.dist[&u][&v], tables.dist[&v][&u]);
            }
        }
    }

    #[test]
    fn test_triangle_shortcut_with_cooldown() {
        let setting = GraphRecalculateSetting {
            recalculate_cool_down: 0.05,
            jitter_tolerance: 0.0,
            jitter_tolerance_multiplier: 1.0,
            node_report_timeout: 9999.0,
            ..Default::default()
        };
        let g = Graph::new(false, &setting);
        let (a, b, c) = (Vertex(1), Vertex(2), Vertex(3));
        add_both(&g, a, b, 1.0);
        add_both(&g, b, c, 1.0);
        add_both(&g, a, c, 3.0);
        assert!(g.recalculate_nh_table(true));
        assert_eq!(next_hop(&g.tables(), a, c), Some(b));

        // Within the cooldown window: the better direct edge is recorded but
        // the table is not recomputed yet.
        g.update_latency(a, c, 1.9, 0.0, true, true);
        assert_eq!(next_hop(&g.tables(), a, c), Some(b));

        std::thread::sleep(Duration::from_millis(60));
        let changed = g.update_latency(a, b, 0.1, 0.0, true, true);
        assert!(!changed); // still through b, table identical
        let tables = g.tables();
        assert_eq!(next_hop(&tables, a, c), Some(b));
        assert!((tables.dist[&a][&c] - 1.1).abs() < 1e-9);

        std::thread::sleep(Duration::from_millis(60));
        let changed = g.update_latency(a, b, 10.0, 0.0, true, true);
        assert!(changed);
        assert_eq!(next_hop(&g.tables(), a, c), Some(c));
    }

    #[test]
    fn test_jitter_suppression_edge_mode() {
        let setting = GraphRecalculateSetting {
            jitter_tolerance: 5.0,
            jitter_tolerance_multiplier: 1.1,
            node_report_timeout: 9999.0,
            recalculate_cool_down: 0.0,
            ..Default::default()
        };
        let g = Graph::new(false, &setting);
        add_both(&g, Vertex(1), Vertex(2), 0.020);
        assert!(g.recalculate_nh_table(true));

        // 20 → 21 → 22 ms stay inside the same jitter class.
        assert!(!g.update_latency(Vertex(1), Vertex(2), 0.021, 0.0, true, true));
        assert!(!g.should_calculate());
        assert!(!g.update_latency(Vertex(1), Vertex(2), 0.022, 0.0, true, true));
        assert!(!g.should_calculate());

        // A jump to 40 ms leaves the class and forces recomputation.
        assert!(g.should_update(Vertex(1), Vertex(2), 0.040));
        g.update_latency(Vertex(1), Vertex(2), 0.040, 0.0, true, false);
        assert!(!g.should_calculate());
    }

    #[test]
    fn test_jitter_supernode_mode() {
        let setting = GraphRecalculateSetting {
            jitter_tolerance: 5.0,
            jitter_tolerance_multiplier: 1.01,
            node_report_timeout: 9999.0,
            recalculate_cool_down: 0.0,
            ..Default::default()
        };
        let g = Graph::new(true, &setting);
        g.update_latency(Vertex(1), Vertex(2), 0.100, 0.0, false, false);
        let _ = g.floyd_warshall().expect("apsp");

        // |101 - 100| = 1 ≤ 5 + 101 * 0.01
        assert!(!g.should_update(Vertex(1), Vertex(2), 0.101));
        // |120 - 100| = 20 > 5 + 120 * 0.01
        assert!(g.should_update(Vertex(1), Vertex(2), 0.120));
    }

    #[test]
    fn test_negative_cycle_repair() {
        let g = Graph::new(false, &no_jitter());
        g.update_latency(Vertex(1), Vertex(2), 1.0, 0.0, false, false);
        g.update_latency(Vertex(2), Vertex(1), -3.0, 0.0, false, false);

        let tables = g.floyd_warshall().expect("repair should succeed");
        for &u in tables.dist.keys() {
            for &v in tables.dist.keys() {
                assert!(tables.dist[&u][&v] >= 0.0);
            }
        }
        // The negative edge was clamped in place.
        assert_eq!(g.weight(Vertex(2), Vertex(1)), 0.0);
    }

    #[test]
    fn test_broadcast_list_matches_next_hops() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        add_both(&g, Vertex(2), Vertex(3), 0.5);
        add_both(&g, Vertex(3), Vertex(4), 0.5);
        let tables = g.floyd_warshall().expect("apsp");

        // Node 2 reaches 1 directly and {3, 4} via 3.
        let bl = broadcast_list(&tables, Vertex(2));
        assert_eq!(bl, BTreeSet::from([Vertex(1), Vertex(3)]));
    }

    #[test]
    fn test_broadcast_through_list_line() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        add_both(&g, Vertex(2), Vertex(3), 0.5);
        add_both(&g, Vertex(3), Vertex(4), 0.5);
        let tables = g.floyd_warshall().expect("apsp");

        // A flood from 1 entering 2: node 2 relays downstream to 3 only.
        let through = broadcast_through_list(&tables, Vertex(2), Vertex(1), Vertex(1));
        assert_eq!(through, BTreeSet::from([Vertex(3)]));
        assert!(!through.contains(&Vertex(1)));

        // Node 3, reached via 2, relays to 4.
        let through = broadcast_through_list(&tables, Vertex(3), Vertex(2), Vertex(1));
        assert_eq!(through, BTreeSet::from([Vertex(4)]));

        // The tail has nothing downstream.
        let through = broadcast_through_list(&tables, Vertex(4), Vertex(3), Vertex(1));
        assert!(through.is_empty());
    }

    #[test]
    fn test_broadcast_through_list_clique_has_no_relays() {
        let g = Graph::new(false, &no_jitter());
        let ids = [Vertex(1), Vertex(2), Vertex(3), Vertex(4)];
        for &u in &ids {
            for &v in &ids {
                if u != v {
                    g.update_latency(u, v, 1.0, 0.0, false, false);
                }
            }
        }
        let tables = g.floyd_warshall().expect("apsp");

        // Every node is a direct leaf of the origin's tree, so no receiver
        // relays anywhere — and in particular never back to the ingress.
        for &node in &ids[1..] {
            let through = broadcast_through_list(&tables, node, Vertex(1), Vertex(1));
            assert!(through.is_empty());
        }
    }

    #[test]
    fn test_remove_virt() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        add_both(&g, Vertex(2), Vertex(3), 0.5);
        g.recalculate_nh_table(false);

        g.remove_virt(Vertex(2), true, false);
        assert!(!g.vertices().contains(&Vertex(2)));
        let tables = g.tables();
        assert_eq!(next_hop(&tables, Vertex(1), Vertex(3)), None);
    }

    #[test]
    fn test_hash_nh_table_is_salted_and_stable() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        let tables = g.floyd_warshall().expect("apsp");

        let h1 = hash_nh_table(&tables.next, b"salt-a");
        let h2 = hash_nh_table(&tables.next, b"salt-a");
        let h3 = hash_nh_table(&tables.next, b"salt-b");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        // 32 lowercase hex chars.
        assert!(h1
            .iter()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));

        // Spot-check against a direct computation.
        let json = serde_json::to_vec(&tables.next).unwrap();
        let mut input = json;
        input.extend_from_slice(b"salt-a");
        let expect = hex::encode(md5::compute(&input).0);
        assert_eq!(&h1[..], expect.as_bytes());
    }

    #[test]
    fn test_static_mode_never_recomputes() {
        let setting = GraphRecalculateSetting {
            static_mode: true,
            ..no_jitter()
        };
        let g = Graph::new(false, &setting);
        let mut next = NextHopTable::new();
        next.entry(Vertex(1)).or_default().insert(Vertex(2), Vertex(2));
        g.set_nh_table(next.clone(), [0x61; 32]);

        g.update_latency(Vertex(1), Vertex(2), 0.5, 0.0, true, true);
        assert_eq!(g.tables().next, next);
        assert_eq!(g.nh_table_hash(), [0x61; 32]);
    }

    #[test]
    fn test_stale_edge_is_infinite() {
        let setting = GraphRecalculateSetting {
            node_report_timeout: 0.0,
            ..no_jitter()
        };
        let g = Graph::new(false, &setting);
        g.update_latency(Vertex(1), Vertex(2), 0.5, 0.0, false, false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(g.weight(Vertex(1), Vertex(2)), INFINITY);
    }

    #[test]
    fn test_additional_cost_applies_to_destination() {
        let g = Graph::new(false, &no_jitter());
        g.update_latency(Vertex(1), Vertex(2), 0.5, 0.25, false, false);
        assert!((g.weight(Vertex(1), Vertex(2)) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_fullroute_yaml_roundtrip() {
        let g = Graph::new(false, &no_jitter());
        add_both(&g, Vertex(1), Vertex(2), 0.5);
        let tables = g.floyd_warshall().expect("apsp");
        let fr = Fullroute {
            next: tables.next.clone(),
            dist: tables.dist.clone(),
        };
        let yaml = serde_yaml::to_string(&fr).unwrap();
        let back: Fullroute = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.next, fr.next);
    }
}
