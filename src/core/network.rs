//! Spiking network graph: leaky threshold units, directed weighted edges,
//! synchronous tick stepping, and exact snapshot capture/restore.
//!
//! The graph owns every unit; edges refer to destinations by stable unit id,
//! never by pointer, so restoring or rebuilding units can never leave a
//! dangling edge. Tick semantics are simultaneous: every unit's new potential
//! is computed from the previous tick's state, and spikes land in the *next*
//! tick's input buffer.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::EvoError;

pub type UnitId = usize;
pub type Weight = f32;

/// Directed weighted edge, owned by its source unit's outbound table.
/// At most one edge exists per ordered (source, target) pair.
#[derive(Debug, Clone)]
pub struct Connection {
    pub target: UnitId,
    pub weight: Weight,
}

/// A single leaky accumulate-and-fire unit.
#[derive(Debug, Clone)]
pub struct Unit {
    pub threshold: f32,
    /// Multiplicative potential retention per tick, in [0, 1].
    pub leak: f32,
    pub potential: f32,
    /// Fire flag for the most recent tick.
    pub fired: bool,
    pub connections: Vec<Connection>,
}

/// What happens to a firing unit's potential, fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Hard reset to zero on the firing tick.
    #[default]
    Zero,
    /// No explicit reset; the potential keeps its leaked value.
    LeakOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: String,
    pub threshold: f32,
    pub leak: f32,
    /// Resting potential the unit starts (and is zeroed back) at.
    #[serde(default)]
    pub rest: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    pub weight: f32,
}

/// Explicit unit + edge listing a graph is constructed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub neurons: Vec<UnitSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub reset: ResetPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronRecord {
    pub id: String,
    pub threshold: f32,
    pub leak: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: String,
    pub to: String,
    pub weight: f32,
}

/// Exact parameter/topology snapshot of a graph: `{neurons, edges}`.
///
/// Restoring a snapshot onto a graph holding the same unit set reproduces
/// identical dynamics: every snapshot edge present at its recorded weight,
/// every other edge removed, every unit parameter overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub neurons: Vec<NeuronRecord>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    pub unit_count: usize,
    pub edge_count: usize,
    pub avg_potential: f32,
    pub fired_last_step: usize,
}

#[derive(Debug, Clone)]
pub struct Network {
    reset: ResetPolicy,
    ids: Vec<String>,
    index: HashMap<String, UnitId>,
    units: Vec<Unit>,
    rest: Vec<f32>,
    // External input accumulating for the current tick: sensory injections
    // plus spikes propagated from the previous tick.
    pending: Vec<f32>,
    tick: u64,
}

impl Network {
    pub fn new(reset: ResetPolicy) -> Self {
        Self {
            reset,
            ids: Vec::new(),
            index: HashMap::new(),
            units: Vec::new(),
            rest: Vec::new(),
            pending: Vec::new(),
            tick: 0,
        }
    }

    /// Build a graph from an explicit unit + edge listing.
    ///
    /// Fails fast on duplicate ids, unknown edge endpoints, and non-finite
    /// or out-of-range parameters, naming the offending identifier.
    pub fn from_config(cfg: &NetworkConfig) -> Result<Self, EvoError> {
        let mut net = Self::new(cfg.reset);
        for spec in &cfg.neurons {
            validate_unit_params(&spec.id, spec.threshold, spec.leak)?;
            if !spec.rest.is_finite() {
                return Err(EvoError::InvalidParameter {
                    id: spec.id.clone(),
                    what: "resting potential must be finite",
                });
            }
            net.add_unit(&spec.id, spec.threshold, spec.leak, spec.rest)?;
        }
        for edge in &cfg.edges {
            net.add_connection(&edge.from, &edge.to, edge.weight)?;
        }
        Ok(net)
    }

    /// Add a unit; duplicate ids are an error, never a silent overwrite.
    pub fn add_unit(
        &mut self,
        id: &str,
        threshold: f32,
        leak: f32,
        rest: f32,
    ) -> Result<UnitId, EvoError> {
        if self.index.contains_key(id) {
            return Err(EvoError::DuplicateUnit(id.to_string()));
        }
        validate_unit_params(id, threshold, leak)?;
        let uid = self.units.len();
        self.index.insert(id.to_string(), uid);
        self.ids.push(id.to_string());
        self.units.push(Unit {
            threshold,
            leak,
            potential: rest,
            fired: false,
            connections: Vec::new(),
        });
        self.rest.push(rest);
        self.pending.push(0.0);
        Ok(uid)
    }

    pub fn unit_id(&self, id: &str) -> Option<UnitId> {
        self.index.get(id).copied()
    }

    fn require(&self, id: &str) -> Result<UnitId, EvoError> {
        self.unit_id(id)
            .ok_or_else(|| EvoError::UnknownUnit(id.to_string()))
    }

    /// Add external current to a unit's pending input for the current tick.
    /// Must be called before `step()`. Unknown ids are reported, never created.
    pub fn inject(&mut self, id: &str, amount: f32) -> Result<(), EvoError> {
        if !amount.is_finite() {
            return Err(EvoError::InvalidParameter {
                id: id.to_string(),
                what: "injected amount must be finite",
            });
        }
        let uid = self.require(id)?;
        self.pending[uid] += amount;
        Ok(())
    }

    /// Index-resolved injection for hot loops. The index must come from
    /// `unit_id` on this graph.
    pub fn inject_unit(&mut self, uid: UnitId, amount: f32) {
        debug_assert!(uid < self.units.len());
        self.pending[uid] += amount;
    }

    /// Advance every unit one tick, simultaneously.
    ///
    /// Each unit leaks its potential, integrates the pending input queued
    /// before this tick, compares against its threshold, and on firing
    /// propagates each outbound weight into the destination's *next*-tick
    /// buffer. No unit's fire flag can influence another within the same
    /// tick, so stepping is reorder-independent.
    pub fn step(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let n = self.units.len();
        let mut next = vec![0.0f32; n];

        for i in 0..n {
            let u = &self.units[i];
            let potential = u.potential * u.leak + self.pending[i];
            let fired = potential >= u.threshold;

            if fired {
                for c in &self.units[i].connections {
                    next[c.target] += c.weight;
                }
            }

            let u = &mut self.units[i];
            u.fired = fired;
            u.potential = if fired {
                match self.reset {
                    ResetPolicy::Zero => 0.0,
                    ResetPolicy::LeakOnly => potential,
                }
            } else {
                potential
            };
        }

        self.pending = next;
    }

    /// Create or overwrite the edge `from -> to` (one edge per ordered pair).
    pub fn add_connection(&mut self, from: &str, to: &str, weight: Weight) -> Result<(), EvoError> {
        if !weight.is_finite() {
            return Err(EvoError::InvalidParameter {
                id: format!("{from}->{to}"),
                what: "edge weight must be finite",
            });
        }
        let f = self.require(from)?;
        let t = self.require(to)?;
        upsert_connection(&mut self.units[f].connections, t, weight);
        Ok(())
    }

    /// Remove the edge `from -> to`; returns whether it existed.
    pub fn remove_connection(&mut self, from: &str, to: &str) -> Result<bool, EvoError> {
        let f = self.require(from)?;
        let t = self.require(to)?;
        let conns = &mut self.units[f].connections;
        let before = conns.len();
        conns.retain(|c| c.target != t);
        Ok(conns.len() != before)
    }

    /// Overwrite the weight of an existing edge; missing edges are an error.
    pub fn set_weight(&mut self, from: &str, to: &str, weight: Weight) -> Result<(), EvoError> {
        if !weight.is_finite() {
            return Err(EvoError::InvalidParameter {
                id: format!("{from}->{to}"),
                what: "edge weight must be finite",
            });
        }
        let f = self.require(from)?;
        let t = self.require(to)?;
        match self.units[f].connections.iter_mut().find(|c| c.target == t) {
            Some(c) => {
                c.weight = weight;
                Ok(())
            }
            None => Err(EvoError::UnknownEdge {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    pub fn edge_weight(&self, from: &str, to: &str) -> Option<Weight> {
        let f = self.unit_id(from)?;
        let t = self.unit_id(to)?;
        self.units[f]
            .connections
            .iter()
            .find(|c| c.target == t)
            .map(|c| c.weight)
    }

    /// Capture the full parameter/topology state, in unit insertion order.
    pub fn capture(&self) -> NetworkSnapshot {
        let neurons = self
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| NeuronRecord {
                id: self.ids[i].clone(),
                threshold: u.threshold,
                leak: u.leak,
            })
            .collect();

        let mut edges = Vec::new();
        for (i, u) in self.units.iter().enumerate() {
            for c in &u.connections {
                edges.push(EdgeRecord {
                    from: self.ids[i].clone(),
                    to: self.ids[c.target].clone(),
                    weight: c.weight,
                });
            }
        }

        NetworkSnapshot { neurons, edges }
    }

    /// Restore a snapshot onto this graph, all-or-nothing.
    ///
    /// Every snapshot neuron and edge endpoint is validated against the
    /// target graph before any state is touched; a snapshot referencing a
    /// unit absent from the graph fails without partial application.
    pub fn restore(&mut self, snap: &NetworkSnapshot) -> Result<(), EvoError> {
        let mut neuron_ids = Vec::with_capacity(snap.neurons.len());
        for n in &snap.neurons {
            validate_unit_params(&n.id, n.threshold, n.leak)?;
            let uid = self.unit_id(&n.id).ok_or_else(|| {
                EvoError::InvalidSnapshot(format!("neuron `{}` not present in target graph", n.id))
            })?;
            neuron_ids.push(uid);
        }

        let mut edges = Vec::with_capacity(snap.edges.len());
        for e in &snap.edges {
            if !e.weight.is_finite() {
                return Err(EvoError::InvalidSnapshot(format!(
                    "edge `{}` -> `{}` has non-finite weight",
                    e.from, e.to
                )));
            }
            let f = self.unit_id(&e.from).ok_or_else(|| {
                EvoError::InvalidSnapshot(format!("edge source `{}` not present", e.from))
            })?;
            let t = self.unit_id(&e.to).ok_or_else(|| {
                EvoError::InvalidSnapshot(format!("edge target `{}` not present", e.to))
            })?;
            edges.push((f, t, e.weight));
        }

        // Validation passed; apply.
        for u in &mut self.units {
            u.connections.clear();
        }
        for (n, &uid) in snap.neurons.iter().zip(&neuron_ids) {
            let u = &mut self.units[uid];
            u.threshold = n.threshold;
            u.leak = n.leak;
        }
        for (f, t, w) in edges {
            upsert_connection(&mut self.units[f].connections, t, w);
        }
        Ok(())
    }

    /// Clear dynamic state (potentials back to rest, fire flags, pending
    /// input) without touching parameters or topology.
    pub fn zero_state(&mut self) {
        for (i, u) in self.units.iter_mut().enumerate() {
            u.potential = self.rest[i];
            u.fired = false;
        }
        for x in &mut self.pending {
            *x = 0.0;
        }
    }

    pub fn unit(&self, uid: UnitId) -> Option<&Unit> {
        self.units.get(uid)
    }

    pub fn fired(&self, uid: UnitId) -> bool {
        self.units.get(uid).map(|u| u.fired).unwrap_or(false)
    }

    pub fn potential(&self, uid: UnitId) -> f32 {
        self.units.get(uid).map(|u| u.potential).unwrap_or(0.0)
    }

    pub fn name(&self, uid: UnitId) -> Option<&str> {
        self.ids.get(uid).map(|s| s.as_str())
    }

    /// Unit ids in insertion order (the deterministic iteration order).
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn edge_count(&self) -> usize {
        self.units.iter().map(|u| u.connections.len()).sum()
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    // The trainer mutates weights and outbound tables in place; everything
    // outside the crate goes through the per-edge methods above.
    pub(crate) fn units_mut(&mut self) -> &mut [Unit] {
        &mut self.units
    }

    pub(crate) fn push_connection(&mut self, from: UnitId, to: UnitId, weight: Weight) -> bool {
        let conns = &mut self.units[from].connections;
        if conns.iter().any(|c| c.target == to) {
            return false;
        }
        conns.push(Connection { target: to, weight });
        true
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let n = self.units.len();
        let avg_potential = if n == 0 {
            0.0
        } else {
            self.units.iter().map(|u| u.potential).sum::<f32>() / n as f32
        };
        Diagnostics {
            unit_count: n,
            edge_count: self.edge_count(),
            avg_potential,
            fired_last_step: self.units.iter().filter(|u| u.fired).count(),
        }
    }
}

fn validate_unit_params(id: &str, threshold: f32, leak: f32) -> Result<(), EvoError> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(EvoError::InvalidParameter {
            id: id.to_string(),
            what: "threshold must be finite and >= 0",
        });
    }
    if !leak.is_finite() || !(0.0..=1.0).contains(&leak) {
        return Err(EvoError::InvalidParameter {
            id: id.to_string(),
            what: "leak must be in [0, 1]",
        });
    }
    Ok(())
}

fn upsert_connection(conns: &mut Vec<Connection>, target: UnitId, weight: Weight) {
    if let Some(c) = conns.iter_mut().find(|c| c.target == target) {
        c.weight = weight;
    } else {
        conns.push(Connection { target, weight });
    }
}
