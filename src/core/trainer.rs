//! Episode-driven training: eligibility traces, reward-shaped weight
//! updates, intrinsic and structural plasticity, and tiered checkpointing
//! with opt-in revert-on-regression.
//!
//! The trainer owns its network for the duration of training; the tick loop
//! and the update loop never run concurrently on the same graph.

use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::error::EvoError;
use crate::network::{Network, NetworkSnapshot, UnitId};
use crate::prng::Prng;
use crate::tracker::OutputTracker;

/// Scalar reward shaping applied to an episode outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMode {
    /// Fixed `+gain` / `-gain` keyed on correctness.
    #[default]
    Binary,
    /// Reward proportional to the signed target margin.
    MarginLinear,
    /// Smooth saturating function of the signed target margin.
    SoftplusMargin,
}

/// Which post-synaptic signal feeds the eligibility trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostSignal {
    /// Binary fire flag of the destination unit.
    #[default]
    Spike,
    /// Smoothed activity rate of the destination unit.
    Rate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertMetric {
    #[default]
    Accuracy,
    Margin,
}

/// Threshold/leak adaptation toward a target firing rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntrinsicConfig {
    pub enabled: bool,
    pub target_rate: f32,
    pub threshold_step: f32,
    pub leak_step: f32,
}

impl Default for IntrinsicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_rate: 0.1,
            threshold_step: 0.01,
            leak_step: 0.001,
        }
    }
}

/// Prune/grow policy applied at batch boundaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StructuralConfig {
    pub enabled: bool,
    /// Magnitude below which an edge is considered dormant.
    pub prune_epsilon: f32,
    /// Consecutive dormant batches before an edge is pruned.
    pub prune_patience: u32,
    /// Maximum edges grown per batch (0 disables growth).
    pub grow_limit: usize,
    /// New edges start uniform in `[-grow_weight, grow_weight]`.
    pub grow_weight: f32,
}

impl Default for StructuralConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prune_epsilon: 1e-3,
            prune_patience: 3,
            grow_limit: 0,
            grow_weight: 0.05,
        }
    }
}

/// One checkpoint retention tier: snapshot every `every` batches, keep the
/// most recent `keep`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionTier {
    pub every: u32,
    pub keep: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RevertConfig {
    pub enabled: bool,
    pub metric: RevertMetric,
    /// Restore the latest checkpoint when the tracked metric drops by more
    /// than this between consecutive batches.
    pub drop_threshold: f32,
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metric: RevertMetric::Accuracy,
            drop_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub warmup_ticks: usize,
    pub decision_ticks: usize,

    /// Detector smoothing factor (EMA alpha).
    pub rate_alpha: f32,
    /// Minimum winner activity; everything at/below abstains.
    pub winner_threshold: f32,
    /// Fallback prediction when all outputs abstain.
    pub default_winner: Option<String>,

    pub learning_rate: f32,
    /// Eligibility trace decay lambda, in (0, 1).
    pub eligibility_decay: f32,
    pub weight_decay: f32,
    pub post_signal: PostSignal,

    pub reward_mode: RewardMode,
    pub reward_gain: f32,
    pub reward_min: f32,
    pub reward_max: f32,

    /// Subtract an exponentially-tracked reward baseline (advantage shaping).
    pub baseline: bool,
    pub baseline_decay: f32,

    /// Suppress the update when the correct unit already wins comfortably.
    pub skip_if_satisfied: bool,
    pub satisfied_margin: f32,

    /// Symmetric weight bound; 0 disables clipping.
    pub weight_clip: f32,

    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,

    pub intrinsic: IntrinsicConfig,
    pub structural: StructuralConfig,
    pub checkpoint_tiers: Vec<RetentionTier>,
    pub revert: RevertConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            warmup_ticks: 10,
            decision_ticks: 20,
            rate_alpha: 0.05,
            winner_threshold: 0.01,
            default_winner: None,
            learning_rate: 0.05,
            eligibility_decay: 0.95,
            weight_decay: 0.0,
            post_signal: PostSignal::Spike,
            reward_mode: RewardMode::Binary,
            reward_gain: 1.0,
            reward_min: -1.0,
            reward_max: 1.0,
            baseline: false,
            baseline_decay: 0.1,
            skip_if_satisfied: false,
            satisfied_margin: 0.05,
            weight_clip: 1.5,
            batch_size: 4,
            shuffle: true,
            seed: 1,
            intrinsic: IntrinsicConfig::default(),
            structural: StructuralConfig::default(),
            checkpoint_tiers: vec![
                RetentionTier { every: 1, keep: 4 },
                RetentionTier { every: 8, keep: 4 },
                RetentionTier { every: 64, keep: 2 },
            ],
            revert: RevertConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), EvoError> {
        if self.decision_ticks == 0 {
            return Err(EvoError::InvalidConfig("decision_ticks must be >= 1"));
        }
        if !self.rate_alpha.is_finite() || self.rate_alpha <= 0.0 || self.rate_alpha > 1.0 {
            return Err(EvoError::InvalidConfig("rate_alpha must be in (0, 1]"));
        }
        if !self.winner_threshold.is_finite() || self.winner_threshold < 0.0 {
            return Err(EvoError::InvalidConfig(
                "winner_threshold must be finite and >= 0",
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(EvoError::InvalidConfig(
                "learning_rate must be finite and >= 0",
            ));
        }
        if self.eligibility_decay <= 0.0 || self.eligibility_decay >= 1.0 {
            return Err(EvoError::InvalidConfig(
                "eligibility_decay must be in (0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.weight_decay) {
            return Err(EvoError::InvalidConfig("weight_decay must be in [0, 1]"));
        }
        if !self.reward_gain.is_finite() {
            return Err(EvoError::InvalidConfig("reward_gain must be finite"));
        }
        if self.reward_min > self.reward_max {
            return Err(EvoError::InvalidConfig("reward_min must be <= reward_max"));
        }
        if self.baseline_decay <= 0.0 || self.baseline_decay > 1.0 {
            return Err(EvoError::InvalidConfig("baseline_decay must be in (0, 1]"));
        }
        if !self.satisfied_margin.is_finite() || self.satisfied_margin < 0.0 {
            return Err(EvoError::InvalidConfig(
                "satisfied_margin must be finite and >= 0",
            ));
        }
        if !self.weight_clip.is_finite() || self.weight_clip < 0.0 {
            return Err(EvoError::InvalidConfig(
                "weight_clip must be finite and >= 0",
            ));
        }
        if self.batch_size == 0 {
            return Err(EvoError::InvalidConfig("batch_size must be >= 1"));
        }
        if self.intrinsic.enabled {
            if !(0.0..=1.0).contains(&self.intrinsic.target_rate) {
                return Err(EvoError::InvalidConfig("target_rate must be in [0, 1]"));
            }
            if self.intrinsic.threshold_step < 0.0 || self.intrinsic.leak_step < 0.0 {
                return Err(EvoError::InvalidConfig(
                    "intrinsic step sizes must be >= 0",
                ));
            }
        }
        if self.structural.enabled {
            if self.structural.prune_epsilon < 0.0 {
                return Err(EvoError::InvalidConfig("prune_epsilon must be >= 0"));
            }
            if self.structural.prune_patience == 0 {
                return Err(EvoError::InvalidConfig("prune_patience must be >= 1"));
            }
        }
        for tier in &self.checkpoint_tiers {
            if tier.every == 0 || tier.keep == 0 {
                return Err(EvoError::InvalidConfig(
                    "checkpoint tiers need every >= 1 and keep >= 1",
                ));
            }
        }
        if self.revert.enabled && self.revert.drop_threshold < 0.0 {
            return Err(EvoError::InvalidConfig("drop_threshold must be >= 0"));
        }
        Ok(())
    }
}

/// Constrains which unit pairs structural growth may connect.
pub trait TopologyPolicy: Send + Sync {
    fn allows(&self, from: &str, to: &str) -> bool;
}

pub struct AllowAll;

impl TopologyPolicy for AllowAll {
    fn allows(&self, _from: &str, _to: &str) -> bool {
        true
    }
}

/// Forbids growing edges into designated sensory units; inputs stay inputs.
pub struct NoSensoryFanIn {
    sensory: Vec<String>,
}

impl NoSensoryFanIn {
    pub fn new(sensory: impl IntoIterator<Item = String>) -> Self {
        Self {
            sensory: sensory.into_iter().collect(),
        }
    }
}

impl TopologyPolicy for NoSensoryFanIn {
    fn allows(&self, _from: &str, to: &str) -> bool {
        !self.sensory.iter().any(|s| s == to)
    }
}

/// Per-epoch training metrics, returned rather than delivered via callbacks.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: u64,
    pub episodes: usize,
    pub accuracy: f32,
    pub mean_margin: f32,
    pub mean_reward: f32,
    pub pruned: usize,
    pub grown: usize,
    pub rejected_updates: usize,
    pub reverted: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvalReport {
    pub episodes: usize,
    pub accuracy: f32,
    pub mean_margin: f32,
}

#[derive(Debug, Clone, Copy)]
struct EpisodeOutcome {
    correct: bool,
    margin: f32,
    /// Target rate minus the best competing output rate.
    signed_margin: f32,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    batch: u64,
    snapshot: NetworkSnapshot,
}

pub struct Trainer {
    cfg: TrainerConfig,
    net: Network,
    outputs: Vec<UnitId>,
    tracker: OutputTracker,
    rng: Prng,
    topology: Box<dyn TopologyPolicy>,

    // All three tables are aligned index-for-index with each unit's
    // outbound connection table.
    eligibility: Vec<Vec<f32>>,
    delta: Vec<Vec<f32>>,
    low_streak: Vec<Vec<u32>>,

    unit_rate: Vec<f32>,
    batch_rate_sum: Vec<f32>,

    baseline: f32,
    batches_done: u64,
    epoch: u64,
    checkpoints: Vec<Vec<Checkpoint>>,
    last_metric: Option<f32>,
}

impl Trainer {
    pub fn new(net: Network, outputs: &[String], cfg: TrainerConfig) -> Result<Self, EvoError> {
        cfg.validate()?;

        let mut output_ids = Vec::with_capacity(outputs.len());
        for id in outputs {
            output_ids.push(
                net.unit_id(id)
                    .ok_or_else(|| EvoError::UnknownUnit(id.clone()))?,
            );
        }
        let default = match &cfg.default_winner {
            Some(id) => Some(
                net.unit_id(id)
                    .ok_or_else(|| EvoError::UnknownUnit(id.clone()))?,
            ),
            None => None,
        };

        let tracker = OutputTracker::new(cfg.rate_alpha, cfg.winner_threshold, default);
        let rng = Prng::new(cfg.seed);
        let tier_count = cfg.checkpoint_tiers.len().max(1);
        let n = net.unit_count();

        let mut trainer = Self {
            cfg,
            net,
            outputs: output_ids,
            tracker,
            rng,
            topology: Box::new(AllowAll),
            eligibility: Vec::new(),
            delta: Vec::new(),
            low_streak: Vec::new(),
            unit_rate: vec![0.0; n],
            batch_rate_sum: vec![0.0; n],
            baseline: 0.0,
            batches_done: 0,
            epoch: 0,
            checkpoints: vec![Vec::new(); tier_count],
            last_metric: None,
        };
        trainer.sync_plastic_tables();
        trainer.rebuild_streaks();
        Ok(trainer)
    }

    pub fn set_topology_policy(&mut self, policy: Box<dyn TopologyPolicy>) {
        self.topology = policy;
    }

    pub fn network(&self) -> &Network {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.net
    }

    pub fn into_network(self) -> Network {
        self.net
    }

    /// Train one pass over the episode set, applying averaged updates at
    /// batch boundaries.
    pub fn train_epoch(&mut self, episodes: &[Episode]) -> Result<EpochReport, EvoError> {
        let mut order: Vec<usize> = (0..episodes.len()).collect();
        if self.cfg.shuffle {
            self.rng.shuffle(&mut order);
        }

        let mut report = EpochReport {
            epoch: self.epoch,
            episodes: episodes.len(),
            ..EpochReport::default()
        };
        let mut correct_total = 0usize;
        let mut margin_sum = 0.0f32;
        let mut reward_sum = 0.0f32;

        // Per-batch bookkeeping.
        let mut batch_n = 0usize;
        let mut batch_contrib = 0usize;
        let mut batch_correct = 0usize;
        let mut batch_margin = 0.0f32;

        for &idx in &order {
            let ep = &episodes[idx];
            let outcome = self.run_episode(ep, true)?;

            if outcome.correct {
                correct_total += 1;
                batch_correct += 1;
            }
            margin_sum += outcome.margin;
            batch_margin += outcome.margin;
            batch_n += 1;

            let satisfied = self.cfg.skip_if_satisfied
                && outcome.correct
                && outcome.margin >= self.cfg.satisfied_margin;
            if !satisfied {
                let reward = self.shape_reward(&outcome);
                let advantage = if self.cfg.baseline {
                    let adv = reward - self.baseline;
                    self.baseline = (1.0 - self.cfg.baseline_decay) * self.baseline
                        + self.cfg.baseline_decay * reward;
                    adv
                } else {
                    reward
                };
                reward_sum += reward;
                self.accumulate_deltas(advantage);
                batch_contrib += 1;
            }

            if batch_n == self.cfg.batch_size {
                self.finish_batch(batch_n, batch_contrib, batch_correct, batch_margin, &mut report);
                batch_n = 0;
                batch_contrib = 0;
                batch_correct = 0;
                batch_margin = 0.0;
            }
        }
        if batch_n > 0 {
            self.finish_batch(batch_n, batch_contrib, batch_correct, batch_margin, &mut report);
        }

        let n = episodes.len().max(1) as f32;
        report.accuracy = correct_total as f32 / n;
        report.mean_margin = margin_sum / n;
        report.mean_reward = reward_sum / n;

        self.epoch += 1;
        log::debug!(
            "epoch {} done: acc {:.3} margin {:.4} pruned {} grown {} reverted {}",
            report.epoch,
            report.accuracy,
            report.mean_margin,
            report.pruned,
            report.grown,
            report.reverted
        );
        Ok(report)
    }

    /// Evaluate-only pass: no eligibility, no updates, no plasticity.
    pub fn evaluate(&mut self, episodes: &[Episode]) -> Result<EvalReport, EvoError> {
        let mut correct = 0usize;
        let mut margin_sum = 0.0f32;
        for ep in episodes {
            let outcome = self.run_episode(ep, false)?;
            if outcome.correct {
                correct += 1;
            }
            margin_sum += outcome.margin;
        }
        let n = episodes.len().max(1) as f32;
        Ok(EvalReport {
            episodes: episodes.len(),
            accuracy: correct as f32 / n,
            mean_margin: margin_sum / n,
        })
    }

    /// Capture the current graph into the finest checkpoint tier.
    pub fn checkpoint(&mut self) {
        let snapshot = self.net.capture();
        let batch = self.batches_done;
        let keep = self
            .cfg
            .checkpoint_tiers
            .first()
            .map(|t| t.keep)
            .unwrap_or(1);
        let ring = &mut self.checkpoints[0];
        ring.push(Checkpoint { batch, snapshot });
        while ring.len() > keep {
            ring.remove(0);
        }
    }

    /// Restore the most recent checkpoint, if any.
    pub fn revert(&mut self) -> bool {
        let latest = self
            .checkpoints
            .iter()
            .flatten()
            .max_by_key(|c| c.batch)
            .map(|c| c.snapshot.clone());
        let Some(snapshot) = latest else {
            return false;
        };
        // Checkpoints were captured from this same graph, so restore cannot
        // fail here.
        if self.net.restore(&snapshot).is_err() {
            return false;
        }
        self.sync_plastic_tables();
        self.rebuild_streaks();
        true
    }

    fn run_episode(&mut self, ep: &Episode, learn: bool) -> Result<EpisodeOutcome, EvoError> {
        let target = self
            .net
            .unit_id(ep.target())
            .ok_or_else(|| EvoError::UnknownUnit(ep.target().to_string()))?;

        self.net.zero_state();
        self.tracker.reset();
        self.unit_rate.fill(0.0);
        if learn {
            for e in &mut self.eligibility {
                e.fill(0.0);
            }
        }

        let total = self.cfg.warmup_ticks + self.cfg.decision_ticks;
        let lambda = self.cfg.eligibility_decay;
        let alpha = self.cfg.rate_alpha;

        for tick in 0..total {
            for (id, amount) in ep.events_at(tick) {
                self.net.inject(id, *amount)?;
            }
            self.net.step();

            for k in 0..self.outputs.len() {
                let uid = self.outputs[k];
                self.tracker.update(uid, self.net.fired(uid));
            }
            for (i, u) in self.net.units().iter().enumerate() {
                let f = if u.fired { 1.0 } else { 0.0 };
                self.unit_rate[i] = (1.0 - alpha) * self.unit_rate[i] + alpha * f;
            }

            if learn {
                let units = self.net.units();
                for i in 0..units.len() {
                    let pre = if units[i].fired { 1.0f32 } else { 0.0 };
                    let elig = &mut self.eligibility[i];
                    for (k, c) in units[i].connections.iter().enumerate() {
                        let post = match self.cfg.post_signal {
                            PostSignal::Spike => {
                                if units[c.target].fired {
                                    1.0
                                } else {
                                    0.0
                                }
                            }
                            PostSignal::Rate => self.unit_rate[c.target],
                        };
                        elig[k] = lambda * elig[k] + pre * post;
                    }
                }
            }
        }

        if learn {
            for (i, r) in self.unit_rate.iter().enumerate() {
                self.batch_rate_sum[i] += r;
            }
        }

        let winner = self.tracker.predict_sticky(&self.outputs);
        let margin = self.tracker.margin(&self.outputs);
        let target_rate = self.tracker.rate(target);
        let best_other = self
            .outputs
            .iter()
            .filter(|&&o| o != target)
            .map(|&o| self.tracker.rate(o))
            .fold(0.0f32, f32::max);

        Ok(EpisodeOutcome {
            // Abstention counts as incorrect unless the default id happens
            // to be the target.
            correct: winner == Some(target),
            margin,
            signed_margin: target_rate - best_other,
        })
    }

    fn shape_reward(&self, outcome: &EpisodeOutcome) -> f32 {
        let gain = self.cfg.reward_gain;
        let m = outcome.signed_margin;
        let raw = match self.cfg.reward_mode {
            RewardMode::Binary => {
                if outcome.correct {
                    gain
                } else {
                    -gain
                }
            }
            RewardMode::MarginLinear => gain * m,
            RewardMode::SoftplusMargin => gain * (softplus(4.0 * m) - core::f32::consts::LN_2),
        };
        raw.clamp(self.cfg.reward_min, self.cfg.reward_max)
    }

    fn accumulate_deltas(&mut self, advantage: f32) {
        let scale = self.cfg.learning_rate * advantage;
        for (d, e) in self.delta.iter_mut().zip(&self.eligibility) {
            for (dk, ek) in d.iter_mut().zip(e) {
                *dk += scale * ek;
            }
        }
    }

    fn finish_batch(
        &mut self,
        batch_n: usize,
        batch_contrib: usize,
        batch_correct: usize,
        batch_margin: f32,
        report: &mut EpochReport,
    ) {
        if batch_contrib > 0 {
            let inv = 1.0 / batch_n as f32;
            let decay = self.cfg.weight_decay;
            let clip = self.cfg.weight_clip;
            let mut rejected = 0usize;
            let units = self.net.units_mut();
            for (u, d) in units.iter_mut().zip(&self.delta) {
                for (c, dk) in u.connections.iter_mut().zip(d) {
                    let w = c.weight - decay * c.weight + dk * inv;
                    if !w.is_finite() {
                        // Local recovery: drop the divergent update, keep the
                        // old weight.
                        rejected += 1;
                        continue;
                    }
                    c.weight = if clip > 0.0 { w.clamp(-clip, clip) } else { w };
                }
            }
            if rejected > 0 {
                log::warn!("rejected {rejected} non-finite weight updates");
                report.rejected_updates += rejected;
            }
        }
        for d in &mut self.delta {
            d.fill(0.0);
        }

        self.intrinsic_step(batch_n);
        self.batch_rate_sum.fill(0.0);

        if self.cfg.structural.enabled {
            let (pruned, grown) = self.structural_step();
            report.pruned += pruned;
            report.grown += grown;
            if pruned > 0 || grown > 0 {
                log::debug!("structural: pruned {pruned} grown {grown}");
            }
        }

        self.batches_done += 1;

        // The revert check runs before this batch's state is captured:
        // "latest checkpoint" must mean the state prior to the suspect
        // update, and a regressed batch must never enter the rings.
        let metric = match self.cfg.revert.metric {
            RevertMetric::Accuracy => batch_correct as f32 / batch_n.max(1) as f32,
            RevertMetric::Margin => batch_margin / batch_n.max(1) as f32,
        };
        if self.cfg.revert.enabled {
            if let Some(prev) = self.last_metric {
                if metric < prev - self.cfg.revert.drop_threshold {
                    if self.revert() {
                        log::warn!(
                            "metric regressed {prev:.3} -> {metric:.3}, reverted to checkpoint"
                        );
                        report.reverted += 1;
                        // Keep comparing against the pre-regression value.
                        return;
                    }
                }
            }
        }
        self.checkpoint_tick();
        self.last_metric = Some(metric);
    }

    fn intrinsic_step(&mut self, batch_n: usize) {
        let ip = self.cfg.intrinsic;
        if !ip.enabled || batch_n == 0 {
            return;
        }
        let inv = 1.0 / batch_n as f32;
        let units = self.net.units_mut();
        for (i, u) in units.iter_mut().enumerate() {
            let err = self.batch_rate_sum[i] * inv - ip.target_rate;
            // Firing above target: raise the bar and drain faster.
            u.threshold = (u.threshold + ip.threshold_step * err).max(0.0);
            u.leak = (u.leak - ip.leak_step * err).clamp(0.0, 1.0);
        }
    }

    fn structural_step(&mut self) -> (usize, usize) {
        let eps = self.cfg.structural.prune_epsilon;
        let patience = self.cfg.structural.prune_patience;

        let mut pruned = 0usize;
        {
            let units = self.net.units_mut();
            for (u, streaks) in units.iter_mut().zip(&mut self.low_streak) {
                let mut k = 0;
                while k < u.connections.len() {
                    if u.connections[k].weight.abs() < eps {
                        streaks[k] += 1;
                    } else {
                        streaks[k] = 0;
                    }
                    if streaks[k] >= patience {
                        u.connections.remove(k);
                        streaks.remove(k);
                        pruned += 1;
                    } else {
                        k += 1;
                    }
                }
            }
        }

        let mut grown = 0usize;
        let limit = self.cfg.structural.grow_limit;
        let n = self.net.unit_count();
        if limit > 0 && n >= 2 {
            let gw = self.cfg.structural.grow_weight;
            let mut planned: Vec<(UnitId, UnitId, f32)> = Vec::new();
            let mut attempts = 0usize;
            while planned.len() < limit && attempts < limit * 16 + 16 {
                attempts += 1;
                let f = self.rng.gen_range_usize(0, n);
                let t = self.rng.gen_range_usize(0, n);
                if f == t {
                    continue;
                }
                let from = self.net.name(f).unwrap_or("");
                let to = self.net.name(t).unwrap_or("");
                if !self.topology.allows(from, to) {
                    continue;
                }
                if self.net.units()[f].connections.iter().any(|c| c.target == t) {
                    continue;
                }
                if planned.iter().any(|&(pf, pt, _)| pf == f && pt == t) {
                    continue;
                }
                let w = self.rng.gen_range_f32(-gw, gw);
                planned.push((f, t, w));
            }
            for (f, t, w) in planned {
                if self.net.push_connection(f, t, w) {
                    self.low_streak[f].push(0);
                    grown += 1;
                }
            }
        }

        if pruned > 0 || grown > 0 {
            self.sync_plastic_tables();
        }
        (pruned, grown)
    }

    fn checkpoint_tick(&mut self) {
        let due: Vec<usize> = self
            .cfg
            .checkpoint_tiers
            .iter()
            .enumerate()
            .filter(|(_, t)| self.batches_done % t.every as u64 == 0)
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }
        let snapshot = self.net.capture();
        for i in due {
            let keep = self.cfg.checkpoint_tiers[i].keep;
            let ring = &mut self.checkpoints[i];
            ring.push(Checkpoint {
                batch: self.batches_done,
                snapshot: snapshot.clone(),
            });
            while ring.len() > keep {
                ring.remove(0);
            }
        }
    }

    /// Rebuild eligibility/delta tables (zeroed) to match the current
    /// outbound connection shapes.
    fn sync_plastic_tables(&mut self) {
        self.eligibility = self
            .net
            .units()
            .iter()
            .map(|u| vec![0.0; u.connections.len()])
            .collect();
        self.delta = self
            .net
            .units()
            .iter()
            .map(|u| vec![0.0; u.connections.len()])
            .collect();
    }

    fn rebuild_streaks(&mut self) {
        self.low_streak = self
            .net
            .units()
            .iter()
            .map(|u| vec![0; u.connections.len()])
            .collect();
    }
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ResetPolicy;

    fn feed_forward_net() -> Network {
        // s drives o0; o1 is a silent competitor.
        let mut net = Network::new(ResetPolicy::Zero);
        net.add_unit("s", 0.5, 0.0, 0.0).unwrap();
        net.add_unit("o0", 0.5, 0.0, 0.0).unwrap();
        net.add_unit("o1", 0.5, 0.0, 0.0).unwrap();
        net.add_connection("s", "o0", 1.0).unwrap();
        net
    }

    fn drive_every_tick(target: &str, ticks: usize) -> Episode {
        let mut ep = Episode::new(target, ticks);
        for t in 0..ticks {
            ep.push_event(t, "s", 1.0).unwrap();
        }
        ep
    }

    fn outputs() -> Vec<String> {
        vec!["o0".to_string(), "o1".to_string()]
    }

    fn quiet_cfg() -> TrainerConfig {
        TrainerConfig {
            warmup_ticks: 5,
            decision_ticks: 20,
            shuffle: false,
            batch_size: 1,
            checkpoint_tiers: Vec::new(),
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn eligibility_decays_geometrically() {
        // Single joint pre/post event at tick 0, then silence:
        // eligibility after k further ticks is lambda^k.
        let mut net = Network::new(ResetPolicy::Zero);
        net.add_unit("pre", 0.5, 0.0, 0.0).unwrap();
        net.add_unit("post", 0.5, 0.0, 0.0).unwrap();
        net.add_connection("pre", "post", 0.0).unwrap();

        let cfg = TrainerConfig {
            warmup_ticks: 0,
            decision_ticks: 5,
            eligibility_decay: 0.95,
            learning_rate: 0.0,
            shuffle: false,
            batch_size: 1,
            checkpoint_tiers: Vec::new(),
            ..TrainerConfig::default()
        };
        let outs = vec!["post".to_string()];
        let mut trainer = Trainer::new(net, &outs, cfg).unwrap();

        // Both units fire on the first step only.
        let ep = Episode::with_events("post", 1, &[(0, "pre", 1.0), (0, "post", 1.0)]).unwrap();
        trainer.run_episode(&ep, true).unwrap();

        let e = trainer.eligibility[0][0];
        let want = 0.95f32.powi(4);
        assert!((e - want).abs() < 1e-4, "eligibility {e} vs {want}");
    }

    #[test]
    fn satisfied_episode_leaves_weights_unchanged() {
        let net = feed_forward_net();
        let cfg = TrainerConfig {
            skip_if_satisfied: true,
            satisfied_margin: 0.05,
            weight_decay: 0.0,
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();

        let before: Vec<f32> = trainer
            .network()
            .units()
            .iter()
            .flat_map(|u| u.connections.iter().map(|c| c.weight))
            .collect();

        let eps = vec![drive_every_tick("o0", 25)];
        let report = trainer.train_epoch(&eps).unwrap();
        assert_eq!(report.accuracy, 1.0);

        let after: Vec<f32> = trainer
            .network()
            .units()
            .iter()
            .flat_map(|u| u.connections.iter().map(|c| c.weight))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn incorrect_outcome_depresses_active_edges() {
        // Target is o1, but s drives o0: binary reward is negative and the
        // s->o0 edge carries all the eligibility.
        let net = feed_forward_net();
        let mut trainer = Trainer::new(net, &outputs(), quiet_cfg()).unwrap();

        let w_before = trainer.network().edge_weight("s", "o0").unwrap();
        let eps = vec![drive_every_tick("o1", 25)];
        let report = trainer.train_epoch(&eps).unwrap();
        assert_eq!(report.accuracy, 0.0);

        let w_after = trainer.network().edge_weight("s", "o0").unwrap();
        assert!(w_after < w_before, "{w_after} should drop below {w_before}");
    }

    #[test]
    fn correct_outcome_potentiates_active_edges() {
        let net = feed_forward_net();
        let mut trainer = Trainer::new(net, &outputs(), quiet_cfg()).unwrap();

        let w_before = trainer.network().edge_weight("s", "o0").unwrap();
        let eps = vec![drive_every_tick("o0", 25)];
        trainer.train_epoch(&eps).unwrap();

        let w_after = trainer.network().edge_weight("s", "o0").unwrap();
        assert!(w_after > w_before);
    }

    #[test]
    fn dormant_edges_pruned_after_patience() {
        let mut net = feed_forward_net();
        net.add_connection("s", "o1", 0.001).unwrap();

        let cfg = TrainerConfig {
            learning_rate: 0.0,
            structural: StructuralConfig {
                enabled: true,
                prune_epsilon: 0.01,
                prune_patience: 2,
                grow_limit: 0,
                grow_weight: 0.05,
            },
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();

        let eps = vec![drive_every_tick("o0", 25), drive_every_tick("o0", 25)];
        let report = trainer.train_epoch(&eps).unwrap();

        assert_eq!(report.pruned, 1);
        assert!(trainer.network().edge_weight("s", "o1").is_none());
        assert!(trainer.network().edge_weight("s", "o0").is_some());
    }

    #[test]
    fn growth_respects_topology_policy() {
        let net = feed_forward_net();
        let cfg = TrainerConfig {
            learning_rate: 0.0,
            structural: StructuralConfig {
                enabled: true,
                prune_epsilon: 0.0,
                prune_patience: 100,
                grow_limit: 64,
                grow_weight: 0.05,
            },
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();
        trainer.set_topology_policy(Box::new(NoSensoryFanIn::new(["s".to_string()])));

        let eps = vec![drive_every_tick("o0", 25)];
        let report = trainer.train_epoch(&eps).unwrap();
        assert!(report.grown > 0);

        // The policy keeps every grown edge out of the sensory unit.
        let s = trainer.network().unit_id("s").unwrap();
        for u in trainer.network().units() {
            assert!(u.connections.iter().all(|c| c.target != s));
        }

        // No self-edges; uniqueness preserved.
        for (i, u) in trainer.network().units().iter().enumerate() {
            let mut targets: Vec<_> = u.connections.iter().map(|c| c.target).collect();
            assert!(!targets.contains(&i));
            let before = targets.len();
            targets.sort_unstable();
            targets.dedup();
            assert_eq!(targets.len(), before);
        }
    }

    #[test]
    fn checkpoint_and_revert_restore_weights() {
        let net = feed_forward_net();
        let mut trainer = Trainer::new(net, &outputs(), quiet_cfg()).unwrap();

        assert!(!trainer.revert(), "no checkpoint yet");

        trainer.checkpoint();
        let w = trainer.network().edge_weight("s", "o0").unwrap();
        trainer.network_mut().set_weight("s", "o0", 0.123).unwrap();
        assert!(trainer.revert());
        assert_eq!(trainer.network().edge_weight("s", "o0"), Some(w));
    }

    #[test]
    fn automatic_revert_discards_regressing_batch() {
        let net = feed_forward_net();
        let cfg = TrainerConfig {
            checkpoint_tiers: vec![RetentionTier { every: 1, keep: 4 }],
            revert: RevertConfig {
                enabled: true,
                metric: RevertMetric::Accuracy,
                drop_threshold: 0.5,
            },
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();

        let r1 = trainer.train_epoch(&[drive_every_tick("o0", 25)]).unwrap();
        assert_eq!(r1.reverted, 0);
        let w_good = trainer.network().edge_weight("s", "o0").unwrap();

        // The o1 batch depresses s->o0 and tanks accuracy. The rollback
        // must restore the state before that update, not a checkpoint
        // captured after it.
        let r2 = trainer.train_epoch(&[drive_every_tick("o1", 25)]).unwrap();
        assert_eq!(r2.reverted, 1);
        assert_eq!(trainer.network().edge_weight("s", "o0"), Some(w_good));
    }

    #[test]
    fn non_finite_updates_are_rejected_locally() {
        let net = feed_forward_net();
        let cfg = TrainerConfig {
            learning_rate: f32::MAX,
            reward_gain: f32::MAX,
            reward_min: f32::MIN,
            reward_max: f32::MAX,
            weight_clip: 0.0,
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();

        let w_before = trainer.network().edge_weight("s", "o0").unwrap();
        let eps = vec![drive_every_tick("o0", 25)];
        let report = trainer.train_epoch(&eps).unwrap();

        assert!(report.rejected_updates > 0);
        assert_eq!(trainer.network().edge_weight("s", "o0"), Some(w_before));
    }

    #[test]
    fn evaluate_reports_accuracy_without_learning() {
        let net = feed_forward_net();
        let mut trainer = Trainer::new(net, &outputs(), quiet_cfg()).unwrap();

        let before: Vec<f32> = trainer
            .network()
            .units()
            .iter()
            .flat_map(|u| u.connections.iter().map(|c| c.weight))
            .collect();

        let eps = vec![drive_every_tick("o0", 25), drive_every_tick("o0", 25)];
        let eval = trainer.evaluate(&eps).unwrap();
        assert_eq!(eval.accuracy, 1.0);
        assert!(eval.mean_margin > 0.0);

        let after: Vec<f32> = trainer
            .network()
            .units()
            .iter()
            .flat_map(|u| u.connections.iter().map(|c| c.weight))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn intrinsic_plasticity_raises_overactive_thresholds() {
        let net = feed_forward_net();
        let cfg = TrainerConfig {
            learning_rate: 0.0,
            intrinsic: IntrinsicConfig {
                enabled: true,
                target_rate: 0.05,
                threshold_step: 0.1,
                leak_step: 0.0,
            },
            ..quiet_cfg()
        };
        let mut trainer = Trainer::new(net, &outputs(), cfg).unwrap();

        let s = trainer.network().unit_id("s").unwrap();
        let th_before = trainer.network().unit(s).unwrap().threshold;

        // s fires every tick, far above the 0.05 target rate.
        let eps = vec![drive_every_tick("o0", 25)];
        trainer.train_epoch(&eps).unwrap();

        let th_after = trainer.network().unit(s).unwrap().threshold;
        assert!(th_after > th_before);
    }

    #[test]
    fn unknown_output_rejected_at_construction() {
        let net = feed_forward_net();
        let outs = vec!["ghost".to_string()];
        assert!(matches!(
            Trainer::new(net, &outs, quiet_cfg()),
            Err(EvoError::UnknownUnit(_))
        ));
    }

    #[test]
    fn config_validation_catches_bad_lambda() {
        let cfg = TrainerConfig {
            eligibility_decay: 1.0,
            ..TrainerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
