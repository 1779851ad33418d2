//! Population-based structure/parameter search over network snapshots.
//!
//! Each generation every genome is materialized into a live network, trained
//! on the inner loop, and evaluated on a held-out episode set. Training
//! results are written back into the genome (Lamarckian inheritance), so
//! offspring mutate *trained* parameters rather than the genome's birth
//! state. Ancestry is recorded in an append-only lineage forest.

use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::episode::Episode;
use crate::error::EvoError;
use crate::network::{Network, NetworkConfig, NetworkSnapshot};
use crate::prng::{mix_seed, Prng};
use crate::trainer::{Trainer, TrainerConfig};

// Stream keys keep trainer shuffling, mutation noise, and parent selection
// on unrelated PRNG sequences even with the same base seed.
const TRAINER_STREAM: u64 = 0x5452_4149;
const MUTATION_STREAM: u64 = 0x4d55_5441;
const SELECT_STREAM: u64 = 0x5345_4c43;

/// Edge-count denominator floor so empty seed graphs still get a defined
/// sparsity term.
const MIN_BASELINE_EDGES: usize = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenomeMetrics {
    pub fitness: f32,
    pub accuracy: f32,
    pub margin: f32,
    pub edge_count: usize,
}

/// One population member: a parameter/topology snapshot plus its place in
/// the lineage forest. `metrics` is `None` until the genome has been through
/// an inner training loop.
#[derive(Debug, Clone)]
pub struct Genome {
    pub snapshot: NetworkSnapshot,
    pub lineage_id: u64,
    pub parent: Option<u64>,
    pub generation: u32,
    pub metrics: Option<GenomeMetrics>,
}

/// Immutable ancestry record. One node is appended per genome: at its
/// first evaluation, or at copy time for surviving elites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageNode {
    pub id: u64,
    pub parent: Option<u64>,
    pub generation: u32,
    pub fitness: f32,
    pub accuracy: f32,
    pub margin: f32,
    pub edge_count: usize,
}

/// Gaussian mutation scales per parameter class. A zero standard deviation
/// disables that class entirely (and draws nothing from the stream).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutationStd {
    pub weight: f32,
    pub threshold: f32,
    pub leak: f32,
}

impl Default for MutationStd {
    fn default() -> Self {
        Self {
            weight: 0.05,
            threshold: 0.02,
            leak: 0.01,
        }
    }
}

/// Linear fitness combination: accuracy and margin reward, plus a penalty
/// on edge count relative to the seed graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub accuracy: f32,
    pub margin: f32,
    pub sparsity: f32,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            accuracy: 1.0,
            margin: 0.5,
            sparsity: 0.001,
        }
    }
}

/// Everything a fitness function may score on.
#[derive(Debug, Clone, Copy)]
pub struct FitnessInputs {
    pub accuracy: f32,
    pub margin: f32,
    pub edge_count: usize,
    pub unit_count: usize,
}

pub type FitnessFn = fn(&FitnessInputs) -> f32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub population: usize,
    /// Top genomes copied unchanged (metrics included) into the next
    /// generation.
    pub elites: usize,
    pub generations: u32,
    pub seed: u64,
    /// Offspring parents are drawn uniformly from the fittest
    /// `parents_pool` genomes.
    pub parents_pool: usize,
    /// Inner-loop training epochs per genome per generation.
    pub train_epochs: u32,
    /// Write trained parameters back into the genome. When false the inner
    /// loop only informs fitness (Darwinian selection).
    pub lamarckian: bool,
    pub mutation: MutationStd,
    pub fitness: FitnessWeights,
    pub trainer: TrainerConfig,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population: 16,
            elites: 2,
            generations: 10,
            seed: 1,
            parents_pool: 4,
            train_epochs: 2,
            lamarckian: true,
            mutation: MutationStd::default(),
            fitness: FitnessWeights::default(),
            trainer: TrainerConfig::default(),
        }
    }
}

impl EvolutionConfig {
    pub fn validate(&self) -> Result<(), EvoError> {
        if self.population == 0 {
            return Err(EvoError::InvalidConfig("population must be >= 1"));
        }
        if self.elites > self.population {
            return Err(EvoError::InvalidConfig("elites must be <= population"));
        }
        if self.parents_pool == 0 {
            return Err(EvoError::InvalidConfig("parents_pool must be >= 1"));
        }
        for std in [
            self.mutation.weight,
            self.mutation.threshold,
            self.mutation.leak,
        ] {
            if !std.is_finite() || std < 0.0 {
                return Err(EvoError::InvalidConfig(
                    "mutation stds must be finite and >= 0",
                ));
            }
        }
        self.trainer.validate()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationReport {
    pub generation: u32,
    pub best_id: u64,
    pub best_fitness: f32,
    pub best_accuracy: f32,
    pub mean_fitness: f32,
}

pub struct EvolutionEngine {
    cfg: EvolutionConfig,
    base: NetworkConfig,
    outputs: Vec<String>,
    train_set: Vec<Episode>,
    eval_set: Vec<Episode>,
    population: Vec<Genome>,
    lineage: Vec<LineageNode>,
    next_id: u64,
    generation: u32,
    baseline_edges: usize,
    fitness_fn: Option<FitnessFn>,
}

impl EvolutionEngine {
    pub fn new(
        cfg: EvolutionConfig,
        base: NetworkConfig,
        outputs: Vec<String>,
        train_set: Vec<Episode>,
        eval_set: Vec<Episode>,
    ) -> Result<Self, EvoError> {
        cfg.validate()?;
        // Materialize once up front so bad base configs and unknown output
        // ids fail here, not mid-run.
        let probe = Network::from_config(&base)?;
        for id in &outputs {
            if probe.unit_id(id).is_none() {
                return Err(EvoError::UnknownUnit(id.clone()));
            }
        }
        let seed_snapshot = probe.capture();
        let baseline_edges = probe.edge_count().max(MIN_BASELINE_EDGES);

        let mut engine = Self {
            cfg,
            base,
            outputs,
            train_set,
            eval_set,
            population: Vec::new(),
            lineage: Vec::new(),
            next_id: 0,
            generation: 0,
            baseline_edges,
            fitness_fn: None,
        };

        // Individual 0 is the unperturbed base; the rest start as mutants of
        // it so the initial population is not degenerate.
        for i in 0..engine.cfg.population {
            let snapshot = if i == 0 {
                seed_snapshot.clone()
            } else {
                let mut rng =
                    Prng::for_slot(engine.cfg.seed ^ MUTATION_STREAM, 0, i as u64);
                mutate_snapshot(
                    &seed_snapshot,
                    &engine.cfg.mutation,
                    engine.cfg.trainer.weight_clip,
                    &mut rng,
                )
            };
            let id = engine.next_id;
            engine.next_id += 1;
            engine.population.push(Genome {
                snapshot,
                lineage_id: id,
                parent: None,
                generation: 0,
                metrics: None,
            });
        }
        Ok(engine)
    }

    /// Replace the built-in linear fitness with a custom score.
    pub fn set_fitness_fn(&mut self, f: FitnessFn) {
        self.fitness_fn = Some(f);
    }

    pub fn population(&self) -> &[Genome] {
        &self.population
    }

    pub fn lineage(&self) -> &[LineageNode] {
        &self.lineage
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Best evaluated genome of the current population.
    pub fn best(&self) -> Option<&Genome> {
        self.population
            .iter()
            .filter(|g| g.metrics.is_some())
            .max_by(|a, b| {
                let fa = a.metrics.as_ref().map(|m| m.fitness).unwrap_or(f32::MIN);
                let fb = b.metrics.as_ref().map(|m| m.fitness).unwrap_or(f32::MIN);
                fa.partial_cmp(&fb).unwrap_or(core::cmp::Ordering::Equal)
            })
    }

    /// Run the configured number of generations, returning one report each.
    pub fn run(&mut self) -> Result<Vec<GenerationReport>, EvoError> {
        let mut reports = Vec::with_capacity(self.cfg.generations as usize);
        for _ in 0..self.cfg.generations {
            let report = self.evaluate_generation()?;
            log::info!(
                "gen {}: best {:.4} (acc {:.3}) mean {:.4}",
                report.generation,
                report.best_fitness,
                report.best_accuracy,
                report.mean_fitness
            );
            reports.push(report);
            if self.generation + 1 < self.cfg.generations {
                self.next_generation();
            }
            self.generation += 1;
        }
        Ok(reports)
    }

    /// Train and score every genome in the current population, writing the
    /// trained parameters back into each genome.
    pub fn evaluate_generation(&mut self) -> Result<GenerationReport, EvoError> {
        let cfg = &self.cfg;
        let base = &self.base;
        let outputs = &self.outputs;
        let train_set = &self.train_set;
        let eval_set = &self.eval_set;
        let gen = self.generation;
        let baseline_edges = self.baseline_edges;
        let fitness_fn = self.fitness_fn;

        let eval_one = |(i, g): (usize, &Genome)| -> Result<(NetworkSnapshot, GenomeMetrics), EvoError> {
            // Elites carry their evaluated metrics forward untouched.
            if let Some(m) = g.metrics {
                return Ok((g.snapshot.clone(), m));
            }
            evaluate_genome(
                cfg,
                base,
                outputs,
                train_set,
                eval_set,
                g,
                gen,
                i as u64,
                baseline_edges,
                fitness_fn,
            )
        };

        #[cfg(feature = "parallel")]
        let results: Vec<Result<(NetworkSnapshot, GenomeMetrics), EvoError>> = self
            .population
            .par_iter()
            .enumerate()
            .map(eval_one)
            .collect();
        #[cfg(not(feature = "parallel"))]
        let results: Vec<Result<(NetworkSnapshot, GenomeMetrics), EvoError>> =
            self.population.iter().enumerate().map(eval_one).collect();

        for (g, res) in self.population.iter_mut().zip(results) {
            let (snapshot, metrics) = res?;
            let first_evaluation = g.metrics.is_none();
            g.snapshot = snapshot;
            g.metrics = Some(metrics);
            if first_evaluation {
                self.lineage.push(LineageNode {
                    id: g.lineage_id,
                    parent: g.parent,
                    generation: g.generation,
                    fitness: metrics.fitness,
                    accuracy: metrics.accuracy,
                    margin: metrics.margin,
                    edge_count: metrics.edge_count,
                });
            }
        }

        let mut best_idx = 0usize;
        let mut sum = 0.0f32;
        for (i, g) in self.population.iter().enumerate() {
            let f = g.metrics.as_ref().map(|m| m.fitness).unwrap_or(f32::MIN);
            sum += f;
            let bf = self.population[best_idx]
                .metrics
                .as_ref()
                .map(|m| m.fitness)
                .unwrap_or(f32::MIN);
            if f > bf {
                best_idx = i;
            }
        }
        let best = &self.population[best_idx];
        let bm = best.metrics.as_ref().copied().unwrap_or(GenomeMetrics {
            fitness: f32::MIN,
            accuracy: 0.0,
            margin: 0.0,
            edge_count: 0,
        });
        Ok(GenerationReport {
            generation: gen,
            best_id: best.lineage_id,
            best_fitness: bm.fitness,
            best_accuracy: bm.accuracy,
            mean_fitness: sum / self.population.len() as f32,
        })
    }

    /// Build the next population: elites copied verbatim, the remainder
    /// filled by mutated offspring of parents drawn from the top pool.
    fn next_generation(&mut self) {
        let mut ranked: Vec<usize> = (0..self.population.len()).collect();
        ranked.sort_by(|&a, &b| {
            let fa = self.population[a]
                .metrics
                .as_ref()
                .map(|m| m.fitness)
                .unwrap_or(f32::MIN);
            let fb = self.population[b]
                .metrics
                .as_ref()
                .map(|m| m.fitness)
                .unwrap_or(f32::MIN);
            fb.partial_cmp(&fa)
                .unwrap_or(core::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let next_gen = self.generation + 1;
        let mut next = Vec::with_capacity(self.cfg.population);
        for &i in ranked.iter().take(self.cfg.elites) {
            // Elites survive unmodified but get a fresh lineage node whose
            // parent is their former self, so the ancestry chain stays
            // contiguous generation to generation.
            let mut elite = self.population[i].clone();
            let id = self.next_id;
            self.next_id += 1;
            elite.parent = Some(elite.lineage_id);
            elite.lineage_id = id;
            elite.generation = next_gen;
            if let Some(m) = elite.metrics {
                self.lineage.push(LineageNode {
                    id,
                    parent: elite.parent,
                    generation: next_gen,
                    fitness: m.fitness,
                    accuracy: m.accuracy,
                    margin: m.margin,
                    edge_count: m.edge_count,
                });
            }
            next.push(elite);
        }

        let pool = self.cfg.parents_pool.min(ranked.len());
        let mut select_rng =
            Prng::for_slot(self.cfg.seed ^ SELECT_STREAM, next_gen as u64, 0);
        while next.len() < self.cfg.population {
            let child_slot = next.len() as u64;
            let pick = ranked[select_rng.gen_range_usize(0, pool)];
            let parent = &self.population[pick];

            let mut rng =
                Prng::for_slot(self.cfg.seed ^ MUTATION_STREAM, next_gen as u64, child_slot);
            let snapshot = mutate_snapshot(
                &parent.snapshot,
                &self.cfg.mutation,
                self.cfg.trainer.weight_clip,
                &mut rng,
            );
            let id = self.next_id;
            self.next_id += 1;
            next.push(Genome {
                snapshot,
                lineage_id: id,
                parent: Some(parent.lineage_id),
                generation: next_gen,
                metrics: None,
            });
        }
        self.population = next;
    }
}

#[allow(clippy::too_many_arguments)]
fn evaluate_genome(
    cfg: &EvolutionConfig,
    base: &NetworkConfig,
    outputs: &[String],
    train_set: &[Episode],
    eval_set: &[Episode],
    genome: &Genome,
    generation: u32,
    individual: u64,
    baseline_edges: usize,
    fitness_fn: Option<FitnessFn>,
) -> Result<(NetworkSnapshot, GenomeMetrics), EvoError> {
    let mut net = Network::from_config(base)?;
    net.restore(&genome.snapshot)?;

    let mut tcfg = cfg.trainer.clone();
    tcfg.seed = mix_seed(cfg.seed ^ TRAINER_STREAM, generation as u64, individual);

    let mut trainer = Trainer::new(net, outputs, tcfg)?;
    for _ in 0..cfg.train_epochs {
        trainer.train_epoch(train_set)?;
    }
    let eval = trainer.evaluate(eval_set)?;
    let net = trainer.into_network();

    let inputs = FitnessInputs {
        accuracy: eval.accuracy,
        margin: eval.mean_margin,
        edge_count: net.edge_count(),
        unit_count: net.unit_count(),
    };
    let fitness = match fitness_fn {
        Some(f) => f(&inputs),
        None => {
            cfg.fitness.accuracy * inputs.accuracy + cfg.fitness.margin * inputs.margin
                - cfg.fitness.sparsity * (inputs.edge_count as f32 / baseline_edges as f32)
        }
    };

    // Lamarckian write-back: the trained state becomes the heritable genome.
    // Darwinian mode keeps the birth snapshot and uses training only to
    // score it.
    let snapshot = if cfg.lamarckian {
        net.capture()
    } else {
        genome.snapshot.clone()
    };
    Ok((
        snapshot,
        GenomeMetrics {
            fitness,
            accuracy: eval.accuracy,
            margin: eval.mean_margin,
            edge_count: inputs.edge_count,
        },
    ))
}

/// Gaussian-perturb a snapshot's parameters. Leak stays in [0, 1] and
/// thresholds stay non-negative; weights respect the trainer's clip bound.
fn mutate_snapshot(
    snap: &NetworkSnapshot,
    std: &MutationStd,
    weight_clip: f32,
    rng: &mut Prng,
) -> NetworkSnapshot {
    let mut out = snap.clone();
    for n in &mut out.neurons {
        n.threshold = (n.threshold + rng.gen_gaussian_f32(std.threshold)).max(0.0);
        n.leak = (n.leak + rng.gen_gaussian_f32(std.leak)).clamp(0.0, 1.0);
    }
    for e in &mut out.edges {
        let w = e.weight + rng.gen_gaussian_f32(std.weight);
        e.weight = if weight_clip > 0.0 {
            w.clamp(-weight_clip, weight_clip)
        } else {
            w
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{EdgeSpec, ResetPolicy, UnitSpec};

    fn base_config() -> NetworkConfig {
        NetworkConfig {
            neurons: ["s", "o0", "o1"]
                .iter()
                .map(|id| UnitSpec {
                    id: id.to_string(),
                    threshold: 0.5,
                    leak: 0.0,
                    rest: 0.0,
                })
                .collect(),
            edges: vec![EdgeSpec {
                from: "s".to_string(),
                to: "o0".to_string(),
                weight: 1.0,
            }],
            reset: ResetPolicy::Zero,
        }
    }

    fn drive_episodes(target: &str, count: usize) -> Vec<Episode> {
        (0..count)
            .map(|_| {
                let mut ep = Episode::new(target, 12);
                for t in 0..12 {
                    ep.push_event(t, "s", 1.0).unwrap();
                }
                ep
            })
            .collect()
    }

    fn small_cfg() -> EvolutionConfig {
        EvolutionConfig {
            population: 4,
            elites: 1,
            generations: 3,
            seed: 11,
            train_epochs: 1,
            trainer: TrainerConfig {
                warmup_ticks: 2,
                decision_ticks: 10,
                batch_size: 1,
                shuffle: false,
                checkpoint_tiers: Vec::new(),
                ..TrainerConfig::default()
            },
            ..EvolutionConfig::default()
        }
    }

    fn outputs() -> Vec<String> {
        vec!["o0".to_string(), "o1".to_string()]
    }

    fn make_engine(cfg: EvolutionConfig) -> EvolutionEngine {
        EvolutionEngine::new(
            cfg,
            base_config(),
            outputs(),
            drive_episodes("o0", 2),
            drive_episodes("o0", 2),
        )
        .unwrap()
    }

    #[test]
    fn seeded_runs_reproduce_exactly() {
        let mut a = make_engine(small_cfg());
        let mut b = make_engine(small_cfg());
        let ra = a.run().unwrap();
        let rb = b.run().unwrap();

        assert_eq!(ra.len(), rb.len());
        for (x, y) in ra.iter().zip(&rb) {
            assert_eq!(x.best_id, y.best_id);
            assert_eq!(x.best_fitness, y.best_fitness);
            assert_eq!(x.mean_fitness, y.mean_fitness);
        }
        assert_eq!(a.lineage().len(), b.lineage().len());
        for (x, y) in a.lineage().iter().zip(b.lineage()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.fitness, y.fitness);
        }
    }

    #[test]
    fn best_fitness_never_regresses_with_elitism() {
        let mut engine = make_engine(EvolutionConfig {
            generations: 5,
            ..small_cfg()
        });
        let reports = engine.run().unwrap();
        for pair in reports.windows(2) {
            assert!(
                pair[1].best_fitness >= pair[0].best_fitness,
                "gen {} best {} dropped below {}",
                pair[1].generation,
                pair[1].best_fitness,
                pair[0].best_fitness
            );
        }
    }

    #[test]
    fn lineage_parents_exist_and_precede_children() {
        let mut engine = make_engine(small_cfg());
        engine.run().unwrap();

        let lineage = engine.lineage();
        assert!(!lineage.is_empty());
        for node in lineage {
            if let Some(pid) = node.parent {
                let parent = lineage
                    .iter()
                    .find(|n| n.id == pid)
                    .expect("parent must already be in the forest");
                assert!(parent.generation < node.generation);
            } else {
                assert_eq!(node.generation, 0);
            }
        }
    }

    #[test]
    fn zero_std_mutation_is_identity() {
        let snap = Network::from_config(&base_config()).unwrap().capture();
        let std = MutationStd {
            weight: 0.0,
            threshold: 0.0,
            leak: 0.0,
        };
        let mut rng = Prng::new(5);
        let out = mutate_snapshot(&snap, &std, 1.5, &mut rng);

        for (a, b) in snap.neurons.iter().zip(&out.neurons) {
            assert_eq!(a.threshold, b.threshold);
            assert_eq!(a.leak, b.leak);
        }
        for (a, b) in snap.edges.iter().zip(&out.edges) {
            assert_eq!(a.weight, b.weight);
        }
    }

    #[test]
    fn mutation_respects_parameter_bounds() {
        let snap = Network::from_config(&base_config()).unwrap().capture();
        let std = MutationStd {
            weight: 5.0,
            threshold: 5.0,
            leak: 5.0,
        };
        let mut rng = Prng::new(17);
        for _ in 0..50 {
            let out = mutate_snapshot(&snap, &std, 1.5, &mut rng);
            for n in &out.neurons {
                assert!(n.threshold >= 0.0);
                assert!((0.0..=1.0).contains(&n.leak));
            }
            for e in &out.edges {
                assert!(e.weight.abs() <= 1.5);
            }
        }
    }

    #[test]
    fn trained_parameters_are_inherited() {
        // Target o1 while s drives o0: the inner loop depresses s->o0, and
        // the write-back must carry that into the surviving genome.
        let cfg = EvolutionConfig {
            population: 2,
            elites: 1,
            generations: 1,
            train_epochs: 2,
            mutation: MutationStd {
                weight: 0.0,
                threshold: 0.0,
                leak: 0.0,
            },
            ..small_cfg()
        };
        let mut engine = EvolutionEngine::new(
            cfg,
            base_config(),
            outputs(),
            drive_episodes("o1", 2),
            drive_episodes("o1", 2),
        )
        .unwrap();
        engine.run().unwrap();

        let best = engine.best().unwrap();
        let w = best
            .snapshot
            .edges
            .iter()
            .find(|e| e.from == "s" && e.to == "o0")
            .map(|e| e.weight)
            .unwrap();
        assert!(w < 1.0, "trained weight {w} should be below the seed 1.0");
    }

    #[test]
    fn darwinian_mode_keeps_birth_snapshot() {
        let cfg = EvolutionConfig {
            population: 1,
            elites: 0,
            generations: 1,
            train_epochs: 2,
            lamarckian: false,
            mutation: MutationStd {
                weight: 0.0,
                threshold: 0.0,
                leak: 0.0,
            },
            ..small_cfg()
        };
        let mut engine = EvolutionEngine::new(
            cfg,
            base_config(),
            outputs(),
            drive_episodes("o1", 2),
            drive_episodes("o1", 2),
        )
        .unwrap();
        engine.run().unwrap();

        let genome = &engine.population()[0];
        let w = genome
            .snapshot
            .edges
            .iter()
            .find(|e| e.from == "s" && e.to == "o0")
            .map(|e| e.weight)
            .unwrap();
        assert_eq!(w, 1.0, "birth snapshot must survive the inner loop");
    }

    #[test]
    fn unknown_output_rejected_at_construction() {
        let err = EvolutionEngine::new(
            small_cfg(),
            base_config(),
            vec!["ghost".to_string()],
            Vec::new(),
            Vec::new(),
        );
        assert!(matches!(err, Err(EvoError::UnknownUnit(_))));
    }

    #[test]
    fn custom_fitness_fn_is_used() {
        let mut engine = make_engine(EvolutionConfig {
            generations: 1,
            ..small_cfg()
        });
        engine.set_fitness_fn(|_| 42.0);
        let reports = engine.run().unwrap();
        assert_eq!(reports[0].best_fitness, 42.0);
    }

    #[test]
    fn config_validation_rejects_oversized_elites() {
        let cfg = EvolutionConfig {
            population: 2,
            elites: 3,
            ..small_cfg()
        };
        assert!(cfg.validate().is_err());
    }
}
