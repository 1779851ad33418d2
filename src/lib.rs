//! Discrete-time spiking networks with reward-modulated learning and an
//! evolutionary outer loop.
//!
//! The crate is layered bottom-up: [`network`] holds the graph and tick
//! dynamics, [`tracker`] turns output spikes into decisions, [`trainer`]
//! runs episodes and applies eligibility-trace weight updates, and
//! [`evolution`] searches over trained networks with Lamarckian
//! inheritance. [`codec`] covers the on-disk formats.
//!
//! ```
//! use evospike::prelude::*;
//!
//! let mut net = Network::new(ResetPolicy::Zero);
//! net.add_unit("in", 0.5, 0.0, 0.0)?;
//! net.add_unit("out", 0.5, 0.0, 0.0)?;
//! net.add_connection("in", "out", 0.8)?;
//!
//! net.inject("in", 1.0)?;
//! net.step();
//! net.step();
//! assert!(net.fired(net.unit_id("out").unwrap()));
//! # Ok::<(), evospike::error::EvoError>(())
//! ```

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/episode.rs"]
pub mod episode;

#[path = "core/tracker.rs"]
pub mod tracker;

#[path = "core/trainer.rs"]
pub mod trainer;

#[path = "core/evolution.rs"]
pub mod evolution;

#[path = "core/codec.rs"]
pub mod codec;

pub mod prelude {
    pub use crate::episode::Episode;
    pub use crate::error::EvoError;
    pub use crate::evolution::{
        EvolutionConfig, EvolutionEngine, FitnessInputs, FitnessWeights, Genome, GenomeMetrics,
        LineageNode, MutationStd,
    };
    pub use crate::network::{
        Network, NetworkConfig, NetworkSnapshot, ResetPolicy, Unit, UnitId,
    };
    pub use crate::tracker::OutputTracker;
    pub use crate::trainer::{
        EpochReport, EvalReport, PostSignal, RewardMode, Trainer, TrainerConfig,
    };
}
