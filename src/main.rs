use std::path::Path;
use std::process;

use evospike::codec;
use evospike::episode::Episode;
use evospike::error::EvoError;
use evospike::evolution::{EvolutionConfig, EvolutionEngine, MutationStd};
use evospike::network::{EdgeSpec, Network, NetworkConfig, ResetPolicy, UnitSpec};
use evospike::trainer::{Trainer, TrainerConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }

    let result = if args.len() >= 2 {
        match args[1].as_str() {
            "evolve-demo" => run_evolve_demo(),
            "run" if args.len() == 4 => run_from_files(&args[2], &args[3]),
            other => {
                eprintln!("Unknown command: {other}");
                print_help();
                process::exit(2);
            }
        }
    } else {
        run_train_demo()
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn print_help() {
    println!("evospike (spiking-network training and evolution)");
    println!("usage:");
    println!("  cargo run                               # built-in training demo");
    println!("  cargo run -- evolve-demo                # built-in evolution demo");
    println!("  cargo run -- run CONFIG.json EPISODES   # train a network from files");
    println!("  cargo run -- --help");
}

/// Two-pattern classification: s0 should drive out_a, s1 should drive out_b.
/// Both hidden units start wired to both outputs with equal weight, so the
/// initial network guesses; training has to break the symmetry.
fn demo_config() -> NetworkConfig {
    let unit = |id: &str, threshold: f32, leak: f32| UnitSpec {
        id: id.to_string(),
        threshold,
        leak,
        rest: 0.0,
    };
    let edge = |from: &str, to: &str, weight: f32| EdgeSpec {
        from: from.to_string(),
        to: to.to_string(),
        weight,
    };
    NetworkConfig {
        neurons: vec![
            unit("s0", 0.5, 0.0),
            unit("s1", 0.5, 0.0),
            unit("h0", 0.6, 0.3),
            unit("h1", 0.6, 0.3),
            unit("out_a", 0.5, 0.2),
            unit("out_b", 0.5, 0.2),
        ],
        edges: vec![
            edge("s0", "h0", 0.8),
            edge("s1", "h1", 0.8),
            edge("h0", "out_a", 0.4),
            edge("h0", "out_b", 0.4),
            edge("h1", "out_a", 0.4),
            edge("h1", "out_b", 0.4),
        ],
        reset: ResetPolicy::Zero,
    }
}

fn demo_episodes(per_pattern: usize) -> Vec<Episode> {
    let mut eps = Vec::new();
    for _ in 0..per_pattern {
        for (sensor, target) in [("s0", "out_a"), ("s1", "out_b")] {
            let mut ep = Episode::new(target, 30);
            for t in 0..30 {
                ep.push_event(t, sensor, 1.0).expect("finite amount");
            }
            eps.push(ep);
        }
    }
    eps
}

fn demo_outputs() -> Vec<String> {
    vec!["out_a".to_string(), "out_b".to_string()]
}

fn run_train_demo() -> Result<(), EvoError> {
    let net = Network::from_config(&demo_config())?;
    let cfg = TrainerConfig {
        skip_if_satisfied: true,
        ..TrainerConfig::default()
    };
    let mut trainer = Trainer::new(net, &demo_outputs(), cfg)?;

    let train_set = demo_episodes(4);
    let eval_set = demo_episodes(2);

    for epoch in 0..30 {
        let report = trainer.train_epoch(&train_set)?;
        if epoch % 5 == 0 {
            println!(
                "epoch {:3}  acc={:.3} margin={:+.4} reward={:+.3}",
                report.epoch, report.accuracy, report.mean_margin, report.mean_reward
            );
        }
    }

    let eval = trainer.evaluate(&eval_set)?;
    println!(
        "final: accuracy {:.3} on {} held-out episodes (margin {:+.4})",
        eval.accuracy, eval.episodes, eval.mean_margin
    );

    let diag = trainer.network().diagnostics();
    println!("network: {} units, {} edges", diag.unit_count, diag.edge_count);
    Ok(())
}

fn run_evolve_demo() -> Result<(), EvoError> {
    let cfg = EvolutionConfig {
        population: 8,
        elites: 2,
        generations: 6,
        seed: 7,
        train_epochs: 5,
        mutation: MutationStd {
            weight: 0.08,
            threshold: 0.02,
            leak: 0.01,
        },
        trainer: TrainerConfig {
            skip_if_satisfied: true,
            ..TrainerConfig::default()
        },
        ..EvolutionConfig::default()
    };

    let mut engine = EvolutionEngine::new(
        cfg,
        demo_config(),
        demo_outputs(),
        demo_episodes(4),
        demo_episodes(2),
    )?;

    for report in engine.run()? {
        println!(
            "gen {:2}  best={:+.4} (id {}, acc {:.3})  mean={:+.4}",
            report.generation,
            report.best_fitness,
            report.best_id,
            report.best_accuracy,
            report.mean_fitness
        );
    }

    println!("lineage ({} nodes):", engine.lineage().len());
    println!("{}", codec::lineage_to_json(engine.lineage())?);
    Ok(())
}

fn run_from_files(config_path: &str, episodes_path: &str) -> Result<(), EvoError> {
    let net_cfg = codec::read_network_config(Path::new(config_path))?;
    let episodes = codec::read_episodes(Path::new(episodes_path))?;
    if episodes.is_empty() {
        return Err(EvoError::Codec(format!("{episodes_path}: no episodes")));
    }

    // Every distinct target in the episode set competes as an output.
    let mut outputs: Vec<String> = Vec::new();
    for ep in &episodes {
        if !outputs.iter().any(|o| o == ep.target()) {
            outputs.push(ep.target().to_string());
        }
    }

    let net = Network::from_config(&net_cfg)?;
    let mut trainer = Trainer::new(net, &outputs, TrainerConfig::default())?;

    for _ in 0..20 {
        let report = trainer.train_epoch(&episodes)?;
        println!(
            "epoch {:3}  acc={:.3} margin={:+.4}",
            report.epoch, report.accuracy, report.mean_margin
        );
    }
    let eval = trainer.evaluate(&episodes)?;
    println!("final training-set accuracy: {:.3}", eval.accuracy);
    Ok(())
}
