//! Calibrate a two-parameter toy model on a worker pool.
//!
//! Run with: `RUST_LOG=info cargo run --release --example calibrate_quadratic`

use std::thread;
use std::time::Duration;

use genetic_calibrator::{
    compute::{
        Calibrator,
        evolution::{Evaluation, EvaluationError, Evaluator},
    },
    schema::{CalibrationConfig, Objective, ParameterSpace},
};

/// Toy "simulation" that keeps per-worker state across evaluations.
struct DecayModel {
    observed: Vec<f64>,
    runs: usize,
}

impl DecayModel {
    fn new() -> Self {
        // Observations generated with rate 0.35 and initial level 80.
        let observed = (0..20)
            .map(|t| 80.0 * (-0.35 * t as f64).exp())
            .collect();
        Self { observed, runs: 0 }
    }
}

impl Evaluator for DecayModel {
    fn evaluate(&mut self, parameters: &[f64]) -> Result<Evaluation, EvaluationError> {
        let (rate, level) = (parameters[0], parameters[1]);
        self.runs += 1;
        thread::sleep(Duration::from_millis(2));

        let sse: f64 = self
            .observed
            .iter()
            .enumerate()
            .map(|(t, y)| (level * (-rate * t as f64).exp() - y).powi(2))
            .sum();

        Ok(Evaluation::new(sse)
            .with_metric("final_level", level * (-rate * 19.0).exp())
            .with_metric("worker_runs", self.runs as f64))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let space = ParameterSpace::default()
        .with("rate", 0.01, 1.0)
        .with("level", 10.0, 200.0);

    let mut config = CalibrationConfig::default();
    config.population.size = 40;
    config.population.generations = 60;
    config.population.early_stop_window = 15;
    config.genetic.bits_per_parameter = 16;
    config.genetic.mutation_probability = 0.2;
    config.objective = Objective::Minimize;
    config.workers.count = 4;
    // Heartbeats only fire between tasks: keep the grace above the slowest
    // single evaluation or long runs are restarted as hung.
    config.workers.heartbeat_grace_ms = 10_000;
    config.random_seed = Some(7);

    let calibrator = match Calibrator::new(config, space) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid setup: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = calibrator.run_with_callback(
        |_worker| Ok(DecayModel::new()),
        |progress| {
            println!(
                "generation {:>3}/{}: best {:.4}, generation best {:.4}, mean {:.4}",
                progress.generation + 1,
                progress.total_generations,
                progress.best_fitness,
                progress.generation_best,
                progress.mean_fitness
            );
        },
    );

    match outcome {
        Ok(result) => {
            println!(
                "Best after {} generations ({:?}): rate = {:.4}, level = {:.2}, sse = {:.4}",
                result.stats.generations,
                result.stats.stop_reason,
                result.best.parameters[0],
                result.best.parameters[1],
                result.best.fitness
            );
            println!(
                "{} evaluations, {} retries, {} worker restarts in {:.2}s",
                result.stats.total_evaluations,
                result.stats.retries,
                result.stats.worker_restarts,
                result.stats.elapsed_seconds
            );
            if let Ok(json) = serde_json::to_string_pretty(&result.best) {
                println!("{}", json);
            }
        }
        Err(e) => {
            eprintln!("Calibration failed: {}", e);
            std::process::exit(1);
        }
    }
}
