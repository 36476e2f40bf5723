//! Calibration configuration and run output types.
//!
//! The configuration tree mirrors the run phases: population sizing,
//! genetic operator settings, worker pool supervision and the per-generation
//! result barrier. Output types describe the generation history and the best
//! candidate found over the whole run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Chromosome, ParameterSpace};

/// Top-level configuration for a calibration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Population and generation settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Genetic operator settings.
    #[serde(default)]
    pub genetic: GeneticConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Result barrier settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// Whether the evaluator's value is maximized or minimized.
    #[serde(default)]
    pub objective: Objective,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of chromosomes per generation.
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Generation budget.
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Stagnation window. Zero disables early stopping.
    #[serde(default)]
    pub early_stop_window: usize,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            generations: default_generations(),
            early_stop_window: 0,
        }
    }
}

fn default_population_size() -> usize {
    20
}
fn default_generations() -> usize {
    50
}

/// Genetic operator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneticConfig {
    /// Probability that an offspring is mutated at all.
    #[serde(default = "default_mutation_probability")]
    pub mutation_probability: f64,
    /// Fraction of bits flipped by one mutation. `None` flips a single bit.
    #[serde(default)]
    pub mutation_rate: Option<f64>,
    /// Segment width per parameter.
    #[serde(default = "default_bits_per_parameter")]
    pub bits_per_parameter: u32,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            mutation_probability: default_mutation_probability(),
            mutation_rate: None,
            bits_per_parameter: default_bits_per_parameter(),
        }
    }
}

fn default_mutation_probability() -> f64 {
    0.02
}
fn default_bits_per_parameter() -> u32 {
    20
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers. Zero uses the available parallelism.
    #[serde(default)]
    pub count: usize,
    /// How long the pool waits for every worker to report ready.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Dequeue timeout of the worker loop and the aggregator.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age after which a silent heartbeat marks a worker as hung.
    ///
    /// A worker beats between tasks, never during an evaluation, so this must
    /// exceed the longest single evaluation. A worker still building its
    /// evaluator is judged against `startup_timeout_ms` instead.
    #[serde(default = "default_heartbeat_grace_ms")]
    pub heartbeat_grace_ms: u64,
    /// Bounded wait for workers to exit on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Restarts allowed over the run before the pool gives up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            startup_timeout_ms: default_startup_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_grace_ms: default_heartbeat_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl WorkerConfig {
    /// Worker count with `0` resolved to the machine's parallelism.
    pub fn resolved_count(&self) -> usize {
        if self.count > 0 {
            self.count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_heartbeat_grace_ms() -> u64 {
    120_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}
fn default_max_restarts() -> usize {
    16
}

/// Result barrier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Wait for a generation's results before requeueing missing tasks.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    /// Requeues allowed per chromosome within one generation.
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: default_generation_timeout_ms(),
            task_retry_limit: default_task_retry_limit(),
        }
    }
}

impl AggregationConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

fn default_generation_timeout_ms() -> u64 {
    600_000
}
fn default_task_retry_limit() -> usize {
    3
}

/// Direction of optimization.
///
/// The genetic operators always maximize; `Minimize` negates the evaluator's
/// value before selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Maximize,
    Minimize,
}

impl Objective {
    /// Map an evaluator value to the maximized scale (an involution).
    pub fn orient(self, value: f64) -> f64 {
        match self {
            Self::Maximize => value,
            Self::Minimize => -value,
        }
    }

    /// True if `candidate` is strictly better than `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.orient(candidate) > self.orient(incumbent)
    }

    /// Index of the best value, first one on ties.
    pub fn best_index(self, values: &[f64]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, &v) in values.iter().enumerate() {
            match best {
                Some(b) if !self.is_better(v, values[b]) => {}
                _ => best = Some(i),
            }
        }
        best
    }
}

// ============================================================================
// Run output
// ============================================================================

/// One completed generation. Immutable once appended to the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Generation index, starting at 0.
    pub generation: usize,
    /// Evaluated population.
    pub population: Vec<Chromosome>,
    /// Decoded parameter vectors, parallel to `population`.
    pub parameters: Vec<Vec<f64>>,
    /// Evaluator values, parallel to `population`.
    pub fitness: Vec<f64>,
    /// Metrics recorded by the evaluator, parallel to `population`.
    pub metrics: Vec<BTreeMap<String, f64>>,
    /// Index of the best chromosome under the run's objective.
    pub best_index: usize,
    /// Summary statistics.
    pub stats: GenerationStats,
}

impl GenerationRecord {
    /// Fitness of the generation's best chromosome.
    pub fn best_fitness(&self) -> f64 {
        self.fitness[self.best_index]
    }
}

/// Mean and coefficient of variation of one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub fitness_mean: f64,
    pub fitness_cov: f64,
    /// Per-parameter mean, keyed by parameter name.
    pub parameter_mean: BTreeMap<String, f64>,
    pub parameter_cov: BTreeMap<String, f64>,
    /// Per-metric mean over the chromosomes that recorded it.
    pub metric_mean: BTreeMap<String, f64>,
    pub metric_cov: BTreeMap<String, f64>,
}

impl GenerationStats {
    /// Compute statistics for one generation.
    pub fn compute(
        space: &ParameterSpace,
        parameters: &[Vec<f64>],
        fitness: &[f64],
        metrics: &[BTreeMap<String, f64>],
    ) -> Self {
        let (fitness_mean, fitness_cov) = mean_and_cov(fitness.iter().copied());

        let mut parameter_mean = BTreeMap::new();
        let mut parameter_cov = BTreeMap::new();
        for (i, param) in space.iter().enumerate() {
            let (mean, cov) = mean_and_cov(parameters.iter().map(|p| p[i]));
            parameter_mean.insert(param.name.clone(), mean);
            parameter_cov.insert(param.name.clone(), cov);
        }

        let mut by_metric: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for recorded in metrics {
            for (name, &value) in recorded {
                by_metric.entry(name.as_str()).or_default().push(value);
            }
        }
        let mut metric_mean = BTreeMap::new();
        let mut metric_cov = BTreeMap::new();
        for (name, values) in by_metric {
            let (mean, cov) = mean_and_cov(values.into_iter());
            metric_mean.insert(name.to_string(), mean);
            metric_cov.insert(name.to_string(), cov);
        }

        Self {
            fitness_mean,
            fitness_cov,
            parameter_mean,
            parameter_cov,
            metric_mean,
            metric_cov,
        }
    }
}

/// Population mean and std/mean. The CoV is reported as 0 when the mean is 0.
fn mean_and_cov(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let cov = if mean == 0.0 {
        0.0
    } else {
        variance.sqrt() / mean
    };
    (mean, cov)
}

/// Run-long generation history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationHistory {
    pub objective: Objective,
    pub generations: Vec<GenerationRecord>,
}

impl CalibrationHistory {
    pub fn new(objective: Objective) -> Self {
        Self {
            objective,
            generations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn last(&self) -> Option<&GenerationRecord> {
        self.generations.last()
    }

    /// Best fitness of every generation.
    pub fn generation_best(&self) -> Vec<f64> {
        self.generations.iter().map(|g| g.best_fitness()).collect()
    }

    /// Running best-ever fitness after each generation.
    ///
    /// Never regresses under the run's objective.
    pub fn best_so_far(&self) -> Vec<f64> {
        let mut out: Vec<f64> = Vec::with_capacity(self.generations.len());
        for value in self.generation_best() {
            let next = match out.last() {
                Some(&prev) if !self.objective.is_better(value, prev) => prev,
                _ => value,
            };
            out.push(next);
        }
        out
    }

    /// Best chromosome over the whole history. Earliest wins on ties.
    pub fn best(&self) -> Option<BestCandidate> {
        let mut best: Option<&GenerationRecord> = None;
        for record in &self.generations {
            match best {
                Some(b) if !self.objective.is_better(record.best_fitness(), b.best_fitness()) => {}
                _ => best = Some(record),
            }
        }
        best.map(|record| {
            let i = record.best_index;
            BestCandidate {
                generation: record.generation,
                index: i,
                chromosome: record.population[i].clone(),
                parameters: record.parameters[i].clone(),
                fitness: record.fitness[i],
                metrics: record.metrics[i].clone(),
            }
        })
    }
}

/// Best candidate of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCandidate {
    /// Generation it was found in.
    pub generation: usize,
    /// Position within that generation.
    pub index: usize,
    pub chromosome: Chromosome,
    pub parameters: Vec<f64>,
    pub fitness: f64,
    pub metrics: BTreeMap<String, f64>,
}

/// Final result of a calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Best candidate across the entire history.
    pub best: BestCandidate,
    /// Full generation history.
    pub history: CalibrationHistory,
    /// Statistics from the run.
    pub stats: RunStats,
}

/// Statistics from a calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    /// Generations evaluated.
    pub generations: usize,
    /// Successful evaluations collected.
    pub total_evaluations: u64,
    /// Tasks requeued by the result barrier.
    pub retries: u64,
    /// Workers restarted by the pool.
    pub worker_restarts: u64,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    /// Reason for stopping.
    pub stop_reason: StopReason,
}

/// Reason a run stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Generation budget exhausted.
    GenerationBudget,
    /// Best fitness stagnated over the early-stop window.
    Stagnation,
    /// User cancelled.
    Cancelled,
}

/// Coordinator state machine phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CoordinatorPhase {
    /// Seeding the initial population.
    #[default]
    Init,
    /// Waiting for the generation's fitness values.
    Evaluating,
    /// Producing the next population.
    Selecting,
    /// Run complete.
    Terminated,
}

/// Progress report emitted after each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationProgress {
    /// Generation just completed.
    pub generation: usize,
    /// Generation budget.
    pub total_generations: usize,
    /// Best fitness over the run so far.
    pub best_fitness: f64,
    /// Best fitness of this generation.
    pub generation_best: f64,
    /// Mean fitness of this generation.
    pub mean_fitness: f64,
    /// Phase after this report.
    pub phase: CoordinatorPhase,
}

// ============================================================================
// Validation
// ============================================================================

/// Calibration configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationConfigError {
    #[error("Population size must be positive")]
    EmptyPopulation,
    #[error("Generation count must be positive")]
    NoGenerations,
    #[error("Mutation probability must be within [0, 1], got {0}")]
    InvalidMutationProbability(f64),
    #[error("Mutation rate must be within (0, 1], got {0}")]
    InvalidMutationRate(f64),
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),
}

impl CalibrationConfig {
    /// Validate calibration configuration.
    pub fn validate(&self) -> Result<(), CalibrationConfigError> {
        if self.population.size == 0 {
            return Err(CalibrationConfigError::EmptyPopulation);
        }
        if self.population.generations == 0 {
            return Err(CalibrationConfigError::NoGenerations);
        }

        let p = self.genetic.mutation_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(CalibrationConfigError::InvalidMutationProbability(p));
        }
        if let Some(rate) = self.genetic.mutation_rate
            && !(rate > 0.0 && rate <= 1.0)
        {
            return Err(CalibrationConfigError::InvalidMutationRate(rate));
        }

        let check_positive = |value: u64, name: &str| {
            if value == 0 {
                Err(CalibrationConfigError::InvalidTiming(format!(
                    "{} must be positive",
                    name
                )))
            } else {
                Ok(())
            }
        };

        check_positive(self.workers.startup_timeout_ms, "startup_timeout_ms")?;
        check_positive(self.workers.poll_interval_ms, "poll_interval_ms")?;
        check_positive(self.workers.heartbeat_grace_ms, "heartbeat_grace_ms")?;
        check_positive(
            self.aggregation.generation_timeout_ms,
            "generation_timeout_ms",
        )?;

        if self.workers.heartbeat_grace_ms <= self.workers.poll_interval_ms {
            return Err(CalibrationConfigError::InvalidTiming(
                "heartbeat_grace_ms must exceed poll_interval_ms".into(),
            ));
        }

        Ok(())
    }
}
