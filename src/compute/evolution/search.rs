//! Generation coordinator: the genetic algorithm's state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::info;

use crate::compute::CalibrationError;
use crate::schema::{
    BestCandidate, CalibrationConfig, CalibrationHistory, CalibrationResult, Chromosome,
    CoordinatorPhase, GenerationProgress, GenerationRecord, GenerationStats, RunStats, StopReason,
};

use super::codec::ChromosomeCodec;
use super::fitness::Evaluation;
use super::operators::{GeneticRng, population_update};

/// Drives the generation loop: decode, evaluate, record, select.
///
/// Evaluation is delegated to a closure so the coordinator stays independent
/// of how tasks reach the workers.
pub struct GenerationCoordinator {
    config: CalibrationConfig,
    codec: ChromosomeCodec,
    rng: GeneticRng,
    population: Vec<Chromosome>,
    history: CalibrationHistory,
    generation: usize,
    phase: CoordinatorPhase,
    cancelled: Arc<AtomicBool>,
}

impl GenerationCoordinator {
    /// Create a coordinator. The config is assumed validated.
    pub fn new(config: CalibrationConfig, codec: ChromosomeCodec) -> Self {
        let rng = match config.random_seed {
            Some(seed) => GeneticRng::new(seed),
            None => GeneticRng::random(),
        };
        let history = CalibrationHistory::new(config.objective);

        Self {
            config,
            codec,
            rng,
            population: Vec::new(),
            history,
            generation: 0,
            phase: CoordinatorPhase::Init,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing cancellation flag.
    pub fn with_cancel_handle(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn history(&self) -> &CalibrationHistory {
        &self.history
    }

    /// Best candidate over every completed generation.
    pub fn best(&self) -> Option<BestCandidate> {
        self.history.best()
    }

    /// Seed a uniformly random initial population.
    pub fn initialize(&mut self) {
        self.population = self.rng.random_population(
            self.config.population.size,
            self.codec.chromosome_length(),
        );
        self.generation = 0;
        self.history = CalibrationHistory::new(self.config.objective);
        self.phase = CoordinatorPhase::Init;
    }

    /// Record a fully evaluated generation.
    fn record(&mut self, parameters: Vec<Vec<f64>>, evaluations: Vec<Evaluation>) {
        assert_eq!(
            evaluations.len(),
            self.population.len(),
            "one evaluation per chromosome"
        );

        let (fitness, metrics): (Vec<f64>, Vec<_>) = evaluations
            .into_iter()
            .map(|e| (e.fitness, e.metrics))
            .unzip();
        let objective = self.config.objective;
        let best_index = objective.best_index(&fitness).unwrap_or_default();
        let stats = GenerationStats::compute(self.codec.space(), &parameters, &fitness, &metrics);

        let improved = self
            .history
            .best()
            .is_none_or(|b| objective.is_better(fitness[best_index], b.fitness));

        info!(
            "Generation {}: best {:.6}, mean {:.6}, cov {:.4}{}",
            self.generation,
            fitness[best_index],
            stats.fitness_mean,
            stats.fitness_cov,
            if improved { " (new best)" } else { "" }
        );

        self.history.generations.push(GenerationRecord {
            generation: self.generation,
            population: self.population.clone(),
            parameters,
            fitness,
            metrics,
            best_index,
            stats,
        });
    }

    /// Check if the run should stop after the latest generation.
    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }

        if self.history.len() >= self.config.population.generations {
            return Some(StopReason::GenerationBudget);
        }

        let window = self.config.population.early_stop_window;
        if window > 0
            && self.history.len() >= window
            && let Some(best) = self.history.best()
        {
            let recent = &self.history.generations[self.history.len() - window..];
            if recent.iter().all(|g| g.best_fitness() == best.fitness) {
                return Some(StopReason::Stagnation);
            }
        }

        None
    }

    fn progress(&self) -> GenerationProgress {
        let (generation_best, mean_fitness) = self
            .history
            .last()
            .map(|g| (g.best_fitness(), g.stats.fitness_mean))
            .unwrap_or_default();

        GenerationProgress {
            generation: self.generation,
            total_generations: self.config.population.generations,
            best_fitness: self.history.best().map(|b| b.fitness).unwrap_or_default(),
            generation_best,
            mean_fitness,
            phase: self.phase,
        }
    }

    /// Run the generation loop with a progress callback.
    ///
    /// `evaluate` receives the generation index and the decoded population and
    /// must return one evaluation per chromosome, in order. The next
    /// population is only produced after it returns.
    ///
    /// # Errors
    ///
    /// Propagates evaluation errors. Cancellation before the first generation
    /// completes yields `CalibrationError::Cancelled`; later cancellation ends
    /// the run with `StopReason::Cancelled`.
    pub fn run_with_callback<V, C>(
        &mut self,
        mut evaluate: V,
        callback: C,
    ) -> Result<CalibrationResult, CalibrationError>
    where
        V: FnMut(usize, &[Vec<f64>]) -> Result<Vec<Evaluation>, CalibrationError>,
        C: Fn(&GenerationProgress),
    {
        let start_time = Instant::now();
        self.initialize();

        let stop_reason = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                break StopReason::Cancelled;
            }

            self.phase = CoordinatorPhase::Evaluating;
            let parameters: Vec<Vec<f64>> = self
                .population
                .iter()
                .map(|c| self.codec.decode(c))
                .collect();

            let evaluations = match evaluate(self.generation, &parameters) {
                Ok(evaluations) => evaluations,
                Err(CalibrationError::Cancelled) => break StopReason::Cancelled,
                Err(err) => {
                    self.phase = CoordinatorPhase::Terminated;
                    return Err(err);
                }
            };
            self.record(parameters, evaluations);

            let stop = self.should_stop();
            self.phase = match stop {
                Some(_) => CoordinatorPhase::Terminated,
                None => CoordinatorPhase::Selecting,
            };
            callback(&self.progress());
            if let Some(reason) = stop {
                break reason;
            }

            let oriented: Vec<f64> = self
                .history
                .last()
                .map(|g| g.fitness.iter().map(|&f| self.config.objective.orient(f)).collect())
                .unwrap_or_default();
            self.population = population_update(
                &self.population,
                &oriented,
                &self.config.genetic,
                &mut self.rng,
            );
            self.generation += 1;
        };

        self.phase = CoordinatorPhase::Terminated;
        let Some(best) = self.history.best() else {
            return Err(CalibrationError::Cancelled);
        };

        let generations = self.history.len();
        info!(
            "Calibration finished after {} generations ({:?}): best {:.6} from generation {}",
            generations, stop_reason, best.fitness, best.generation
        );

        Ok(CalibrationResult {
            best,
            history: self.history.clone(),
            stats: RunStats {
                generations,
                total_evaluations: (generations * self.config.population.size) as u64,
                retries: 0,
                worker_restarts: 0,
                elapsed_seconds: start_time.elapsed().as_secs_f64(),
                stop_reason,
            },
        })
    }

    /// Run the generation loop without progress reporting.
    pub fn run<V>(&mut self, evaluate: V) -> Result<CalibrationResult, CalibrationError>
    where
        V: FnMut(usize, &[Vec<f64>]) -> Result<Vec<Evaluation>, CalibrationError>,
    {
        self.run_with_callback(evaluate, |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Objective, ParameterSpace, PopulationConfig};
    use std::cell::RefCell;

    fn coordinator(config: CalibrationConfig) -> GenerationCoordinator {
        let space = ParameterSpace::default()
            .with("x", -1.0, 1.0)
            .with("y", -1.0, 1.0);
        let codec = ChromosomeCodec::new(space, config.genetic.bits_per_parameter).unwrap();
        GenerationCoordinator::new(config, codec)
    }

    fn config(size: usize, generations: usize, window: usize) -> CalibrationConfig {
        let mut config = CalibrationConfig {
            population: PopulationConfig {
                size,
                generations,
                early_stop_window: window,
            },
            random_seed: Some(11),
            ..Default::default()
        };
        config.genetic.bits_per_parameter = 8;
        config
    }

    fn negated_sphere(_: usize, params: &[Vec<f64>]) -> Result<Vec<Evaluation>, CalibrationError> {
        Ok(params
            .iter()
            .map(|p| Evaluation::new(-(p[0] * p[0] + p[1] * p[1])))
            .collect())
    }

    #[test]
    fn test_runs_generation_budget() {
        let mut engine = coordinator(config(10, 5, 0));
        let result = engine.run(negated_sphere).unwrap();

        assert_eq!(result.stats.generations, 5);
        assert_eq!(result.stats.total_evaluations, 50);
        assert_eq!(result.stats.stop_reason, StopReason::GenerationBudget);
        assert_eq!(engine.phase(), CoordinatorPhase::Terminated);
        assert_eq!(engine.best(), Some(result.best.clone()));

        let best_gen = result.history.generation_best();
        let overall = best_gen.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.best.fitness, overall);
        assert!(result.best.parameters.iter().all(|p| (-1.0..=1.0).contains(p)));
    }

    #[test]
    fn test_generations_are_indexed_in_order() {
        let seen = RefCell::new(Vec::new());
        let mut engine = coordinator(config(4, 3, 0));
        engine
            .run(|generation, params| {
                seen.borrow_mut().push((generation, params.len()));
                negated_sphere(generation, params)
            })
            .unwrap();
        assert_eq!(seen.into_inner(), vec![(0, 4), (1, 4), (2, 4)]);
    }

    #[test]
    fn test_stagnation_stops_early() {
        let mut engine = coordinator(config(6, 50, 3));
        let result = engine
            .run(|_, params| Ok(vec![Evaluation::new(1.0); params.len()]))
            .unwrap();

        assert_eq!(result.stats.stop_reason, StopReason::Stagnation);
        assert_eq!(result.stats.generations, 3);
        assert_eq!(result.best.generation, 0);
    }

    #[test]
    fn test_minimize_objective() {
        let mut cfg = config(10, 4, 0);
        cfg.objective = Objective::Minimize;
        let mut engine = coordinator(cfg);
        let result = engine
            .run(|_, params| {
                Ok(params
                    .iter()
                    .map(|p| Evaluation::new(p[0] * p[0] + p[1] * p[1]))
                    .collect())
            })
            .unwrap();

        let lowest = result
            .history
            .generation_best()
            .into_iter()
            .fold(f64::INFINITY, f64::min);
        assert_eq!(result.best.fitness, lowest);
        let so_far = result.history.best_so_far();
        assert!(so_far.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_progress_callback() {
        let reports = RefCell::new(Vec::new());
        let mut engine = coordinator(config(4, 3, 0));
        engine
            .run_with_callback(negated_sphere, |p| reports.borrow_mut().push(p.clone()))
            .unwrap();

        let reports = reports.into_inner();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].phase, CoordinatorPhase::Selecting);
        assert_eq!(reports[2].phase, CoordinatorPhase::Terminated);
        assert!(reports.windows(2).all(|w| w[1].best_fitness >= w[0].best_fitness));
    }

    #[test]
    fn test_cancellation() {
        let mut engine = coordinator(config(4, 100, 0));
        let cancel = engine.cancel_handle();

        let result = engine
            .run(|generation, params| {
                if generation == 2 {
                    cancel.store(true, Ordering::Relaxed);
                }
                negated_sphere(generation, params)
            })
            .unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::Cancelled);
        assert_eq!(result.stats.generations, 3);
    }

    #[test]
    fn test_cancel_before_first_generation() {
        let mut engine = coordinator(config(4, 3, 0));
        engine.cancel_handle().store(true, Ordering::Relaxed);
        let err = engine.run(negated_sphere).unwrap_err();
        assert!(matches!(err, CalibrationError::Cancelled));
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let mut engine = coordinator(config(4, 3, 0));
        let err = engine
            .run(|generation, _| {
                Err(CalibrationError::GenerationStalled {
                    generation,
                    indices: vec![1],
                })
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::GenerationStalled { generation: 0, .. }
        ));
    }
}
