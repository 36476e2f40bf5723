//! Fitness cache and per-generation result barrier.
//!
//! The aggregator dispatches one task per chromosome, then drains results
//! until every chromosome of the generation has a successful evaluation.
//! Failed results are requeued at once; chromosomes still missing when the
//! generation timeout elapses are requeued individually. Each chromosome may
//! be requeued at most `task_retry_limit` times per generation. Once the
//! barrier is met the dispatcher is told to retire the generation, so queued
//! duplicates never reach a worker.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::fitness::Evaluation;
use crate::compute::CalibrationError;
use crate::compute::workers::{Outcome, Task, TaskResult, WorkerPoolError};
use crate::schema::AggregationConfig;

/// Where tasks go and results come from.
pub trait Dispatch {
    /// Hand a task to the workers.
    fn dispatch(&mut self, task: Task);

    /// Wait up to `timeout` for the next result.
    fn collect(&mut self, timeout: Duration) -> Option<TaskResult>;

    /// Periodic liveness check, called on every aggregator poll.
    fn supervise(&mut self) -> Result<(), WorkerPoolError> {
        Ok(())
    }

    /// Every chromosome of `generation` has a result; drop any of its tasks
    /// still waiting to be evaluated.
    fn retire_generation(&mut self, _generation: usize) {}
}

/// Successful evaluations keyed by `(generation, chromosome)`.
#[derive(Debug, Default)]
pub struct FitnessCache {
    entries: HashMap<(usize, usize), Evaluation>,
}

impl FitnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless already present. Returns whether it was inserted.
    pub fn insert(&mut self, generation: usize, chromosome: usize, evaluation: Evaluation) -> bool {
        match self.entries.entry((generation, chromosome)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(evaluation);
                true
            }
        }
    }

    pub fn get(&self, generation: usize, chromosome: usize) -> Option<&Evaluation> {
        self.entries.get(&(generation, chromosome))
    }

    pub fn contains(&self, generation: usize, chromosome: usize) -> bool {
        self.entries.contains_key(&(generation, chromosome))
    }

    /// Number of cached evaluations for `generation`.
    pub fn count(&self, generation: usize) -> usize {
        self.entries.keys().filter(|(g, _)| *g == generation).count()
    }

    /// Drop every generation before `generation`.
    pub fn evict_before(&mut self, generation: usize) {
        self.entries.retain(|(g, _), _| *g >= generation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Blocks per generation until every chromosome has a successful result.
pub struct ResultAggregator {
    cache: FitnessCache,
    generation_timeout: Duration,
    poll_interval: Duration,
    retry_limit: usize,
    cancelled: Arc<AtomicBool>,
    retries: u64,
}

/// Bookkeeping for the generation being collected.
struct Round {
    generation: usize,
    tasks: Vec<Task>,
    attempts: Vec<usize>,
}

impl ResultAggregator {
    pub fn new(
        config: &AggregationConfig,
        poll_interval: Duration,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cache: FitnessCache::new(),
            generation_timeout: config.generation_timeout(),
            poll_interval,
            retry_limit: config.task_retry_limit,
            cancelled,
            retries: 0,
        }
    }

    /// Total requeues over the aggregator's lifetime.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn cache(&self) -> &FitnessCache {
        &self.cache
    }

    /// Dispatch `tasks` and wait for all of their results.
    ///
    /// `tasks[i]` must be chromosome `i` of `generation`. Returns the
    /// evaluations in chromosome order.
    ///
    /// # Errors
    ///
    /// `GenerationStalled` when a chromosome exceeds the retry limit,
    /// `Cancelled` when the cancel flag is raised, and any supervision error
    /// from the dispatcher.
    pub fn await_generation<D: Dispatch>(
        &mut self,
        generation: usize,
        tasks: Vec<Task>,
        dispatcher: &mut D,
    ) -> Result<Vec<Evaluation>, CalibrationError> {
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.key(), (generation, i), "tasks must be in chromosome order");
        }

        self.cache.evict_before(generation);
        let size = tasks.len();
        let mut round = Round {
            generation,
            attempts: vec![0; size],
            tasks,
        };

        for task in &round.tasks {
            debug!("Dispatching generation {} chromosome {}", generation, task.chromosome);
            dispatcher.dispatch(task.clone());
        }

        let mut deadline = Instant::now() + self.generation_timeout;
        while self.cache.count(generation) < size {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(CalibrationError::Cancelled);
            }
            dispatcher.supervise()?;

            if let Some(result) = dispatcher.collect(self.poll_interval) {
                self.accept(result, &mut round, dispatcher)?;
            }

            if self.cache.count(generation) < size && Instant::now() >= deadline {
                let missing: Vec<usize> = (0..size)
                    .filter(|&i| !self.cache.contains(generation, i))
                    .collect();
                warn!(
                    "Generation {} timed out with {} of {} results, requeueing {:?}",
                    generation,
                    size - missing.len(),
                    size,
                    missing
                );
                self.requeue(&missing, &mut round, dispatcher)?;
                deadline = Instant::now() + self.generation_timeout;
            }
        }

        let evaluations: Vec<Evaluation> = (0..size)
            .filter_map(|i| self.cache.get(generation, i).cloned())
            .collect();
        assert_eq!(evaluations.len(), size, "result barrier bypassed");
        dispatcher.retire_generation(generation);
        Ok(evaluations)
    }

    fn accept<D: Dispatch>(
        &mut self,
        result: TaskResult,
        round: &mut Round,
        dispatcher: &mut D,
    ) -> Result<(), CalibrationError> {
        let generation = round.generation;
        if result.generation != generation || result.chromosome >= round.tasks.len() {
            debug!(
                "Discarding stale result for generation {} chromosome {}",
                result.generation, result.chromosome
            );
            return Ok(());
        }
        if self.cache.contains(generation, result.chromosome) {
            debug!(
                "Discarding duplicate result for chromosome {}",
                result.chromosome
            );
            return Ok(());
        }

        match result.outcome {
            Outcome::Completed(evaluation) => {
                self.cache.insert(generation, result.chromosome, evaluation);
                Ok(())
            }
            Outcome::Failed { diagnostic } => {
                if result.attempt < round.attempts[result.chromosome] {
                    // A newer attempt is already in flight.
                    return Ok(());
                }
                warn!(
                    "Chromosome {} of generation {} failed on worker {}: {}",
                    result.chromosome, generation, result.worker, diagnostic
                );
                self.requeue(&[result.chromosome], round, dispatcher)
            }
        }
    }

    fn requeue<D: Dispatch>(
        &mut self,
        indices: &[usize],
        round: &mut Round,
        dispatcher: &mut D,
    ) -> Result<(), CalibrationError> {
        let stuck: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| round.attempts[i] >= self.retry_limit)
            .collect();
        if !stuck.is_empty() {
            error!(
                "Generation {} stalled: chromosomes {:?} exceeded {} retries",
                round.generation, stuck, self.retry_limit
            );
            return Err(CalibrationError::GenerationStalled {
                generation: round.generation,
                indices: stuck,
            });
        }

        for &i in indices {
            round.attempts[i] += 1;
            self.retries += 1;
            debug!(
                "Requeueing generation {} chromosome {} (attempt {})",
                round.generation, i, round.attempts[i]
            );
            dispatcher.dispatch(round.tasks[i].retry(round.attempts[i]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet, VecDeque};

    /// Evaluates synchronously and can drop or fail chosen attempts.
    #[derive(Default)]
    struct ScriptedDispatcher {
        pending: VecDeque<TaskResult>,
        dispatched: Vec<Task>,
        retired: Vec<usize>,
        drop: HashSet<(usize, usize, usize)>,
        fail: HashSet<(usize, usize, usize)>,
    }

    impl Dispatch for ScriptedDispatcher {
        fn dispatch(&mut self, task: Task) {
            self.dispatched.push(task.clone());
            let id = (task.generation, task.chromosome, task.attempt);
            if self.drop.contains(&id) {
                return;
            }
            let outcome = if self.fail.contains(&id) {
                Outcome::Failed {
                    diagnostic: "scripted failure".into(),
                }
            } else {
                Outcome::Completed(Evaluation::new(task.parameters[0]))
            };
            self.pending.push_back(TaskResult {
                generation: task.generation,
                chromosome: task.chromosome,
                attempt: task.attempt,
                worker: 0,
                outcome,
            });
        }

        fn collect(&mut self, timeout: Duration) -> Option<TaskResult> {
            let next = self.pending.pop_front();
            if next.is_none() {
                std::thread::sleep(timeout);
            }
            next
        }

        fn retire_generation(&mut self, generation: usize) {
            self.retired.push(generation);
        }
    }

    fn attempts_by_chromosome(log: &[Task]) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for task in log {
            *counts.entry(task.chromosome).or_insert(0) += 1;
        }
        counts
    }

    fn aggregator(retry_limit: usize) -> ResultAggregator {
        ResultAggregator::new(
            &AggregationConfig {
                generation_timeout_ms: 30,
                task_retry_limit: retry_limit,
            },
            Duration::from_millis(1),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn tasks(generation: usize, n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new(generation, i, vec![i as f64])).collect()
    }

    #[test]
    fn test_cache_ignores_duplicates() {
        let mut cache = FitnessCache::new();
        assert!(cache.insert(0, 1, Evaluation::new(1.0)));
        assert!(!cache.insert(0, 1, Evaluation::new(2.0)));
        assert_eq!(cache.get(0, 1).unwrap().fitness, 1.0);
        cache.insert(1, 0, Evaluation::new(3.0));
        assert_eq!(cache.count(0), 1);

        cache.evict_before(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(1, 0));
    }

    #[test]
    fn test_collects_in_chromosome_order() {
        let mut dispatcher = ScriptedDispatcher::default();
        let mut aggregator = aggregator(2);

        let evaluations = aggregator
            .await_generation(0, tasks(0, 6), &mut dispatcher)
            .unwrap();
        let fitness: Vec<f64> = evaluations.iter().map(|e| e.fitness).collect();
        assert_eq!(fitness, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(aggregator.retries(), 0);
        assert_eq!(dispatcher.retired, vec![0]);

        aggregator
            .await_generation(1, tasks(1, 6), &mut dispatcher)
            .unwrap();
        assert_eq!(dispatcher.retired, vec![0, 1]);
    }

    #[test]
    fn test_dropped_result_retries_only_that_chromosome() {
        let mut dispatcher = ScriptedDispatcher::default();
        dispatcher.drop.insert((0, 4, 0));
        let mut aggregator = aggregator(2);

        let evaluations = aggregator
            .await_generation(0, tasks(0, 6), &mut dispatcher)
            .unwrap();

        assert_eq!(evaluations.len(), 6);
        assert_eq!(aggregator.retries(), 1);
        assert_eq!(dispatcher.dispatched.len(), 7);
        let counts = attempts_by_chromosome(&dispatcher.dispatched);
        assert_eq!(counts[&4], 2);
        assert!(counts.iter().filter(|(i, _)| **i != 4).all(|(_, n)| *n == 1));
        assert_eq!(dispatcher.dispatched.last().unwrap().attempt, 1);
    }

    #[test]
    fn test_failed_result_requeued_immediately() {
        let mut dispatcher = ScriptedDispatcher::default();
        dispatcher.fail.insert((0, 2, 0));
        let mut aggregator = aggregator(2);

        aggregator
            .await_generation(0, tasks(0, 3), &mut dispatcher)
            .unwrap();
        assert_eq!(aggregator.retries(), 1);
        assert_eq!(attempts_by_chromosome(&dispatcher.dispatched)[&2], 2);
    }

    #[test]
    fn test_retry_limit_stalls_generation() {
        let mut dispatcher = ScriptedDispatcher::default();
        for attempt in 0..3 {
            dispatcher.drop.insert((0, 1, attempt));
        }
        let mut aggregator = aggregator(2);

        let err = aggregator
            .await_generation(0, tasks(0, 3), &mut dispatcher)
            .unwrap_err();
        match err {
            CalibrationError::GenerationStalled {
                generation,
                indices,
            } => {
                assert_eq!(generation, 0);
                assert_eq!(indices, vec![1]);
            }
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(aggregator.retries(), 2);
        assert!(dispatcher.retired.is_empty());
    }

    #[test]
    fn test_stale_results_are_discarded() {
        let mut dispatcher = ScriptedDispatcher::default();
        dispatcher.pending.push_back(TaskResult {
            generation: 0,
            chromosome: 0,
            attempt: 0,
            worker: 1,
            outcome: Outcome::Completed(Evaluation::new(99.0)),
        });
        let mut aggregator = aggregator(1);

        let evaluations = aggregator
            .await_generation(1, tasks(1, 2), &mut dispatcher)
            .unwrap();
        assert_eq!(evaluations[0].fitness, 0.0);
        assert!(!aggregator.cache().contains(0, 0));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let mut dispatcher = ScriptedDispatcher::default();
        dispatcher.drop.insert((0, 0, 0));
        let cancelled = Arc::new(AtomicBool::new(true));
        let mut aggregator = ResultAggregator::new(
            &AggregationConfig::default(),
            Duration::from_millis(1),
            cancelled,
        );

        let err = aggregator
            .await_generation(0, tasks(0, 1), &mut dispatcher)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Cancelled));
    }
}
