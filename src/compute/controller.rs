//! Run controller: wires the codec, worker pool, result barrier and
//! generation coordinator into one calibration run.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{error, info};

use super::evolution::{
    ChromosomeCodec, Dispatch, EncodingError, EvaluationError, Evaluator, GenerationCoordinator,
    ResultAggregator,
};
use super::workers::{Task, WorkerPool, WorkerPoolError};
use crate::schema::{
    CalibrationConfig, CalibrationConfigError, CalibrationResult, GenerationProgress,
    ParameterSpace,
};

/// Errors that end a calibration run.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] CalibrationConfigError),
    #[error("Invalid encoding: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Workers(#[from] WorkerPoolError),
    #[error("Generation {generation} stalled: chromosomes {indices:?} exceeded the retry limit")]
    GenerationStalled {
        generation: usize,
        indices: Vec<usize>,
    },
    #[error("Calibration cancelled before any generation completed")]
    Cancelled,
}

/// Calibration run controller.
pub struct Calibrator {
    config: CalibrationConfig,
    codec: ChromosomeCodec,
    cancelled: Arc<AtomicBool>,
}

impl Calibrator {
    /// Validate the configuration and build the codec.
    pub fn new(config: CalibrationConfig, space: ParameterSpace) -> Result<Self, CalibrationError> {
        config.validate()?;
        let codec = ChromosomeCodec::new(space, config.genetic.bits_per_parameter)?;
        info!(
            "Calibrating {} parameters with {}-bit chromosomes",
            codec.space().len(),
            codec.chromosome_length()
        );
        Ok(Self {
            config,
            codec,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn codec(&self) -> &ChromosomeCodec {
        &self.codec
    }

    /// Get cancellation handle. Raising it stops the run at the next poll.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run to completion on a fresh worker pool.
    ///
    /// `factory` is called once on each worker thread with the worker id to
    /// build that worker's evaluator.
    pub fn run<F, E>(&self, factory: F) -> Result<CalibrationResult, CalibrationError>
    where
        F: Fn(usize) -> Result<E, EvaluationError> + Send + Sync + 'static,
        E: Evaluator + 'static,
    {
        self.run_with_callback(factory, |_| {})
    }

    /// Run with a progress callback invoked after every generation.
    ///
    /// The pool is shut down before returning, on success and on error.
    pub fn run_with_callback<F, E, C>(
        &self,
        factory: F,
        callback: C,
    ) -> Result<CalibrationResult, CalibrationError>
    where
        F: Fn(usize) -> Result<E, EvaluationError> + Send + Sync + 'static,
        E: Evaluator + 'static,
        C: Fn(&GenerationProgress),
    {
        let mut pool = WorkerPool::start(&self.config.workers, factory)?;

        let outcome = self.drive(&mut pool, callback);
        let restarts = pool.restarts();
        pool.shutdown();

        match outcome {
            Ok(mut result) => {
                result.stats.worker_restarts = restarts as u64;
                Ok(result)
            }
            Err(err) => {
                error!("Calibration failed: {}", err);
                Err(err)
            }
        }
    }

    /// Run the generation loop against any dispatcher.
    ///
    /// Generation `g + 1` is dispatched only after every result of generation
    /// `g` has been collected.
    pub fn drive<D, C>(
        &self,
        dispatcher: &mut D,
        callback: C,
    ) -> Result<CalibrationResult, CalibrationError>
    where
        D: Dispatch,
        C: Fn(&GenerationProgress),
    {
        let mut aggregator = ResultAggregator::new(
            &self.config.aggregation,
            self.config.workers.poll_interval(),
            Arc::clone(&self.cancelled),
        );
        let mut coordinator = GenerationCoordinator::new(self.config.clone(), self.codec.clone())
            .with_cancel_handle(Arc::clone(&self.cancelled));

        let mut result = coordinator.run_with_callback(
            |generation, parameters| {
                let tasks = parameters
                    .iter()
                    .enumerate()
                    .map(|(i, p)| Task::new(generation, i, p.clone()))
                    .collect();
                aggregator.await_generation(generation, tasks, &mut *dispatcher)
            },
            callback,
        )?;

        result.stats.retries = aggregator.retries();
        Ok(result)
    }
}

/// Calibrate `space` with a worker pool built from `factory`.
pub fn calibrate<F, E>(
    config: CalibrationConfig,
    space: ParameterSpace,
    factory: F,
) -> Result<CalibrationResult, CalibrationError>
where
    F: Fn(usize) -> Result<E, EvaluationError> + Send + Sync + 'static,
    E: Evaluator + 'static,
{
    Calibrator::new(config, space)?.run(factory)
}
