//! Evaluator interface for scoring decoded parameter vectors.
//!
//! An evaluator wraps the simulation model. Each worker owns one instance,
//! created once on the worker thread and reused for every task it processes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Fitness and auxiliary metrics for one parameter vector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evaluation {
    pub fitness: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl Evaluation {
    pub fn new(fitness: f64) -> Self {
        Self {
            fitness,
            metrics: BTreeMap::new(),
        }
    }

    /// Attach a recorded metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

impl From<f64> for Evaluation {
    fn from(fitness: f64) -> Self {
        Self::new(fitness)
    }
}

/// Failure raised by an evaluator or its setup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error("Evaluator setup failed: {0}")]
    Setup(String),
    #[error("Simulation failed: {0}")]
    Simulation(String),
}

/// Scores one parameter vector against a private simulation context.
pub trait Evaluator: Send {
    fn evaluate(&mut self, parameters: &[f64]) -> Result<Evaluation, EvaluationError>;
}

impl<F> Evaluator for F
where
    F: FnMut(&[f64]) -> Result<Evaluation, EvaluationError> + Send,
{
    fn evaluate(&mut self, parameters: &[f64]) -> Result<Evaluation, EvaluationError> {
        self(parameters)
    }
}

/// Type-erased evaluator constructor, called once per worker with its id.
pub(crate) type EvaluatorFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn Evaluator>, EvaluationError> + Send + Sync>;

/// Erase a typed factory so the pool can hold it without generics.
pub(crate) fn erase_factory<F, E>(factory: F) -> EvaluatorFactory
where
    F: Fn(usize) -> Result<E, EvaluationError> + Send + Sync + 'static,
    E: Evaluator + 'static,
{
    Arc::new(move |worker_id| {
        factory(worker_id).map(|evaluator| Box::new(evaluator) as Box<dyn Evaluator>)
    })
}
