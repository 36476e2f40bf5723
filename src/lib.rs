//! Genetic-algorithm parameter calibration with a supervised worker pool.
//!
//! A black-box evaluator scores one parameter vector by running a simulation.
//! This crate searches the parameter space with a bit-string genetic
//! algorithm and farms the expensive evaluations out to a fixed pool of
//! worker threads, synchronizing once per generation.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Parameters, chromosomes, configuration and run output types
//! - `compute`: Codec, genetic operators, queues, workers and the run controller
//!
//! # Example
//!
//! ```rust,no_run
//! use genetic_calibrator::{
//!     compute::{calibrate, evolution::{Evaluation, EvaluationError}},
//!     schema::{CalibrationConfig, ParameterSpace},
//! };
//!
//! let space = ParameterSpace::default()
//!     .with("infection_rate", 0.0, 1.0)
//!     .with("recovery_days", 3.0, 14.0);
//!
//! let mut config = CalibrationConfig::default();
//! config.population.size = 20;
//! config.population.generations = 30;
//! config.workers.count = 4;
//!
//! // Each worker builds its own model once and reuses it for every task.
//! let result = calibrate(config, space, |_worker| {
//!     Ok(|params: &[f64]| -> Result<Evaluation, EvaluationError> {
//!         let error = (params[0] - 0.3).powi(2) + (params[1] - 7.0).powi(2);
//!         Ok(Evaluation::new(-error))
//!     })
//! })
//! .unwrap();
//!
//! println!("Best parameters: {:?}", result.best.parameters);
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{CalibrationError, Calibrator, calibrate};
pub use schema::{CalibrationConfig, CalibrationResult, Parameter, ParameterSpace};
