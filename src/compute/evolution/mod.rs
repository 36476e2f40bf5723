//! Genetic search over bit-string chromosomes.
//!
//! # Overview
//!
//! - **Codec** (`codec`): bounded real parameters to bit segments and back
//! - **Operators** (`operators`): selection, crossover, mutation, population update
//! - **Evaluator** (`fitness`): the pluggable simulation interface
//! - **Aggregator** (`archive`): fitness cache and per-generation result barrier
//! - **Coordinator** (`search`): the generation state machine
//!
//! # Example
//!
//! ```rust
//! use genetic_calibrator::compute::evolution::{
//!     ChromosomeCodec, Evaluation, GenerationCoordinator,
//! };
//! use genetic_calibrator::schema::{CalibrationConfig, ParameterSpace};
//!
//! let mut config = CalibrationConfig::default();
//! config.population.size = 8;
//! config.population.generations = 3;
//! config.genetic.bits_per_parameter = 10;
//!
//! let space = ParameterSpace::default().with("x", -2.0, 2.0);
//! let codec = ChromosomeCodec::new(space, config.genetic.bits_per_parameter).unwrap();
//!
//! // Evaluate in-process; the run controller farms this out to workers instead.
//! let mut coordinator = GenerationCoordinator::new(config, codec);
//! let result = coordinator
//!     .run(|_, params| Ok(params.iter().map(|p| Evaluation::new(-p[0] * p[0])).collect()))
//!     .unwrap();
//!
//! assert_eq!(result.history.len(), 3);
//! ```

mod archive;
mod codec;
mod fitness;
mod operators;
mod search;

pub use archive::{Dispatch, FitnessCache, ResultAggregator};
pub use codec::{ChromosomeCodec, EncodingError, MAX_BITS_PER_PARAMETER, encode_bounds};
pub use fitness::{Evaluation, EvaluationError, Evaluator};
pub(crate) use fitness::{EvaluatorFactory, erase_factory};
pub use operators::{
    GeneticRng, crossover, cumulative_probabilities, mutate, population_update, roulette_select,
    selection_probabilities,
};
pub use search::GenerationCoordinator;
