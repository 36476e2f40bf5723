//! Compute module - Genetic search, worker pool and the run controller.

mod controller;

pub mod evolution;
pub mod workers;

pub use controller::*;
