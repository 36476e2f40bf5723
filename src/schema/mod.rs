//! Schema module - Parameter, chromosome, configuration and run output types.

mod calibration;
mod chromosome;
mod parameter;

pub use calibration::*;
pub use chromosome::*;
pub use parameter::*;
