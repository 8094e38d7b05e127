pub mod analytics;
pub mod error;
pub mod experiments;

pub use error::{AbTestError, Result};
pub use experiments::stats::evaluate;
pub use experiments::{CycleOutcome, TestController, TestRegistry};
