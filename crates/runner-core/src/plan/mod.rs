//! Plan intake: parsing and validation of a submitted [`PlanSpec`] (§6.1).

pub mod parser;

pub use parser::{validate_plan, PlanValidationError};
