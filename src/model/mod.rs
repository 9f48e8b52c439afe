//! Installation model: normalization, naming, diffing and schema.

pub mod action_plan;
pub mod namer;
pub mod normalizer;
pub mod schemer;
pub mod templates;
pub mod topology;

pub use action_plan::{ActionPlan, PlanNode};
pub use normalizer::Normalizer;
pub use schemer::Schemer;
pub use topology::{ChiRef, ChiSnapshot, NormalizedChi};
