pub mod context;
pub mod contract;
pub mod failure;
pub mod lockfile;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod recipe;
pub mod registry;
pub mod step;
pub mod steps;
pub mod transaction;
pub mod validation;

pub use context::{Context, ContextValue, RunReport, ServiceResult};
pub use contract::{Attribute, AttributeType, Contract, Rule};
pub use failure::{ContractViolation, DefinitionError, FailureReason, PipelineError};
pub use observability::MetricsCollector;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use policy::Guardian;
pub use recipe::Recipe;
pub use registry::{StepAction, StepRegistry};
pub use step::{StepDescriptor, StepHandle, StepKind};
pub use transaction::{NoopUnitOfWork, UnitOfWork};
