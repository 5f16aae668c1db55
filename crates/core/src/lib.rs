// Core types and functionality for the Runway deployment orchestrator

pub mod adapters;
pub mod error;
pub mod events;
pub mod manifest;
pub mod registry;
pub mod secrets;
pub mod storage;
pub mod types;
pub mod verifier;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{OrchestratorError, SecretUnavailable, StepError, ValidationError};
pub use manifest::{HealthSignal, Manifest, StepDeclaration};
pub use registry::{AdapterRegistry, StepAdapter};
pub use types::*;
pub use workflow::{Orchestrator, OrchestratorConfig, Plan};
