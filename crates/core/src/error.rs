//! Error taxonomy shared by the compiler, executor and controller.
//!
//! - [`ValidationError`]: plan-compile time, fatal, nothing runs.
//! - [`StepError`]: reported by adapters and the executor; its variant decides
//!   retry eligibility.
//! - [`SecretUnavailable`]: raised by the secret broker; names the secret, never
//!   its value.

use crate::storage::StateError;
use crate::types::{ErrorKind, StepId};
use std::time::Duration;
use thiserror::Error;

/// Plan validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(StepId),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<StepId> },

    #[error("step '{step}' uses unregistered action kind '{kind}'")]
    UnknownKind { step: StepId, kind: String },

    #[error("step '{step}' references undefined context value '${{{name}}}'")]
    UnresolvedPlaceholder { step: StepId, name: String },

    #[error("step '{step}' is invalid: {message}")]
    InvalidStep { step: StepId, message: String },
}

fn format_cycle(cycle: &[StepId]) -> String {
    cycle
        .iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A named secret could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("secret '{name}' unavailable: {reason}")]
pub struct SecretUnavailable {
    pub name: String,
    pub reason: String,
    /// Set when the backing store reported an outage rather than a missing value
    pub retryable: bool,
}

/// Failure reported for a single step attempt
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Network errors, throttling and other conditions worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad input, authorization failures and anything else that will not heal
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error(transparent)]
    Secret(#[from] SecretUnavailable),

    #[error("step timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether the executor may spend another attempt on this error
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Transient(_) | StepError::TimedOut(_) => true,
            StepError::Permanent(_) => false,
            StepError::Secret(err) => err.retryable,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Transient(_) => ErrorKind::Transient,
            StepError::Permanent(_) => ErrorKind::Permanent,
            StepError::Secret(_) => ErrorKind::SecretUnavailable,
            StepError::TimedOut(_) => ErrorKind::Timeout,
        }
    }

    /// Rewrite the free-text parts of the error through `mask`
    pub fn map_message(self, mask: impl Fn(&str) -> String) -> Self {
        match self {
            StepError::Transient(message) => StepError::Transient(mask(&message)),
            StepError::Permanent(message) => StepError::Permanent(mask(&message)),
            other => other,
        }
    }
}

/// Failure of an orchestration run as a whole
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    /// Pending steps remain but nothing is ready or running
    #[error("no progress possible; steps still pending: {}", format_cycle(.pending))]
    Deadlock { pending: Vec<StepId> },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
