use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Final disposition of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    VerificationTimedOut,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::VerificationTimedOut => "verification_timed_out",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Types of events recorded during a run. None of them carry secret values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        plan_id: PlanId,
        steps: usize,
    },
    RunFinished {
        outcome: RunOutcome,
        duration_ms: u64,
    },
    RunCancelled {
        reason: String,
    },

    // Step lifecycle events
    StepReady {
        step_id: StepId,
    },
    StepStarted {
        step_id: StepId,
        attempt: u32,
    },
    StepSucceeded {
        step_id: StepId,
        attempt: u32,
        duration_ms: u64,
        output: Option<String>,
    },
    /// Satisfied by an earlier success with the same idempotency key
    StepReused {
        step_id: StepId,
        idempotency_key: String,
        satisfied_by: StepId,
    },
    StepFailed {
        step_id: StepId,
        kind: ErrorKind,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    StepRetryScheduled {
        step_id: StepId,
        delay_ms: u64,
        next_attempt: u32,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },

    // Verification events
    VerificationStarted {
        target: String,
    },
    VerificationPassed {
        attempts: u32,
        elapsed_ms: u64,
    },
    VerificationTimedOut {
        attempts: u32,
        elapsed_ms: u64,
        last_observation: String,
    },

    // Rollback events
    RollbackStarted {
        plan_id: PlanId,
    },
    StepRolledBack {
        step_id: StepId,
    },
    RollbackUnsupported {
        step_id: StepId,
    },
    RollbackFailed {
        step_id: StepId,
        error: String,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Persist anything buffered for a run
    async fn flush_run(&self, _run_id: RunId) -> anyhow::Result<()> {
        Ok(())
    }
}
