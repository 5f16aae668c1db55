use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a plan
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Stable identity of a compiled plan (hex SHA-256 of its context and steps)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex characters, for tables and log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a step's execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Whether the controller considers this status settled for the current run.
    /// Failed is only settled once the executor gives up retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Allowed edges of the execution record state machine.
    ///
    /// Forward progress is monotonic except for the retry edge (Failed -> Running)
    /// and resets back to Pending, which are used when resuming a run and after a
    /// successful rollback.
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        use StepStatus::*;
        match (self, to) {
            (Pending, Ready) | (Pending, Skipped) => true,
            (Ready, Running) | (Ready, Succeeded) | (Ready, Skipped) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (Failed, Running) => true,
            (from, Pending) => from != Pending,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_base_ms() -> u64 {
    1000
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

/// Environment values resolved into a plan at compile time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<String>,
    /// Any additional key/value pairs
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl GlobalContext {
    /// Look up a context value by its manifest key
    pub fn get(&self, key: &str) -> Option<&str> {
        let known = match key {
            "region" => &self.region,
            "environment" => &self.environment,
            "resource_group" => &self.resource_group,
            "registry" => &self.registry,
            "node_affinity" => &self.node_affinity,
            "domain_suffix" => &self.domain_suffix,
            other => return self.extra.get(other).map(String::as_str),
        };
        known.as_deref()
    }

    /// All defined values, keyed by manifest key, in sorted order
    pub fn entries(&self) -> BTreeMap<String, String> {
        let mut entries = self.extra.clone();
        let known = [
            ("region", &self.region),
            ("environment", &self.environment),
            ("resource_group", &self.resource_group),
            ("registry", &self.registry),
            ("node_affinity", &self.node_affinity),
            ("domain_suffix", &self.domain_suffix),
        ];
        for (key, value) in known {
            if let Some(value) = value {
                entries.insert(key.to_string(), value.clone());
            }
        }
        entries
    }

    /// Overlay every value that is set in `other` on top of this context
    pub fn merge(&mut self, other: GlobalContext) {
        let GlobalContext {
            region,
            environment,
            resource_group,
            registry,
            node_affinity,
            domain_suffix,
            extra,
        } = other;
        if region.is_some() {
            self.region = region;
        }
        if environment.is_some() {
            self.environment = environment;
        }
        if resource_group.is_some() {
            self.resource_group = resource_group;
        }
        if registry.is_some() {
            self.registry = registry;
        }
        if node_affinity.is_some() {
            self.node_affinity = node_affinity;
        }
        if domain_suffix.is_some() {
            self.domain_suffix = domain_suffix;
        }
        self.extra.extend(extra);
    }
}

/// Classification of a recorded step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Timeout,
    SecretUnavailable,
    DependencyFailed,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SecretUnavailable => "secret_unavailable",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic detail attached to an execution record. Never carries secret values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl FailureDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            at: Utc::now(),
        }
    }
}

/// Timestamped status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: StepStatus,
    pub to: StepStatus,
    pub at: DateTime<Utc>,
}

/// Execution state of one step of one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub idempotency_key: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<StatusChange>,
}

impl ExecutionRecord {
    pub fn pending(plan_id: PlanId, step_id: StepId, idempotency_key: String) -> Self {
        let now = Utc::now();
        Self {
            plan_id,
            step_id,
            idempotency_key,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }
}

/// Persisted summary of a registered plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: PlanId,
    /// Step ids in execution order
    pub steps: Vec<StepId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<RunId>,
    /// Claim of the run currently driving the plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<RunLease>,
}

/// Exclusive, expiring claim on a plan. A run renews it while it works, so a
/// lease past `expires_at` belongs to a run that stopped without releasing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub run_id: RunId,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
