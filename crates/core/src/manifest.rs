use crate::types::{GlobalContext, RetryPolicy, StepId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Declarative description of a deployment: context, steps and health signal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub context: GlobalContext,
    #[serde(default)]
    pub health: Option<HealthSignal>,
    #[serde(default)]
    pub steps: Vec<StepDeclaration>,
}

/// A step as written in the manifest, before compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDeclaration {
    pub id: StepId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Logical names of the secrets this step consumes
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl StepDeclaration {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            kind: kind.into(),
            description: None,
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
            idempotency_key: None,
            retry: RetryPolicy::default(),
            timeout_ms: None,
            secrets: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on.extend(ids.iter().map(|id| StepId::new(*id)));
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff_base_ms: u64) -> Self {
        self.retry = RetryPolicy::new(max_attempts, backoff_base_ms);
        self
    }

    pub fn secret(mut self, name: impl Into<String>) -> Self {
        self.secrets.push(name.into());
        self
    }
}

/// Readiness probe consulted after every step has succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSignal {
    pub endpoint: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    /// JSON shape the response body must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<u64>,
}

fn default_expect_status() -> u16 {
    200
}

impl Manifest {
    /// Load a manifest from disk. Files ending in `.json` are parsed as JSON,
    /// everything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))
        } else {
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML manifest")
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid JSON manifest")
    }
}
