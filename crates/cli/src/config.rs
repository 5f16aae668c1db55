use anyhow::{Context, Result};
use runway_core::secrets::{EnvSecretSource, FileSecretSource, SecretBroker};
use runway_core::storage::{JsonlEventLog, RedbStateStore};
use runway_core::verifier::VerifierConfig;
use runway_core::workflow::{Orchestrator, OrchestratorConfig, StepExecutorConfig};
use runway_core::AdapterRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwayConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub verifier: VerifierSettings,

    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Lifetime of a run's claim on a plan between renewals
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_lease_ttl_ms() -> u64 {
    60_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: true,
            default_timeout_ms: default_timeout_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    /// Optional TOML file of `name = "value"` pairs
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_env_prefix() -> String {
    "RUNWAY_SECRET_".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_budget_ms() -> u64 {
    300_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            budget_ms: default_budget_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Action kind -> built-in adapter it runs on
    #[serde(default)]
    pub kinds: BTreeMap<String, String>,
}

impl RunwayConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::debug!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the state database path
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.executor.max_concurrency,
            executor: StepExecutorConfig {
                backoff_cap: Duration::from_millis(self.executor.backoff_cap_ms),
                jitter: self.executor.jitter,
                default_timeout: Duration::from_millis(self.executor.default_timeout_ms),
            },
            verifier: VerifierConfig {
                interval: Duration::from_millis(self.verifier.interval_ms),
                budget: Duration::from_millis(self.verifier.budget_ms),
                request_timeout: Duration::from_millis(self.verifier.request_timeout_ms),
            },
            lease_ttl: Duration::from_millis(self.executor.lease_ttl_ms),
        }
    }

    /// Built-in adapters plus the configured kind aliases
    pub fn registry(&self) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::with_builtins();
        for (kind, target) in &self.registry.kinds {
            registry
                .alias(kind.clone(), target)
                .with_context(|| format!("Invalid [registry.kinds] entry '{}'", kind))?;
        }
        Ok(registry)
    }

    pub fn secret_broker(&self) -> SecretBroker {
        let mut broker = SecretBroker::new().with_source(Arc::new(EnvSecretSource::new(
            self.secrets.env_prefix.clone(),
        )));
        if let Some(file) = &self.secrets.file {
            broker = broker.with_source(Arc::new(FileSecretSource::new(file)));
        }
        broker
    }
}

/// Opened stores and the orchestrator built over them
pub struct AppState {
    pub state: Arc<RedbStateStore>,
    pub event_log: Arc<JsonlEventLog>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(config: &RunwayConfig) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        let state = Arc::new(
            RedbStateStore::new(config.state_path()).context("Failed to open state store")?,
        );

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let orchestrator = Orchestrator::new(
            Arc::new(config.registry()?),
            state.clone(),
            config.secret_broker(),
            event_log.clone(),
            config.orchestrator_config(),
        );

        Ok(Self {
            state,
            event_log,
            orchestrator,
        })
    }
}
