//! Post-deployment health verification.

use crate::manifest::HealthSignal;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthObservation {
    pub ready: bool,
    pub detail: String,
}

impl HealthObservation {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self {
            ready: true,
            detail: detail.into(),
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            ready: false,
            detail: detail.into(),
        }
    }
}

/// Something that can be asked whether the deployment is healthy
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// Human-readable description of what is probed
    fn target(&self) -> String;

    async fn probe(&self) -> HealthObservation;
}

/// Probes an HTTP endpoint and checks status code and JSON body shape
pub struct HttpHealthProbe {
    client: reqwest::Client,
    endpoint: url::Url,
    expect_status: u16,
    expect: Option<Value>,
}

impl HttpHealthProbe {
    pub fn new(signal: &HealthSignal, request_timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(&signal.endpoint)
            .with_context(|| format!("Invalid health endpoint '{}'", signal.endpoint))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            expect_status: signal.expect_status,
            expect: signal.expect.clone(),
        })
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    fn target(&self) -> String {
        self.endpoint.to_string()
    }

    async fn probe(&self) -> HealthObservation {
        let response = match self.client.get(self.endpoint.clone()).send().await {
            Ok(response) => response,
            Err(e) => return HealthObservation::not_ready(format!("request failed: {}", e)),
        };

        let status = response.status().as_u16();
        if status != self.expect_status {
            return HealthObservation::not_ready(format!(
                "status {} (expected {})",
                status, self.expect_status
            ));
        }

        let Some(expected) = &self.expect else {
            return HealthObservation::ready(format!("status {}", status));
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return HealthObservation::not_ready(format!("response body is not JSON: {}", e))
            }
        };

        if json_contains(&body, expected) {
            HealthObservation::ready(format!("status {}, body matches", status))
        } else {
            let mut shown = body.to_string();
            if shown.len() > 200 {
                let mut cut = 200;
                while !shown.is_char_boundary(cut) {
                    cut -= 1;
                }
                shown.truncate(cut);
                shown.push_str("...");
            }
            HealthObservation::not_ready(format!("body does not match expected shape: {}", shown))
        }
    }
}

/// Structural containment: objects by key subset, arrays by element
/// containment, everything else by equality
pub fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(key, value)| actual.get(key).is_some_and(|a| json_contains(a, value))),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|e| actual.iter().any(|a| json_contains(a, e))),
        (actual, expected) => actual == expected,
    }
}

/// Polling defaults, overridable per health signal
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub interval: Duration,
    pub budget: Duration,
    pub request_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            budget: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The health signal never became ready within the budget
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verification timed out after {}ms and {attempts} probes; last observation: {last_observation}", .elapsed.as_millis())]
pub struct VerificationTimeout {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_observation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error(transparent)]
    Timeout(#[from] VerificationTimeout),

    #[error("verification cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSuccess {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Polls a probe on a fixed interval until ready or out of budget
pub struct Verifier {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    budget: Duration,
}

impl Verifier {
    pub fn new(probe: Arc<dyn HealthProbe>, interval: Duration, budget: Duration) -> Self {
        Self {
            probe,
            interval,
            budget,
        }
    }

    /// Verifier for a declared health signal, taking interval and budget from
    /// the signal when it sets them
    pub fn for_signal(signal: &HealthSignal, config: &VerifierConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(signal, config.request_timeout)?;
        Ok(Self::new(
            Arc::new(probe),
            signal
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(config.interval),
            signal
                .budget_ms
                .map(Duration::from_millis)
                .unwrap_or(config.budget),
        ))
    }

    pub fn target(&self) -> String {
        self.probe.target()
    }

    pub async fn verify(
        &self,
        cancel: &CancellationToken,
    ) -> Result<VerificationSuccess, VerificationError> {
        let start = Instant::now();
        let deadline = start + self.budget;
        let mut attempts = 0;

        tracing::info!(
            "Verifying {} (interval {:?}, budget {:?})",
            self.probe.target(),
            self.interval,
            self.budget
        );

        loop {
            attempts += 1;
            let observation = tokio::select! {
                observation = self.probe.probe() => observation,
                _ = cancel.cancelled() => return Err(VerificationError::Cancelled),
            };

            if observation.ready {
                tracing::info!("Health check passed after {} probes", attempts);
                return Ok(VerificationSuccess {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }

            tracing::debug!("Health probe {} not ready: {}", attempts, observation.detail);

            let now = Instant::now();
            if now >= deadline {
                return Err(VerificationTimeout {
                    attempts,
                    elapsed: now - start,
                    last_observation: observation.detail,
                }
                .into());
            }

            let wait = self.interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(VerificationError::Cancelled),
            }
        }
    }
}
