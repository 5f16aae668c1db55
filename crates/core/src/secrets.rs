//! Execution-time credential resolution.
//!
//! Secrets are looked up by logical name when a step attempt starts and live
//! only in the [`SecretSet`] handed to that attempt. Nothing here caches a
//! value, so a rotated credential is picked up by the next attempt.

use crate::error::SecretUnavailable;
use base64::Engine;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const REDACTED: &str = "[REDACTED]";

/// A resolved credential. Prints as `SecretValue([REDACTED])` and has no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext. Callers must not log or persist the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue({})", REDACTED)
    }
}

/// A backing store the broker can consult
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    /// Short name used in error messages
    fn name(&self) -> &str;

    /// `Ok(None)` when this source does not know the secret
    async fn lookup(&self, name: &str) -> Result<Option<SecretValue>, SecretUnavailable>;
}

/// Reads `<prefix><NAME>` from the process environment, where `NAME` is the
/// logical name upper-cased with `-` and `.` replaced by `_`
pub struct EnvSecretSource {
    prefix: String,
}

impl EnvSecretSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new("RUNWAY_SECRET_")
    }
}

#[async_trait::async_trait]
impl SecretSource for EnvSecretSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SecretValue>, SecretUnavailable> {
        match std::env::var(self.variable_name(name)) {
            Ok(value) => Ok(Some(SecretValue::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretUnavailable {
                name: name.to_string(),
                reason: "environment value is not valid UTF-8".to_string(),
                retryable: false,
            }),
        }
    }
}

/// Flat TOML table of `name = "value"` pairs, re-read on every lookup.
/// Values prefixed with `base64:` are decoded.
pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn unavailable(&self, name: &str, reason: String, retryable: bool) -> SecretUnavailable {
        SecretUnavailable {
            name: name.to_string(),
            reason: format!("{} ({})", reason, self.path.display()),
            retryable,
        }
    }
}

#[async_trait::async_trait]
impl SecretSource for FileSecretSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SecretValue>, SecretUnavailable> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(self.unavailable(name, format!("cannot read secrets file: {}", e), true))
            }
        };

        // Parse errors would echo file content, so only the position is kept
        let table: HashMap<String, String> = toml::from_str(&content).map_err(|e| {
            let at = e
                .span()
                .map(|span| format!(" at byte {}", span.start))
                .unwrap_or_default();
            self.unavailable(name, format!("secrets file is malformed{}", at), false)
        })?;

        let Some(raw) = table.get(name) else {
            return Ok(None);
        };

        match raw.strip_prefix("base64:") {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| self.unavailable(name, "invalid base64 value".to_string(), false))?;
                let value = String::from_utf8(bytes).map_err(|_| {
                    self.unavailable(name, "decoded value is not UTF-8".to_string(), false)
                })?;
                Ok(Some(SecretValue::new(value)))
            }
            None => Ok(Some(SecretValue::new(raw.clone()))),
        }
    }
}

/// Fixed in-memory values
#[derive(Default)]
pub struct StaticSecretSource {
    values: HashMap<String, SecretValue>,
}

impl StaticSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), SecretValue::new(value));
        self
    }
}

#[async_trait::async_trait]
impl SecretSource for StaticSecretSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SecretValue>, SecretUnavailable> {
        Ok(self.values.get(name).cloned())
    }
}

/// Resolves logical secret names against an ordered list of sources
#[derive(Clone, Default)]
pub struct SecretBroker {
    sources: Vec<Arc<dyn SecretSource>>,
}

impl SecretBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn SecretSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// First source that knows `name` wins. A source error stops the search.
    pub async fn resolve(&self, name: &str) -> Result<SecretValue, SecretUnavailable> {
        for source in &self.sources {
            if let Some(value) = source.lookup(name).await? {
                tracing::debug!("Resolved secret '{}' from {} source", name, source.name());
                return Ok(value);
            }
        }

        let searched = self
            .sources
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ");
        Err(SecretUnavailable {
            name: name.to_string(),
            reason: if searched.is_empty() {
                "no secret sources configured".to_string()
            } else {
                format!("not found in any source ({})", searched)
            },
            retryable: false,
        })
    }

    /// Resolve every name a step declares, failing on the first missing one
    pub async fn resolve_all(&self, names: &[String]) -> Result<SecretSet, SecretUnavailable> {
        let mut set = SecretSet::default();
        for name in names {
            let value = self.resolve(name).await?;
            set.values.push((name.clone(), value));
        }
        Ok(set)
    }
}

/// Secrets resolved for one step attempt
#[derive(Clone, Default)]
pub struct SecretSet {
    values: Vec<(String, SecretValue)>,
}

impl SecretSet {
    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every occurrence of a resolved value in `text` with `[REDACTED]`
    pub fn redact(&self, text: &str) -> String {
        let mut secrets: Vec<&str> = self
            .values
            .iter()
            .map(|(_, v)| v.expose())
            .filter(|v| !v.is_empty())
            .collect();
        // Longest first so a value containing another is masked whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut masked = text.to_string();
        for secret in secrets {
            masked = masked.replace(secret, REDACTED);
        }
        masked
    }
}

impl std::fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.values.iter().map(|(name, _)| name))
            .finish()
    }
}
