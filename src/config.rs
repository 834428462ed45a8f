use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::phone::NumberingPlan;

/// Which driver talks to the messaging network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Native multi-device protocol over a WebSocket endpoint.
    #[default]
    Native,
    /// Browser-automation bridge spawned as a child process.
    Browser,
}

/// Reconnection backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    #[serde(with = "duration_ms")]
    pub base: Duration,
    /// Multiplier applied per additional attempt.
    pub factor: u32,
    /// Upper bound for a single backoff delay.
    #[serde(with = "duration_ms")]
    pub cap: Duration,
    /// Consecutive failures before the long cooldown kicks in.
    pub max_attempts: u32,
    /// Pause after `max_attempts` failures, before the counter restarts at zero.
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 8,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration for the connector: transport selection, persistence, timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Stable identifier of the session; part of every persisted key.
    pub session_name: String,
    /// Driver used to reach the network.
    pub transport: TransportKind,
    /// Endpoint of the native protocol gateway.
    pub network_endpoint: String,
    /// Executable of the browser-automation bridge.
    pub bridge_command: String,
    /// Arguments passed to the bridge executable.
    pub bridge_args: Vec<String>,
    /// Path of the durable key/value file backing credentials and caches.
    pub store_path: String,
    /// Namespace prefix of every persisted key.
    pub key_prefix: String,
    /// Secret used to seal credential material at rest, if any.
    pub encryption_secret: Option<String>,
    /// TTL refreshed on credential and key material whenever they are touched.
    #[serde(with = "duration_secs")]
    pub credential_ttl: Duration,
    /// Lifetime of a QR artifact.
    #[serde(with = "duration_ms")]
    pub qr_window: Duration,
    pub backoff: BackoffConfig,
    /// Interval of the liveness probe while ready.
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Upper bound of a single transport send (and lookup/repair) call.
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Interval of the periodic credential/status backup.
    #[serde(with = "duration_ms")]
    pub backup_interval: Duration,
    /// Backoff retries of a rate limited candidate before giving up.
    pub rate_limit_retries: u32,
    /// How long a candidate stays blocked after exhausting rate limit retries.
    #[serde(with = "duration_ms")]
    pub rate_limit_cooldown: Duration,
    /// Check that a candidate is registered before sending (best effort).
    pub verify_registration: bool,
    /// Ask the transport for the registered id of the canonical number.
    pub resolve_canonical_id: bool,
    pub numbering_plan: NumberingPlan,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            session_name: "default".into(),
            transport: TransportKind::Native,
            network_endpoint: "ws://127.0.0.1:8085/ws".into(),
            bridge_command: "wa-bridge".into(),
            bridge_args: Vec::new(),
            store_path: "./data/wa-connector.json".into(),
            key_prefix: "wa".into(),
            encryption_secret: None,
            credential_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            qr_window: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            backup_interval: Duration::from_secs(5 * 60),
            rate_limit_retries: 2,
            rate_limit_cooldown: Duration::from_secs(60),
            verify_registration: true,
            resolve_canonical_id: true,
            numbering_plan: NumberingPlan::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConnectorConfig {
    /// Load configuration from a JSON file; missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Override the session name.
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    /// Select the transport driver.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Override the native protocol endpoint.
    pub fn with_network_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.network_endpoint = endpoint.into();
        self
    }

    /// Override the bridge executable and its arguments.
    pub fn with_bridge_command(
        mut self,
        command: impl Into<String>,
        args: impl IntoIterator<Item = String>,
    ) -> Self {
        self.bridge_command = command.into();
        self.bridge_args = args.into_iter().collect();
        self
    }

    /// Override the key/value file path.
    pub fn with_store_path(mut self, path: impl Into<String>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Seal stored credentials with a key derived from `secret`.
    pub fn with_encryption_secret(mut self, secret: impl Into<String>) -> Self {
        self.encryption_secret = Some(secret.into());
        self
    }

    /// Override the reconnection backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the QR artifact lifetime.
    pub fn with_qr_window(mut self, window: Duration) -> Self {
        self.qr_window = window;
        self
    }

    /// Override the health check interval and probe timeout.
    pub fn with_health_check(mut self, interval: Duration, probe_timeout: Duration) -> Self {
        self.health_interval = interval;
        self.probe_timeout = probe_timeout;
        self
    }

    /// Override the per-attempt send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Override the numbering plan used to canonicalize phone numbers.
    pub fn with_numbering_plan(mut self, plan: NumberingPlan) -> Self {
        self.numbering_plan = plan;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: ConnectorConfig =
            serde_json::from_str(r#"{"session_name":"ops","transport":"browser","qr_window":30000}"#)
                .unwrap();
        assert_eq!(config.session_name, "ops");
        assert_eq!(config.transport, TransportKind::Browser);
        assert_eq!(config.qr_window, Duration::from_secs(30));
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConnectorConfig::default()
            .with_session_name("erp")
            .with_encryption_secret("s3cret")
            .with_bridge_command("node", vec!["bridge.js".to_string()]);
        assert_eq!(config.session_name, "erp");
        assert_eq!(config.encryption_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.bridge_args, vec!["bridge.js"]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ConnectorConfig::default().with_session_name("from-disk");
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        assert_eq!(ConnectorConfig::from_file(&path).unwrap(), config);
    }
}
