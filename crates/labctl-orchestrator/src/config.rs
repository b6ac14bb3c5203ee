//! Service configuration.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, `LABCTL_CONFIG`, or `./labctl.toml` if present)
//! 3. `LABCTL_*` environment variables

use labctl_core::config::{self as limits, env_vars};
use labctl_core::{Error, Result, TopicScheme};
use labctl_devices::HeartbeatConfig;
use labctl_locks::LockManagerConfig;
use labctl_plugins::{DeadLetterConfig, RouterConfig};
use labctl_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "labctl.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub topics: TopicsConfig,
    /// Broker settings. Without them the service needs an injected bus.
    pub mqtt: Option<MqttConfig>,
    pub devices: HeartbeatConfig,
    pub locks: LocksConfig,
    pub router: RouterConfig,
    pub scheduler: SchedulerConfig,
    pub dedup: DedupConfig,
    pub dead_letter: DeadLetterConfig,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub root: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            root: labctl_core::config::DEFAULT_TOPIC_ROOT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            reconnect_interval_ms: 5000,
        }
    }
}

#[cfg(feature = "mqtt")]
impl MqttConfig {
    pub fn to_bus_config(&self) -> labctl_bus::MqttBusConfig {
        let mut config = labctl_bus::MqttBusConfig::new(&self.host).with_port(self.port);
        config.client_id = self.client_id.clone();
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.keep_alive = self.keep_alive_secs;
        config.reconnect_interval_ms = self.reconnect_interval_ms;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub sweep_interval_secs: u64,
    /// Applied when a module acquires without a TTL. Absent means no expiry.
    pub default_ttl_secs: Option<u64>,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: labctl_core::config::locks::DEFAULT_SWEEP_INTERVAL_SECS,
            default_ttl_secs: None,
        }
    }
}

impl LocksConfig {
    pub fn to_manager_config(&self) -> LockManagerConfig {
        LockManagerConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            default_ttl: self.default_ttl_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Register the built-in device tracker module.
    pub enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl OrchestratorConfig {
    /// Resolve the config file, read it, apply the environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(path) {
            Some(path) => {
                info!(category = "config", path = %path.display(), "Loading config file");
                Self::from_file(&path)?
            }
            None => {
                info!(category = "config", "No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(env_vars::CONFIG_PATH) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {e}")))
    }

    /// Overlay `LABCTL_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables from `lookup`. Unparseable values are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(env_vars::TOPIC_ROOT) {
            self.topics.root = root;
        }

        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.get_or_insert_with(MqttConfig::default).host = host;
        }
        if let Some(port) = parse_var(&lookup, env_vars::MQTT_PORT) {
            self.mqtt.get_or_insert_with(MqttConfig::default).port = port;
        }
        if let Some(mqtt) = self.mqtt.as_mut() {
            if let Some(client_id) = lookup(env_vars::MQTT_CLIENT_ID) {
                mqtt.client_id = Some(client_id);
            }
            if let Some(username) = lookup(env_vars::MQTT_USERNAME) {
                mqtt.username = Some(username);
            }
            if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
                mqtt.password = Some(password);
            }
        }

        if let Some(secs) = parse_var(&lookup, env_vars::SILENCE_TIMEOUT_SECS) {
            self.devices.silence_timeout_secs = secs;
        }
        if let Some(n) = parse_var(&lookup, env_vars::MAX_CONCURRENT_HANDLERS) {
            self.router.max_concurrent_handlers = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        TopicScheme::new(&self.topics.root)?;
        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.trim().is_empty() {
                return Err(Error::config("mqtt.host must not be empty"));
            }
            if mqtt.port == 0 {
                return Err(Error::config("mqtt.port must not be 0"));
            }
        }
        if self.devices.sweep_interval_secs == 0 {
            return Err(Error::config("devices.sweep_interval_secs must be positive"));
        }
        if self.devices.silence_timeout_secs > limits::devices::MAX_SILENCE_TIMEOUT_SECS {
            return Err(Error::config(format!(
                "devices.silence_timeout_secs must be at most {}",
                limits::devices::MAX_SILENCE_TIMEOUT_SECS
            )));
        }
        if self.dead_letter.retention_hours > limits::retention::MAX_DEAD_LETTER_HOURS {
            return Err(Error::config(format!(
                "dead_letter.retention_hours must be at most {}",
                limits::retention::MAX_DEAD_LETTER_HOURS
            )));
        }
        if self.locks.sweep_interval_secs == 0 {
            return Err(Error::config("locks.sweep_interval_secs must be positive"));
        }
        if self.router.max_concurrent_handlers == 0 {
            return Err(Error::config("router.max_concurrent_handlers must be positive"));
        }
        if self.scheduler.tick_interval_ms == 0 || self.scheduler.max_concurrent == 0 {
            return Err(Error::config(
                "scheduler.tick_interval_ms and scheduler.max_concurrent must be positive",
            ));
        }
        if self.dedup.enabled && (self.dedup.ttl_secs == 0 || self.dedup.max_size == 0) {
            return Err(Error::config("dedup.ttl_secs and dedup.max_size must be positive"));
        }
        if self.dedup.ttl_secs > limits::retention::MAX_DEDUP_TTL_SECS {
            return Err(Error::config(format!(
                "dedup.ttl_secs must be at most {}",
                limits::retention::MAX_DEDUP_TTL_SECS
            )));
        }
        Ok(())
    }

    pub fn topic_scheme(&self) -> Result<TopicScheme> {
        TopicScheme::new(&self.topics.root)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(category = "config", key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_parse_toml_config() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
[topics]
root = "/bench/"

[mqtt]
host = "broker.local"
port = 8883

[devices]
silence_timeout_secs = 120

[router]
max_concurrent_handlers = 4
handler_timeout_secs = 0

[dedup]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.topic_scheme().unwrap().root(), "bench");
        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!((mqtt.host.as_str(), mqtt.port), ("broker.local", 8883));
        assert_eq!(config.devices.silence_timeout_secs, 120);
        assert_eq!(config.devices.sweep_interval_secs, 30);
        assert_eq!(config.router.handler_timeout(), None);
        assert!(!config.dedup.enabled);
        assert!(config.tracker.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::TOPIC_ROOT, "site2"),
            (env_vars::MQTT_HOST, "10.0.0.5"),
            (env_vars::MQTT_PORT, "not-a-port"),
            (env_vars::SILENCE_TIMEOUT_SECS, "45"),
            (env_vars::MAX_CONCURRENT_HANDLERS, "8"),
        ]
        .into_iter()
        .collect();

        let mut config = OrchestratorConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.topics.root, "site2");
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.host, "10.0.0.5");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(config.devices.silence_timeout_secs, 45);
        assert_eq!(config.router.max_concurrent_handlers, 8);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.topics.root = "lab/#".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = OrchestratorConfig::default();
        config.router.max_concurrent_handlers = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = OrchestratorConfig::default();
        config.locks.sweep_interval_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_bounds_durations() {
        let mut config = OrchestratorConfig::default();
        config.devices.silence_timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = OrchestratorConfig::default();
        config.dead_letter.retention_hours = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = OrchestratorConfig::default();
        config.dedup.ttl_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // An oversized value from the environment is caught the same way.
        let mut config = OrchestratorConfig::default();
        config.apply_env_from(|key| {
            (key == "LABCTL_SILENCE_TIMEOUT_SECS").then(|| "18446744073709551615".to_string())
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\ntick_interval_ms = 250").unwrap();
        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.scheduler.max_concurrent, 10);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            OrchestratorConfig::from_file(&missing),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("[router\nmax = 1"),
            Err(Error::Config(_))
        ));
    }
}
