//! clusterwatch.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;

const DEFAULT_PERIODIC_INTERVAL_MAX: u64 = 60;
const DEFAULT_PERIODIC_INTERVAL: u64 = 60;
const DEFAULT_DISPATCH_TIMEOUT: u64 = 30;
const DEFAULT_LIFE_CHECK_TIMEOUT: u64 = 2;
const DEFAULT_DEAD_TIMEOUT: u64 = 180;
/// Longest accepted period or timeout, in seconds (30 days).
pub const MAX_PERIOD_SECS: u64 = 30 * 24 * 3600;
const DEFAULT_TOPIC: &str = "health-manager";
const DEFAULT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterwatchConfig {
    pub health_manager: Option<HealthManagerConfig>,
    pub engine: Option<EngineConfig>,
    pub registrations: Option<Vec<RegistrationConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthManagerConfig {
    /// Upper bound (seconds) on any polling interval.
    pub periodic_interval_max: Option<u64>,
    /// Period (seconds) of the engine heartbeat timer.
    pub periodic_interval: Option<u64>,
    /// Bound (seconds) on a single recovery dispatch.
    pub dispatch_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds a notification call may go unanswered.
    pub engine_life_check_timeout: Option<u64>,
    /// Seconds without a heartbeat before an engine counts as dead.
    pub engine_dead_timeout: Option<u64>,
    pub topic: Option<String>,
    pub version: Option<String>,
}

/// A cluster to register when the daemon boots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub cluster_id: String,
    pub check_type: String,
    pub interval: Option<u64>,
    pub params: Option<HashMap<String, toml::Value>>,
}

/// Fully resolved settings consumed by the health manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub periodic_interval_max: Duration,
    pub periodic_interval: Duration,
    pub dispatch_timeout: Duration,
    pub engine_life_check_timeout: Duration,
    pub engine_dead_timeout: Duration,
    pub topic: String,
    pub version: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        ClusterwatchConfig::default().settings()
    }
}

impl ClusterwatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterwatchConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config with every default spelled out.
    pub fn scaffold() -> Self {
        ClusterwatchConfig {
            health_manager: Some(HealthManagerConfig {
                periodic_interval_max: Some(DEFAULT_PERIODIC_INTERVAL_MAX),
                periodic_interval: Some(DEFAULT_PERIODIC_INTERVAL),
                dispatch_timeout: Some(DEFAULT_DISPATCH_TIMEOUT),
            }),
            engine: Some(EngineConfig {
                engine_life_check_timeout: Some(DEFAULT_LIFE_CHECK_TIMEOUT),
                engine_dead_timeout: Some(DEFAULT_DEAD_TIMEOUT),
                topic: Some(DEFAULT_TOPIC.to_string()),
                version: Some(DEFAULT_VERSION.to_string()),
            }),
            registrations: None,
        }
    }

    /// Reject values the health manager cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = self.settings();
        for (name, value) in [
            ("periodic_interval_max", s.periodic_interval_max),
            ("periodic_interval", s.periodic_interval),
            ("dispatch_timeout", s.dispatch_timeout),
            ("engine_life_check_timeout", s.engine_life_check_timeout),
            ("engine_dead_timeout", s.engine_dead_timeout),
        ] {
            if value.is_zero() {
                bail!("{name} must be positive");
            }
            if value.as_secs() > MAX_PERIOD_SECS {
                bail!("{name} must be at most {MAX_PERIOD_SECS}s");
            }
        }
        // A live engine must refresh its record before it can be declared dead.
        if s.engine_dead_timeout <= s.periodic_interval {
            bail!(
                "engine_dead_timeout ({}s) must exceed periodic_interval ({}s)",
                s.engine_dead_timeout.as_secs(),
                s.periodic_interval.as_secs()
            );
        }
        for reg in self.registrations.iter().flatten() {
            if reg.cluster_id.trim().is_empty() {
                bail!("registration with empty cluster_id");
            }
            if reg.interval.is_some_and(|secs| secs > MAX_PERIOD_SECS) {
                bail!("registration {}: interval must be at most {MAX_PERIOD_SECS}s", reg.cluster_id);
            }
        }
        Ok(())
    }

    /// Resolve optional fields into concrete settings.
    pub fn settings(&self) -> HealthSettings {
        let hm = self.health_manager.clone().unwrap_or_default();
        let engine = self.engine.clone().unwrap_or_default();
        HealthSettings {
            periodic_interval_max: Duration::from_secs(
                hm.periodic_interval_max.unwrap_or(DEFAULT_PERIODIC_INTERVAL_MAX),
            ),
            periodic_interval: Duration::from_secs(
                hm.periodic_interval.unwrap_or(DEFAULT_PERIODIC_INTERVAL),
            ),
            dispatch_timeout: Duration::from_secs(
                hm.dispatch_timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT),
            ),
            engine_life_check_timeout: Duration::from_secs(
                engine
                    .engine_life_check_timeout
                    .unwrap_or(DEFAULT_LIFE_CHECK_TIMEOUT),
            ),
            engine_dead_timeout: Duration::from_secs(
                engine.engine_dead_timeout.unwrap_or(DEFAULT_DEAD_TIMEOUT),
            ),
            topic: engine.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            version: engine.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        }
    }
}

impl RegistrationConfig {
    /// Params as a JSON object, the representation stored in the registry.
    pub fn params_json(&self) -> anyhow::Result<serde_json::Value> {
        match &self.params {
            Some(params) => Ok(serde_json::to_value(params)?),
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = ClusterwatchConfig::scaffold();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("periodic_interval_max = 60"));
        assert!(toml_str.contains("health-manager"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ClusterwatchConfig = toml::from_str("").unwrap();
        let s = config.settings();
        assert_eq!(s.periodic_interval_max, Duration::from_secs(60));
        assert_eq!(s.engine_life_check_timeout, Duration::from_secs(2));
        assert_eq!(s.topic, "health-manager");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_registrations() {
        let toml_str = r#"
[health_manager]
periodic_interval_max = 30

[[registrations]]
cluster_id = "c1"
check_type = "NODE_STATUS_POLLING"
interval = 10

[registrations.params]
node_update_timeout = 300
"#;
        let config: ClusterwatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.settings().periodic_interval_max, Duration::from_secs(30));

        let regs = config.registrations.as_ref().unwrap();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].interval, Some(10));
        let params = regs[0].params_json().unwrap();
        assert_eq!(params["node_update_timeout"], 300);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let toml_str = r#"
[engine]
engine_life_check_timeout = 0
"#;
        let config: ClusterwatchConfig = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine_life_check_timeout"));
    }

    #[test]
    fn test_validate_dead_timeout_exceeds_heartbeat() {
        let toml_str = r#"
[health_manager]
periodic_interval = 60

[engine]
engine_dead_timeout = 60
"#;
        let config: ClusterwatchConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_periods() {
        let toml_str = format!(
            r#"
[health_manager]
periodic_interval_max = {}
"#,
            i64::MAX
        );
        let config: ClusterwatchConfig = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());

        let toml_str = format!(
            r#"
[health_manager]
periodic_interval_max = {MAX_PERIOD_SECS}
periodic_interval = 60
"#
        );
        let config: ClusterwatchConfig = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_ok());
    }
}
