//! TOML configuration for connections and monitors.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! poll_interval_ms = 100
//! processes = ["^qt_chooser.*$"]
//!
//! [binding]
//! namespace = "ROOT\\CIMV2"
//! enumeration_policy = "skip-invalid"
//!
//! [[services]]
//! name = "Spooler"
//! label = "Print spooler"
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::enumerate::EnumerationPolicy;
use crate::errors::WbemError;

pub const DEFAULT_NAMESPACE: &str = "ROOT\\CIMV2";
pub const DEFAULT_CLASS_PREFIX: &str = "Win32_";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_PROCESS_PATTERN: &str = "^qt_chooser.*$";

/// How to reach the subsystem and how to enumerate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    pub namespace: String,
    /// Prepended to logical entity names (`service` -> `Win32_Service`).
    pub class_prefix: String,
    pub enumeration_policy: EnumerationPolicy,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            class_prefix: DEFAULT_CLASS_PREFIX.to_owned(),
            enumeration_policy: EnumerationPolicy::default(),
        }
    }
}

/// One service the service monitor follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedService {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Settings shared by the service and process monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub binding: BindingConfig,
    pub poll_interval_ms: u64,
    /// A monitor whose heartbeat is older than this is reported stalled.
    pub stall_after_ms: u64,
    /// Extra attempts for a poll that failed with a transient status.
    pub transient_retries: u32,
    pub services: Vec<WatchedService>,
    /// Process-name patterns; a matching process becomes watchable.
    pub processes: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            binding: BindingConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stall_after_ms: 5_000,
            transient_retries: 2,
            services: Vec::new(),
            processes: vec![DEFAULT_PROCESS_PATTERN.to_owned()],
        }
    }
}

impl MonitorConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, WbemError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WbemError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, WbemError> {
        let config: MonitorConfig =
            toml::from_str(text).map_err(|e| WbemError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WbemError> {
        if self.poll_interval_ms == 0 {
            return Err(WbemError::Config("poll_interval_ms must be > 0".to_owned()));
        }
        if self.binding.namespace.trim().is_empty() {
            return Err(WbemError::Config("namespace must not be empty".to_owned()));
        }
        if self.services.iter().any(|s| s.name.trim().is_empty()) {
            return Err(WbemError::Config("service name must not be empty".to_owned()));
        }
        self.process_patterns().map(|_| ())
    }

    /// Compiled process-name patterns.
    pub fn process_patterns(&self) -> Result<Vec<Regex>, WbemError> {
        self.processes
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| WbemError::Config(format!("bad pattern {p:?}: {e}")))
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_after(&self) -> Duration {
        Duration::from_millis(self.stall_after_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = MonitorConfig::from_toml_str("").unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.binding.namespace, "ROOT\\CIMV2");
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.processes, vec!["^qt_chooser.*$".to_owned()]);
    }

    #[test]
    fn test_full_document() {
        let config = MonitorConfig::from_toml_str(
            r#"
            poll_interval_ms = 250
            transient_retries = 0
            processes = ["^notepad\\.exe$"]

            [binding]
            namespace = "ROOT\\StandardCimv2"
            enumeration_policy = "skip-invalid"

            [[services]]
            name = "Spooler"
            label = "Print spooler"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.binding.enumeration_policy, EnumerationPolicy::SkipInvalid);
        assert_eq!(config.binding.class_prefix, "Win32_");
        assert_eq!(config.services[0].label.as_deref(), Some("Print spooler"));
        assert_eq!(config.process_patterns().unwrap().len(), 1);
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let err = MonitorConfig::from_toml_str("poll_interval_ms = 0").unwrap_err();
        assert!(err.to_string().starts_with("ConfigError"));
    }

    #[test]
    fn test_validation_rejects_bad_pattern() {
        assert!(MonitorConfig::from_toml_str(r#"processes = ["(unclosed"]"#).is_err());
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        let err = MonitorConfig::from_toml_str(
            "[binding]\nenumeration_policy = \"sometimes\"",
        )
        .unwrap_err();
        assert!(matches!(err, WbemError::Config(_)));
    }
}
