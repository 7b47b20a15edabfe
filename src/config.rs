//! Database configuration
//!
//! Loaded from JSON, from `TILECC_*` environment variables, or `Default`.
//! Every constructor runs `validate` before handing the config out.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::mvcc::{EpochConfig, GcConfig};
use crate::types::ProtocolKind;
use crate::{CcError, Result};

pub const ENV_PROTOCOL: &str = "TILECC_PROTOCOL";
pub const ENV_EPOCH_INTERVAL_MS: &str = "TILECC_EPOCH_INTERVAL_MS";
pub const ENV_EPOCH_RING_CAPACITY: &str = "TILECC_EPOCH_RING_CAPACITY";
pub const ENV_GC_ENABLED: &str = "TILECC_GC_ENABLED";
pub const ENV_WAL_PATH: &str = "TILECC_WAL_PATH";

/// Configuration of one `Database`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcConfig {
    pub protocol: ProtocolKind,
    /// Epoch ticker period
    pub epoch_interval_ms: u64,
    pub epoch_ring_capacity: usize,
    pub gc_enabled: bool,
    /// Minimum time between two GC runs
    pub gc_interval_ms: u64,
    /// Queued slots needed before a GC run starts
    pub gc_min_pending: usize,
    /// Commit log file; no log when unset
    pub wal_path: Option<PathBuf>,
}

impl Default for CcConfig {
    fn default() -> Self {
        let epoch = EpochConfig::default();
        let gc = GcConfig::default();
        Self {
            protocol: ProtocolKind::Optimistic,
            epoch_interval_ms: epoch.interval.as_millis() as u64,
            epoch_ring_capacity: epoch.capacity,
            gc_enabled: gc.enabled,
            gc_interval_ms: gc.interval.as_millis() as u64,
            gc_min_pending: gc.min_pending,
            wal_path: None,
        }
    }
}

impl CcConfig {
    pub fn with_protocol(protocol: ProtocolKind) -> Self {
        Self { protocol, ..Self::default() }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| CcError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CcError::Serialization(e.to_string()))
    }

    /// Defaults overridden by any `TILECC_*` variable that is set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_PROTOCOL) {
            config.protocol = ProtocolKind::from_str(&value)?;
        }
        if let Some(value) = lookup(ENV_EPOCH_INTERVAL_MS) {
            config.epoch_interval_ms = parse_var(ENV_EPOCH_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_EPOCH_RING_CAPACITY) {
            config.epoch_ring_capacity = parse_var(ENV_EPOCH_RING_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_GC_ENABLED) {
            config.gc_enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(CcError::InvalidConfig(format!("{}: not a boolean: {}", ENV_GC_ENABLED, other)))
                }
            };
        }
        if let Some(value) = lookup(ENV_WAL_PATH) {
            config.wal_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epoch_interval_ms == 0 {
            return Err(CcError::InvalidConfig("epoch_interval_ms must be positive".into()));
        }
        if self.epoch_ring_capacity < 2 {
            return Err(CcError::InvalidConfig(format!(
                "epoch_ring_capacity must be at least 2, got {}",
                self.epoch_ring_capacity
            )));
        }
        if self.gc_min_pending == 0 {
            return Err(CcError::InvalidConfig("gc_min_pending must be positive".into()));
        }
        Ok(())
    }

    pub fn epoch_config(&self) -> EpochConfig {
        EpochConfig {
            interval: Duration::from_millis(self.epoch_interval_ms),
            capacity: self.epoch_ring_capacity,
        }
    }

    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            interval: Duration::from_millis(self.gc_interval_ms),
            min_pending: self.gc_min_pending,
            enabled: self.gc_enabled,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CcError::InvalidConfig(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        let config = CcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol, ProtocolKind::Optimistic);
        assert_eq!(config.epoch_config().capacity, 4096);
        assert_eq!(config.gc_config().interval, Duration::from_millis(100));
    }

    #[test]
    fn test_from_json_partial() {
        let config = CcConfig::from_json(r#"{"protocol": "ssi", "gc_enabled": false}"#).unwrap();
        assert_eq!(config.protocol, ProtocolKind::Ssi);
        assert!(!config.gc_enabled);
        assert_eq!(config.epoch_interval_ms, 40);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = CcConfig::with_protocol(ProtocolKind::OptimisticRb);
        config.wal_path = Some(PathBuf::from("/tmp/tilecc.wal"));
        let restored = CcConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            CcConfig::from_json(r#"{"epoch_ring_capacity": 1}"#),
            Err(CcError::InvalidConfig(_))
        ));
        assert!(matches!(CcConfig::from_json("not json"), Err(CcError::Serialization(_))));
    }

    #[test]
    fn test_from_lookup() {
        let config = CcConfig::from_lookup(lookup(&[
            (ENV_PROTOCOL, "2pl"),
            (ENV_EPOCH_INTERVAL_MS, "10"),
            (ENV_GC_ENABLED, "off"),
            (ENV_WAL_PATH, "/tmp/x.wal"),
        ]))
        .unwrap();
        assert_eq!(config.protocol, ProtocolKind::Pessimistic);
        assert_eq!(config.epoch_interval_ms, 10);
        assert!(!config.gc_enabled);
        assert_eq!(config.wal_path, Some(PathBuf::from("/tmp/x.wal")));
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(matches!(
            CcConfig::from_lookup(lookup(&[(ENV_PROTOCOL, "mvto")])),
            Err(CcError::UnknownProtocol(_))
        ));
        assert!(matches!(
            CcConfig::from_lookup(lookup(&[(ENV_EPOCH_RING_CAPACITY, "many")])),
            Err(CcError::InvalidConfig(_))
        ));
        assert!(matches!(
            CcConfig::from_lookup(lookup(&[(ENV_GC_ENABLED, "maybe")])),
            Err(CcError::InvalidConfig(_))
        ));
    }
}
