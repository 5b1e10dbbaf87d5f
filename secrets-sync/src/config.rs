//! Configuration for secrets sync

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Annotation holding the comma separated list of roles a namespace may assume.
pub const DEFAULT_NAMESPACE_ANNOTATION: &str = "iam.amazonaws.com/allowed-roles";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often the remote secret list is refreshed
    #[serde(with = "duration_secs", rename = "list_interval_sec")]
    pub list_interval: Duration,

    /// How often every tracked mapping resource is reconciled
    #[serde(with = "duration_secs", rename = "sync_interval_sec")]
    pub sync_interval: Duration,

    /// Namespace annotation carrying the allowed role list
    pub namespace_annotation: String,

    /// Maximum number of mapping resources resolved concurrently per tick
    pub worker_limit: usize,

    /// Remote provider configuration
    pub provider: AwsSecretsManagerConfig,

    /// Cache configuration
    pub cache: CacheConfig,

    /// Audit configuration
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsSecretsManagerConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    /// Session name used for every `AssumeRole` call
    pub role_session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on cached secret values (one entry per secret version)
    pub max_entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_all_access: bool,
}

// Serialize Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl SyncConfig {
    /// Reject settings the timers or worker pool cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.list_interval.is_zero() {
            return Err(crate::SyncError::Config(
                "list interval must be at least one second".to_string(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(crate::SyncError::Config(
                "sync interval must be at least one second".to_string(),
            ));
        }
        if self.worker_limit == 0 {
            return Err(crate::SyncError::Config(
                "worker limit must be positive".to_string(),
            ));
        }
        if self.namespace_annotation.trim().is_empty() {
            return Err(crate::SyncError::Config(
                "namespace annotation name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Worst case delay between a remote value change and the matching output write.
    pub fn max_propagation_delay(&self) -> Duration {
        self.list_interval + self.sync_interval
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_interval: Duration::from_secs(300),
            sync_interval: Duration::from_secs(120),
            namespace_annotation: DEFAULT_NAMESPACE_ANNOTATION.to_string(),
            worker_limit: 8,
            provider: AwsSecretsManagerConfig {
                region: None,
                endpoint_url: None,
                role_session_name: "secrets-sync".to_string(),
            },
            cache: CacheConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_all_access: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.list_interval, Duration::from_secs(300));
        assert_eq!(config.sync_interval, Duration::from_secs(120));
        assert_eq!(config.namespace_annotation, "iam.amazonaws.com/allowed-roles");
        assert_eq!(config.max_propagation_delay(), Duration::from_secs(420));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_intervals_serialize_as_seconds() {
        let json = serde_json::to_value(SyncConfig::default()).unwrap();
        assert_eq!(json["list_interval_sec"], 300);
        assert_eq!(json["sync_interval_sec"], 120);

        let back: SyncConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.sync_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_zero_worker_limit_rejected() {
        let config = SyncConfig {
            worker_limit: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(crate::SyncError::Config(_))));
    }
}
