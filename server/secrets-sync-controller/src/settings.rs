use clap::{ArgAction, Parser, ValueEnum};
use secrets_sync::config::{
    AuditConfig, AwsSecretsManagerConfig, CacheConfig, SyncConfig, DEFAULT_NAMESPACE_ANNOTATION,
};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Syncs AWS Secrets Manager values into Kubernetes Secrets
#[derive(Parser, Debug)]
#[command(name = "secrets-sync-controller")]
#[command(about = "Syncs AWS Secrets Manager values into Kubernetes Secrets")]
pub struct Settings {
    /// Seconds between refreshes of the remote secret list
    #[arg(long, env = "LIST_INTERVAL_SEC", default_value_t = 300)]
    pub list_interval_sec: u64,

    /// Seconds between reconciliations of every SyncedSecret
    #[arg(long, env = "SYNC_INTERVAL_SEC", default_value_t = 120)]
    pub sync_interval_sec: u64,

    /// Namespace annotation listing the roles the namespace may use
    #[arg(long, env = "NAMESPACE_ANNOTATION", default_value = DEFAULT_NAMESPACE_ANNOTATION)]
    pub namespace_annotation: String,

    /// Prometheus exporter bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// SyncedSecrets resolved concurrently per tick
    #[arg(long, env = "SYNC_WORKER_LIMIT", default_value_t = 8)]
    pub worker_limit: usize,

    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Override the Secrets Manager endpoint (local stacks)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Upper bound on cached secret versions
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    pub cache_max_entries: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "AUDIT_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub audit_enabled: bool,

    /// Also audit resolutions that did not change the output
    #[arg(long, env = "AUDIT_LOG_ALL_ACCESS")]
    pub audit_log_all_access: bool,

    /// Print the SyncedSecret CRD as YAML and exit
    #[arg(long)]
    pub print_crd: bool,
}

impl Settings {
    pub fn to_config(&self) -> SyncConfig {
        SyncConfig {
            list_interval: Duration::from_secs(self.list_interval_sec),
            sync_interval: Duration::from_secs(self.sync_interval_sec),
            namespace_annotation: self.namespace_annotation.clone(),
            worker_limit: self.worker_limit,
            provider: AwsSecretsManagerConfig {
                region: self.region.clone(),
                endpoint_url: self.endpoint_url.clone(),
                ..SyncConfig::default().provider
            },
            cache: CacheConfig {
                max_entries: self.cache_max_entries,
            },
            audit: AuditConfig {
                enabled: self.audit_enabled,
                log_all_access: self.audit_log_all_access,
            },
        }
    }
}
