//! # Secrets Sync
//!
//! Keeps Kubernetes Secrets in step with AWS Secrets Manager.
//!
//! ## Components:
//! - Secret cache: remote descriptor list plus lazily fetched, version keyed values
//! - Namespace policy: which IAM roles a namespace's mapping resources may assume
//! - Resolver: literal, key, whole value and template entries into one document
//! - Reconciler: per-resource state machine, writes only on change
//!
//! ## Timers:
//! - List refresh every `list_interval` (default 300s)
//! - Sync of all mapping resources every `sync_interval` (default 120s)
//!
//! A remote change reaches the output store within `list_interval + sync_interval`.

pub mod audit;
pub mod cache;
pub mod config;
pub mod crd;
pub mod error;
pub mod kube_adapters;
pub mod mapping;
pub mod metrics;
pub mod policy;
pub mod providers;
pub mod reconciler;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod template;
pub mod testing;
pub mod types;

pub use cache::SecretCache;
pub use config::SyncConfig;
pub use error::SyncError;
pub use reconciler::{ReconcileState, Reconciler};
pub use types::*;

/// Result type for secrets sync
pub type Result<T> = std::result::Result<T, SyncError>;
