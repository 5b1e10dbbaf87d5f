//! Output store and namespace policy seams
//!
//! The reconciler only writes through [`OutputStore`] and only reads namespace
//! annotations through [`PolicySource`]. The Kubernetes implementations live in
//! `kube_adapters`; the in-memory ones here back tests and dry runs.

use crate::mapping::ResourceKey;
use crate::policy::NamespacePolicy;
use crate::{ResolvedDocument, Result, SyncError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Destination of resolved documents.
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Create or replace the document addressed by `name`/`namespace`.
    async fn write(&self, name: &str, namespace: &str, document: &ResolvedDocument) -> Result<()>;
}

/// Lookup of a namespace's role allow-list.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn namespace_policy(&self, namespace: &str) -> Result<NamespacePolicy>;
}

/// Output store keeping documents in memory and counting writes.
#[derive(Default)]
pub struct MemoryOutputStore {
    documents: RwLock<BTreeMap<ResourceKey, ResolvedDocument>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Option<ResolvedDocument> {
        self.documents
            .read()
            .await
            .get(&ResourceKey::new(namespace, name))
            .cloned()
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutputStore for MemoryOutputStore {
    async fn write(&self, name: &str, namespace: &str, document: &ResolvedDocument) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store(format!(
                "write of {}/{} rejected",
                namespace, name
            )));
        }

        self.documents
            .write()
            .await
            .insert(ResourceKey::new(namespace, name), document.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Policy source backed by a fixed annotation table.
#[derive(Default)]
pub struct StaticPolicySource {
    annotations: RwLock<HashMap<String, String>>,
}

impl StaticPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the allow-list annotation of `namespace`.
    pub async fn annotate(&self, namespace: &str, roles: &str) {
        self.annotations
            .write()
            .await
            .insert(namespace.to_string(), roles.to_string());
    }

    /// Remove the annotation from `namespace`.
    pub async fn clear(&self, namespace: &str) {
        self.annotations.write().await.remove(namespace);
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn namespace_policy(&self, namespace: &str) -> Result<NamespacePolicy> {
        let annotations = self.annotations.read().await;
        Ok(NamespacePolicy::from_annotation(
            namespace,
            annotations.get(namespace).map(String::as_str),
        ))
    }
}
