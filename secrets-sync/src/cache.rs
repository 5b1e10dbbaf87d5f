//! Two-tier secret cache
//!
//! The descriptor tier mirrors the remote secret list and is replaced wholesale
//! on every refresh. The value tier holds fetched payloads keyed by
//! `(id, version)`, so a value is fetched again only after a refresh reports a
//! new version for its secret. Concurrent misses on the same key share a
//! single remote fetch.

use crate::metrics;
use crate::providers::SecretClient;
use crate::{CachedValue, Result, SecretDescriptor, SecretValue, SyncError};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ValueKey {
    id: String,
    version_id: String,
}

pub struct SecretCache {
    client: Arc<dyn SecretClient>,
    descriptors: RwLock<Arc<HashMap<String, SecretDescriptor>>>,
    values: Cache<ValueKey, CachedValue>,
}

impl SecretCache {
    pub fn new(client: Arc<dyn SecretClient>, max_entries: u64) -> Self {
        let values = Cache::builder().max_capacity(max_entries).build();

        Self {
            client,
            descriptors: RwLock::new(Arc::new(HashMap::new())),
            values,
        }
    }

    /// Replace the descriptor set with a fresh remote listing.
    ///
    /// On failure the previous descriptor set stays in place.
    pub async fn refresh_list(&self) -> Result<usize> {
        let listed = match self.client.list_secrets().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(
                    client = self.client.name(),
                    error = %e,
                    "Secret list refresh failed, keeping previous descriptors"
                );
                metrics::record_list_refresh(false);
                return Err(e);
            }
        };

        let fresh: Arc<HashMap<String, SecretDescriptor>> = Arc::new(
            listed
                .into_iter()
                .map(|descriptor| (descriptor.id.clone(), descriptor))
                .collect(),
        );

        let previous = {
            let mut guard = self.descriptors.write().await;
            std::mem::replace(&mut *guard, Arc::clone(&fresh))
        };

        let mut superseded = 0usize;
        for (id, old) in previous.iter() {
            let unchanged = fresh
                .get(id)
                .map(|current| current.version_id == old.version_id)
                .unwrap_or(false);
            if !unchanged {
                self.values
                    .invalidate(&ValueKey {
                        id: id.clone(),
                        version_id: old.version_id.clone(),
                    })
                    .await;
                superseded += 1;
            }
        }

        metrics::record_list_refresh(true);
        metrics::set_cached_descriptors(fresh.len());
        info!(
            descriptors = fresh.len(),
            superseded,
            "Secret list refreshed"
        );

        Ok(fresh.len())
    }

    /// Value of `id` at its current version, fetched with `role` on a miss.
    ///
    /// An empty `role` fetches with the controller's own identity. Values are
    /// shared across roles: a hit is served without asking the remote service
    /// whether `role` may read the secret, so namespace policy is the only
    /// check once any permitted role has fetched it.
    pub async fn get_value(&self, id: &str, role: &str) -> Result<CachedValue> {
        let descriptor = self
            .descriptor(id)
            .await
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        let key = ValueKey {
            id: descriptor.id.clone(),
            version_id: descriptor.version_id.clone(),
        };

        let client = Arc::clone(&self.client);
        let role = role.to_string();

        let value = self
            .values
            .try_get_with(key.clone(), async move {
                debug!(secret = %descriptor.id, version = %descriptor.version_id, "Fetching secret value");

                let credentials = if role.is_empty() {
                    None
                } else {
                    Some(client.assume_role(&role).await?)
                };

                let fetched = client
                    .get_secret_value(&descriptor.id, &descriptor.version_id, credentials.as_ref())
                    .await;
                metrics::record_remote_fetch(fetched.is_ok());

                Ok::<_, SyncError>(CachedValue {
                    version_id: descriptor.version_id,
                    value: SecretValue::parse(fetched?),
                })
            })
            .await
            .map_err(|e| (*e).clone())?;

        // A refresh may have superseded the version while it was being fetched
        let current = self.descriptor(id).await.map(|d| d.version_id);
        if current.as_deref() != Some(key.version_id.as_str()) {
            self.values.invalidate(&key).await;
        }
        Ok(value)
    }

    pub async fn descriptor(&self, id: &str) -> Option<SecretDescriptor> {
        self.descriptors.read().await.get(id).cloned()
    }

    /// Snapshot of every known descriptor, ordered by id.
    pub async fn list_descriptors(&self) -> Vec<SecretDescriptor> {
        let snapshot = Arc::clone(&*self.descriptors.read().await);
        let mut descriptors: Vec<SecretDescriptor> = snapshot.values().cloned().collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub async fn descriptor_count(&self) -> usize {
        self.descriptors.read().await.len()
    }

    /// Drop every cached value; descriptors are kept.
    pub fn invalidate_all(&self) {
        self.values.invalidate_all();
    }
}
