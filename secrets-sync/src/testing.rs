//! In-memory collaborators for tests and local dry runs
//!
//! `FakeSecretClient` stands in for the remote secret service and counts the
//! calls made against it. Every `put_secret` bumps the secret's version
//! (`v1`, `v2`, ...) the way a real update would.

use crate::providers::{SecretClient, SecretVersion, CURRENT_STAGE};
use crate::{Result, RoleCredentials, SecretDescriptor, SyncError};
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeSecret {
    tags: HashMap<String, String>,
    /// Every value ever stored; version `vN` is `history[N - 1]`
    history: Vec<Vec<u8>>,
}

impl FakeSecret {
    fn version(&self) -> usize {
        self.history.len()
    }
}

#[derive(Default)]
pub struct FakeSecretClient {
    secrets: Mutex<BTreeMap<String, FakeSecret>>,
    failing_gets: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
    get_delay: Option<Duration>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    assumed_roles: Mutex<Vec<String>>,
    last_fetch_role: Mutex<Option<String>>,
}

impl FakeSecretClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every value fetch, to widen the window for concurrent callers.
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }

    /// Create or update a secret, moving it to a new version.
    pub fn put_secret(&self, id: &str, tags: &[(&str, &str)], value: &str) {
        if let Ok(mut secrets) = self.secrets.lock() {
            let secret = secrets.entry(id.to_string()).or_insert_with(|| FakeSecret {
                tags: HashMap::new(),
                history: Vec::new(),
            });
            secret.tags = tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            secret.history.push(value.as_bytes().to_vec());
        }
    }

    pub fn remove_secret(&self, id: &str) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.remove(id);
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_get(&self, id: &str, fail: bool) {
        if let Ok(mut failing) = self.failing_gets.lock() {
            if fail {
                failing.insert(id.to_string());
            } else {
                failing.remove(id);
            }
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn assumed_roles(&self) -> Vec<String> {
        self.assumed_roles
            .lock()
            .map(|roles| roles.clone())
            .unwrap_or_default()
    }

    /// Role of the most recent value fetch; `None` for the default identity.
    pub fn last_fetch_role(&self) -> Option<String> {
        self.last_fetch_role.lock().ok().and_then(|role| role.clone())
    }

    fn snapshot(&self, id: &str) -> Option<FakeSecret> {
        self.secrets.lock().ok().and_then(|s| s.get(id).cloned())
    }
}

fn version_label(version: usize) -> String {
    format!("v{}", version)
}

#[async_trait]
impl SecretClient for FakeSecretClient {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_secrets(&self) -> Result<Vec<SecretDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(SyncError::fetch("*", "ThrottlingException: rate exceeded"));
        }

        let secrets = self
            .secrets
            .lock()
            .map_err(|_| SyncError::fetch("*", "fake client poisoned"))?;
        Ok(secrets
            .iter()
            .map(|(id, secret)| SecretDescriptor {
                id: id.clone(),
                tags: secret.tags.clone(),
                version_id: version_label(secret.version()),
            })
            .collect())
    }

    async fn list_secret_versions(&self, id: &str) -> Result<Vec<SecretVersion>> {
        let secret = self
            .snapshot(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let current = secret.version();
        Ok((1..=current)
            .map(|version| SecretVersion {
                version_id: version_label(version),
                stages: if version == current {
                    vec![CURRENT_STAGE.to_string()]
                } else {
                    Vec::new()
                },
            })
            .collect())
    }

    async fn assume_role(&self, role: &str) -> Result<RoleCredentials> {
        if let Ok(mut roles) = self.assumed_roles.lock() {
            roles.push(role.to_string());
        }
        Ok(RoleCredentials {
            role: role.to_string(),
            access_key_id: "ASIAFAKE".to_string(),
            secret_access_key: SecretString::new("fake-secret".to_string()),
            session_token: None,
            expiration: None,
        })
    }

    async fn get_secret_value(
        &self,
        id: &str,
        version_id: &str,
        credentials: Option<&RoleCredentials>,
    ) -> Result<Vec<u8>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_fetch_role.lock() {
            *last = credentials.map(|c| c.role.clone());
        }
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_gets
            .lock()
            .map(|f| f.contains(id))
            .unwrap_or(false);
        if failing {
            return Err(SyncError::fetch(id, "AccessDeniedException"));
        }

        let secret = self
            .snapshot(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        secret
            .history
            .iter()
            .enumerate()
            .find(|(index, _)| version_label(index + 1) == version_id)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| SyncError::fetch(id, format!("unknown version {}", version_id)))
    }
}
