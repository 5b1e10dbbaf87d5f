//! Reconciliation of mapping resources into the output store
//!
//! Every sync tick walks all tracked resources:
//!
//! ```text
//! Pending -> Authorizing -> Resolving -> Writing -> Idle
//!                 |              |           |
//!                 +--------------+-----------+--> Failed(reason)
//! ```
//!
//! A failed resource is retried from `Pending` on the next tick. The output is
//! only written when the resolved document differs from the last one written
//! for that resource. Removing a resource stops tracking it and leaves its
//! output in place.

use crate::audit::AuditLogger;
use crate::cache::SecretCache;
use crate::config::SyncConfig;
use crate::crd::SyncedSecret;
use crate::mapping::{MappingResource, ResourceKey};
use crate::metrics;
use crate::policy::authorize;
use crate::resolver::Resolver;
use crate::store::{OutputStore, PolicySource};
use crate::{ResolvedDocument, Result, SyncError};
use futures::stream::{self, StreamExt};
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    Pending,
    Authorizing,
    Resolving,
    Writing,
    Idle,
    /// Short reason, see [`SyncError::reason`]
    Failed(String),
}

/// Result of one reconciliation of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Unchanged,
    Failed(&'static str),
    /// Resource stopped being tracked, or its spec is invalid
    Skipped,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Written => "written",
            Outcome::Unchanged => "unchanged",
            Outcome::Failed(reason) => reason,
            Outcome::Skipped => "skipped",
        }
    }
}

/// Per-tick totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub unchanged: usize,
    pub failed: usize,
}

struct Tracked {
    /// `Err` holds the validation error of an invalid spec
    resource: std::result::Result<MappingResource, SyncError>,
    /// Unique per stored `resource`, replaced along with it
    generation: u64,
    state: ReconcileState,
    last_written: Option<ResolvedDocument>,
}

pub struct Reconciler {
    resolver: Resolver,
    policies: Arc<dyn PolicySource>,
    store: Arc<dyn OutputStore>,
    audit: AuditLogger,
    worker_limit: usize,
    tracked: RwLock<HashMap<ResourceKey, Tracked>>,
    generations: AtomicU64,
}

impl Reconciler {
    pub fn new(
        cache: Arc<SecretCache>,
        policies: Arc<dyn PolicySource>,
        store: Arc<dyn OutputStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            resolver: Resolver::new(cache),
            policies,
            store,
            audit: AuditLogger::from_config(&config.audit),
            worker_limit: config.worker_limit.max(1),
            tracked: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Start tracking a watched object, or replace the tracked version of it.
    ///
    /// An invalid spec is tracked as `Failed("invalid-spec")` until the next
    /// update fixes it.
    pub async fn apply(&self, object: &SyncedSecret) {
        let Some(namespace) = object.namespace() else {
            warn!(name = %object.name_any(), "Ignoring SyncedSecret without namespace");
            return;
        };
        let key = ResourceKey::new(namespace, object.name_any());

        let parsed = MappingResource::from_object(object);
        if let Err(e) = &parsed {
            warn!(resource = %key, error = %e, "Invalid SyncedSecret spec");
        }
        self.upsert(key, parsed).await;
    }

    /// Start tracking an already validated resource.
    pub async fn track(&self, resource: MappingResource) {
        self.upsert(resource.key(), Ok(resource)).await;
    }

    async fn upsert(&self, key: ResourceKey, resource: std::result::Result<MappingResource, SyncError>) {
        let state = match &resource {
            Ok(_) => ReconcileState::Pending,
            Err(e) => ReconcileState::Failed(e.reason().to_string()),
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let mut tracked = self.tracked.write().await;
        match tracked.get_mut(&key) {
            Some(existing) => {
                existing.resource = resource;
                existing.generation = generation;
                existing.state = state;
            }
            None => {
                debug!(resource = %key, "Tracking mapping resource");
                tracked.insert(
                    key,
                    Tracked {
                        resource,
                        generation,
                        state,
                        last_written: None,
                    },
                );
            }
        }
        metrics::set_tracked_resources(tracked.len());
    }

    /// Stop tracking a resource. Its output document is left untouched.
    pub async fn remove(&self, namespace: &str, name: &str) -> bool {
        let mut tracked = self.tracked.write().await;
        let removed = tracked.remove(&ResourceKey::new(namespace, name)).is_some();
        metrics::set_tracked_resources(tracked.len());
        if removed {
            info!(namespace, name, "Stopped tracking mapping resource");
        }
        removed
    }

    /// Replace the tracked set with a full relist of the watched objects.
    pub async fn restart(&self, objects: &[SyncedSecret]) {
        let live: HashSet<ResourceKey> = objects
            .iter()
            .filter_map(|object| {
                object
                    .namespace()
                    .map(|namespace| ResourceKey::new(namespace, object.name_any()))
            })
            .collect();

        for key in self.tracked().await {
            if !live.contains(&key) {
                self.remove(&key.namespace, &key.name).await;
            }
        }
        for object in objects {
            self.apply(object).await;
        }
    }

    pub async fn state(&self, namespace: &str, name: &str) -> Option<ReconcileState> {
        self.tracked
            .read()
            .await
            .get(&ResourceKey::new(namespace, name))
            .map(|t| t.state.clone())
    }

    /// Keys of every tracked resource, ordered.
    pub async fn tracked(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.tracked.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reconcile every tracked resource, at most `worker_limit` at a time.
    pub async fn sync_all(&self) -> SyncReport {
        let keys = self.tracked().await;
        let outcomes: Vec<Outcome> = stream::iter(keys)
            .map(|key| async move { self.reconcile_one(&key).await })
            .buffer_unordered(self.worker_limit)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Written => report.written += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Failed(_) => report.failed += 1,
                Outcome::Skipped => {}
            }
        }
        report
    }

    #[instrument(skip(self, key), fields(resource = %key))]
    pub async fn reconcile_one(&self, key: &ResourceKey) -> Outcome {
        let (resource, generation, last_written) = {
            let tracked = self.tracked.read().await;
            match tracked.get(key) {
                Some(Tracked {
                    resource: Ok(resource),
                    generation,
                    last_written,
                    ..
                }) => (resource.clone(), *generation, last_written.clone()),
                _ => return Outcome::Skipped,
            }
        };
        let run = Run { key, generation };

        self.set_state(&run, ReconcileState::Pending).await;
        let outcome = match self.run(&run, &resource, last_written.as_ref()).await {
            Ok(outcome) => {
                self.set_state(&run, ReconcileState::Idle).await;
                outcome
            }
            Err(e) => {
                let reason = e.reason();
                match &e {
                    SyncError::PolicyDenied { .. } => {
                        self.audit.denied(&key.to_string(), &resource.iam_role)
                    }
                    _ => self
                        .audit
                        .failed(&key.to_string(), &resource.iam_role, &e.to_string()),
                }
                warn!(reason, error = %e, "Reconciliation failed");
                self.set_state(&run, ReconcileState::Failed(reason.to_string()))
                    .await;
                Outcome::Failed(reason)
            }
        };

        metrics::record_reconcile(outcome.label());
        outcome
    }

    async fn run(
        &self,
        run: &Run<'_>,
        resource: &MappingResource,
        last_written: Option<&ResolvedDocument>,
    ) -> Result<Outcome> {
        let key = run.key;
        self.set_state(run, ReconcileState::Authorizing).await;
        let policy = self.policies.namespace_policy(&resource.namespace).await?;
        if !authorize(&policy, &resource.iam_role).is_allowed() {
            return Err(SyncError::PolicyDenied {
                namespace: resource.namespace.clone(),
                role: resource.iam_role.clone(),
            });
        }

        self.set_state(run, ReconcileState::Resolving).await;
        let document = self
            .resolver
            .resolve(&resource.spec, &resource.iam_role)
            .await?;

        if last_written == Some(&document) {
            debug!("Resolved document unchanged, skipping write");
            self.audit.resolved(&key.to_string(), &resource.iam_role);
            return Ok(Outcome::Unchanged);
        }

        self.set_state(run, ReconcileState::Writing).await;
        self.store
            .write(&resource.name, &resource.namespace, &document)
            .await?;
        metrics::record_output_write();
        self.audit.written(&key.to_string(), &resource.iam_role);
        info!(keys = document.len(), "Wrote output secret");

        if let Some(tracked) = run.current(&mut *self.tracked.write().await) {
            tracked.last_written = Some(document);
        }
        Ok(Outcome::Written)
    }

    /// Updates from a run are dropped once its resource has been replaced.
    async fn set_state(&self, run: &Run<'_>, state: ReconcileState) {
        if let Some(tracked) = run.current(&mut *self.tracked.write().await) {
            tracked.state = state;
        }
    }
}

/// One reconciliation of the resource version tracked at `generation`.
struct Run<'a> {
    key: &'a ResourceKey,
    generation: u64,
}

impl Run<'_> {
    fn current<'t>(&self, tracked: &'t mut HashMap<ResourceKey, Tracked>) -> Option<&'t mut Tracked> {
        tracked
            .get_mut(self.key)
            .filter(|tracked| tracked.generation == self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DataEntrySpec, SecretKeyRef, SyncedSecretSpec};
    use crate::mapping::{DataEntry, DataSource, MappingSpec};
    use crate::store::{MemoryOutputStore, StaticPolicySource};
    use crate::testing::FakeSecretClient;
    use std::time::Duration;

    struct Harness {
        client: Arc<FakeSecretClient>,
        cache: Arc<SecretCache>,
        policies: Arc<StaticPolicySource>,
        store: Arc<MemoryOutputStore>,
        reconciler: Reconciler,
    }

    async fn harness() -> Harness {
        let client = Arc::new(FakeSecretClient::new());
        client.put_secret("mysql", &[], r#"{"password":"s3cr3t"}"#);
        let cache = Arc::new(SecretCache::new(client.clone(), 100));
        cache.refresh_list().await.unwrap();

        let policies = Arc::new(StaticPolicySource::new());
        let store = Arc::new(MemoryOutputStore::new());
        let reconciler = Reconciler::new(
            cache.clone(),
            policies.clone(),
            store.clone(),
            &SyncConfig::default(),
        );

        Harness {
            client,
            cache,
            policies,
            store,
            reconciler,
        }
    }

    fn password_mapping(namespace: &str, name: &str, role: &str, secret: &str) -> MappingResource {
        MappingResource {
            name: name.to_string(),
            namespace: namespace.to_string(),
            iam_role: role.to_string(),
            spec: MappingSpec::Data(vec![DataEntry {
                name: "PASSWORD".to_string(),
                source: DataSource::KeyRef {
                    secret_name: secret.to_string(),
                    secret_key: "password".to_string(),
                },
            }]),
        }
    }

    fn password_doc(value: &str) -> ResolvedDocument {
        [("PASSWORD".to_string(), value.as_bytes().to_vec())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_unchanged_document_is_not_rewritten() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;

        let first = h.reconciler.sync_all().await;
        let second = h.reconciler.sync_all().await;

        assert_eq!(first.written, 1);
        assert_eq!(second.unchanged, 1);
        assert_eq!(h.store.writes(), 1);
        assert_eq!(h.client.get_calls(), 1);
        assert_eq!(
            h.store.get("team-a", "creds").await,
            Some(password_doc("s3cr3t"))
        );
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Idle)
        );
    }

    #[tokio::test]
    async fn test_remote_change_is_written_after_refresh() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;
        h.reconciler.sync_all().await;

        h.client.put_secret("mysql", &[], r#"{"password":"rotated"}"#);
        // Not visible until the list refresh
        h.reconciler.sync_all().await;
        assert_eq!(h.store.writes(), 1);

        h.cache.refresh_list().await.unwrap();
        h.reconciler.sync_all().await;
        assert_eq!(h.store.writes(), 2);
        assert_eq!(
            h.store.get("team-a", "creds").await,
            Some(password_doc("rotated"))
        );
    }

    #[tokio::test]
    async fn test_policy_denied_before_any_fetch() {
        let h = harness().await;
        h.policies.annotate("team-a", "arn:aws:iam::1:role/other").await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "arn:aws:iam::1:role/app", "mysql"))
            .await;

        let report = h.reconciler.sync_all().await;
        assert_eq!(report.failed, 1);
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Failed("policy-denied".to_string()))
        );
        assert_eq!(h.client.get_calls(), 0);
        assert!(h.client.assumed_roles().is_empty());
        assert_eq!(h.store.writes(), 0);

        // Annotation edits apply on the next tick
        h.policies
            .annotate("team-a", "arn:aws:iam::1:role/other, arn:aws:iam::1:role/app")
            .await;
        h.reconciler.sync_all().await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Idle)
        );
        assert_eq!(h.client.assumed_roles(), vec!["arn:aws:iam::1:role/app"]);
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_empty_role_denied_when_namespace_annotated() {
        let h = harness().await;
        h.policies.annotate("team-a", "").await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;

        h.reconciler.sync_all().await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Failed("policy-denied".to_string()))
        );
    }

    #[tokio::test]
    async fn test_failure_recovers_on_later_tick() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "postgres"))
            .await;

        h.reconciler.sync_all().await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Failed("secret-not-found".to_string()))
        );

        h.client.put_secret("postgres", &[], r#"{"password":"pg"}"#);
        h.cache.refresh_list().await.unwrap();
        h.reconciler.sync_all().await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Idle)
        );
        assert_eq!(h.store.get("team-a", "creds").await, Some(password_doc("pg")));
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;

        h.store.fail_writes(true);
        h.reconciler.sync_all().await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Failed("store-error".to_string()))
        );

        h.store.fail_writes(false);
        let report = h.reconciler.sync_all().await;
        assert_eq!(report.written, 1);
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_remove_leaves_output_in_place() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;
        h.reconciler.sync_all().await;

        assert!(h.reconciler.remove("team-a", "creds").await);
        assert!(!h.reconciler.remove("team-a", "creds").await);
        assert!(h.reconciler.tracked().await.is_empty());
        assert_eq!(h.reconciler.state("team-a", "creds").await, None);

        h.reconciler.sync_all().await;
        assert_eq!(h.store.writes(), 1);
        assert!(h.store.get("team-a", "creds").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_object_tracked_as_failed_until_fixed() {
        let h = harness().await;
        let mut object = SyncedSecret::new("creds", SyncedSecretSpec::default());
        object.metadata.namespace = Some("team-a".to_string());

        h.reconciler.apply(&object).await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Failed("invalid-spec".to_string()))
        );
        let report = h.reconciler.sync_all().await;
        assert_eq!(report, SyncReport::default());

        object.spec.data = Some(vec![DataEntrySpec {
            name: "PASSWORD".to_string(),
            secret_key_ref: Some(SecretKeyRef {
                name: "mysql".to_string(),
                key: "password".to_string(),
            }),
            ..Default::default()
        }]);
        h.reconciler.apply(&object).await;
        assert_eq!(
            h.reconciler.state("team-a", "creds").await,
            Some(ReconcileState::Pending)
        );

        h.reconciler.sync_all().await;
        assert_eq!(h.store.get("team-a", "creds").await, Some(password_doc("s3cr3t")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_during_tick_keeps_new_state() {
        let client = Arc::new(FakeSecretClient::new().with_get_delay(Duration::from_millis(300)));
        client.put_secret("mysql", &[], r#"{"password":"s3cr3t"}"#);
        let cache = Arc::new(SecretCache::new(client.clone(), 100));
        cache.refresh_list().await.unwrap();
        let store = Arc::new(MemoryOutputStore::new());
        let reconciler = Arc::new(Reconciler::new(
            cache,
            Arc::new(StaticPolicySource::new()),
            store.clone(),
            &SyncConfig::default(),
        ));
        reconciler
            .track(password_mapping("team-a", "creds", "", "mysql"))
            .await;

        let tick = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.sync_all().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut invalid = SyncedSecret::new("creds", SyncedSecretSpec::default());
        invalid.metadata.namespace = Some("team-a".to_string());
        reconciler.apply(&invalid).await;

        tick.await.unwrap();
        let failed = Some(ReconcileState::Failed("invalid-spec".to_string()));
        assert_eq!(reconciler.state("team-a", "creds").await, failed);

        reconciler.sync_all().await;
        assert_eq!(reconciler.state("team-a", "creds").await, failed);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_restart_drops_objects_missing_from_relist() {
        let h = harness().await;
        h.reconciler
            .track(password_mapping("team-a", "stale", "", "mysql"))
            .await;

        let mut object = SyncedSecret::new(
            "creds",
            SyncedSecretSpec {
                data_from: Some(crate::crd::DataFromSpec {
                    secret_ref: crate::crd::SecretRef {
                        name: "mysql".to_string(),
                    },
                }),
                ..Default::default()
            },
        );
        object.metadata.namespace = Some("team-a".to_string());

        h.reconciler.restart(&[object]).await;
        assert_eq!(
            h.reconciler.tracked().await,
            vec![ResourceKey::new("team-a", "creds")]
        );
    }

    #[tokio::test]
    async fn test_many_resources_share_one_fetch() {
        let h = harness().await;
        for i in 0..20 {
            h.reconciler
                .track(password_mapping("team-a", &format!("creds-{}", i), "", "mysql"))
                .await;
        }

        let report = h.reconciler.sync_all().await;
        assert_eq!(report.written, 20);
        assert_eq!(h.client.get_calls(), 1);
        assert_eq!(h.reconciler.tracked().await.len(), 20);
    }
}
