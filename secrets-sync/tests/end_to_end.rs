//! Timer driven sync against in-memory collaborators

use secrets_sync::mapping::{DataEntry, DataSource, MappingResource, MappingSpec};
use secrets_sync::store::{MemoryOutputStore, StaticPolicySource};
use secrets_sync::testing::FakeSecretClient;
use secrets_sync::{runtime, ReconcileState, Reconciler, SecretCache, SyncConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Setup {
    client: Arc<FakeSecretClient>,
    store: Arc<MemoryOutputStore>,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    tasks: (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>),
}

fn mapping() -> MappingResource {
    MappingResource {
        name: "db-creds".to_string(),
        namespace: "team-a".to_string(),
        iam_role: String::new(),
        spec: MappingSpec::Data(vec![DataEntry {
            name: "PASSWORD".to_string(),
            source: DataSource::KeyRef {
                secret_name: "prod/mysql".to_string(),
                secret_key: "password".to_string(),
            },
        }]),
    }
}

async fn start(config: SyncConfig) -> Setup {
    let client = Arc::new(FakeSecretClient::new());
    client.put_secret("prod/mysql", &[("team", "a")], r#"{"password":"first"}"#);

    let cache = Arc::new(SecretCache::new(client.clone(), config.cache.max_entries));
    cache.refresh_list().await.unwrap();

    let store = Arc::new(MemoryOutputStore::new());
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        Arc::new(StaticPolicySource::new()),
        store.clone(),
        &config,
    ));
    reconciler.track(mapping()).await;

    let shutdown = CancellationToken::new();
    let tasks = runtime::spawn(cache, reconciler.clone(), &config, shutdown.clone());

    Setup {
        client,
        store,
        reconciler,
        shutdown,
        tasks,
    }
}

async fn password(store: &MemoryOutputStore) -> Option<String> {
    store
        .get("team-a", "db-creds")
        .await
        .and_then(|doc| doc.get("PASSWORD").cloned())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

async fn stop(setup: Setup) {
    setup.shutdown.cancel();
    setup.tasks.0.await.unwrap();
    setup.tasks.1.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remote_change_reaches_output_within_both_intervals() {
    let config = SyncConfig::default();
    assert_eq!(config.max_propagation_delay(), Duration::from_secs(420));
    let setup = start(config).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(password(&setup.store).await.as_deref(), Some("first"));

    // Change lands just after the list refresh at t=300, the worst case
    tokio::time::sleep(Duration::from_secs(300)).await;
    setup
        .client
        .put_secret("prod/mysql", &[("team", "a")], r#"{"password":"second"}"#);

    // The refresh at t=600 is the first to see it
    tokio::time::sleep(Duration::from_secs(298)).await;
    assert_eq!(password(&setup.store).await.as_deref(), Some("first"));

    tokio::time::sleep(Duration::from_secs(122)).await;
    assert_eq!(password(&setup.store).await.as_deref(), Some("second"));

    // One fetch per version and one write per distinct document
    assert_eq!(setup.client.get_calls(), 2);
    assert_eq!(setup.store.writes(), 2);

    stop(setup).await;
}

#[tokio::test(start_paused = true)]
async fn test_listed_change_is_written_within_one_sync_interval() {
    let config = SyncConfig {
        list_interval: Duration::from_secs(250),
        ..SyncConfig::default()
    };
    let sync_interval = config.sync_interval;
    let setup = start(config).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Lands just before the list refresh at t=250, after the sync tick at t=240
    tokio::time::sleep(Duration::from_secs(244)).await;
    setup
        .client
        .put_secret("prod/mysql", &[("team", "a")], r#"{"password":"second"}"#);

    // Next sync tick is at t=360
    tokio::time::sleep(Duration::from_secs(114)).await;
    assert_eq!(password(&setup.store).await.as_deref(), Some("first"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(password(&setup.store).await.as_deref(), Some("second"));
    assert!(Duration::from_secs(361 - 250) <= sync_interval);
    assert_eq!(setup.store.writes(), 2);

    stop(setup).await;
}

#[tokio::test(start_paused = true)]
async fn test_deleted_remote_secret_leaves_last_output() {
    let setup = start(SyncConfig::default()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    setup.client.remove_secret("prod/mysql");
    tokio::time::sleep(Duration::from_secs(420)).await;

    assert_eq!(
        setup.reconciler.state("team-a", "db-creds").await,
        Some(ReconcileState::Failed("secret-not-found".to_string()))
    );
    assert_eq!(password(&setup.store).await.as_deref(), Some("first"));

    stop(setup).await;
}
