mod settings;

use anyhow::Context;
use clap::Parser;
use futures::TryStreamExt;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use secrets_sync::crd::SyncedSecret;
use secrets_sync::kube_adapters::{KubeNamespacePolicies, KubeSecretStore};
use secrets_sync::providers::AwsSecretsManagerClient;
use secrets_sync::{metrics, runtime, Reconciler, SecretCache};
use settings::{LogFormat, Settings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::parse();

    if settings.print_crd {
        print!("{}", serde_yaml::to_string(&SyncedSecret::crd())?);
        return Ok(());
    }

    init_tracing(settings.log_format);

    let config = settings.to_config();
    config.validate().context("invalid configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        list_interval_secs = config.list_interval.as_secs(),
        sync_interval_secs = config.sync_interval.as_secs(),
        max_propagation_secs = config.max_propagation_delay().as_secs(),
        "Starting secrets sync controller"
    );

    PrometheusBuilder::new()
        .with_http_listener(settings.metrics_addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    metrics::describe_metrics();
    info!(addr = %settings.metrics_addr, "Metrics exporter listening");

    let remote = AwsSecretsManagerClient::new(&config.provider)
        .await
        .context("failed to configure AWS Secrets Manager client")?;
    let kube_client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let cache = Arc::new(SecretCache::new(Arc::new(remote), config.cache.max_entries));
    let reconciler = Arc::new(Reconciler::new(
        cache.clone(),
        Arc::new(KubeNamespacePolicies::new(
            kube_client.clone(),
            config.namespace_annotation.clone(),
        )),
        Arc::new(KubeSecretStore::new(kube_client.clone())),
        &config,
    ));

    let shutdown = CancellationToken::new();
    let watch = tokio::spawn(watch_synced_secrets(
        kube_client,
        reconciler.clone(),
        shutdown.clone(),
    ));
    let (list, sync) = runtime::spawn(cache, reconciler, &config, shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    let (watch, list, sync) = tokio::join!(watch, list, sync);
    for result in [watch, list, sync] {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Secrets sync controller stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "secrets_sync=info,secrets_sync_controller=info,kube=warn,aws_config=warn".into()
    });

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init(),
    }
}

/// Feed SyncedSecret watch events into the reconciler until shutdown.
async fn watch_synced_secrets(
    client: Client,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
) {
    let api: Api<SyncedSecret> = Api::all(client);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(events);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.try_next() => match event {
                Ok(Some(Event::Applied(object))) => reconciler.apply(&object).await,
                Ok(Some(Event::Deleted(object))) => {
                    if let Some(namespace) = object.namespace() {
                        reconciler.remove(&namespace, &object.name_any()).await;
                    }
                }
                Ok(Some(Event::Restarted(objects))) => {
                    info!(count = objects.len(), "SyncedSecret watch (re)started");
                    reconciler.restart(&objects).await;
                }
                Ok(None) => {
                    warn!("SyncedSecret watch stream ended");
                    break;
                }
                Err(e) => warn!(error = %e, "SyncedSecret watch error"),
            }
        }
    }
}
