//! Baler - Kubernetes node disruption engine

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use baler::config::{FeatureGates, Settings};
use baler::controller::{run_node_watcher, run_pod_watcher, run_termination_scanner, KubeNodeOps, KubePoolSource};
use baler::crd::NodePool;
use baler::disruption::{collect_orphans, DriftDetector, Orchestrator, PoolSource};
use baler::events::KubeEventRecorder;
use baler::interruption::{InMemoryQueue, Ingestor};
use baler::provider::{CloudProvider, FakeCloudProvider, UnavailableOfferings};
use baler::state::Cluster;
use baler::termination::Terminator;

/// Baler - consolidates, replaces, and drains controller-owned worker nodes
#[derive(Parser, Debug)]
#[command(name = "baler", version, about, long_about = None)]
struct Cli {
    /// Generate the NodePool CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Name of the cluster this engine owns nodes in
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Interruption queue name; enables the forceful ingestion path
    #[arg(long, env = "INTERRUPTION_QUEUE")]
    interruption_queue: Option<String>,

    /// Feature gates, e.g. "spotToSpotConsolidation=true,nodeRepair=false"
    #[arg(long, env = "FEATURE_GATES", default_value = "")]
    feature_gates: String,

    /// Seconds between orchestrator ticks
    #[arg(long, default_value = "10")]
    polling_period_secs: u64,

    /// Quiescence seconds required after a scale event before consolidating
    #[arg(long, default_value = "300")]
    stabilization_window_secs: u64,

    /// Minimum cheaper spot types required for spot-to-spot replacement
    #[arg(long, default_value = "15")]
    spot_flex_min: usize,

    /// Cap on instance-type options passed per launch request
    #[arg(long, default_value = "20")]
    max_instance_types: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&NodePool::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    let settings = Settings {
        cluster_name: cli.cluster_name.unwrap_or_default(),
        polling_period: Duration::from_secs(cli.polling_period_secs),
        stabilization_window: Duration::from_secs(cli.stabilization_window_secs),
        spot_flex_min: cli.spot_flex_min,
        max_instance_types: cli.max_instance_types,
        interruption_queue: cli.interruption_queue,
        feature_gates: FeatureGates::parse(&cli.feature_gates)?,
        ..Default::default()
    };
    settings.validate()?;

    let client = Client::try_default().await?;
    tracing::info!(cluster = %settings.cluster_name, "starting baler");

    let cancel = CancellationToken::new();
    let cluster = Arc::new(Cluster::new());
    let node_ops = Arc::new(KubeNodeOps::new(client.clone()));
    let pool_source: Arc<dyn PoolSource> = Arc::new(KubePoolSource::new(client.clone()));
    let recorder = Arc::new(KubeEventRecorder::new(client.clone(), "baler"));
    let unavailable = Arc::new(UnavailableOfferings::default());

    // The in-tree provider serves local development; production distributions
    // wire a real adapter here.
    let provider: Arc<dyn CloudProvider> = Arc::new(FakeCloudProvider::new());
    tracing::warn!("using the in-tree fake cloud provider; launches are simulated");

    let mut workers = Vec::new();

    workers.push(tokio::spawn(run_node_watcher(
        client.clone(),
        cluster.clone(),
        cancel.clone(),
    )));
    workers.push(tokio::spawn(run_pod_watcher(
        client.clone(),
        cluster.clone(),
        cancel.clone(),
    )));

    let terminator = Arc::new(Terminator::new(
        cluster.clone(),
        node_ops.clone(),
        provider.clone(),
        pool_source.clone(),
    ));
    workers.push(tokio::spawn(run_termination_scanner(
        cluster.clone(),
        terminator,
        cancel.clone(),
    )));

    // drift detection sweeps the fleet once a minute
    let drift = DriftDetector::new(
        cluster.clone(),
        provider.clone(),
        true,
    );
    {
        let pool_source = pool_source.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
                match pool_source.pools().await {
                    Ok(pools) => {
                        if let Err(e) = drift.detect(&pools).await {
                            tracing::warn!(error = %e, "drift detection failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "listing pools for drift failed"),
                }
            }
        }));
    }

    if settings.interruption_enabled() {
        // the in-tree queue backs local development; the distribution wires
        // the real queue adapter next to the cloud provider
        tracing::info!(
            queue = settings.interruption_queue.as_deref().unwrap_or_default(),
            "interruption ingestion enabled"
        );
        let ingestor = Ingestor::new(
            cluster.clone(),
            Arc::new(InMemoryQueue::new()),
            node_ops.clone(),
            recorder.clone(),
            cancel.clone(),
        );
        workers.push(tokio::spawn(ingestor.run()));
    }

    let orchestrator = Orchestrator::new(
        cluster.clone(),
        node_ops.clone(),
        pool_source.clone(),
        provider.clone(),
        recorder.clone(),
        unavailable.clone(),
        settings.clone(),
        cancel.clone(),
    );
    workers.push(tokio::spawn(orchestrator.run()));

    // orphaned instances are swept every five minutes
    {
        let cluster = cluster.clone();
        let pool_source = pool_source.clone();
        let provider = provider.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                }
                if let Err(e) =
                    collect_orphans(&cluster, pool_source.as_ref(), provider.as_ref()).await
                {
                    tracing::warn!(error = %e, "orphan collection failed");
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("baler stopped");
    Ok(())
}
