pub mod batch;
pub mod config;
pub mod events;
pub mod overlay;
pub mod providers;
pub mod provisioning;
pub mod registry;
pub mod scheduling;
pub mod state;

use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;

use crate::batch::Batcher;
use crate::config::Options;
use crate::events::EventRecorder;
use crate::overlay::store::InstanceTypeStore;
use crate::overlay::validator::OverlayValidator;
use crate::providers::fixture::FixtureProvider;
use crate::providers::CloudProvider;
use crate::provisioning::provisioner::Provisioner;
use crate::registry::Registry;
use crate::state::cluster::ClusterState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables into the runtime.
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = Arc::new(Options::from_env());
    info!(?opts, "starting autoscaler control plane");

    let registry = Registry::new();
    let cluster = Arc::new(ClusterState::new());
    let store = Arc::new(InstanceTypeStore::new());
    let events = Arc::new(EventRecorder::default());
    let batcher = Arc::new(Batcher::new(
        opts.batch_idle_duration,
        opts.batch_max_duration,
    ));
    // The in-process provider stands in until a real cloud is wired up.
    let provider: Arc<dyn CloudProvider> = Arc::new(FixtureProvider::new(Vec::new()));
    info!(node_classes = ?provider.supported_node_classes(), "cloud provider ready");

    let validator = Arc::new(OverlayValidator::new(
        registry.clone(),
        Arc::clone(&store),
        Arc::clone(&cluster),
        Arc::clone(&provider),
    ));
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&opts),
        registry.clone(),
        Arc::clone(&cluster),
        Arc::clone(&store),
        Arc::clone(&provider),
        Arc::clone(&batcher),
        Arc::clone(&events),
    ));

    // With nothing to populate the registry yet, an empty initial list is a
    // complete one.
    registry.mark_synced();
    cluster.mark_synced();

    {
        let validator = Arc::clone(&validator);
        tokio::spawn(async move { validator.run().await });
    }
    {
        let provisioner = Arc::clone(&provisioner);
        tokio::spawn(async move { provisioner.run().await });
    }

    tokio::signal::ctrl_c().await?;
    let stats = provisioner.stats();
    info!(
        passes = stats.passes,
        claims_created = stats.claims_created,
        "autoscaler stopping"
    );
    Ok(())
}
