//! Example subscriber: watches Deployments across every namespace and
//! flags ones that disappear while still carrying a `tier=critical` label,
//! the kind of "workload went away unexpectedly" detector the engine stays
//! agnostic to and leaves for a consumer to implement.

use std::sync::Arc;

use faro_core::config::{EngineConfig, ResourceEntry, Scope};
use faro_core::dispatch::subscriber;
use faro_core::metrics::NoopMetricsSink;
use faro_core::model::EventKind;
use faro_core::Engine;
use kube::Client;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let client = Client::try_default().await?;
    let config = EngineConfig {
        resources: vec![ResourceEntry {
            gvr: "apps/v1/deployments".into(),
            scope: Scope::Namespaced,
            namespaces: vec![],
            name_selector: None,
            label_selector: Some("tier=critical".into()),
        }],
        ..Default::default()
    };

    let engine = Engine::new(client, config, Arc::new(NoopMetricsSink));
    engine
        .add_subscriber(subscriber(|event| async move {
            let key = event.key();
            match event.event_kind {
                EventKind::Deleted => warn!(%key, "critical deployment disappeared"),
                EventKind::Added => info!(%key, "critical deployment is now being watched"),
                EventKind::Updated => info!(%key, "critical deployment changed"),
            }
            Ok(())
        }))
        .await;

    engine.start().await?;
    tokio::signal::ctrl_c().await?;
    engine.stop().await;
    Ok(())
}
