//! Example subscriber: logs every CustomResourceDefinition lifecycle event
//! Faro observes, the way a cluster-wide schema-change auditor would.
//!
//! This lives outside `faro-core` on purpose: the CRD watcher is a
//! consumer of the engine, not a part of it — custom logic that decides
//! what to do with an event is out of scope for the engine itself.

use std::sync::Arc;

use faro_core::config::{EngineConfig, ResourceEntry, Scope};
use faro_core::dispatch::subscriber;
use faro_core::metrics::NoopMetricsSink;
use faro_core::model::EventKind;
use faro_core::Engine;
use kube::Client;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let client = Client::try_default().await?;
    let config = EngineConfig {
        resources: vec![ResourceEntry {
            gvr: "apiextensions.k8s.io/v1/customresourcedefinitions".into(),
            scope: Scope::Cluster,
            namespaces: vec![],
            name_selector: None,
            label_selector: None,
        }],
        ..Default::default()
    };

    let engine = Engine::new(client, config, Arc::new(NoopMetricsSink));
    engine
        .add_subscriber(subscriber(|event| async move {
            match event.event_kind {
                EventKind::Added => info!(name = %event.name, "new CRD installed"),
                EventKind::Updated => info!(name = %event.name, "CRD schema changed"),
                EventKind::Deleted => info!(name = %event.name, "CRD removed"),
            }
            Ok(())
        }))
        .await;

    engine.start().await?;
    tokio::signal::ctrl_c().await?;
    engine.stop().await;
    Ok(())
}
