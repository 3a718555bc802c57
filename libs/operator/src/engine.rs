//! Engine Façade: the single entry point embedders construct,
//! start, subscribe to, and stop.
//!
//! A cheap, `Clone`-able handle shared between whatever drives the
//! background work and whatever reads its status, built around one
//! façade that owns every other component. The
//! `Created → Starting → Ready → Stopping → Stopped` state machine and
//! the bounded shutdown wait are built from `tokio::sync::RwLock` for
//! shared state, `tokio_util::sync::CancellationToken` for the root
//! cancellation, and `tokio::sync::OnceCell` for the "fire the ready
//! callback exactly once" rule.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::ResourceCatalog;
use crate::config::{self, EngineConfig, NormalizedConfig};
use crate::crd_adapter;
use crate::dispatch::{event_file_path, Dispatcher, JsonSink, Subscriber};
use crate::error::{Error, Result};
use crate::informer::InformerRegistry;
use crate::metrics::MetricsSink;
use crate::model::{FilterRule, Gvr, ResourceDescriptor};
use crate::queue::{run_worker_pool, WorkQueue};
use crate::reconcile::Reconciler;

/// Default worker pool size.
const DEFAULT_WORKER_COUNT: usize = 3;

/// Upper bound `Stop()` waits for background tasks before giving up and
/// returning anyway, logging a warning.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

struct Tasks {
    crd_adapter: Option<JoinHandle<()>>,
    workers: Option<JoinHandle<()>>,
}

/// The engine's owned, mutable runtime state, guarded by one
/// `tokio::sync::RwLock`.
struct Inner {
    state: EngineState,
    normalized: NormalizedConfig,
    tasks: Tasks,
}

/// The single entry point for embedding Faro: construct with
/// [`Engine::new`], register subscribers, call [`Engine::start`], and
/// [`Engine::stop`] when done.
#[derive(Clone)]
pub struct Engine {
    client: Client,
    raw_config: EngineConfig,
    catalog: Arc<RwLock<ResourceCatalog>>,
    registry: InformerRegistry,
    queue: WorkQueue,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<dyn MetricsSink>,
    inner: Arc<RwLock<Inner>>,
    cancel: CancellationToken,
    ready_once: Arc<OnceCell<()>>,
    ready_callback: Arc<Mutex<Option<ReadyCallback>>>,
    worker_count: usize,
}

impl Engine {
    /// Constructs an engine from an already-configured API client, a
    /// parsed configuration value, and a metrics sink. Loading
    /// configuration from disk and formatting log output are the
    /// caller's concern; this only accepts already-resolved
    /// Rust values.
    pub fn new(client: Client, config: EngineConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let registry = InformerRegistry::new(client.clone(), metrics.clone());
        let dispatcher = Arc::new(Dispatcher::new(metrics.clone()));
        Self {
            client,
            raw_config: config,
            catalog: Arc::new(RwLock::new(ResourceCatalog::new())),
            registry,
            queue: WorkQueue::new(metrics.clone()),
            dispatcher,
            metrics,
            inner: Arc::new(RwLock::new(Inner {
                state: EngineState::Created,
                normalized: NormalizedConfig::default(),
                tasks: Tasks {
                    crd_adapter: None,
                    workers: None,
                },
            })),
            cancel: CancellationToken::new(),
            ready_once: Arc::new(OnceCell::new()),
            ready_callback: Arc::new(Mutex::new(None)),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }

    /// Opens the JSON event sink at `<outputDir>/events.jsonl` if
    /// `jsonExport` is set in the configuration, wiring it into the
    /// dispatcher before `Start` is called. A no-op if `jsonExport` is
    /// false or no engine has been constructed with a sink yet.
    pub async fn with_json_export(mut self) -> std::io::Result<Self> {
        if !self.raw_config.json_export {
            return Ok(self);
        }
        let dir = self.raw_config.output_dir.clone().unwrap_or_else(|| ".".to_string());
        let path: PathBuf = event_file_path(&dir);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sink = JsonSink::open(&path).await?;
        let metrics = self.metrics.clone();
        self.dispatcher = Arc::new(Dispatcher::new(metrics).with_json_sink(sink));
        Ok(self)
    }

    /// Registers an in-process subscriber. Callable at any engine state;
    /// subscribers added after `Start` simply receive events from then on.
    pub async fn add_subscriber(&self, handler: Subscriber) {
        self.dispatcher.add_subscriber(handler).await;
    }

    /// Registers a callback fired exactly once, the moment the engine
    /// enters `Ready`. Idempotent: if the engine is already `Ready`, the
    /// callback fires immediately instead of being queued.
    pub async fn set_ready_callback<F: FnOnce() + Send + 'static>(&self, callback: F) {
        if self.ready_once.initialized() {
            callback();
            return;
        }
        *self.ready_callback.lock().await = Some(Box::new(callback));
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.state == EngineState::Ready
    }

    pub async fn state(&self) -> EngineState {
        self.inner.read().await.state
    }

    /// Runs the startup sequence: discover
    /// resources, normalize the configuration if not already
    /// normalized, start one informer per `(gvr, namespace)` demanded by
    /// the normalized config (owner `"config"`), start the worker
    /// pool, and start the CRD adapter. On success the
    /// engine enters `Ready` and fires the ready callback exactly once.
    pub async fn start(&self) -> Result<()> {
        self.set_state(EngineState::Starting).await;

        let normalized = match config::normalize(&self.raw_config) {
            Ok(normalized) => normalized,
            Err(err) => {
                self.set_state(EngineState::Failed).await;
                return Err(err);
            }
        };

        if let Err(err) = self.catalog.write().await.discover(&self.client).await {
            self.set_state(EngineState::Failed).await;
            return Err(err);
        }

        {
            let mut inner = self.inner.write().await;
            inner.normalized = normalized.clone();
        }

        for (gvr, rules) in &normalized {
            self.start_informers_for(gvr, rules).await?;
        }

        let worker_handle = {
            let queue = self.queue.clone();
            let reconciler = Reconciler::new(self.registry.clone(), self.dispatcher.clone(), self.metrics.clone());
            let worker_count = self.worker_count;
            tokio::spawn(async move {
                run_worker_pool(queue, worker_count, move |item| {
                    let reconciler = reconciler.clone();
                    async move { reconciler.reconcile(item).await }
                })
                .await;
            })
        };

        let crd_adapter_handle = {
            let client = self.client.clone();
            let registry = self.registry.clone();
            let catalog = (*self.catalog.read().await).clone();
            let normalized = normalized.clone();
            let work_tx = self.queue_sender();
            let cancel = self.cancel.child_token();
            tokio::spawn(crd_adapter::run(client, registry, catalog, normalized, work_tx, cancel))
        };

        {
            let mut inner = self.inner.write().await;
            inner.tasks.workers = Some(worker_handle);
            inner.tasks.crd_adapter = Some(crd_adapter_handle);
        }

        self.set_state(EngineState::Ready).await;
        let _ = self.ready_once.set(());
        if let Some(callback) = self.ready_callback.lock().await.take() {
            callback();
        }
        self.metrics.set_active_informers(self.registry.active_count().await as i64);
        Ok(())
    }

    /// Adds further filter rules at runtime. Only callable
    /// once the engine is `Ready`. Already-active `(gvr, namespace)` pairs
    /// are silently skipped — calling this twice with the same rules must
    /// not double-create informers or double-deliver events.
    pub async fn add_resources(&self, rules: impl IntoIterator<Item = FilterRule>) -> Result<()> {
        if !self.is_ready().await {
            return Err(Error::InvalidEngineState {
                state: format!("{:?}", self.state().await),
                action: "AddResources".to_string(),
            });
        }

        let mut additions: NormalizedConfig = NormalizedConfig::default();
        for rule in rules {
            additions.entry(rule.gvr.clone()).or_default().push(rule);
        }

        {
            let mut inner = self.inner.write().await;
            for (gvr, rules) in &additions {
                let entry = inner.normalized.entry(gvr.clone()).or_default();
                for rule in rules {
                    if !entry.contains(rule) {
                        entry.push(rule.clone());
                    }
                }
            }
        }

        let snapshot = self.inner.read().await.normalized.clone();
        for (gvr, _) in &additions {
            if let Some(rules) = snapshot.get(gvr) {
                self.start_informers_for(gvr, rules).await?;
            }
        }
        Ok(())
    }

    /// Cancels the root token, shuts the queue down, and waits up to
    /// [`SHUTDOWN_TIMEOUT`] for every background task to finish. Logs a
    /// warning and returns regardless if the bound is exceeded.
    pub async fn stop(&self) {
        self.set_state(EngineState::Stopping).await;
        self.cancel.cancel();
        self.registry.stop_all().await;
        self.queue.shutdown();

        let (crd_adapter, workers) = {
            let mut inner = self.inner.write().await;
            (inner.tasks.crd_adapter.take(), inner.tasks.workers.take())
        };

        let join_all = async {
            if let Some(handle) = crd_adapter {
                let _ = handle.await;
            }
            if let Some(handle) = workers {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
            warn!("engine stop exceeded shutdown timeout, returning anyway");
        }
        self.set_state(EngineState::Stopped).await;
    }

    async fn set_state(&self, state: EngineState) {
        self.inner.write().await.state = state;
        info!(?state, "engine state transition");
    }

    /// Starts informers for every distinct namespace `rules` names, with
    /// the resource descriptor taken from the catalog. Resources not in
    /// the catalog (not yet discovered, or a CRD whose own informer
    /// hasn't produced its descriptor yet) are skipped with a warning —
    /// the CRD adapter's startup reconciliation is what catches these.
    async fn start_informers_for(&self, gvr: &Gvr, rules: &[FilterRule]) -> Result<()> {
        let descriptor = {
            let catalog = self.catalog.read().await;
            catalog.get(gvr).cloned()
        };
        let Some(descriptor) = descriptor else {
            warn!(%gvr, "no catalog entry for configured gvr yet, skipping for now");
            return Ok(());
        };

        for namespace in namespaces_for(&descriptor, rules) {
            let ns_rules = rules_for_namespace(rules, namespace.as_deref());
            self.registry
                .register("config", &descriptor, namespace.as_deref(), &ns_rules, self.queue_sender())
                .await?;
        }
        Ok(())
    }

    fn queue_sender(&self) -> tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                queue.enqueue(item).await;
            }
        });
        tx
    }
}

fn namespaces_for(descriptor: &ResourceDescriptor, rules: &[FilterRule]) -> Vec<Option<String>> {
    if !descriptor.namespaced {
        return vec![None];
    }
    let mut namespaces: Vec<Option<String>> = Vec::new();
    for rule in rules {
        if rule.namespaces.is_empty() {
            if !namespaces.contains(&None) {
                namespaces.push(None);
            }
        } else {
            for ns in &rule.namespaces {
                let entry = if ns.is_empty() { None } else { Some(ns.clone()) };
                if !namespaces.contains(&entry) {
                    namespaces.push(entry);
                }
            }
        }
    }
    if namespaces.is_empty() {
        namespaces.push(None);
    }
    namespaces
}

/// Narrows `rules` (all the rules configured for a gvr) down to the ones
/// that actually apply to `namespace`, mirroring `crd_adapter`'s
/// per-namespace filter. A rule with no `namespaces` applies everywhere;
/// otherwise it applies only to the namespaces it names (an empty-string
/// entry is the cluster-scoped sentinel).
fn rules_for_namespace(rules: &[FilterRule], namespace: Option<&str>) -> Vec<FilterRule> {
    rules
        .iter()
        .filter(|rule| {
            rule.namespaces.is_empty()
                || rule
                    .namespaces
                    .iter()
                    .any(|n| n.is_empty() || Some(n.as_str()) == namespace)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamespaceEntry, ResourceSelector};
    use crate::metrics::NoopMetricsSink;
    use std::collections::HashMap;

    fn test_client() -> Client {
        let (client, _handle) =
            tower_test::mock::pair::<http::Request<kube::client::Body>, http::Response<kube::client::Body>>();
        Client::new(client, "default")
    }

    fn simple_config() -> EngineConfig {
        let mut resources = HashMap::new();
        resources.insert(
            "v1/configmaps".to_string(),
            ResourceSelector {
                name_selector: None,
                label_selector: Some("app=faro-test".into()),
            },
        );
        EngineConfig {
            namespaces: vec![NamespaceEntry {
                namespace: "t3".to_string(),
                resources,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn engine_starts_in_created_state() {
        let engine = Engine::new(test_client(), simple_config(), Arc::new(NoopMetricsSink));
        assert_eq!(engine.state().await, EngineState::Created);
        assert!(!engine.is_ready().await);
    }

    #[tokio::test]
    async fn ready_callback_fires_immediately_if_already_ready() {
        let engine = Engine::new(test_client(), simple_config(), Arc::new(NoopMetricsSink));
        engine.inner.write().await.state = EngineState::Ready;
        let _ = engine.ready_once.set(());

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        engine
            .set_ready_callback(move || fired_clone.store(true, std::sync::atomic::Ordering::SeqCst))
            .await;
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn add_resources_rejected_before_ready() {
        let engine = Engine::new(test_client(), simple_config(), Arc::new(NoopMetricsSink));
        let rule = FilterRule {
            gvr: Gvr::new("", "v1", "pods"),
            namespaces: vec!["default".into()],
            name_selector: None,
            label_selector: None,
        };
        let result = engine.add_resources(vec![rule]).await;
        assert!(result.is_err());
    }

    #[test]
    fn namespaces_for_cluster_scoped_ignores_rule_namespaces() {
        let descriptor = ResourceDescriptor {
            gvr: Gvr::new("", "v1", "namespaces"),
            kind: "Namespace".into(),
            namespaced: false,
            watchable: true,
        };
        let rule = FilterRule {
            gvr: descriptor.gvr.clone(),
            namespaces: vec!["".into()],
            name_selector: Some("faro-test-5".into()),
            label_selector: None,
        };
        assert_eq!(namespaces_for(&descriptor, &[rule]), vec![None]);
    }

    #[test]
    fn namespaces_for_namespaced_dedupes_across_rules() {
        let descriptor = ResourceDescriptor {
            gvr: Gvr::new("batch", "v1", "jobs"),
            kind: "Job".into(),
            namespaced: true,
            watchable: true,
        };
        let rules = vec![
            FilterRule {
                gvr: descriptor.gvr.clone(),
                namespaces: vec!["a".into(), "b".into()],
                name_selector: None,
                label_selector: None,
            },
            FilterRule {
                gvr: descriptor.gvr.clone(),
                namespaces: vec!["b".into(), "c".into()],
                name_selector: None,
                label_selector: None,
            },
        ];
        assert_eq!(namespaces_for(&descriptor, &rules).len(), 3);
    }

    #[test]
    fn rules_for_namespace_scopes_to_the_matching_rule_only() {
        let gvr = Gvr::new("", "v1", "configmaps");
        let ns1_rule = FilterRule {
            gvr: gvr.clone(),
            namespaces: vec!["ns1".into()],
            name_selector: None,
            label_selector: Some("a".into()),
        };
        let ns2_rule = FilterRule {
            gvr: gvr.clone(),
            namespaces: vec!["ns2".into()],
            name_selector: None,
            label_selector: Some("b".into()),
        };
        let rules = vec![ns1_rule.clone(), ns2_rule.clone()];

        assert_eq!(rules_for_namespace(&rules, Some("ns1")), vec![ns1_rule]);
        assert_eq!(rules_for_namespace(&rules, Some("ns2")), vec![ns2_rule]);
        assert!(rules_for_namespace(&rules, Some("ns3")).is_empty());
    }

    #[test]
    fn rules_for_namespace_keeps_rules_with_no_namespace_restriction() {
        let gvr = Gvr::new("", "v1", "configmaps");
        let open_rule = FilterRule {
            gvr: gvr.clone(),
            namespaces: vec![],
            name_selector: None,
            label_selector: Some("app=faro".into()),
        };
        assert_eq!(rules_for_namespace(std::slice::from_ref(&open_rule), Some("any-ns")), vec![open_rule]);
    }
}
