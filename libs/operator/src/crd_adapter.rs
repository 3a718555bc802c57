//! CRD Adapter: watches `CustomResourceDefinition` objects and starts
//! or stops informers as CRDs matching the normalized config come and go.
//!
//! Grounded on the informer primitives in [`crate::informer`] — the CRD
//! watch is itself just another informer, registered under the owner key
//! `"crd-adapter"`, the same way `infraweave-io`'s operator
//! (other_examples) lists `Api<CustomResourceDefinition>` to discover its
//! own group's CRDs before watching them.

use std::collections::{HashMap, HashSet};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ResourceCatalog;
use crate::config::NormalizedConfig;
use crate::informer::InformerRegistry;
use crate::model::{FilterRule, Gvr, ResourceDescriptor};

/// `owner` key every CRD-instigated informer is registered under.
pub fn crd_owner(name: &str) -> String {
    format!("crd:{name}")
}

/// A CRD's relevant shape, extracted once per observation so the rest of
/// this module never re-parses the raw object.
struct CrdView {
    name: String,
    group: String,
    plural: String,
    kind: String,
    namespaced: bool,
    /// The single version selected by the preferred-version priority rule.
    preferred_version: Option<String>,
    /// The set of `(served && storage)` versions; used by the Updated
    /// handler to detect a restart-worthy change.
    served_storage_versions: HashSet<String>,
}

impl CrdView {
    fn from_crd(crd: &CustomResourceDefinition) -> Self {
        let stored_versions: HashSet<&str> = crd
            .status
            .as_ref()
            .and_then(|s| s.stored_versions.as_ref())
            .map(|versions| versions.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let served_storage_versions = crd
            .spec
            .versions
            .iter()
            .filter(|v| v.served && v.storage)
            .map(|v| v.name.clone())
            .collect();

        let preferred_version = preferred_version(crd, &stored_versions);

        Self {
            name: crd.metadata.name.clone().unwrap_or_default(),
            group: crd.spec.group.clone(),
            plural: crd.spec.names.plural.clone(),
            kind: crd.spec.names.kind.clone(),
            namespaced: crd.spec.scope == "Namespaced",
            preferred_version,
            served_storage_versions,
        }
    }

    fn gvr(&self) -> Option<Gvr> {
        self.preferred_version
            .as_ref()
            .map(|version| Gvr::new(self.group.clone(), version.clone(), self.plural.clone()))
    }

    /// The subset of a CRD's shape that, if changed, warrants a full
    /// stop-then-restart of its informers (the Updated rule:
    /// group, scope, plural name, or the `served ∧ storage` version set).
    fn signature(&self) -> CrdSignature {
        let mut served_storage: Vec<String> = self.served_storage_versions.iter().cloned().collect();
        served_storage.sort();
        CrdSignature {
            group: self.group.clone(),
            namespaced: self.namespaced,
            plural: self.plural.clone(),
            served_storage_versions: served_storage,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
struct CrdSignature {
    group: String,
    namespaced: bool,
    plural: String,
    served_storage_versions: Vec<String>,
}

/// Selects the preferred served version per this priority rule:
/// 1. first name in `status.storedVersions` that is also `served` in spec
/// 2. else first spec version with `storage=true && served=true`
/// 3. else first spec version with `served=true`
/// 4. else the first spec version
fn preferred_version(crd: &CustomResourceDefinition, stored_versions: &HashSet<&str>) -> Option<String> {
    let served = |name: &str| crd.spec.versions.iter().any(|v| v.name == name && v.served);

    if let Some(name) = crd
        .spec
        .versions
        .iter()
        .map(|v| v.name.as_str())
        .find(|name| stored_versions.contains(name) && served(name))
    {
        return Some(name.to_string());
    }
    if let Some(v) = crd.spec.versions.iter().find(|v| v.storage && v.served) {
        return Some(v.name.clone());
    }
    if let Some(v) = crd.spec.versions.iter().find(|v| v.served) {
        return Some(v.name.clone());
    }
    crd.spec.versions.first().map(|v| v.name.clone())
}

/// Starts informers for every rule matching `view`'s GVR, one per distinct
/// namespace named in the matching rules, under owner `crd:<crd name>`.
/// Idempotent: an already-active `(gvr, namespace)` pair is left in place.
async fn start_matching_informers(
    registry: &InformerRegistry,
    catalog: &mut ResourceCatalog,
    config: &NormalizedConfig,
    work_tx: &tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem>,
    view: &CrdView,
) {
    let Some(gvr) = view.gvr() else {
        warn!(crd = %view.name, "crd has no servable version, skipping");
        return;
    };

    let Some(rules) = config.get(&gvr) else {
        return; // No configured rules reference this GVR: nothing to watch.
    };

    let descriptor = ResourceDescriptor {
        gvr: gvr.clone(),
        kind: view.kind.clone(),
        namespaced: view.namespaced,
        watchable: true,
    };
    catalog.insert(descriptor.clone());

    let owner = crd_owner(&view.name);
    for namespace in distinct_namespaces(rules, view.namespaced) {
        let ns_opt = namespace.as_deref().filter(|ns| !ns.is_empty());
        let ns_rules: Vec<FilterRule> = rules
            .iter()
            .filter(|rule| rule.namespaces.is_empty() || rule.namespaces.iter().any(|n| Some(n.as_str()) == ns_opt || n.is_empty()))
            .cloned()
            .collect();
        if let Err(err) = registry
            .register(&owner, &descriptor, ns_opt, &ns_rules, work_tx.clone())
            .await
        {
            warn!(crd = %view.name, %gvr, error = %err, "failed to start informer for crd");
        }
    }
}

/// One namespace per entry a rule names, or a single `None` entry for a
/// cluster-scoped GVR / a namespaced GVR with no namespace restriction.
fn distinct_namespaces(rules: &[FilterRule], namespaced: bool) -> Vec<Option<String>> {
    let mut namespaces: Vec<Option<String>> = Vec::new();
    for rule in rules {
        if rule.namespaces.is_empty() {
            if !namespaces.contains(&None) {
                namespaces.push(None);
            }
        } else {
            for ns in &rule.namespaces {
                let entry = if ns.is_empty() || !namespaced { None } else { Some(ns.clone()) };
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

/// Runs the CRD Adapter's own informer loop against
/// `apiextensions.k8s.io/v1/customresourcedefinitions`, reacting to
/// Added/Updated/Deleted events by starting or stopping informers through
/// `registry`, and performing the startup reconciliation pass once the
/// initial list has synced.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: Client,
    registry: InformerRegistry,
    mut catalog: ResourceCatalog,
    config: NormalizedConfig,
    work_tx: tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem>,
    cancel: CancellationToken,
) {
    let api: Api<CustomResourceDefinition> = Api::all(client);

    let mut synced_once = false;
    let mut signatures: HashMap<String, CrdSignature> = HashMap::new();
    let stream = watcher(api.clone(), watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("crd adapter cancelled");
                return;
            }
            next = futures::StreamExt::try_next(&mut stream) => {
                match next {
                    Ok(Some(event)) => {
                        let synced = handle_event(event, &registry, &mut catalog, &config, &work_tx, &mut signatures).await;
                        if synced && !synced_once {
                            synced_once = true;
                            reconcile_startup(&api, &registry, &mut catalog, &config, &work_tx, &mut signatures).await;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => warn!(error = %err, "crd watch stream error, retrying"),
                }
            }
        }
    }
}

/// Handles one watch event, returning `true` iff this was the `InitDone`
/// marker that signals the initial CRD list has fully synced.
async fn handle_event(
    event: watcher::Event<CustomResourceDefinition>,
    registry: &InformerRegistry,
    catalog: &mut ResourceCatalog,
    config: &NormalizedConfig,
    work_tx: &tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem>,
    signatures: &mut HashMap<String, CrdSignature>,
) -> bool {
    match event {
        watcher::Event::Init => false,
        watcher::Event::InitDone => true,
        watcher::Event::InitApply(crd) | watcher::Event::Apply(crd) => {
            on_added_or_updated(&crd, registry, catalog, config, work_tx, signatures).await;
            false
        }
        watcher::Event::Delete(crd) => {
            on_deleted(&crd, registry, catalog, signatures).await;
            false
        }
    }
}

/// Handles both Added and Updated: a CRD not yet in `signatures` is
/// treated as newly Added; one whose `group`/`scope`/`plural`/
/// served-storage-version-set changed is stopped and re-added
/// (the Updated rule); anything else is a no-op, since
/// [`start_matching_informers`] is already idempotent per `(gvr,
/// namespace)`.
async fn on_added_or_updated(
    crd: &CustomResourceDefinition,
    registry: &InformerRegistry,
    catalog: &mut ResourceCatalog,
    config: &NormalizedConfig,
    work_tx: &tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem>,
    signatures: &mut HashMap<String, CrdSignature>,
) {
    let view = CrdView::from_crd(crd);
    let signature = view.signature();

    match signatures.get(&view.name) {
        Some(previous) if *previous != signature => {
            info!(crd = %view.name, "crd shape changed, restarting its informers");
            registry.stop(&crd_owner(&view.name)).await;
        }
        Some(_) => return, // unchanged: already idempotent, nothing to do
        None => info!(crd = %view.name, group = %view.group, "observed new crd"),
    }

    signatures.insert(view.name.clone(), signature);
    start_matching_informers(registry, catalog, config, work_tx, &view).await;
}

async fn on_deleted(
    crd: &CustomResourceDefinition,
    registry: &InformerRegistry,
    catalog: &mut ResourceCatalog,
    signatures: &mut HashMap<String, CrdSignature>,
) {
    let view = CrdView::from_crd(crd);
    info!(crd = %view.name, "crd deleted, stopping its informers");
    signatures.remove(&view.name);
    registry.stop(&crd_owner(&view.name)).await;
    if let Some(gvr) = view.gvr() {
        catalog.remove(&gvr);
    }
}

/// Re-lists all CRDs once the initial watch has synced and idempotently
/// starts informers for every one whose GVR has config rules but no
/// active informer yet — closes the race where a CRD pre-dates the
/// adapter's own watch.
async fn reconcile_startup(
    api: &Api<CustomResourceDefinition>,
    registry: &InformerRegistry,
    catalog: &mut ResourceCatalog,
    config: &NormalizedConfig,
    work_tx: &tokio::sync::mpsc::UnboundedSender<crate::model::WorkItem>,
    signatures: &mut HashMap<String, CrdSignature>,
) {
    let crds = match api.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(err) => {
            warn!(error = %err, "crd startup reconciliation: list failed");
            return;
        }
    };

    for crd in &crds.items {
        let view = CrdView::from_crd(crd);
        let Some(gvr) = view.gvr() else { continue };
        if !config.contains_key(&gvr) {
            continue;
        }
        signatures.entry(view.name.clone()).or_insert_with(|| view.signature());
        start_matching_informers(registry, catalog, config, work_tx, &view).await;
    }
}
