//! Resource Catalog: discovers every GVR the cluster's API server
//! offers and records its scope and watchability.
//!
//! Per-group discovery is driven one `(group, version)` at a time via
//! `Client::{list_core_api_resources, list_api_group_resources}` — the
//! same calls `flavio-rust-client-watcher`'s example program uses to
//! resolve a single GVK — rather than `kube::discovery::Discovery::run()`,
//! which aborts the entire walk on the first group that fails. The spec's
//! failure model requires a failing group to be logged and skipped, not to
//! take the whole catalog down with it.

use std::collections::HashMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::Client;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Gvr, ResourceDescriptor};

/// Resource names that are technically watchable per their API metadata
/// but are known-problematic to watch in practice: component
/// statuses are a synthetic, non-watchable aggregate view; bindings are
/// write-only.
const EXCLUDED_RESOURCES: &[&str] = &["componentstatuses", "bindings"];

/// A snapshot of all resource descriptors known to the cluster, keyed by
/// canonical GVR. Multiple versions of the same kind are stored under
/// distinct keys; re-running `discover` never silently replaces an
/// existing entry with a same-keyed duplicate — call
/// [`ResourceCatalog::refresh`] to intentionally rebuild.
#[derive(Clone, Debug, Default)]
pub struct ResourceCatalog {
    descriptors: HashMap<Gvr, ResourceDescriptor>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries the API for all group/version pairs and the resources each
    /// exposes, one group at a time. A group or version that fails is
    /// logged at warning level and skipped; an entirely empty result
    /// after the walk is an error the engine façade surfaces to its
    /// caller.
    pub async fn discover(&mut self, client: &Client) -> Result<()> {
        let mut any_success = false;

        match client.list_core_api_versions().await {
            Ok(versions) => {
                for version in versions.versions {
                    match client.list_core_api_resources(&version).await {
                        Ok(list) => {
                            self.ingest_resource_list("", &version, list.resources);
                            any_success = true;
                        }
                        Err(err) => log_group_discovery_failure("core", &err),
                    }
                }
            }
            Err(err) => log_group_discovery_failure("core", &err),
        }

        match client.list_api_groups().await {
            Ok(groups) => {
                for group in groups.groups {
                    for version in &group.versions {
                        match client.list_api_group_resources(&version.group_version).await {
                            Ok(list) => {
                                self.ingest_resource_list(&group.name, &version.version, list.resources);
                                any_success = true;
                            }
                            Err(err) => log_group_discovery_failure(&group.name, &err),
                        }
                    }
                }
            }
            Err(err) => log_group_discovery_failure("*", &err),
        }

        if self.descriptors.is_empty() && !any_success {
            return Err(Error::ConfigError(
                "resource discovery produced an empty catalog".into(),
            ));
        }
        Ok(())
    }

    /// Inserts every non-subresource, non-excluded entry of one
    /// group/version's resource list. First observed wins on collision,
    /// matching repeated [`discover`](Self::discover) semantics.
    fn ingest_resource_list(&mut self, group: &str, version: &str, resources: Vec<APIResource>) {
        for resource in resources {
            if resource.name.contains('/') {
                // Subresource (status, scale, ...): not a standalone kind.
                continue;
            }
            if EXCLUDED_RESOURCES.contains(&resource.name.as_str()) {
                continue;
            }

            let gvr = Gvr::new(group, version, resource.name.clone());
            let watchable = resource.verbs.iter().any(|v| v == "watch" || v == "list");
            let descriptor = ResourceDescriptor {
                gvr: gvr.clone(),
                kind: resource.kind.clone(),
                namespaced: resource.namespaced,
                watchable,
            };
            self.descriptors.entry(gvr).or_insert(descriptor);
        }
    }

    /// Rebuilds the catalog from scratch, discarding any previously
    /// discovered descriptors. Used when the caller explicitly wants a
    /// fresh walk rather than the "first observed wins" merge semantics
    /// of repeated [`discover`](Self::discover) calls.
    pub async fn refresh(&mut self, client: &Client) -> Result<()> {
        self.descriptors.clear();
        self.discover(client).await
    }

    pub fn get(&self, gvr: &Gvr) -> Option<&ResourceDescriptor> {
        self.descriptors.get(gvr)
    }

    pub fn contains(&self, gvr: &Gvr) -> bool {
        self.descriptors.contains_key(gvr)
    }

    pub fn insert(&mut self, descriptor: ResourceDescriptor) {
        self.descriptors.entry(descriptor.gvr.clone()).or_insert(descriptor);
    }

    pub fn remove(&mut self, gvr: &Gvr) {
        self.descriptors.remove(gvr);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Logs a per-group discovery problem without aborting the overall walk.
fn log_group_discovery_failure(group: &str, err: &kube::Error) {
    warn!(group, error = %err, "resource discovery failed for api group, continuing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_known_problematic_resources() {
        assert!(EXCLUDED_RESOURCES.contains(&"componentstatuses"));
        assert!(EXCLUDED_RESOURCES.contains(&"bindings"));
    }

    #[test]
    fn ingest_resource_list_skips_subresources_and_excluded() {
        let mut catalog = ResourceCatalog::new();
        catalog.ingest_resource_list(
            "apps",
            "v1",
            vec![
                APIResource {
                    name: "deployments".into(),
                    kind: "Deployment".into(),
                    namespaced: true,
                    verbs: vec!["list".into(), "watch".into()],
                    ..Default::default()
                },
                APIResource {
                    name: "deployments/status".into(),
                    kind: "Deployment".into(),
                    namespaced: true,
                    verbs: vec!["get".into(), "update".into()],
                    ..Default::default()
                },
            ],
        );
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(&Gvr::new("apps", "v1", "deployments")).unwrap().watchable);
    }

    #[test]
    fn first_insert_wins_on_collision() {
        let mut catalog = ResourceCatalog::new();
        let gvr = Gvr::new("apps", "v1", "deployments");
        catalog.insert(ResourceDescriptor {
            gvr: gvr.clone(),
            kind: "Deployment".into(),
            namespaced: true,
            watchable: true,
        });
        catalog.insert(ResourceDescriptor {
            gvr: gvr.clone(),
            kind: "Deployment".into(),
            namespaced: false,
            watchable: false,
        });
        assert!(catalog.get(&gvr).unwrap().namespaced);
    }

    #[test]
    fn remove_deletes_descriptor() {
        let mut catalog = ResourceCatalog::new();
        let gvr = Gvr::new("example.com", "v1", "widgets");
        catalog.insert(ResourceDescriptor {
            gvr: gvr.clone(),
            kind: "Widget".into(),
            namespaced: true,
            watchable: true,
        });
        assert!(catalog.contains(&gvr));
        catalog.remove(&gvr);
        assert!(!catalog.contains(&gvr));
    }
}
