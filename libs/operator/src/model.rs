//! Core data types shared by every component: the GVR identifier, the
//! resource catalog's descriptor, the configuration normalizer's filter
//! rules, informer bookkeeping, work-queue items and the normalized event
//! that eventually reaches subscribers and the JSON sink.
//!
//! These are plain product/sum types rather than anything reflection-based
//! — a `FilterRule` is a concrete struct, not a dynamically-typed bag of
//! selectors, and an event's lifecycle is a closed `EventKind` enum.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A group/version/resource identifier, e.g. `apps/v1/deployments` or
/// `v1/pods` for the core group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// The `group/version/resource` string used everywhere as a map key and
    /// lister-cache key prefix. The core group renders without a leading
    /// slash, e.g. `v1/pods` rather than `/v1/pods`.
    pub fn canonical(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether this GVR is the legacy `v1/events` carve-out.
    pub fn is_legacy_core_event(&self) -> bool {
        self.group.is_empty() && self.version == "v1" && self.resource == "events"
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A resource kind discovered in the cluster's API, as produced by the
/// Resource Catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub gvr: Gvr,
    pub kind: String,
    pub namespaced: bool,
    /// Whether this resource supports `list`+`watch` and is therefore a
    /// candidate for an informer. Subresources (`status`, `scale`, ...) and
    /// the fixed exclusion set are never watchable.
    pub watchable: bool,
}

/// A single normalized filter rule as produced by the Configuration
/// Normalizer: one GVR maps to zero or more of these.
///
/// `namespaces`: an empty list means "every
/// namespace"; for cluster-scoped GVRs normalization sets it to `[""]`,
/// the one internal use of the empty-string sentinel, which downstream
/// treats identically to "no namespace scoping".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub gvr: Gvr,
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Exact-match name filter. Glob/regex metacharacters are rejected at
    /// normalization time rather than silently ignored.
    #[serde(default)]
    pub name_selector: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

impl FilterRule {
    /// `namespaces` empty, or containing only the `""` sentinel, matches
    /// any namespace (including `None` for cluster-scoped objects).
    pub fn matches_namespace(&self, namespace: Option<&str>) -> bool {
        if self.namespaces.is_empty() || self.namespaces.iter().all(|n| n.is_empty()) {
            return true;
        }
        match namespace {
            Some(ns) => self.namespaces.iter().any(|n| n == ns),
            None => false,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match &self.name_selector {
            Some(selector) => selector == name,
            None => true,
        }
    }

    /// The field selector this rule maps to, if a single exact name is set.
    pub fn field_selector(&self) -> Option<String> {
        self.name_selector
            .as_ref()
            .map(|name| format!("metadata.name={name}"))
    }
}

/// Bookkeeping record for one running informer, tracked by the Informer
/// Registry. `owner` identifies who asked for the watch (`"config"`,
/// or `"crd:<crd name>"` for a CRD-adapter-initiated watch, or
/// `"crd-adapter"` for the CRD adapter's own CRD watch).
#[derive(Clone, Debug)]
pub struct InformerRecord {
    pub owner: String,
    pub gvr: Gvr,
    pub namespace: Option<String>,
    pub started_at: DateTime<Utc>,
    pub synced: bool,
}

impl InformerRecord {
    /// The key this record is stored and looked up under:
    /// `"<gvr>@<namespace>"`, or `"<gvr>@"` for cluster-scoped / all-namespace
    /// watches. See DESIGN.md for why this mirrors a plain cache key rather
    /// than a `kube::runtime::reflector::ObjectRef`-based store.
    pub fn key(&self) -> String {
        lister_key(&self.gvr, self.namespace.as_deref())
    }
}

/// Builds the `"<gvr>@<namespace>"` lister/informer key. `namespace = None`
/// renders as `"<gvr>@"`, used both for cluster-scoped resources and for
/// namespace-wide watches.
pub fn lister_key(gvr: &Gvr, namespace: Option<&str>) -> String {
    format!("{}@{}", gvr.canonical(), namespace.unwrap_or(""))
}

/// The kind of lifecycle transition an object went through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One unit of work enqueued by a watch loop and drained by the worker
/// pool. `key` is the object's `namespace/name` (or just `name` for
/// cluster-scoped objects), matching the dedup/lister key scheme.
///
/// `rules` are the filter rules that produced the watcher that emitted
/// this item; they ride along for the Reconciler's namespace filtering
/// step but deliberately do not participate in equality/hashing — the
/// dedup/retry identity of a work item is `(gvr, key, eventKind)` alone,
/// so two enqueues of the same key collapse even if the
/// matching rule set happens to differ in some unrelated field.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub gvr: Gvr,
    pub key: String,
    pub event_kind: EventKind,
    pub rules: Vec<FilterRule>,
}

impl WorkItem {
    pub fn new(gvr: Gvr, key: impl Into<String>, event_kind: EventKind) -> Self {
        Self {
            gvr,
            key: key.into(),
            event_kind,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<FilterRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        match self.key.split_once('/') {
            Some((_, name)) => name,
            None => &self.key,
        }
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.gvr == other.gvr && self.key == other.key && self.event_kind == other.event_kind
    }
}

impl Eq for WorkItem {}

impl std::hash::Hash for WorkItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.gvr.hash(state);
        self.key.hash(state);
        self.event_kind.hash(state);
    }
}

/// The reconciled, in-process representation of an event, built by the
/// Reconciler and handed to the Dispatcher.
#[derive(Clone, Debug)]
pub struct NormalizedEvent {
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    pub gvr: Gvr,
    pub namespace: Option<String>,
    pub name: String,
    /// Only present if the informer surfaced a tombstone; in
    /// practice `kube-rs` delivers the last-known object directly on
    /// delete, so this is populated whenever `object` is, and absent only
    /// for the minimal shell built when the object has fully vanished from
    /// the cache — see DESIGN.md.
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// For Deleted events this may be a minimal shell containing only
    /// `{namespace, name}` when the cached copy is gone.
    pub object: Option<serde_json::Value>,
}

impl NormalizedEvent {
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// Projects this event into the JSON shape written to the event file
    /// and handed to in-process subscribers, including the
    /// legacy `v1/events` core-Event carve-out fields when applicable.
    pub fn to_json_event(&self) -> JsonEvent {
        let (reason, message, involved_object, event_type) = if self.gvr.is_legacy_core_event() {
            let obj = self.object.as_ref();
            (
                obj.and_then(|o| o.get("reason")).and_then(|v| v.as_str()).map(String::from),
                obj.and_then(|o| o.get("message")).and_then(|v| v.as_str()).map(String::from),
                obj.and_then(|o| o.get("involvedObject")).cloned(),
                obj.and_then(|o| o.get("type")).and_then(|v| v.as_str()).map(String::from),
            )
        } else {
            (None, None, None, None)
        };

        JsonEvent {
            timestamp: self.timestamp,
            event_type: self.event_kind,
            gvr: self.gvr.canonical(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            resource_version: self.resource_version.clone(),
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
            involved_object,
            reason,
            message,
            r#type: event_type,
        }
    }
}

/// The JSON-serializable projection of a [`NormalizedEvent`], written one
/// per line to the event file and passed to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "eventType")]
    pub event_type: EventKind,
    pub gvr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "involvedObject", skip_serializing_if = "Option::is_none")]
    pub involved_object: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_renders_core_group_without_leading_segment() {
        let gvr = Gvr::new("", "v1", "pods");
        assert_eq!(gvr.canonical(), "v1/pods");
        assert_eq!(gvr.api_version(), "v1");
    }

    #[test]
    fn canonical_renders_named_group() {
        let gvr = Gvr::new("apps", "v1", "deployments");
        assert_eq!(gvr.canonical(), "apps/v1/deployments");
        assert_eq!(gvr.api_version(), "apps/v1");
    }

    #[test]
    fn lister_key_falls_back_to_empty_namespace() {
        let gvr = Gvr::new("apps", "v1", "deployments");
        assert_eq!(lister_key(&gvr, Some("default")), "apps/v1/deployments@default");
        assert_eq!(lister_key(&gvr, None), "apps/v1/deployments@");
    }

    #[test]
    fn filter_rule_empty_namespaces_matches_any() {
        let rule = FilterRule {
            gvr: Gvr::new("", "v1", "pods"),
            namespaces: vec![],
            name_selector: None,
            label_selector: None,
        };
        assert!(rule.matches_namespace(Some("default")));
        assert!(rule.matches_namespace(None));
    }

    #[test]
    fn filter_rule_sentinel_namespace_matches_any() {
        let rule = FilterRule {
            gvr: Gvr::new("", "v1", "namespaces"),
            namespaces: vec!["".to_string()],
            name_selector: Some("faro-test-5".into()),
            label_selector: None,
        };
        assert!(rule.matches_namespace(None));
    }

    #[test]
    fn filter_rule_name_selector_is_exact_match() {
        let rule = FilterRule {
            gvr: Gvr::new("", "v1", "pods"),
            namespaces: vec![],
            name_selector: Some("web-0".into()),
            label_selector: None,
        };
        assert!(rule.matches_name("web-0"));
        assert!(!rule.matches_name("web-1"));
        assert_eq!(rule.field_selector().as_deref(), Some("metadata.name=web-0"));
    }

    #[test]
    fn work_item_key_splits_namespace_and_name() {
        let item = WorkItem::new(Gvr::new("", "v1", "pods"), "default/web-0", EventKind::Added);
        assert_eq!(item.namespace(), Some("default"));
        assert_eq!(item.name(), "web-0");

        let cluster_item = WorkItem::new(Gvr::new("", "v1", "nodes"), "node-a", EventKind::Added);
        assert_eq!(cluster_item.namespace(), None);
        assert_eq!(cluster_item.name(), "node-a");
    }

    #[test]
    fn json_event_serializes_event_type_as_screaming_case() {
        let event = NormalizedEvent {
            timestamp: Utc::now(),
            event_kind: EventKind::Added,
            gvr: Gvr::new("", "v1", "configmaps"),
            namespace: Some("t3".into()),
            name: "test-1".into(),
            uid: Some("abc-123".into()),
            resource_version: Some("42".into()),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            object: None,
        };
        let json = serde_json::to_value(event.to_json_event()).unwrap();
        assert_eq!(json["eventType"], "ADDED");
        assert_eq!(json["gvr"], "v1/configmaps");
        assert!(json.get("labels").is_none());
    }
}
