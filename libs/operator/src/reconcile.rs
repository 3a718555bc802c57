//! Reconciler: maps a queued work item back to the live cache object,
//! builds the normalized event, filters it against the matching rules,
//! and hands it to the Dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::api::DynamicObject;
use tracing::{error, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::informer::InformerRegistry;
use crate::metrics::MetricsSink;
use crate::model::{EventKind, NormalizedEvent, WorkItem};
use crate::telemetry::get_trace_id;

#[derive(Clone)]
pub struct Reconciler {
    informers: InformerRegistry,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<dyn MetricsSink>,
}

impl Reconciler {
    pub fn new(informers: InformerRegistry, dispatcher: Arc<Dispatcher>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { informers, dispatcher, metrics }
    }

    /// Resolves and dispatches one work item. Returns `Ok`
    /// for both a successful dispatch and for the non-retryable "lister
    /// missing" case (logged, forgotten); returns `Err` only for
    /// conditions the worker pool should retry with backoff. Reconcile
    /// duration and failures are recorded regardless of which path is
    /// taken.
    pub async fn reconcile(&self, item: WorkItem) -> Result<()> {
        let trace_id = get_trace_id();
        let _measurer = self.metrics.measure_reconcile(&trace_id);
        let gvr = item.gvr.clone();
        let result = self.reconcile_inner(item).await;
        if let Err(err) = &result {
            self.metrics.record_reconcile_failure(&gvr, err);
        }
        result
    }

    async fn reconcile_inner(&self, item: WorkItem) -> Result<()> {
        let event = if item.event_kind == EventKind::Deleted {
            self.minimal_deleted_event(&item)
        } else {
            match self.informers.lister_for(&item.gvr, item.namespace()).await {
                None => {
                    let err = Error::ReconcileError {
                        gvr: item.gvr.clone(),
                        key: item.key.clone(),
                        event_kind: item.event_kind,
                        message: "no lister registered for this gvr/namespace".to_string(),
                    };
                    error!(error = %err, "dropping non-retryable work item");
                    self.metrics.record_reconcile_failure(&item.gvr, &err);
                    return Ok(());
                }
                Some(lister) => match lister.get(&item.key).await {
                    Some(obj) => self.full_event(&item, obj),
                    None => {
                        // Reached the queue after the object was already removed:
                        // reinterpret as Deleted rather than an error.
                        self.minimal_deleted_event(&item)
                    }
                },
            }
        };

        if !item.rules.is_empty() && !item.rules.iter().any(|rule| {
            rule.matches_namespace(event.namespace.as_deref()) && rule.matches_name(&event.name)
        }) {
            warn!(gvr = %item.gvr, key = %item.key, "event filtered out by rules, not dispatching");
            return Ok(());
        }

        self.dispatcher.dispatch(event).await;
        Ok(())
    }

    fn minimal_deleted_event(&self, item: &WorkItem) -> NormalizedEvent {
        NormalizedEvent {
            timestamp: Utc::now(),
            event_kind: EventKind::Deleted,
            gvr: item.gvr.clone(),
            namespace: item.namespace().map(str::to_owned),
            name: item.name().to_string(),
            uid: None,
            resource_version: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            object: Some(serde_json::json!({
                "namespace": item.namespace(),
                "name": item.name(),
            })),
        }
    }

    fn full_event(&self, item: &WorkItem, obj: DynamicObject) -> NormalizedEvent {
        let labels = obj.metadata.labels.clone().unwrap_or_default().into_iter().collect();
        let annotations = obj.metadata.annotations.clone().unwrap_or_default().into_iter().collect();
        let uid = obj.metadata.uid.clone();
        let resource_version = obj.metadata.resource_version.clone();
        let object = serde_json::to_value(&obj).ok();

        NormalizedEvent {
            timestamp: Utc::now(),
            event_kind: item.event_kind,
            gvr: item.gvr.clone(),
            namespace: item.namespace().map(str::to_owned),
            name: item.name().to_string(),
            uid,
            resource_version,
            labels,
            annotations,
            object,
        }
    }
}
