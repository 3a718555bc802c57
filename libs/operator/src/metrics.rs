//! The metrics sink interface and its `prometheus-client`
//! implementation. Every component that observes timing or failure takes
//! a `dyn MetricsSink` rather than a concrete `Metrics` struct, so tests
//! and embedders can swap in [`NoopMetricsSink`].
//!
//! A `Family` per dimension, a `HistogramWithExemplars` keyed by trace id
//! for reconcile duration, and a `Drop`-based measurer so a single
//! `measure_reconcile()` call covers both the success and the early-return
//! paths.

use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
    histogram::Histogram,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::error::Error;
use crate::model::{EventKind, Gvr};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GvrLabel {
    pub gvr: String,
}

impl From<&Gvr> for GvrLabel {
    fn from(gvr: &Gvr) -> Self {
        Self { gvr: gvr.canonical() }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub gvr: String,
    pub event_kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub gvr: String,
    pub error: String,
}

/// The lifecycle state of one informer, as reported by the registry that
/// owns it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum InformerState {
    /// Registered and running its initial list, not yet past `InitDone`.
    Syncing,
    /// Past its initial sync, processing the live watch stream.
    Active,
    /// The watch loop exited without being asked to stop.
    Failed,
}

impl InformerState {
    fn as_str(self) -> &'static str {
        match self {
            InformerState::Syncing => "syncing",
            InformerState::Active => "active",
            InformerState::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InformerStateLabels {
    pub gvr: String,
    pub state: String,
}

/// What every component reports, independent of whether the process is
/// serving a real `/metrics` endpoint or running under test.
pub trait MetricsSink: Send + Sync {
    fn record_event(&self, gvr: &Gvr, event_kind: EventKind);
    fn record_reconcile_failure(&self, gvr: &Gvr, err: &Error);
    fn measure_reconcile(&self, trace_id: &TraceId) -> ReconcileMeasurer;
    fn set_queue_depth(&self, depth: i64);
    fn set_active_informers(&self, count: i64);
    /// Records the current lifecycle state of one GVR's informer. Setting a
    /// state implicitly clears the other two for the same GVR.
    fn set_informer_state(&self, gvr: &Gvr, state: InformerState);
    /// Observes how long a GVR's informer took to reach `InitDone`.
    fn observe_sync_duration(&self, gvr: &Gvr, seconds: f64);
    /// Records the unix timestamp of the most recent event observed for a GVR.
    fn set_last_event_timestamp(&self, gvr: &Gvr, unix_seconds: f64);
    /// Records how many objects a GVR's lister currently holds.
    fn set_tracked_resources(&self, gvr: &Gvr, count: i64);
}

/// A `MetricsSink` that records nothing. Used by default in unit tests and
/// by embedders that don't care about a Prometheus registry.
#[derive(Clone, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_event(&self, _gvr: &Gvr, _event_kind: EventKind) {}
    fn record_reconcile_failure(&self, _gvr: &Gvr, _err: &Error) {}
    fn measure_reconcile(&self, _trace_id: &TraceId) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            labels: None,
            metric: None,
        }
    }
    fn set_queue_depth(&self, _depth: i64) {}
    fn set_active_informers(&self, _count: i64) {}
    fn set_informer_state(&self, _gvr: &Gvr, _state: InformerState) {}
    fn observe_sync_duration(&self, _gvr: &Gvr, _seconds: f64) {}
    fn set_last_event_timestamp(&self, _gvr: &Gvr, _unix_seconds: f64) {}
    fn set_tracked_resources(&self, _gvr: &Gvr, _count: i64) {}
}

/// The `prometheus-client`-backed sink, registered once and shared across
/// every informer/worker/dispatcher via `Arc<dyn MetricsSink>`.
#[derive(Clone)]
pub struct PrometheusMetricsSink {
    events: Family<EventLabels, Counter>,
    failures: Family<FailureLabels, Counter>,
    duration: HistogramWithExemplars<TraceLabel>,
    queue_depth: Gauge,
    active_informers: Gauge,
    informer_states: Family<InformerStateLabels, Gauge>,
    sync_duration: Family<GvrLabel, Histogram>,
    last_event_timestamp: Family<GvrLabel, Gauge>,
    tracked_resources: Family<GvrLabel, Gauge>,
}

pub struct Metrics {
    pub sink: Arc<PrometheusMetricsSink>,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("faro");
        let sink = PrometheusMetricsSink::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            sink: Arc::new(sink),
        }
    }
}

impl Default for PrometheusMetricsSink {
    fn default() -> Self {
        Self {
            events: Family::<EventLabels, Counter>::default(),
            failures: Family::<FailureLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.01, 0.05, 0.1, 0.5, 1., 5., 10.].into_iter()),
            queue_depth: Gauge::default(),
            active_informers: Gauge::default(),
            informer_states: Family::<InformerStateLabels, Gauge>::default(),
            sync_duration: Family::<GvrLabel, Histogram>::new_with_constructor(|| {
                Histogram::new([0.1, 0.5, 1., 2.5, 5., 10., 30., 60.].into_iter())
            }),
            last_event_timestamp: Family::<GvrLabel, Gauge>::default(),
            tracked_resources: Family::<GvrLabel, Gauge>::default(),
        }
    }
}

impl PrometheusMetricsSink {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("events_total", "normalized events observed", self.events.clone());
        r.register(
            "reconcile_failures_total",
            "reconciliation failures",
            self.failures.clone(),
        );
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("queue_depth", "pending work queue items", self.queue_depth.clone());
        r.register(
            "active_informers",
            "currently running informers",
            self.active_informers.clone(),
        );
        r.register(
            "informer_state",
            "informer lifecycle state, one gauge per (gvr, state) set to 1 for the current state",
            self.informer_states.clone(),
        );
        r.register_with_unit(
            "informer_sync_duration",
            "time an informer took to complete its initial list",
            Unit::Seconds,
            self.sync_duration.clone(),
        );
        r.register(
            "last_event_timestamp_seconds",
            "unix timestamp of the most recently observed event per gvr",
            self.last_event_timestamp.clone(),
        );
        r.register(
            "tracked_resources",
            "objects currently held in a gvr's lister",
            self.tracked_resources.clone(),
        );
        self
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_event(&self, gvr: &Gvr, event_kind: EventKind) {
        self.events
            .get_or_create(&EventLabels {
                gvr: gvr.canonical(),
                event_kind: event_kind.to_string(),
            })
            .inc();
    }

    fn record_reconcile_failure(&self, gvr: &Gvr, err: &Error) {
        self.failures
            .get_or_create(&FailureLabels {
                gvr: gvr.canonical(),
                error: err.metric_label(),
            })
            .inc();
    }

    fn measure_reconcile(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: Some(self.duration.clone()),
        }
    }

    fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.set(depth);
    }

    fn set_active_informers(&self, count: i64) {
        self.active_informers.set(count);
    }

    fn set_informer_state(&self, gvr: &Gvr, state: InformerState) {
        for candidate in [InformerState::Syncing, InformerState::Active, InformerState::Failed] {
            let value = if candidate == state { 1 } else { 0 };
            self.informer_states
                .get_or_create(&InformerStateLabels {
                    gvr: gvr.canonical(),
                    state: candidate.as_str().to_string(),
                })
                .set(value);
        }
    }

    fn observe_sync_duration(&self, gvr: &Gvr, seconds: f64) {
        self.sync_duration.get_or_create(&GvrLabel::from(gvr)).observe(seconds);
    }

    fn set_last_event_timestamp(&self, gvr: &Gvr, unix_seconds: f64) {
        self.last_event_timestamp
            .get_or_create(&GvrLabel::from(gvr))
            .set(unix_seconds as i64);
    }

    fn set_tracked_resources(&self, gvr: &Gvr, count: i64) {
        self.tracked_resources.get_or_create(&GvrLabel::from(gvr)).set(count);
    }
}

/// Relies on `Drop` to calculate the elapsed duration and register the
/// observation in the histogram, so callers only need to hold the guard
/// for the span of the reconcile call.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: Option<HistogramWithExemplars<TraceLabel>>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        if let Some(metric) = &self.metric {
            let duration = self.start.elapsed().as_secs_f64();
            metric.observe(duration, self.labels.take());
        }
    }
}
