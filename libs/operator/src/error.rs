//! The top-level error type, composed from each component's failure
//! modes: discovery failures, configuration rejections, watch
//! failures, reconcile failures, dispatch/sink failures, and engine
//! lifecycle misuse. Every variant keeps enough of the offending context
//! (`gvr`, `key`, `event_kind`) to log without the caller needing to thread
//! it through separately — the "never silently swallows an error" rule.

use thiserror::Error;

use crate::model::{EventKind, Gvr};

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("resource discovery failed: {0}")]
    DiscoveryError(#[source] kube::Error),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("watch failed for {gvr} (namespace={namespace:?}): {source}")]
    WatchError {
        gvr: Gvr,
        namespace: Option<String>,
        #[source]
        source: kube::runtime::watcher::Error,
    },

    #[error("reconcile failed for {gvr} key={key} event={event_kind}: {message}")]
    ReconcileError {
        gvr: Gvr,
        key: String,
        event_kind: EventKind,
        message: String,
    },

    #[error("dispatch to subscriber {subscriber} failed for {gvr} key={key}: {message}")]
    DispatchError {
        subscriber: String,
        gvr: Gvr,
        key: String,
        message: String,
    },

    #[error("json event sink error: {0}")]
    SinkError(#[source] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("engine is in state {state}, cannot {action}")]
    InvalidEngineState { state: String, action: String },

    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Low-cardinality label used for the `MetricsSink`'s failure counters
    /// — never the full error message, which may contain unbounded object
    /// names or API server text.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube_error".to_string(),
            Error::DiscoveryError(_) => "discovery_error".to_string(),
            Error::ConfigError(_) => "config_error".to_string(),
            Error::WatchError { .. } => "watch_error".to_string(),
            Error::ReconcileError { .. } => "reconcile_error".to_string(),
            Error::DispatchError { .. } => "dispatch_error".to_string(),
            Error::SinkError(_) => "sink_error".to_string(),
            Error::SerializationError(_) => "serialization_error".to_string(),
            Error::InvalidEngineState { .. } => "invalid_engine_state".to_string(),
            Error::InvalidTraceId => "invalid_trace_id".to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
