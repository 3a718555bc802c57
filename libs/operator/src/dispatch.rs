//! Event Dispatcher: fans each normalized event out to in-process
//! subscribers and serially appends its JSON-exported form to the event
//! file.
//!
//! An explicit subscriber list: a concrete `Vec<Subscriber>` behind a
//! `tokio::sync::RwLock`, snapshotted under a read lock and iterated
//! without further locking, rather than a chain of observers. The JSON
//! sink is a shared resource guarded by its own lock — a
//! `tokio::sync::Mutex`-guarded buffered writer.

use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};

use crate::error::Error;
use crate::metrics::MetricsSink;
use crate::model::NormalizedEvent;

/// An in-process subscriber handler: `(event) -> Result<(), String>`. The
/// `String` error is logged; it never halts other handlers or the worker.
pub type Subscriber = Arc<dyn Fn(NormalizedEvent) -> SubscriberFuture + Send + Sync>;
pub type SubscriberFuture = std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<(), String>> + Send>>;

/// Wraps a plain async closure into the boxed [`Subscriber`] shape.
pub fn subscriber<F, Fut>(f: F) -> Subscriber
where
    F: Fn(NormalizedEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Append-only, line-delimited JSON event sink. Writes
/// complete before the worker moves to the next item, giving the
/// invariant: if a subscriber sees event E, the sink has already admitted
/// E for writing.
pub struct JsonSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonSink {
    pub async fn open(path: impl AsRef<Path>) -> IoResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub async fn write(&self, event: &NormalizedEvent) -> Result<(), Error> {
        let line = serde_json::to_string(&event.to_json_event())?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await.map_err(Error::SinkError)?;
        writer.write_all(b"\n").await.map_err(Error::SinkError)?;
        writer.flush().await.map_err(Error::SinkError)
    }
}

/// `outputDir` + `jsonExport` resolved into a concrete sink path.
pub fn event_file_path(output_dir: &str) -> PathBuf {
    Path::new(output_dir).join("events.jsonl")
}

pub struct Dispatcher {
    subscribers: RwLock<Vec<Subscriber>>,
    sink: Option<JsonSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            sink: None,
            metrics,
        }
    }

    pub fn with_json_sink(mut self, sink: JsonSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn add_subscriber(&self, handler: Subscriber) {
        self.subscribers.write().await.push(handler);
    }

    /// Invokes every registered subscriber concurrently and serially
    /// appends the event to the JSON sink: the JSON write completes
    /// before this call returns, so a subscriber observing the event
    /// implies the line is already durable.
    pub async fn dispatch(&self, event: NormalizedEvent) {
        self.metrics.record_event(&event.gvr, event.event_kind);

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.write(&event).await {
                error!(gvr = %event.gvr, name = %event.name, error = %err, "failed to append event to json sink");
            }
        }

        let snapshot = {
            let subscribers = self.subscribers.read().await;
            subscribers.clone()
        };

        let mut tasks = Vec::with_capacity(snapshot.len());
        for (idx, handler) in snapshot.into_iter().enumerate() {
            let event = event.clone();
            tasks.push((idx, tokio::spawn(async move { handler(event).await })));
        }
        for (idx, task) in tasks {
            let subscriber = format!("subscriber-{idx}");
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    let err = Error::DispatchError {
                        subscriber,
                        gvr: event.gvr.clone(),
                        key: event.key(),
                        message,
                    };
                    warn!(error = %err, "subscriber handler returned an error");
                }
                Err(join_err) => {
                    let err = Error::DispatchError {
                        subscriber,
                        gvr: event.gvr.clone(),
                        key: event.key(),
                        message: join_err.to_string(),
                    };
                    warn!(error = %err, "subscriber handler task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use crate::model::{EventKind, Gvr};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn sample_event(name: &str) -> NormalizedEvent {
        NormalizedEvent {
            timestamp: chrono::Utc::now(),
            event_kind: EventKind::Added,
            gvr: Gvr::new("", "v1", "configmaps"),
            namespace: Some("t3".into()),
            name: name.into(),
            uid: Some("abc".into()),
            resource_version: Some("1".into()),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            object: None,
        }
    }

    #[tokio::test]
    async fn all_subscribers_observe_the_event_even_if_one_errors() {
        let dispatcher = Dispatcher::new(Arc::new(NoopMetricsSink));
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let a_calls_clone = a_calls.clone();
        dispatcher
            .add_subscriber(subscriber(move |_event| {
                let a_calls = a_calls_clone.clone();
                async move {
                    a_calls.fetch_add(1, Ordering::SeqCst);
                    Err("subscriber a failed".to_string())
                }
            }))
            .await;

        let b_calls_clone = b_calls.clone();
        dispatcher
            .add_subscriber(subscriber(move |_event| {
                let b_calls = b_calls_clone.clone();
                async move {
                    b_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await;

        dispatcher.dispatch(sample_event("test-1")).await;

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn json_sink_writes_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = event_file_path(dir.path().to_str().unwrap());
        let sink = JsonSink::open(&path).await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(NoopMetricsSink)).with_json_sink(sink);

        dispatcher.dispatch(sample_event("test-1")).await;
        dispatcher.dispatch(sample_event("test-2")).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["eventType"], "ADDED");
        assert_eq!(first["name"], "test-1");
    }
}
