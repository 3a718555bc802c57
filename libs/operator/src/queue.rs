//! Work Queue + Worker Pool: a rate-limited, deduplicating FIFO of
//! object keys to reconcile, drained by a fixed pool of workers.
//!
//! There is no single crate that reproduces client-go's rate-limiting
//! workqueue wholesale, so this composes `tokio_util::time::DelayQueue`
//! for delayed re-admission and `backon::ExponentialBackoff` for per-item
//! backoff. See DESIGN.md for the exact semantics kept and simplified
//! relative to client-go.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

use crate::metrics::MetricsSink;
use crate::model::WorkItem;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

enum Command {
    Enqueue(WorkItem, Duration),
}

/// Identifies the underlying object a work item targets, independent of
/// which event kind triggered it. Two items that share this identity must
/// never be handed to two workers at once — see [`WorkQueue::get`].
type ObjectIdent = (String, String);

fn object_ident(item: &WorkItem) -> ObjectIdent {
    (item.gvr.canonical(), item.key.clone())
}

/// A rate-limited, deduplicating queue of [`WorkItem`]s. Cloning shares
/// the same underlying queue; cheap to hand to every informer and worker.
#[derive(Clone)]
pub struct WorkQueue {
    commands_tx: mpsc::UnboundedSender<Command>,
    ready_rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    queued: Arc<Mutex<HashSet<WorkItem>>>,
    backoffs: Arc<Mutex<HashMap<WorkItem, ExponentialBackoff>>>,
    /// Object identities currently held by a worker. Bars a second item for
    /// the same `(gvr, key)` from being dequeued until the first is
    /// forgotten or re-admitted, so Added/Updated/Deleted for one object
    /// always dispatch in the order they were first popped.
    in_flight: Arc<Mutex<HashSet<ObjectIdent>>>,
    /// Items that arrived for an identity already in flight, held back in
    /// FIFO order until [`WorkQueue::release`] frees that identity.
    pending: Arc<Mutex<HashMap<ObjectIdent, VecDeque<WorkItem>>>>,
    sink: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(pump(commands_rx, ready_tx, shutdown.clone()));
        Self {
            commands_tx,
            ready_rx: Arc::new(Mutex::new(ready_rx)),
            queued: Arc::new(Mutex::new(HashSet::new())),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink,
            shutdown,
        }
    }

    /// Causes every pending and future [`get`](Self::get) call to return
    /// `None` once the queue has drained, terminating worker loops. This
    /// is the "shutdown marker" the worker pool's `get` loop watches for.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Non-blocking. If `item` is already waiting to be dequeued, this is
    /// a no-op — the queue size grows by at most one per distinct
    /// `(gvr, key, eventKind)`.
    pub async fn enqueue(&self, item: WorkItem) {
        let mut queued = self.queued.lock().await;
        if queued.insert(item.clone()) {
            self.sink.set_queue_depth(queued.len() as i64);
            drop(queued);
            let _ = self.commands_tx.send(Command::Enqueue(item, Duration::ZERO));
        }
    }

    /// Blocks until an item is ready to be processed, or returns `None`
    /// once the queue has been shut down and drained. Items whose
    /// `(gvr, key)` identity is already held by another worker are set
    /// aside in FIFO order rather than returned, preserving per-object
    /// dispatch ordering across event kinds.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let item = {
                let mut rx = self.ready_rx.lock().await;
                rx.recv().await?
            };
            let ident = object_ident(&item);
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains(&ident) {
                drop(in_flight);
                self.pending.lock().await.entry(ident).or_default().push_back(item);
                continue;
            }
            in_flight.insert(ident);
            return Some(item);
        }
    }

    /// Frees `item`'s `(gvr, key)` identity and, if another item arrived
    /// for the same identity while this one was in flight, re-admits the
    /// oldest of those immediately.
    async fn release(&self, item: &WorkItem) {
        let ident = object_ident(item);
        self.in_flight.lock().await.remove(&ident);
        let next = {
            let mut pending = self.pending.lock().await;
            let next = pending.get_mut(&ident).and_then(VecDeque::pop_front);
            if pending.get(&ident).is_some_and(|q| q.is_empty()) {
                pending.remove(&ident);
            }
            next
        };
        if let Some(next) = next {
            let _ = self.commands_tx.send(Command::Enqueue(next, Duration::ZERO));
        }
    }

    /// Resets the item's backoff and clears it from the dedup set; called
    /// by a worker after a successful reconcile.
    pub async fn forget(&self, item: &WorkItem) {
        self.backoffs.lock().await.remove(item);
        let mut queued = self.queued.lock().await;
        queued.remove(item);
        self.sink.set_queue_depth(queued.len() as i64);
        drop(queued);
        self.release(item).await;
    }

    /// Re-admits `item` after an exponential backoff delay; called by a
    /// worker after a failed reconcile. The delay grows on each
    /// consecutive failure of the same item and resets on the next
    /// [`forget`](Self::forget).
    pub async fn add_rate_limited(&self, item: WorkItem) {
        let delay = {
            let mut backoffs = self.backoffs.lock().await;
            let backoff = backoffs.entry(item.clone()).or_insert_with(new_backoff);
            backoff.next().unwrap_or(MAX_BACKOFF)
        };
        debug!(gvr = %item.gvr, key = %item.key, ?delay, "re-admitting work item after backoff");
        {
            // `item` is already present from its original `enqueue`/
            // `add_rate_limited` call and stays in the dedup set until
            // `forget`, so this insert is just keeping the set consistent,
            // not gating whether the retry gets scheduled.
            let mut queued = self.queued.lock().await;
            queued.insert(item.clone());
            self.sink.set_queue_depth(queued.len() as i64);
        }
        self.release(&item).await;
        let _ = self.commands_tx.send(Command::Enqueue(item, delay));
    }

    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }
}

fn new_backoff() -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(MIN_BACKOFF)
        .with_max_delay(MAX_BACKOFF)
        .without_max_times()
        .build()
}

async fn pump(
    mut commands_rx: mpsc::UnboundedReceiver<Command>,
    ready_tx: mpsc::UnboundedSender<WorkItem>,
    shutdown: CancellationToken,
) {
    let mut delay_queue: DelayQueue<WorkItem> = DelayQueue::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("work queue shutdown requested, stopping pump");
                return;
            }
            cmd = commands_rx.recv() => {
                match cmd {
                    Some(Command::Enqueue(item, delay)) => {
                        delay_queue.insert(item, delay);
                    }
                    None => return,
                }
            }
            expired = delay_queue.next(), if !delay_queue.is_empty() => {
                if let Some(expired) = expired {
                    if ready_tx.send(expired.into_inner()).is_err() {
                        warn!("work queue ready channel closed, stopping pump");
                        return;
                    }
                }
            }
        }
    }
}

/// Runs a fixed pool of workers draining `queue`, each invoking
/// `reconcile` and following the `get -> reconcile -> forget/addRateLimited`
/// loop. Returns when `queue` shuts down.
pub async fn run_worker_pool<F, Fut>(queue: WorkQueue, worker_count: usize, reconcile: F)
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static + Clone,
    Fut: std::future::Future<Output = crate::error::Result<()>> + Send,
{
    let mut handles = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let queue = queue.clone();
        let reconcile = reconcile.clone();
        handles.push(tokio::spawn(async move {
            while let Some(item) = queue.get().await {
                debug!(worker = id, gvr = %item.gvr, key = %item.key, "dequeued work item");
                match reconcile(item.clone()).await {
                    Ok(()) => queue.forget(&item).await,
                    Err(err) => {
                        warn!(worker = id, gvr = %item.gvr, key = %item.key, error = %err, "reconcile failed, re-admitting");
                        queue.add_rate_limited(item).await;
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
