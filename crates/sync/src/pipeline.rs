//! Producer/consumer pipeline between the change source and the engine.
//!
//! The producer filters events, stamps the finalizer on first sighting and pushes into a
//! bounded queue; a full queue stalls the producer (and with it the watch) rather than
//! dropping anything. A single consumer reconciles events strictly in queue order and
//! removes the mirror of every deleted source object.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kmirror_core::meta::{identity, name_of};
use kmirror_core::{ChangeEvent, ChangeKind, DiffSink, DEFAULT_QUEUE_CAP};

use crate::engine::Engine;
use crate::filter::Filter;
use crate::finalizer::FinalizerGuard;

/// Stops the producer. Dropping the handle without calling `cancel` also stops it.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub received: u64,
    pub admitted: u64,
    pub finalizers_added: u64,
    pub finalizer_errors: u64,
    /// Objects still remembered as stamped when the producer stopped.
    pub tracked: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub reconciled: u64,
    pub errors: u64,
    pub deletions: u64,
    /// Count per [`Outcome::label`](crate::engine::Outcome::label).
    pub outcomes: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub producer: ProducerStats,
    pub consumer: ConsumerStats,
}

pub struct Pipeline {
    filter: Filter,
    guard: FinalizerGuard,
    engine: Arc<Engine>,
    sink: Option<Arc<dyn DiffSink>>,
    capacity: usize,
}

impl Pipeline {
    pub fn new(filter: Filter, guard: FinalizerGuard, engine: Arc<Engine>) -> Self {
        Self { filter, guard, engine, sink: None, capacity: DEFAULT_QUEUE_CAP }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiffSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Spawn the producer and consumer tasks over `events`.
    pub fn start<S>(self, events: S) -> PipelineHandle
    where
        S: Stream<Item = ChangeEvent> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(self.capacity);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let producer = tokio::spawn(produce(events, self.filter, self.guard, tx, cancel_rx));
        let consumer = tokio::spawn(consume(rx, self.engine, self.sink));
        PipelineHandle { cancel: CancelHandle { tx: Some(cancel_tx) }, producer, consumer }
    }
}

pub struct PipelineHandle {
    cancel: CancelHandle,
    producer: JoinHandle<ProducerStats>,
    consumer: JoinHandle<ConsumerStats>,
}

impl PipelineHandle {
    /// Stop taking events from the source, then let the consumer drain what is already queued.
    pub async fn shutdown(self) -> PipelineStats {
        let PipelineHandle { cancel, producer, consumer } = self;
        cancel.cancel();
        collect(producer, consumer).await
    }

    /// Wait for the source stream to end on its own, then for the queue to drain.
    pub async fn join(self) -> PipelineStats {
        let PipelineHandle { cancel, producer, consumer } = self;
        let producer = join_task(producer, "producer").await;
        drop(cancel);
        let consumer = join_task(consumer, "consumer").await;
        PipelineStats { producer, consumer }
    }
}

async fn collect(producer: JoinHandle<ProducerStats>, consumer: JoinHandle<ConsumerStats>) -> PipelineStats {
    let producer = join_task(producer, "producer").await;
    let consumer = join_task(consumer, "consumer").await;
    PipelineStats { producer, consumer }
}

async fn join_task<T: Default>(task: JoinHandle<T>, what: &str) -> T {
    match task.await {
        Ok(v) => v,
        Err(e) => {
            error!(task = what, error = %e, "pipeline task failed");
            T::default()
        }
    }
}

async fn produce<S>(
    mut events: S,
    filter: Filter,
    guard: FinalizerGuard,
    tx: mpsc::Sender<ChangeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> ProducerStats
where
    S: Stream<Item = ChangeEvent> + Send + Unpin,
{
    let mut stats = ProducerStats::default();
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        let ev = tokio::select! {
            _ = &mut cancel_rx => {
                info!("producer cancelled");
                break;
            }
            next = events.next() => match next {
                Some(ev) => ev,
                None => {
                    debug!("change stream ended");
                    break;
                }
            },
        };
        stats.received += 1;
        let id = identity(&ev.object);
        if ev.change == ChangeKind::Deleted {
            seen.remove(&id);
        }
        if !filter.passes(&ev.object) {
            continue;
        }
        stats.admitted += 1;
        match ev.change {
            ChangeKind::Applied if !seen.contains(&id) => match guard.ensure(&ev.resource, &ev.object).await {
                Ok(added) => {
                    if added {
                        stats.finalizers_added += 1;
                    }
                    seen.insert(id);
                }
                Err(e) => {
                    // not marked seen: the next event for this object retries
                    stats.finalizer_errors += 1;
                    counter!("mirror_errors_total", 1u64);
                    warn!(gvk = %ev.resource.id, name = %name_of(&ev.object), error = %e, "finalizer add failed");
                }
            },
            ChangeKind::Applied | ChangeKind::Deleted => {}
        }
        if tx.send(ev).await.is_err() {
            warn!("consumer gone; stopping producer");
            break;
        }
    }
    stats.tracked = seen.len() as u64;
    stats
}

async fn consume(mut rx: mpsc::Receiver<ChangeEvent>, engine: Arc<Engine>, sink: Option<Arc<dyn DiffSink>>) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    while let Some(ev) = rx.recv().await {
        if let Some(sink) = sink.as_ref() {
            sink.observe(&ev);
        }
        let gvk = ev.resource.id.clone();
        let name = name_of(&ev.object).to_string();
        let result = match ev.change {
            ChangeKind::Deleted => {
                // usually retired while terminating already; removal is idempotent
                stats.deletions += 1;
                debug!(gvk = %gvk, name = %name, "source deleted");
                engine.remove(&ev.resource, &name).await
            }
            ChangeKind::Applied => engine.reconcile(&ev.resource, ev.object).await,
        };
        match result {
            Ok(outcome) => {
                stats.reconciled += 1;
                *stats.outcomes.entry(outcome.label()).or_default() += 1;
            }
            Err(e) => {
                stats.errors += 1;
                counter!("mirror_errors_total", 1u64);
                error!(gvk = %gvk, name = %name, error = %e, "reconcile failed");
            }
        }
    }
    info!(reconciled = stats.reconciled, errors = stats.errors, "consumer drained");
    stats
}
