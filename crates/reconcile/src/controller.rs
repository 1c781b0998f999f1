//! Controller: ingest task plus a fixed pool of workers over one queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::Resource;
use metrics::{counter, gauge, histogram};
use tether_core::{ApplyError, LookupError, ReconcileKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, WatchEvent};
use crate::queue::{Backoff, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, HandlerError::Apply(ApplyError::Conflict { .. }))
    }
}

/// Reconciles one key. `obj` is `None` when the object is gone from the cache.
#[async_trait]
pub trait Handler<K>: Send + Sync + 'static {
    async fn reconcile(&self, key: &ReconcileKey, obj: Option<Arc<K>>) -> Result<(), HandlerError>;
}

/// Where a controller gets its objects from: a full list for priming and
/// resync, and a stream of changes.
#[async_trait]
pub trait ObjectSource<K>: Send + Sync + 'static {
    async fn list(&self) -> anyhow::Result<Vec<K>>;

    fn watch(&self) -> BoxStream<'static, anyhow::Result<WatchEvent<K>>>;
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Used as the `controller` label on metrics and in logs.
    pub name: &'static str,
    pub workers: usize,
    /// Total handler invocations per key before it is dropped.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub resync: Option<Duration>,
}

impl LoopConfig {
    pub fn new(name: &'static str) -> Self {
        Self { name, workers: 2, max_retries: 5, backoff: Backoff::default(), resync: Some(Duration::from_secs(300)) }
    }
}

pub struct Controller<K, S, H> {
    cfg: LoopConfig,
    source: Arc<S>,
    handler: Arc<H>,
    cache: Arc<Cache<K>>,
    queue: WorkQueue<ReconcileKey>,
}

impl<K, S, H> Controller<K, S, H>
where
    K: Resource + Send + Sync + 'static,
    S: ObjectSource<K>,
    H: Handler<K>,
{
    pub fn new(cfg: LoopConfig, source: S, handler: H) -> Self {
        let queue = WorkQueue::new(cfg.backoff);
        Self { cfg, source: Arc::new(source), handler: Arc::new(handler), cache: Arc::new(Cache::new()), queue }
    }

    pub fn cache(&self) -> Arc<Cache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn queue(&self) -> WorkQueue<ReconcileKey> {
        self.queue.clone()
    }

    /// Run until `shutdown` fires. In-flight reconciles finish; queued keys
    /// are abandoned. Returns after every worker has exited.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let name = self.cfg.name;
        let items = self.source.list().await.with_context(|| format!("{name}: initial list"))?;
        self.enqueue(self.cache.replace(items));
        info!(controller = name, objects = self.cache.len(), workers = self.cfg.workers, "controller started");

        let mut workers = Vec::with_capacity(self.cfg.workers.max(1));
        for id in 0..self.cfg.workers.max(1) {
            let worker = Worker {
                name,
                max_retries: self.cfg.max_retries.max(1),
                cache: Arc::clone(&self.cache),
                queue: self.queue.clone(),
                handler: Arc::clone(&self.handler),
            };
            workers.push(tokio::spawn(async move {
                worker.run().await;
                debug!(controller = name, worker = id, "worker exited");
            }));
        }

        let mut events = self.source.watch();
        let mut watching = true;
        let mut resync = self.cfg.resync.map(|p| tokio::time::interval_at(tokio::time::Instant::now() + p, p));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = events.next(), if watching => match ev {
                    Some(Ok(ev)) => self.enqueue(self.cache.apply(ev)),
                    Some(Err(e)) => warn!(controller = name, error = %e, "watch error"),
                    None => {
                        warn!(controller = name, "event stream ended");
                        watching = false;
                    }
                },
                _ = tick(resync.as_mut()) => match self.source.list().await {
                    Ok(items) => {
                        let keys = self.cache.replace(items);
                        debug!(controller = name, keys = keys.len(), "resync");
                        self.enqueue(keys);
                    }
                    Err(e) => warn!(controller = name, error = %e, "resync list failed"),
                },
            }
        }

        info!(controller = name, pending = self.queue.len(), "shutting down");
        self.queue.shut_down();
        for res in futures::future::join_all(workers).await {
            if let Err(e) = res {
                error!(controller = name, error = %e, "worker task failed");
            }
        }
        info!(controller = name, "controller stopped");
        Ok(())
    }

    fn enqueue(&self, keys: Vec<ReconcileKey>) {
        for key in keys {
            self.queue.add(key);
        }
        gauge!("queue_depth", self.queue.len() as f64, "controller" => self.cfg.name);
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Worker<K, H> {
    name: &'static str,
    max_retries: u32,
    cache: Arc<Cache<K>>,
    queue: WorkQueue<ReconcileKey>,
    handler: Arc<H>,
}

impl<K, H> Worker<K, H>
where
    K: Resource + Send + Sync + 'static,
    H: Handler<K>,
{
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
            gauge!("queue_depth", self.queue.len() as f64, "controller" => self.name);
        }
    }

    async fn process(&self, key: &ReconcileKey) {
        let obj = self.cache.get(key);
        let started = Instant::now();
        let res = self.handler.reconcile(key, obj).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => self.name);
        match res {
            Ok(()) => {
                counter!("reconcile_ok", 1u64, "controller" => self.name);
                self.queue.forget(key);
            }
            Err(e) => {
                counter!("reconcile_err", 1u64, "controller" => self.name);
                let attempts = self.queue.num_requeues(key) + 1;
                if attempts < self.max_retries {
                    let (name, conflict) = (self.name, e.is_conflict());
                    warn!(controller = name, key = %key, attempts, conflict, error = %e, "reconcile failed; retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        controller = self.name,
                        key = %key,
                        attempts,
                        error = %e,
                        "giving up; relation left unresolved"
                    );
                    counter!("reconcile_dropped", 1u64, "controller" => self.name);
                    self.queue.forget(key);
                }
            }
        }
    }
}
