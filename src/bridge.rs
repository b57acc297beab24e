//! Fan-out between the always-on transcode stage and zero-or-more
//! downstream consumers.
//!
//! Each (re)start of the stage begins a new *run*: one distributor task
//! drains the stage's unit channel into a fresh broadcast channel, and one
//! feeder task per attached consumer forwards copies to its sink. A slow
//! consumer lags and loses units; a dead one is detached. Neither can ever
//! back-pressure the stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stage::{ProducedUnit, UnitReceiver, UNIT_CHANNEL_CAP};

pub type ConsumerSink = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a feeder waits for the next unit before re-checking its
/// cancellation token.
const FEEDER_POLL: Duration = Duration::from_millis(100);

struct Feeder {
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct BridgeInner {
    /// (run id, sender) of the current run, None between runs.
    current: std::sync::Mutex<Option<(u64, broadcast::Sender<ProducedUnit>)>>,
    next_run: AtomicU64,
    next_consumer: AtomicU64,
    feeders: tokio::sync::Mutex<HashMap<u64, Feeder>>,
}

impl BridgeInner {
    /// Drop feeder entries whose tasks already ran to completion. Runs on
    /// every attach and at the start of every run, so entries left behind
    /// by a previous run never accumulate.
    async fn reap(&self) {
        let mut feeders = self.feeders.lock().await;
        feeders.retain(|_, feeder| {
            !(feeder.finished.load(Ordering::Acquire) && feeder.join.is_finished())
        });
    }
}

#[derive(Clone)]
pub struct OutputBridge {
    inner: Arc<BridgeInner>,
}

impl OutputBridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                current: std::sync::Mutex::new(None),
                next_run: AtomicU64::new(0),
                next_consumer: AtomicU64::new(0),
                feeders: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start distributing a new run. The previous run's channel (if any) is
    /// replaced; its feeders observe `Closed` once the old distributor is
    /// gone and exit on their own.
    pub fn begin_run(&self, mut units: UnitReceiver, cancel: CancellationToken) {
        let (tx, _) = broadcast::channel(UNIT_CHANNEL_CAP);
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        *self.inner.current.lock().unwrap() = Some((run_id, tx.clone()));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            log::debug!("distributor started (run {})", run_id);
            inner.reap().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    unit = units.recv() => match unit {
                        // No receiver attached is fine, units just fall away.
                        Some(unit) => { let _ = tx.send(unit); }
                        None => break, // stage torn down
                    },
                }
            }
            let mut current = inner.current.lock().unwrap();
            if matches!(*current, Some((id, _)) if id == run_id) {
                *current = None;
            }
            log::debug!("distributor stopped (run {})", run_id);
        });
    }

    pub fn has_active_run(&self) -> bool {
        self.inner.current.lock().unwrap().is_some()
    }

    /// Attach one consumer to the current run. Fails between runs; the
    /// serving layer retries by reconnecting its client.
    pub async fn attach_consumer(
        &self,
        name: &str,
        mut sink: ConsumerSink,
    ) -> anyhow::Result<ConsumerHandle> {
        let mut rx = {
            let current = self.inner.current.lock().unwrap();
            let (_, tx) = current
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no active run"))?;
            tx.subscribe()
        };

        let id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let name = name.to_string();
        let task_cancel = cancel.clone();
        let task_finished = Arc::clone(&finished);
        let join = tokio::spawn(async move {
            log::info!("feeder started: {}", name);
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                match tokio::time::timeout(FEEDER_POLL, rx.recv()).await {
                    Err(_) => continue, // poll timeout, re-check cancellation
                    Ok(Err(broadcast::error::RecvError::Closed)) => break, // run over
                    Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                        log::warn!("consumer {} lagged, dropped {} units", name, n);
                    }
                    Ok(Ok(unit)) => {
                        // A write stalled on a dead-but-open consumer must
                        // not outlive shutdown.
                        tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            res = sink.write_all(&unit.data) => {
                                if let Err(e) = res {
                                    log::info!("consumer {} gone: {}", name, e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            task_finished.store(true, Ordering::Release);
            log::info!("feeder stopped: {}", name);
        });

        self.inner.feeders.lock().await.insert(
            id,
            Feeder {
                cancel,
                finished,
                join,
            },
        );

        self.inner.reap().await;

        Ok(ConsumerHandle {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cancel and join every feeder. Idempotent; returns only once all
    /// feeder tasks have observably stopped.
    pub async fn shutdown(&self) {
        let feeders: Vec<Feeder> = {
            let mut map = self.inner.feeders.lock().await;
            map.drain().map(|(_, f)| f).collect()
        };
        for feeder in &feeders {
            feeder.cancel.cancel();
        }
        for feeder in feeders {
            let _ = feeder.join.await;
        }
    }
}

impl Default for OutputBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// One attached downstream sink. Detaching cancels and joins the feeder.
pub struct ConsumerHandle {
    id: u64,
    inner: Arc<BridgeInner>,
}

impl ConsumerHandle {
    pub fn is_active(&self) -> bool {
        let feeders = match self.inner.feeders.try_lock() {
            Ok(guard) => guard,
            Err(_) => return true, // attach/shutdown in progress
        };
        feeders
            .get(&self.id)
            .map(|f| !f.finished.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub async fn detach(self) {
        let feeder = self.inner.feeders.lock().await.remove(&self.id);
        if let Some(feeder) = feeder {
            feeder.cancel.cancel();
            let _ = feeder.join.await;
        }
    }

    /// Wait for the feeder to finish on its own (run over or consumer
    /// gone), without cancelling it.
    pub async fn joined(self) {
        let feeder = self.inner.feeders.lock().await.remove(&self.id);
        if let Some(feeder) = feeder {
            let _ = feeder.join.await;
        }
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;
