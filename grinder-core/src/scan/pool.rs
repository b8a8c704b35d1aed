//! Bounded worker pools
//!
//! A pool owns a bounded task queue and `size` long-lived workers. Workers
//! take turns pulling from the shared receiver, so at most `size` tasks are
//! ever being executed and at most `size` external processes are alive.

use super::EngineRegistry;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::types::{ScanKind, ScanOutcome, ScanTask, WorkerClass};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout and retry policy shared by all workers of a run
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Extra attempts after a failed invocation
    pub retries: u32,
    /// Deadline per scan kind
    pub timeouts: HashMap<ScanKind, Duration>,
    /// Deadline for kinds missing from `timeouts`
    pub default_timeout: Duration,
}

impl PoolSettings {
    /// Settings taken from a run configuration
    pub fn from_config(config: &RunConfig) -> Self {
        let timeouts = [
            ScanKind::PortService,
            ScanKind::Vulnerability,
            ScanKind::Tls,
            ScanKind::NseScript,
            ScanKind::PythonScript,
        ]
        .into_iter()
        .map(|kind| (kind, config.timeout_for(kind)))
        .collect();

        Self {
            retries: config.scan_retries,
            timeouts,
            default_timeout: config.nmap_timeout,
        }
    }

    /// Deadline of one invocation of `kind`
    pub fn timeout_for(&self, kind: ScanKind) -> Duration {
        self.timeouts.get(&kind).copied().unwrap_or(self.default_timeout)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// A fixed set of workers draining one bounded queue
pub struct WorkerPool {
    class: WorkerClass,
    sender: Option<mpsc::Sender<ScanTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers reporting to `outcomes`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        class: WorkerClass,
        size: usize,
        registry: Arc<EngineRegistry>,
        settings: Arc<PoolSettings>,
        outcomes: mpsc::Sender<ScanOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size * 2);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let worker = Worker {
                    id,
                    class,
                    receiver: Arc::clone(&receiver),
                    registry: Arc::clone(&registry),
                    settings: Arc::clone(&settings),
                    outcomes: outcomes.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        debug!(%class, size, "worker pool started");
        Self {
            class,
            sender: Some(sender),
            workers,
        }
    }

    /// Pool class
    pub fn class(&self) -> WorkerClass {
        self.class
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a task, waiting while the queue is full
    pub async fn submit(&self, task: ScanTask) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::ScanFailure(format!("{} pool is closed", self.class)))?;
        sender
            .send(task)
            .await
            .map_err(|_| Error::ScanFailure(format!("{} pool workers have stopped", self.class)))
    }

    /// Stops accepting tasks; workers exit once the queue is drained
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// Closes the pool and waits for every worker to exit
    pub async fn join(mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(class = %self.class, error = %e, "scan worker terminated abnormally");
            }
        }
    }
}

struct Worker {
    id: usize,
    class: WorkerClass,
    receiver: Arc<Mutex<mpsc::Receiver<ScanTask>>>,
    registry: Arc<EngineRegistry>,
    settings: Arc<PoolSettings>,
    outcomes: mpsc::Sender<ScanOutcome>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let task = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let Some(task) = task else { break };

            let outcome = if self.cancel.is_cancelled() {
                ScanOutcome::cancelled(task, 0)
            } else {
                self.execute(task).await
            };

            if self.outcomes.send(outcome).await.is_err() {
                debug!(class = %self.class, worker = self.id, "outcome receiver dropped");
                break;
            }
        }
    }

    async fn execute(&self, task: ScanTask) -> ScanOutcome {
        let Some(engine) = self.registry.get(task.kind).cloned() else {
            let kind = task.kind;
            return ScanOutcome::failed(task, 0, format!("no engine registered for {}", kind));
        };

        let timeout = self.settings.timeout_for(task.kind);
        let max_attempts = self.settings.retries + 1;
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                class = %self.class,
                worker = self.id,
                engine = engine.name(),
                host = %task.key,
                kind = %task.kind,
                attempt = attempts,
                "scan started"
            );

            // Panics inside an engine fail the task, not the worker.
            let invocation = AssertUnwindSafe(tokio::time::timeout(timeout, engine.scan(&task)))
                .catch_unwind();

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = invocation => Some(result),
            };
            let Some(result) = result else {
                debug!(host = %task.key, kind = %task.kind, "scan cancelled");
                return ScanOutcome::cancelled(task, attempts);
            };

            match result {
                Ok(Ok(Ok(findings))) => return ScanOutcome::success(task, attempts, findings),
                Ok(Err(_elapsed)) => {
                    let error = Error::ScanTimeout(timeout);
                    warn!(host = %task.key, kind = %task.kind, %error, "scan timed out");
                    return ScanOutcome::timeout(task, attempts, error.to_string());
                }
                Ok(Ok(Err(error))) if attempts < max_attempts => {
                    debug!(host = %task.key, kind = %task.kind, %error, "scan failed, retrying");
                }
                Ok(Ok(Err(error))) => {
                    warn!(host = %task.key, kind = %task.kind, %error, attempts, "scan failed");
                    return ScanOutcome::failed(task, attempts, error.to_string());
                }
                Err(_panic) => {
                    warn!(host = %task.key, kind = %task.kind, "scan engine panicked");
                    return ScanOutcome::failed(task, attempts, "scan engine panicked");
                }
            }
        }
    }
}
