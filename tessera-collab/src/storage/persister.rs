//! Background persistence worker.
//!
//! Saves are queued on an mpsc mailbox and executed one at a time on the
//! blocking pool, so the event path never waits on storage. A failed save
//! is retried with linear backoff; the final outcome is reported back on a
//! oneshot channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::Row;
use tokio::sync::{mpsc, oneshot};

use super::{PersistenceGateway, StoreError, GRID_KEY};

/// Retry policy for saves.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Attempts per save, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl PersistConfig {
    /// Fast retries for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

/// Final outcome of one queued save.
#[derive(Debug, Clone)]
pub enum PersistReport {
    Saved { attempts: u32 },
    Failed { attempts: u32, error: StoreError },
}

impl PersistReport {
    pub fn is_saved(&self) -> bool {
        matches!(self, PersistReport::Saved { .. })
    }
}

enum Job {
    Save {
        rows: Arc<Vec<Row>>,
        reply: oneshot::Sender<PersistReport>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence worker.
pub struct Persister {
    tx: mpsc::UnboundedSender<Job>,
    closed: AtomicBool,
}

impl Persister {
    /// Spawn the worker on the current runtime.
    pub fn spawn(gateway: Arc<dyn PersistenceGateway>, config: PersistConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(gateway, config, rx));
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a save of `rows` under the grid key.
    ///
    /// After `shutdown` every submission fails immediately with
    /// `StoreError::Unavailable`.
    pub fn submit(&self, rows: Vec<Row>) -> oneshot::Receiver<PersistReport> {
        let (reply, rx) = oneshot::channel();

        if self.closed.load(Ordering::Acquire) {
            let _ = reply.send(PersistReport::Failed {
                attempts: 0,
                error: StoreError::Unavailable("persister shut down".into()),
            });
            return rx;
        }

        let job = Job::Save {
            rows: Arc::new(rows),
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            if let Job::Save { reply, .. } = job {
                let _ = reply.send(PersistReport::Failed {
                    attempts: 0,
                    error: StoreError::Unavailable("persistence worker stopped".into()),
                });
            }
        }
        rx
    }

    /// Wait until every save queued before this call has finished.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop accepting saves and wait for the pending ones.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.flush().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn run_worker(
    gateway: Arc<dyn PersistenceGateway>,
    config: PersistConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Save { rows, reply } => {
                let report = save_with_retry(&gateway, &config, rows).await;
                let _ = reply.send(report);
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Persistence worker stopped");
}

async fn save_with_retry(
    gateway: &Arc<dyn PersistenceGateway>,
    config: &PersistConfig,
    rows: Arc<Vec<Row>>,
) -> PersistReport {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let gw = gateway.clone();
        let blob = rows.clone();
        let result = tokio::task::spawn_blocking(move || gw.save(GRID_KEY, &blob))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("save task failed: {e}"))));

        match result {
            Ok(()) => {
                log::info!("Persisted grid ({} rows, attempt {attempt})", rows.len());
                return PersistReport::Saved { attempts: attempt };
            }
            Err(e) if attempt < max_attempts => {
                log::warn!("Save attempt {attempt}/{max_attempts} failed: {e}");
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Err(e) => {
                log::error!("Giving up on grid save after {attempt} attempts: {e}");
                return PersistReport::Failed {
                    attempts: attempt,
                    error: e,
                };
            }
        }
    }
}
