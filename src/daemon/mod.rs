//! Daemon for processing batch units with bounded concurrency.
//!
//! The daemon continuously claims pending batches from storage, dispatches
//! them to worker tasks up to a concurrency cap, and records each batch's
//! outcome. A supervisory sweep returns batches stuck in processing (crashed
//! worker, lost task) to the queue. Multiple daemon instances may run against
//! the same storage; the atomic claim keeps them from stepping on each other.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};

use crate::domain::{OutcomeResult, WorkerId};
use crate::error::Result;
use crate::rows::RowSource;
use crate::storage::Storage;

pub mod worker;

/// Configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Maximum number of batches to claim in each iteration.
    pub claim_batch_size: usize,

    /// How long to sleep between claim iterations.
    pub claim_interval_ms: u64,

    /// Maximum number of batch units processed concurrently.
    pub worker_concurrency: usize,

    /// How long a batch may sit in processing before the sweep treats its
    /// worker as crashed and returns it to pending.
    pub processing_timeout_ms: u64,

    /// Interval of the stuck-batch sweep.
    pub sweep_interval_ms: u64,

    /// Interval for logging daemon status (batches in flight).
    /// Set to None to disable periodic status logging.
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 4,
            claim_interval_ms: 500,
            worker_concurrency: 4,
            processing_timeout_ms: 600_000, // 10 minutes
            sweep_interval_ms: 30_000,
            status_log_interval_ms: Some(2000),
        }
    }
}

/// Daemon that processes claimed batch units.
pub struct Daemon<S, R> {
    worker_id: WorkerId,
    storage: Arc<S>,
    rows: Arc<R>,
    config: DaemonConfig,
    batches_in_flight: Arc<AtomicUsize>,
    batches_processed: Arc<AtomicU64>,
    batches_failed: Arc<AtomicU64>,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl<S, R> Daemon<S, R>
where
    S: Storage + 'static,
    R: RowSource + 'static,
{
    pub fn new(
        storage: Arc<S>,
        rows: Arc<R>,
        config: DaemonConfig,
        shutdown_token: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            worker_id: WorkerId::from(uuid::Uuid::new_v4()),
            storage,
            rows,
            config,
            batches_in_flight: Arc::new(AtomicUsize::new(0)),
            batches_processed: Arc::new(AtomicU64::new(0)),
            batches_failed: Arc::new(AtomicU64::new(0)),
            shutdown_token,
        }
    }

    /// Spawn the daemon onto the runtime and return its handle.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run the daemon loop until shutdown.
    ///
    /// On shutdown the loop stops claiming but drains in-flight units, so
    /// every started batch still gets its outcome recorded.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Daemon starting main processing loop");

        // Supervisory sweep: return batches stuck in processing to pending.
        {
            let storage = self.storage.clone();
            let shutdown = self.shutdown_token.clone();
            let sweep_interval_ms = self.config.sweep_interval_ms;
            let timeout_ms = self.config.processing_timeout_ms;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(sweep_interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match storage
                                .requeue_stuck(chrono::Duration::milliseconds(timeout_ms as i64))
                                .await
                            {
                                Ok(requeued) => {
                                    for (session_id, batch_number) in requeued {
                                        tracing::warn!(
                                            session_id = %session_id,
                                            batch_number,
                                            "Requeued batch stuck in processing"
                                        );
                                        counter!("girder_batches_requeued_total").increment(1);
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "Stuck-batch sweep failed");
                                }
                            }
                        }
                        _ = shutdown.cancelled() => {
                            tracing::info!("Shutting down stuck-batch sweep");
                            break;
                        }
                    }
                }
            });
        }

        // Periodic status logging, if configured.
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let batches_in_flight = self.batches_in_flight.clone();
            let worker_id = self.worker_id;
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            tracing::debug!(
                                worker_id = %worker_id,
                                batches_in_flight = batches_in_flight.load(Ordering::Relaxed),
                                "Daemon status"
                            );
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            });
        }

        let mut join_set: JoinSet<()> = JoinSet::new();

        let run_result = loop {
            if self.shutdown_token.is_cancelled() {
                tracing::info!("Shutdown signal received, stopping daemon");
                break Ok(());
            }

            // Poll for completed tasks (non-blocking).
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Batch task panicked");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)) => {},
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping daemon");
                    break Ok(());
                }
            }

            let capacity = self
                .config
                .worker_concurrency
                .saturating_sub(self.batches_in_flight.load(Ordering::SeqCst));
            if capacity == 0 {
                continue;
            }

            let claimed = match self
                .storage
                .claim_batches(capacity.min(self.config.claim_batch_size), self.worker_id)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => break Err(e),
            };

            for batch in claimed {
                let storage = self.storage.clone();
                let rows = self.rows.clone();
                let batches_processed = self.batches_processed.clone();
                let batches_failed = self.batches_failed.clone();
                self.batches_in_flight.fetch_add(1, Ordering::SeqCst);
                let guard = InFlightGuard {
                    in_flight: self.batches_in_flight.clone(),
                };

                join_set.spawn(async move {
                    let _guard = guard;
                    let session_id = batch.data.session_id;
                    let batch_number = batch.data.batch_number;

                    let outcome = worker::process_batch(storage.as_ref(), rows.as_ref(), batch).await;
                    let succeeded = matches!(outcome.result, OutcomeResult::Succeeded { .. });

                    if let Err(e) = storage.apply_outcome(outcome).await {
                        tracing::error!(
                            session_id = %session_id,
                            batch_number,
                            error = %e,
                            "Failed to record batch outcome"
                        );
                    }

                    if succeeded {
                        batches_processed.fetch_add(1, Ordering::Relaxed);
                        counter!("girder_batches_total", "outcome" => "succeeded").increment(1);
                    } else {
                        batches_failed.fetch_add(1, Ordering::Relaxed);
                        counter!("girder_batches_total", "outcome" => "failed").increment(1);
                    }
                });
            }
        };

        // Drain in-flight units so every started batch records its outcome.
        while join_set.join_next().await.is_some() {}

        tracing::info!(
            processed = self.batches_processed.load(Ordering::Relaxed),
            failed = self.batches_failed.load(Ordering::Relaxed),
            "Daemon stopped"
        );
        run_result
    }
}

/// Guard that decrements the in-flight counter when dropped, even if the
/// batch task is cancelled or panics.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
