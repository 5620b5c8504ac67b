//! Background worker that drains the provisioning queue.
//!
//! Polls for due batches, claims them atomically, and executes each under
//! a concurrency-limiting semaphore. Housekeeping ticks release stale
//! claims from dead workers and evict aged-out breaker windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::breaker::BreakerCache;
use crate::executor::ProvisioningExecutor;
use crate::queue::{OperationQueue, QueueStore};
use crate::store::Page;

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max batches executing at once.
    pub concurrency: usize,
    /// Queue poll interval.
    pub poll_interval: Duration,
    /// How often stale claims are released.
    pub stale_claim_interval: Duration,
    /// Claims older than this are considered abandoned.
    pub stale_claim_age: Duration,
    /// How often the breaker cache drops aged-out windows.
    pub breaker_evict_interval: Duration,
    /// Widest configured breaker window; windows older than this are
    /// always safe to drop.
    pub breaker_evict_window: Duration,
    /// Batches fetched per poll.
    pub scan_page_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            stale_claim_interval: Duration::from_secs(60),
            stale_claim_age: Duration::from_secs(600),
            breaker_evict_interval: Duration::from_secs(300),
            breaker_evict_window: Duration::from_secs(3600),
            scan_page_size: 50,
        }
    }
}

/// Long-running queue drainer. One per process is the intended shape;
/// several processes cooperate safely through atomic claims.
pub struct ProvisioningWorker {
    executor: Arc<ProvisioningExecutor>,
    queue: Arc<OperationQueue>,
    queue_store: Arc<dyn QueueStore>,
    breaker: Arc<BreakerCache>,
    config: WorkerConfig,
    instance_id: Uuid,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProvisioningWorker {
    /// Wire up a worker.
    pub fn new(
        executor: Arc<ProvisioningExecutor>,
        queue: Arc<OperationQueue>,
        queue_store: Arc<dyn QueueStore>,
        breaker: Arc<BreakerCache>,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            queue,
            queue_store,
            breaker,
            config,
            instance_id: Uuid::new_v4(),
            semaphore,
            shutdown_tx,
        }
    }

    /// This worker's instance id, recorded on claims it takes.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Signal the loop to stop after in-flight batches finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until shutdown.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn run(&self) {
        info!(concurrency = self.config.concurrency, "provisioning worker started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut stale = tokio::time::interval(self.config.stale_claim_interval);
        let mut evict = tokio::time::interval(self.config.breaker_evict_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(error = %err, "queue poll failed");
                    }
                }
                _ = stale.tick() => {
                    self.release_stale().await;
                }
                _ = evict.tick() => {
                    self.breaker.evict_expired(
                        chrono::Duration::from_std(self.config.breaker_evict_window)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
                        Utc::now(),
                    );
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Wait for in-flight batches by draining all permits.
        let _ = self
            .semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("provisioning worker stopped");
    }

    /// One poll: claim due batches and execute them concurrently.
    pub async fn poll_once(&self) -> Result<(), crate::queue::QueueError> {
        let batches = self
            .queue
            .find_batches_to_process(&self.breaker, Page::first(self.config.scan_page_size))
            .await?;
        if batches.is_empty() {
            return Ok(());
        }
        debug!(count = batches.len(), "due batches found");

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            if !self.queue.claim_batch(batch.id, self.instance_id).await? {
                // Another worker got there first.
                continue;
            }
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = Arc::clone(&self.executor);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = executor.execute_batch(batch.id).await {
                    error!(batch_id = %batch.id, error = %err, "batch execution failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn release_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_claim_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        match self.queue_store.release_stale_claims(cutoff).await {
            Ok(0) => {}
            Ok(released) => warn!(released, "released stale batch claims"),
            Err(err) => error!(error = %err, "stale claim release failed"),
        }
    }
}
