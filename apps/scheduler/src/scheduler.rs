use crate::cache::{CacheError, CacheStore};
use crate::chain::ChainRegistry;
use crate::db::JobRepository;
use crate::executor::ExecutionService;
use crate::types::{CacheStatus, Job, JobStatus, is_due, unix_now};
use alloy::primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const RECEIPT_FAILED_ON_CHAIN: &str = "user operation failed on-chain";

/// The pipeline moving jobs through queuing → pending → completed/failed.
///
/// Two workers: the poller reconciles receipts, syncs terminal statuses to
/// the database and enqueues due jobs once per interval; the dispatcher
/// drains the queue and hands each job to the execution service. The cache
/// is the only shared mutable state, and for any single job id the two
/// workers never touch its record concurrently: the poller skips jobs that
/// are already pending, and the dispatcher only writes after dequeuing.
pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    cache: Arc<dyn CacheStore>,
    chains: Arc<ChainRegistry>,
    executor: Arc<ExecutionService>,
    polling_interval: Duration,
}

/// Running scheduler workers. `stop` cancels them and waits for both to
/// exit, up to a bounded grace period.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl SchedulerHandle {
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let drained = tokio::time::timeout(STOP_TIMEOUT, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("scheduler workers did not exit within {STOP_TIMEOUT:?}; aborting");
            self.workers.abort_all();
        }
    }
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        cache: Arc<dyn CacheStore>,
        chains: Arc<ChainRegistry>,
        executor: Arc<ExecutionService>,
        polling_interval: Duration,
    ) -> Self {
        Self {
            repo,
            cache,
            chains,
            executor,
            polling_interval,
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let this = Arc::new(self);
        let mut workers = JoinSet::new();
        workers.spawn(this.clone().poller_loop(shutdown.clone()));
        workers.spawn(this.dispatcher_loop(shutdown.clone()));
        SchedulerHandle { shutdown, workers }
    }

    async fn poller_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("poller stopped");
                    return;
                }
                _ = interval.tick() => {}
            }
            // A cache outage aborts the tick; everything retries next
            // interval.
            if let Err(err) = self.tick().await {
                tracing::warn!(err = %err, "poller tick failed");
            }
        }
    }

    async fn dispatcher_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("dispatcher stopped");
                    return;
                }
                popped = self.cache.dequeue(DEQUEUE_TIMEOUT) => match popped {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(err = %err, "dequeue failed");
                        tokio::time::sleep(DEQUEUE_TIMEOUT).await;
                        continue;
                    }
                }
            };
            // Deliberately not raced against shutdown: aborting a
            // submission mid-RPC risks a double submit on restart. If
            // shutdown preempts the hash stamp below, the record expires
            // via TTL and the job is re-enqueued.
            self.dispatch_one(job).await;
        }
    }

    async fn dispatch_one(&self, job: Job) {
        tracing::info!(job_id = %job.id, chain_id = job.chain_id, "executing job");
        match self.executor.execute(&job).await {
            Ok(user_op_hash) => {
                tracing::info!(job_id = %job.id, user_op_hash = %user_op_hash, "user operation submitted");
                if let Err(err) = self.cache.set_user_op_hash(job.id, user_op_hash).await {
                    tracing::warn!(job_id = %job.id, err = %err, "failed to stamp user op hash");
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, err = %err, "job execution failed");
                if let Err(cache_err) = self
                    .cache
                    .set_status(job.id, job.chain_id, CacheStatus::Failed, Some(&err.to_string()))
                    .await
                {
                    tracing::warn!(job_id = %job.id, err = %cache_err, "failed to record job failure");
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), CacheError> {
        self.reconcile_receipts().await?;
        self.sync_cache_to_db().await?;
        self.enqueue_due_jobs().await?;
        Ok(())
    }

    /// Step 1: poll receipts for every pending record that has a submitted
    /// hash, and promote them to completed/failed in the cache.
    async fn reconcile_receipts(&self) -> Result<(), CacheError> {
        let pending = self.cache.list_by_status(CacheStatus::Pending).await?;
        let mut by_chain: HashMap<u64, Vec<_>> = HashMap::new();
        for record in pending {
            by_chain.entry(record.chain_id).or_default().push(record);
        }

        for (chain_id, records) in by_chain {
            let chain = match self.chains.get(chain_id) {
                Ok(chain) => chain,
                Err(err) => {
                    tracing::warn!(chain_id, err = %err, "pending records on unsupported chain");
                    continue;
                }
            };
            for record in records {
                // Submission has not finished yet; nothing to poll.
                if record.user_op_hash == B256::ZERO {
                    continue;
                }
                match chain
                    .bundler
                    .get_user_operation_receipt(record.user_op_hash)
                    .await
                {
                    Ok(None) => {}
                    Ok(Some(receipt)) if receipt.success => {
                        self.cache
                            .set_status(record.job_id, record.chain_id, CacheStatus::Completed, None)
                            .await?;
                    }
                    Ok(Some(_)) => {
                        self.cache
                            .set_status(
                                record.job_id,
                                record.chain_id,
                                CacheStatus::Failed,
                                Some(RECEIPT_FAILED_ON_CHAIN),
                            )
                            .await?;
                    }
                    Err(err) => {
                        tracing::warn!(
                            job_id = %record.job_id,
                            user_op_hash = %record.user_op_hash,
                            err = %err,
                            "receipt poll failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 2: write terminal cache statuses to the repository, then evict.
    /// A failed write leaves the record for the next tick.
    async fn sync_cache_to_db(&self) -> Result<(), CacheError> {
        for status in [CacheStatus::Completed, CacheStatus::Failed] {
            for record in self.cache.list_by_status(status).await? {
                let job_status = match record.status {
                    CacheStatus::Completed => JobStatus::Completed,
                    CacheStatus::Failed => JobStatus::Failed,
                    CacheStatus::Pending => continue,
                };
                let error_message = (!record.error.is_empty()).then_some(record.error.as_str());
                match self
                    .repo
                    .update_status(record.job_id, job_status, error_message)
                    .await
                {
                    Ok(()) => self.cache.delete(record.job_id).await?,
                    Err(err) => {
                        tracing::warn!(job_id = %record.job_id, err = %err, "status sync failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Steps 3–5: load active jobs, skip the ones already in flight, and
    /// enqueue those whose on-chain schedule says they are due.
    async fn enqueue_due_jobs(&self) -> Result<(), CacheError> {
        let jobs = match self.repo.find_active().await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(err = %err, "failed to load active jobs");
                return Ok(());
            }
        };

        let now = unix_now();
        for job in jobs {
            if let Some(record) = self.cache.get_status(job.id).await? {
                if record.status == CacheStatus::Pending {
                    continue;
                }
            }

            let chain = match self.chains.get(job.chain_id) {
                Ok(chain) => chain,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, err = %err, "job on unsupported chain");
                    continue;
                }
            };
            let config = match chain
                .reader
                .read_execution_log(job.account, job.on_chain_job_id)
                .await
            {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, err = %err, "failed to read execution log");
                    continue;
                }
            };
            tracing::debug!(
                job_id = %job.id,
                interval = config.execute_interval,
                completed = config.number_of_executions_completed,
                total = config.number_of_executions,
                data = %config.execution_data,
                "execution log read"
            );
            if !is_due(&config, now) {
                continue;
            }

            tracing::info!(job_id = %job.id, chain_id = job.chain_id, "job due, enqueueing");
            self.cache.enqueue(&job).await?;
            self.cache
                .set_status(job.id, job.chain_id, CacheStatus::Pending, None)
                .await?;
        }
        Ok(())
    }
}
