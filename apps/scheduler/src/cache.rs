use crate::types::{CacheRecord, CacheStatus, Job, unix_now};
use alloy::primitives::B256;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default queue key; status records live under `<ns>:status:<job id>`.
pub const DEFAULT_QUEUE_KEY: &str = "job_queue";

/// Records expire a day after their last write. An orphaned `pending` record
/// (crash between submit and stamp) therefore unblocks its job after at most
/// this long.
pub const STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("malformed cache payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Scratch space coordinating the poller and the dispatcher: a FIFO work
/// queue of job snapshots plus a keyed status map with TTL. The scheduler is
/// the only writer.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Push the job at the head of the queue.
    async fn enqueue(&self, job: &Job) -> Result<(), CacheError>;

    /// Block up to `timeout` for the next job at the tail of the queue.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, CacheError>;

    async fn get_status(&self, job_id: Uuid) -> Result<Option<CacheRecord>, CacheError>;

    /// Create or update the record for `job_id`, re-arming the TTL. An
    /// existing record keeps its `user_op_hash`; a fresh one starts at zero.
    async fn set_status(
        &self,
        job_id: Uuid,
        chain_id: u64,
        status: CacheStatus,
        error: Option<&str>,
    ) -> Result<(), CacheError>;

    /// Stamp the submitted hash into an existing record, preserving its
    /// status and remaining TTL.
    async fn set_user_op_hash(&self, job_id: Uuid, hash: B256) -> Result<(), CacheError>;

    async fn delete(&self, job_id: Uuid) -> Result<(), CacheError>;

    async fn list_by_status(&self, status: CacheStatus) -> Result<Vec<CacheRecord>, CacheError>;
}

/// Redis-backed cache. `ConnectionManager` multiplexes one reconnecting
/// connection; clones are cheap handles onto it.
pub struct RedisCache {
    conn: ConnectionManager,
    ns: String,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, ns: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Unavailable(anyhow::Error::new(e)))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| CacheError::Unavailable(anyhow::Error::new(e)))?;
        Ok(Self {
            conn,
            ns: ns.to_string(),
        })
    }

    fn status_key(&self, job_id: Uuid) -> String {
        format!("{}:status:{}", self.ns, job_id)
    }
}

fn redis_err(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(anyhow::Error::new(err))
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn enqueue(&self, job: &Job) -> Result<(), CacheError> {
        let payload = serde_json::to_string(job).map_err(CacheError::Decode)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.ns, payload)
            .await
            .map_err(redis_err)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, CacheError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&self.ns, timeout.as_secs().max(1) as usize)
            .await
            .map_err(redis_err)?;
        match popped {
            Some((_, payload)) => {
                let job = serde_json::from_str(&payload).map_err(CacheError::Decode)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<CacheRecord>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.status_key(job_id))
            .await
            .map_err(redis_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(CacheError::Decode))
            .transpose()
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        chain_id: u64,
        status: CacheStatus,
        error: Option<&str>,
    ) -> Result<(), CacheError> {
        let user_op_hash = self
            .get_status(job_id)
            .await?
            .map(|r| r.user_op_hash)
            .unwrap_or_default();
        let record = CacheRecord {
            job_id,
            chain_id,
            user_op_hash,
            status,
            error: error.unwrap_or_default().to_string(),
            updated_at: unix_now() as i64,
        };
        let payload = serde_json::to_string(&record).map_err(CacheError::Decode)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.status_key(job_id),
            payload,
            STATUS_TTL.as_secs() as usize,
        )
        .await
        .map_err(redis_err)
    }

    async fn set_user_op_hash(&self, job_id: Uuid, hash: B256) -> Result<(), CacheError> {
        let key = self.status_key(job_id);
        let Some(mut record) = self.get_status(job_id).await? else {
            // Expired between submit and stamp; the TTL path re-enqueues.
            tracing::warn!(job_id = %job_id, "no cache record to stamp user op hash into");
            return Ok(());
        };
        record.user_op_hash = hash;
        record.updated_at = unix_now() as i64;

        let mut conn = self.conn.clone();
        let remaining: i64 = conn.ttl(&key).await.map_err(redis_err)?;
        let ttl = if remaining > 0 {
            remaining as usize
        } else {
            STATUS_TTL.as_secs() as usize
        };
        let payload = serde_json::to_string(&record).map_err(CacheError::Decode)?;
        conn.set_ex::<_, _, ()>(key, payload, ttl)
            .await
            .map_err(redis_err)
    }

    async fn delete(&self, job_id: Uuid) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.status_key(job_id))
            .await
            .map_err(redis_err)
    }

    async fn list_by_status(&self, status: CacheStatus) -> Result<Vec<CacheRecord>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:status:*", self.ns);
        let keys: Vec<String> = {
            let mut iter = conn.scan_match(&pattern).await.map_err(redis_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut records = Vec::new();
        for key in keys {
            // A record may expire or be deleted between the scan and the
            // read; skip it.
            let raw: Option<String> = conn.get(&key).await.map_err(redis_err)?;
            let Some(raw) = raw else { continue };
            let record: CacheRecord = serde_json::from_str(&raw).map_err(CacheError::Decode)?;
            if record.status == status {
                records.push(record);
            }
        }
        Ok(records)
    }
}
