use alloy::primitives::{Address, B256, Bytes};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use userop::UserOperation;
use uuid::Uuid;

/// Persistent job status. Once a job leaves `queuing` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queuing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Queuing => "queuing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "queuing" => Ok(Self::Queuing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown job status: {other}"),
        }
    }
}

/// A registered recurring job. The embedded user operation is the template
/// the owner signed up with: `sender`, `nonce` key, `callData` and the
/// validator-selecting signature prefix. Gas fields and the dynamic
/// signature are filled in per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub account: Address,
    pub chain_id: u64,
    pub on_chain_job_id: i64,
    pub entry_point: Address,
    pub user_op: UserOperation,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-flight status of a cache record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Pending,
    Completed,
    Failed,
}

/// The cache's view of one job submission attempt. `user_op_hash` stays zero
/// until the dispatcher has submitted and stamped the bundler's hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub job_id: Uuid,
    pub chain_id: u64,
    pub user_op_hash: B256,
    pub status: CacheStatus,
    #[serde(default)]
    pub error: String,
    pub updated_at: i64,
}

/// On-chain schedule state read from the scheduled-transfers module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub execute_interval: u64,
    pub number_of_executions: u16,
    pub number_of_executions_completed: u16,
    pub start_date: u64,
    pub is_enabled: bool,
    pub last_execution_time: u64,
    pub execution_data: Bytes,
}

/// Whether the schedule calls for an execution at `now` (unix seconds).
/// A job that has never run is due once its start date has passed (or
/// immediately, if none was set); afterwards it is due one interval after
/// the last execution.
pub fn is_due(config: &ExecutionConfig, now: u64) -> bool {
    if !config.is_enabled {
        return false;
    }
    if config.last_execution_time == 0 {
        return config.start_date == 0 || now >= config.start_date;
    }
    now >= config.last_execution_time + config.execute_interval
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn parse_hex_32(name: &str, value: &str) -> Result<[u8; 32]> {
    let trimmed = value.trim();
    let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(stripped).with_context(|| format!("decode {name} hex"))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{name} must be exactly 32 bytes"))?;
    Ok(arr)
}
