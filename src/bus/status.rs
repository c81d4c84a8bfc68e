//! Per-job lifecycle status.
//!
//! One hash per bus, keyed by job id. The hash also carries a sentinel
//! field written at bus init, which is never a job id.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::{BusError, Result};
use crate::storage::{ConnectionPool, StoreManager, StreamConnection};

/// Hash field holding the bus readiness sentinel.
pub const READY_FIELD: &str = "status";

/// Sentinel value written under `READY_FIELD` at init.
pub const READY_VALUE: &str = "ready";

/// Job lifecycle: pending → in_progress → processed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    InProgress,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        }
    }

    /// Processed and failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Processed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "processed" => Ok(JobStatus::Processed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Job status hash. Each call acquires its own pooled session.
pub struct JobStatusStore<M: StoreManager> {
    pool: ConnectionPool<M>,
    key: String,
}

impl<M: StoreManager> Clone for JobStatusStore<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key: self.key.clone(),
        }
    }
}

impl<M: StoreManager> JobStatusStore<M> {
    pub fn new(pool: ConnectionPool<M>, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Write the readiness sentinel.
    pub async fn mark_ready(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.hash_set(&self.key, READY_FIELD, READY_VALUE).await?;
        Ok(())
    }

    /// Overwrite a job's status.
    pub async fn set(&self, job_id: &str, status: JobStatus) -> Result<()> {
        check_job_id(job_id)?;
        let mut conn = self.pool.acquire().await?;
        conn.hash_set(&self.key, job_id, status.as_str()).await?;
        Ok(())
    }

    /// Current status of a job, or `None` if unknown.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobStatus>> {
        check_job_id(job_id)?;
        let mut conn = self.pool.acquire().await?;
        let raw = conn.hash_get(&self.key, job_id).await?;

        Ok(raw.and_then(|value| match value.parse() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Ignoring unrecognised job status");
                None
            }
        }))
    }
}

/// Reject ids that cannot name a job: empty, or the sentinel field.
pub(crate) fn check_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() {
        return Err(BusError::InvalidArgument("job id must not be empty".to_string()));
    }
    if job_id == READY_FIELD {
        return Err(BusError::InvalidArgument(format!(
            "'{}' is reserved and not a job id",
            READY_FIELD
        )));
    }
    Ok(())
}
