//! Stream-backed event bus.
//!
//! Producers append `{type, payload, jobId}` entries to a stream and record
//! the job as pending. Consumers claim entries through a consumer group,
//! fan each one out to every registered handler, write the terminal status
//! and only then acknowledge the entry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::dispatch::{decode_entry, dispatch_to_handlers, DispatchResult, Handlers};
use super::status::{check_job_id, JobStatus, JobStatusStore};
use super::{BusError, BusEvent, BusEventHandler, BusOptions, Result};
use crate::storage::{
    ConnectionPool, GroupInit, ReadCursor, StoreManager, StreamConnection, StreamEntry,
};
use crate::utils::retry::{CONSUME_IDLE_DELAY, READ_ERROR_BACKOFF};
use crate::utils::TaskHandle;

/// Poll interval used by callers that have no better idea.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Durable competing-consumers event bus.
pub struct EventBus<M: StoreManager> {
    pool: ConnectionPool<M>,
    options: BusOptions,
    statuses: JobStatusStore<M>,
    handlers: Handlers,
}

impl<M: StoreManager> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            statuses: self.statuses.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<M: StoreManager> EventBus<M> {
    /// Create a bus. Validates options; no store call is made.
    pub fn new(pool: ConnectionPool<M>, options: BusOptions) -> Result<Self> {
        options.validate()?;
        let statuses = JobStatusStore::new(pool.clone(), options.status_key.clone());
        Ok(Self {
            pool,
            options,
            statuses,
            handlers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Create the consumer group and write the readiness sentinel.
    ///
    /// Safe to repeat: an existing group keeps its cursor.
    pub async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        match conn
            .create_group(&self.options.stream_key, &self.options.group)
            .await?
        {
            GroupInit::Created => info!(
                stream = %self.options.stream_key,
                group = %self.options.group,
                "Consumer group created"
            ),
            GroupInit::Existing => debug!(
                stream = %self.options.stream_key,
                group = %self.options.group,
                "Consumer group already exists"
            ),
        }
        drop(conn);

        self.statuses.mark_ready().await
    }

    /// `new` followed by `init`.
    pub async fn connect(pool: ConnectionPool<M>, options: BusOptions) -> Result<Self> {
        let bus = Self::new(pool, options)?;
        bus.init().await?;
        Ok(bus)
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    pub fn statuses(&self) -> &JobStatusStore<M> {
        &self.statuses
    }

    /// Append an event and return its job id without waiting for a consumer.
    ///
    /// The job is recorded as pending before the entry becomes visible.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(stream = %self.options.stream_key, event_type = %event.event_type))]
    pub async fn publish(&self, event: &BusEvent) -> Result<String> {
        let payload = serde_json::to_string(&event.payload)?;
        let job_id = generate_job_id();

        self.statuses.set(&job_id, JobStatus::Pending).await?;

        let mut conn = self.pool.acquire().await?;
        let entry_id = conn
            .append(
                &self.options.stream_key,
                &[
                    ("type", event.event_type.as_str()),
                    ("payload", payload.as_str()),
                    ("jobId", job_id.as_str()),
                ],
            )
            .await?;

        debug!(job_id = %job_id, entry_id = %entry_id, "Event published");
        Ok(job_id)
    }

    /// Register a handler. Every handler sees every event.
    pub async fn subscribe(&self, handler: Arc<dyn BusEventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Current status of a job.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        self.statuses.get(job_id).await
    }

    /// Perform one read step for `consumer` and process what it returned.
    ///
    /// Returns the number of entries processed. Read errors propagate;
    /// handler failures only mark the job failed.
    pub async fn consume_once(&self, consumer: &str, cursor: ReadCursor) -> Result<usize> {
        let entries = {
            let mut conn = self.pool.acquire().await?;
            conn.read_group(
                &self.options.stream_key,
                &self.options.group,
                consumer,
                cursor,
                self.options.consume_count(),
                self.options.block_timeout(),
            )
            .await?
        };

        let count = entries.len();
        for entry in entries {
            self.process_entry(entry).await?;
        }
        Ok(count)
    }

    async fn process_entry(&self, entry: StreamEntry) -> Result<()> {
        let (job_id, result) = match decode_entry(&entry) {
            (_, Ok(message)) => {
                let job_id = message.job_id.clone();
                if let Some(status) = self.statuses.get(&job_id).await? {
                    if status.is_terminal() {
                        debug!(job_id = %job_id, status = %status, "Job already finished, acknowledging");
                        return self.ack(&entry.id).await;
                    }
                }
                self.statuses.set(&job_id, JobStatus::InProgress).await?;
                let result = dispatch_to_handlers(&self.handlers, &Arc::new(message)).await;
                (Some(job_id), result)
            }
            (job_id, Err(e)) => {
                error!(entry_id = %entry.id, error = %e, "Malformed stream entry");
                (job_id, DispatchResult::DecodeError)
            }
        };

        if let Some(job_id) = job_id {
            let outcome = if result.is_success() {
                JobStatus::Processed
            } else {
                JobStatus::Failed
            };
            self.statuses.set(&job_id, outcome).await?;
            debug!(job_id = %job_id, status = %outcome, result = ?result, "Job finished");
        }

        self.ack(&entry.id).await
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ack(&self.options.stream_key, &self.options.group, entry_id)
            .await?;
        Ok(())
    }

    /// Spawn the continuous consume loop for `consumer`.
    ///
    /// The loop first drains this consumer's pending entries, left over from
    /// a previous run that died before acknowledging, then reads new ones.
    pub fn start_consuming(&self, consumer: impl Into<String>) -> TaskHandle {
        let bus = self.clone();
        let consumer = consumer.into();

        TaskHandle::spawn(move |mut shutdown| async move {
            info!(
                stream = %bus.options.stream_key,
                group = %bus.options.group,
                consumer = %consumer,
                "Bus consumer started"
            );

            let mut cursor = ReadCursor::Pending;
            while !shutdown.is_requested() {
                let step = tokio::select! {
                    step = bus.consume_once(&consumer, cursor) => step,
                    _ = shutdown.requested() => break,
                };

                let delay = match step {
                    Ok(0) if cursor == ReadCursor::Pending => {
                        cursor = ReadCursor::New;
                        continue;
                    }
                    Ok(_) => CONSUME_IDLE_DELAY,
                    Err(e) => {
                        error!(consumer = %consumer, error = %e, "Bus read step failed");
                        cursor = ReadCursor::Pending;
                        READ_ERROR_BACKOFF
                    }
                };

                if !shutdown.sleep(delay).await {
                    break;
                }
            }

            info!(consumer = %consumer, "Bus consumer stopped");
        })
    }

    /// Build a future resolving once `job_id` is processed.
    ///
    /// Arguments are checked before any polling starts. The future polls
    /// every `delay`, fails with `BusError::JobFailed` when the job fails and
    /// never gives up otherwise. Store errors during a poll are logged and
    /// the next poll proceeds as usual.
    pub fn wait_for_completion(
        &self,
        job_id: &str,
        delay: Duration,
    ) -> Result<impl Future<Output = Result<()>> + Send + 'static> {
        check_job_id(job_id)?;
        if delay.is_zero() {
            return Err(BusError::InvalidArgument(
                "poll delay must be positive".to_string(),
            ));
        }

        let statuses = self.statuses.clone();
        let job_id = job_id.to_string();

        Ok(async move {
            loop {
                match statuses.get(&job_id).await {
                    Ok(Some(JobStatus::Processed)) => return Ok(()),
                    Ok(Some(JobStatus::Failed)) => {
                        warn!(job_id = %job_id, "Job failed");
                        return Err(BusError::JobFailed(job_id));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "Job status poll failed"),
                }
                tokio::time::sleep(delay).await;
            }
        })
    }
}

/// `{epoch-millis}-{random}`. Unique enough for tracking, not for security.
fn generate_job_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}
