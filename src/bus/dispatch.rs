//! Handler dispatch utilities.
//!
//! Fans a decoded stream entry out to every registered handler.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio::sync::RwLock;
use tracing::error;

use super::status::READY_FIELD;
use super::{BusError, BusEvent, BusEventHandler, BusMessage};
use crate::storage::StreamEntry;

/// Shared handler table.
pub type Handlers = Arc<RwLock<Vec<Arc<dyn BusEventHandler>>>>;

/// Result of processing a stream entry through handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded.
    Success,
    /// One or more handlers failed.
    HandlerFailed,
    /// Entry could not be decoded; no redelivery will help.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if all handlers succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Adapt an async closure into a `BusEventHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn BusEventHandler>
where
    F: Fn(Arc<BusMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

impl<F, Fut> BusEventHandler for FnHandler<F>
where
    F: Fn(Arc<BusMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    fn handle(&self, message: Arc<BusMessage>) -> BoxFuture<'static, Result<(), BusError>> {
        Box::pin((self.0)(message))
    }
}

/// Decode a raw stream entry into a `BusMessage`.
///
/// The job id is returned separately so callers can still mark a job failed
/// when the rest of the entry is malformed.
pub fn decode_entry(entry: &StreamEntry) -> (Option<String>, Result<BusMessage, String>) {
    let job_id = entry
        .field("jobId")
        .filter(|id| !id.is_empty() && *id != READY_FIELD)
        .map(str::to_string);

    let message = (|| -> Result<BusMessage, String> {
        let job_id = job_id.clone().ok_or("missing or invalid jobId field")?;
        let event_type = entry.field("type").ok_or("missing type field")?;
        let raw = entry.field("payload").ok_or("missing payload field")?;
        let payload = serde_json::from_str(raw).map_err(|e| format!("invalid payload: {}", e))?;
        Ok(BusMessage {
            id: entry.id.clone(),
            job_id,
            event: BusEvent {
                event_type: event_type.to_string(),
                payload,
            },
        })
    })();

    (job_id, message)
}

/// Dispatch a message to all registered handlers concurrently.
///
/// Every handler runs even if another fails.
pub async fn dispatch_to_handlers(
    handlers: &Handlers,
    message: &Arc<BusMessage>,
) -> DispatchResult {
    let snapshot: Vec<_> = handlers.read().await.iter().cloned().collect();

    let results = join_all(
        snapshot
            .iter()
            .map(|handler| handler.handle(Arc::clone(message))),
    )
    .await;

    let mut result = DispatchResult::Success;
    for e in results.into_iter().filter_map(|r| r.err()) {
        error!(
            job_id = %message.job_id,
            event_type = %message.event.event_type,
            error = %e,
            "Handler failed"
        );
        result = DispatchResult::HandlerFailed;
    }
    result
}
