//! Request/reply RPC over the message broker.
//!
//! This module contains:
//! - `RpcClient`: correlation-id request/reply through a temporary reply queue
//! - `RpcServer`: one durable `{service}.{operation}` queue per operation,
//!   exactly one reply per request
//! - `RpcHandler` trait: for serving operations

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::BrokerError;

pub mod client;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use server::{RpcServer, RpcServerHandle};

#[cfg(feature = "amqp")]
/// RPC client over RabbitMQ.
pub type AmqpRpcClient = RpcClient<crate::transport::AmqpTransport>;
#[cfg(feature = "amqp")]
/// RPC server over RabbitMQ.
pub type AmqpRpcServer = RpcServer<crate::transport::AmqpTransport>;

/// Content type of every request and reply body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced to RPC callers and server owners.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Reply stream closed before a reply arrived")]
    ReplyStreamClosed,

    #[error("Invalid registration: {0}")]
    Registration(String),
}

/// Failure raised by an operation handler.
///
/// Never reaches the caller as is: the server replies with the generic
/// failure envelope instead.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Service response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub status: bool,
    pub message: String,
    pub data: Value,
}

impl ServiceResponse {
    /// The generic failure envelope sent whenever a handler fails.
    pub fn error() -> Self {
        Self {
            status: false,
            message: "Error".to_string(),
            data: Value::Null,
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "status": self.status,
            "message": self.message,
            "data": self.data,
        })
    }
}

/// Decode a message body. An empty body is the empty string, not null.
pub fn decode_body(body: &[u8]) -> std::result::Result<Value, serde_json::Error> {
    if body.is_empty() {
        return Ok(Value::String(String::new()));
    }
    serde_json::from_slice(body)
}

/// Handler for one RPC operation.
pub trait RpcHandler: Send + Sync {
    fn call(&self, request: Value) -> BoxFuture<'static, std::result::Result<Value, HandlerError>>;
}

/// Adapt an async closure into an `RpcHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, request: Value) -> BoxFuture<'static, std::result::Result<Value, HandlerError>> {
        Box::pin((self.0)(request))
    }
}
