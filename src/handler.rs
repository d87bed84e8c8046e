// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Contract
//!
//! Implement [`ConsumerHandler`] to process messages delivered to a queue. A
//! handler is invoked once per delivery; retried and redelivered messages are a
//! normal outcome, so implementations must tolerate seeing the same payload
//! more than once.

use async_trait::async_trait;
use opentelemetry::Context;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by a handler. Any error drives the retry / dead-letter
/// decision of the consumer; it is never surfaced as a process-level error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

/// A message handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    /// Number of previous delivery attempts known to the broker.
    pub retry_count: i64,
}

impl ConsumerMessage {
    pub fn new(queue: &str, data: &[u8]) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            exchange: "".to_owned(),
            routing_key: "".to_owned(),
            msg_type: None,
            data: data.to_vec(),
            retry_count: 0,
        }
    }

    /// Deserializes the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.data).map_err(|err| HandlerError::new(err.to_string()))
    }
}

/// Processes one delivered message.
///
/// `ctx` carries the trace context extracted from the message and the
/// consumer's [`CancellationToken`], reachable with [`cancellation`].
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Returns the consumer cancellation token attached to a handler context.
pub fn cancellation(ctx: &Context) -> Option<&CancellationToken> {
    ctx.get::<CancellationToken>()
}
