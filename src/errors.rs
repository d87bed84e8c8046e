// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable AMQP Client
//!
//! This module provides the error taxonomy for every broker-facing operation.
//! Connection, channel and declare failures are returned synchronously to the
//! caller that triggered them; consume-loop failures are observed only by the
//! supervisor.

use std::fmt;
use thiserror::Error;

/// The topology step that failed while preparing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStep {
    Exchange,
    Queue,
    Binding,
    QoS,
    ConfirmMode,
}

impl fmt::Display for DeclareStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            DeclareStep::Exchange => "exchange",
            DeclareStep::Queue => "queue",
            DeclareStep::Binding => "binding",
            DeclareStep::QoS => "qos",
            DeclareStep::ConfirmMode => "confirm-mode",
        };
        f.write_str(step)
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant maps to one failure class of the client layer. Variants carry
/// the broker's reason as text so the error stays comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Broker alias could not be resolved or configuration could not be parsed
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A topology step failed while preparing a channel
    #[error("failure to declare {step} `{name}` for `{descriptor}`: {reason}")]
    DeclareError {
        step: DeclareStep,
        name: String,
        descriptor: String,
        reason: String,
    },

    /// The broker refused the publish or the channel failed while sending
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker answered a publisher confirm with a nack
    #[error("broker nacked the message published to `{0}`")]
    PublishNackError(String),

    /// The publish did not complete before its deadline
    #[error("publish to `{0}` timed out")]
    PublishTimeoutError(String),

    /// The publisher confirm did not arrive before the deadline
    #[error("publisher confirm for `{0}` timed out")]
    ConfirmTimeoutError(String),

    /// One or more messages of a batch were not published
    #[error("failure to publish {} of {total} messages (indices {failed:?}): {first}", .failed.len())]
    BatchPublishError {
        failed: Vec<usize>,
        total: usize,
        first: Box<AmqpError>,
    },

    /// The caller canceled the operation
    #[error("operation canceled")]
    Cancelled,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The channel closed unexpectedly during the receive loop
    #[error("consumer for `{0}` stopped: {1}")]
    ConsumerError(String, String),
}

impl AmqpError {
    /// Tells whether another publish attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AmqpError::ConfigError(_) | AmqpError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_error_names_step_and_descriptor() {
        let err = AmqpError::DeclareError {
            step: DeclareStep::ConfirmMode,
            name: "orders".to_owned(),
            descriptor: "default|orders|ex|direct|key".to_owned(),
            reason: "closed".to_owned(),
        };

        let msg = err.to_string();
        assert!(msg.contains("confirm-mode"));
        assert!(msg.contains("default|orders|ex|direct|key"));
    }

    #[test]
    fn batch_error_lists_failed_indices() {
        let err = AmqpError::BatchPublishError {
            failed: vec![1, 3],
            total: 4,
            first: Box::new(AmqpError::PublishingError("boom".to_owned())),
        };

        assert_eq!(
            err.to_string(),
            "failure to publish 2 of 4 messages (indices [1, 3]): failure to publish: boom"
        );
    }

    #[test]
    fn config_and_cancel_are_not_retryable() {
        assert!(!AmqpError::ConfigError("x".to_owned()).is_retryable());
        assert!(!AmqpError::Cancelled.is_retryable());
        assert!(AmqpError::PublishTimeoutError("q".to_owned()).is_retryable());
    }
}
