// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable AMQP 0-9-1 messaging on top of `lapin`: cached connections per
//! broker alias, idempotent topology declaration, confirmed publishing with
//! batch support, a consumer with bounded retries and dead-lettering, and a
//! supervisor restarting consumers whose channel closed.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod topology;

pub use dispatcher::RabbitMQDispatcher;
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, ConsumerMessage, HandlerError};
pub use publisher::PublishMessage;
pub use queue::QueueDescriptor;
