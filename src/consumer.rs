// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module runs the receive loop of one consumer and applies the
//! acknowledgement policy to every delivery:
//!
//! - handler success: ack
//! - handler failure with `retry_count < max_retry`: nack with requeue
//! - handler failure otherwise: nack without requeue, which dead-letters the
//!   message when the queue has a dead-letter exchange and drops it otherwise
//!
//! A consumer moves through `Idle → Declaring → Consuming` and ends either
//! `ClosedGracefully` (canceled) or `ClosedByError` (declare failure or the
//! channel closed under it).

use crate::{
    channel::{close_channel, ConnectionManager},
    configs::{ConsumeConfigs, QueueConfigs},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    queue::QueueDescriptor,
    topology::{ensure_channel, ChannelRole},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the delivery counter maintained by quorum queues
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

const MAX_TRACKED_DELIVERIES: usize = 65_536;

/// Lifecycle of one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerState {
    #[default]
    Idle,
    Declaring,
    Consuming,
    ClosedGracefully,
    ClosedByError,
}

/// What happens to a delivery once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Maps a handler outcome to the acknowledgement applied to the delivery.
pub fn disposition<E>(result: &Result<(), E>, retry_count: i64, max_retry: i64) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(_) if retry_count < max_retry => Disposition::Requeue,
        Err(_) => Disposition::DeadLetter,
    }
}

/// Number of previous delivery attempts of a message.
///
/// Read from `x-delivery-count`, then from the first `x-death` entry. When
/// neither header exists the broker's redelivered flag counts as one attempt.
/// A header that is present but malformed yields 0.
pub fn retry_count(props: &AMQPProperties, redelivered: bool) -> i64 {
    let fallback = i64::from(redelivered);

    let Some(headers) = props.headers() else {
        return fallback;
    };
    let headers = headers.inner();

    if let Some(value) = headers.get(AMQP_HEADERS_DELIVERY_COUNT) {
        return as_count(value).unwrap_or_default();
    }

    if let Some(value) = headers.get(AMQP_HEADERS_X_DEATH) {
        return death_count(value).unwrap_or_default();
    }

    fallback
}

fn death_count(value: &AMQPValue) -> Option<i64> {
    value
        .as_array()?
        .as_slice()
        .first()?
        .as_field_table()?
        .inner()
        .get(AMQP_HEADERS_COUNT)
        .and_then(as_count)
}

fn as_count(value: &AMQPValue) -> Option<i64> {
    let count = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    (count >= 0).then_some(count)
}

/// Failed attempts seen by this process, keyed by message id.
///
/// Classic queues requeue a message without any counting header, so the
/// broker side count stops at the redelivered flag. Every requeue recorded
/// here raises the count by one; an ack or a dead-letter forgets the message.
#[derive(Debug, Default)]
pub(crate) struct DeliveryAttempts {
    failed: Mutex<HashMap<String, i64>>,
}

impl DeliveryAttempts {
    /// The larger of the broker count and the attempts recorded for `message_id`.
    pub(crate) fn retry_count(
        &self,
        message_id: Option<&str>,
        props: &AMQPProperties,
        redelivered: bool,
    ) -> i64 {
        let broker = retry_count(props, redelivered);

        let Some(id) = message_id else {
            return broker;
        };

        let seen = self
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or_default();

        broker.max(seen)
    }

    pub(crate) fn record(&self, message_id: Option<&str>, decision: Disposition) {
        let Some(id) = message_id else {
            return;
        };

        let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
        match decision {
            Disposition::Requeue => {
                if failed.len() >= MAX_TRACKED_DELIVERIES && !failed.contains_key(id) {
                    warn!(tracked = failed.len(), "too many requeued messages tracked, resetting");
                    failed.clear();
                }
                *failed.entry(id.to_owned()).or_default() += 1;
            }
            Disposition::Ack | Disposition::DeadLetter => {
                failed.remove(id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Settles a delivery with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
    async fn ack_message(&self) -> Result<(), AmqpError>;
    async fn nack_message(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack_message(&self) -> Result<(), AmqpError> {
        self.ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack_message(&self, requeue: bool) -> Result<(), AmqpError> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(error = err.to_string(), requeue = requeue, "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}

/// Runs the handler for one message and settles it.
///
/// Returns [`AmqpError::Cancelled`] without settling when the consumer is
/// canceled while a failed message waits for its retry delay.
pub(crate) async fn process<A: Acknowledger + ?Sized>(
    acker: &A,
    handler: &dyn ConsumerHandler,
    ctx: &Context,
    msg: &ConsumerMessage,
    cfg: &ConsumeConfigs,
    cancel: &CancellationToken,
) -> Result<Disposition, AmqpError> {
    let result = handler.exec(ctx, msg).await;
    let decision = disposition(&result, msg.retry_count, cfg.retries());

    match decision {
        Disposition::Ack => {
            debug!(queue = msg.queue, "message successfully processed");
            acker.ack_message().await?;
        }
        Disposition::Requeue => {
            warn!(
                queue = msg.queue,
                retry_count = msg.retry_count,
                error = result.err().map(|e| e.to_string()).unwrap_or_default(),
                "error whiling handling msg, requeuing for latter"
            );
            if !cfg.retry_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                    _ = tokio::time::sleep(cfg.retry_delay) => {}
                }
            }
            acker.nack_message(true).await?;
        }
        Disposition::DeadLetter => {
            error!(
                queue = msg.queue,
                retry_count = msg.retry_count,
                "too many attempts, rejecting to dead-letter"
            );
            acker.nack_message(false).await?;
        }
    }

    Ok(decision)
}

/// Everything needed to (re)start a consumer.
#[derive(Clone)]
pub struct ConsumerDefinition {
    pub(crate) descriptor: QueueDescriptor,
    pub(crate) cfg: QueueConfigs,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl ConsumerDefinition {
    pub fn new(
        descriptor: &QueueDescriptor,
        cfg: QueueConfigs,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        ConsumerDefinition {
            descriptor: descriptor.clone(),
            cfg,
            handler,
        }
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }
}

/// Runs one consumer until cancellation (`Ok`) or failure (`Err`).
#[async_trait]
pub trait ConsumerRunner: Send + Sync {
    async fn run(
        &self,
        def: &ConsumerDefinition,
        cancel: CancellationToken,
        state: &watch::Sender<ConsumerState>,
    ) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the ConsumerRunner trait.
pub struct RabbitMQConsumer {
    connections: Arc<ConnectionManager>,
    attempts: DeliveryAttempts,
}

impl RabbitMQConsumer {
    pub fn new(connections: Arc<ConnectionManager>) -> Arc<RabbitMQConsumer> {
        Arc::new(RabbitMQConsumer {
            connections,
            attempts: DeliveryAttempts::default(),
        })
    }

    async fn consume(
        &self,
        def: &ConsumerDefinition,
        cancel: &CancellationToken,
        state: &watch::Sender<ConsumerState>,
    ) -> Result<(), AmqpError> {
        let key = def.descriptor.key();
        let queue = def.descriptor.queue_name();

        let channel = ensure_channel(
            &self.connections,
            &def.descriptor,
            &def.cfg,
            ChannelRole::Consumer,
        )
        .await?;

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        channel.on_error(move |err| {
            let _ = closed_tx.send(err.to_string());
        });

        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut consumer = match channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), descriptor = key, "error to create the consumer");
                close_channel(&channel).await;
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
        };

        state.send_replace(ConsumerState::Consuming);
        info!(descriptor = key, tag = tag, "consuming");

        let tracer = otel::tracer();
        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(descriptor = key, "consumer canceled");
                    break Ok(());
                }

                Some(reason) = closed_rx.recv() => {
                    break Err(AmqpError::ConsumerError(key.clone(), reason));
                }

                next = consumer.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(&tracer, def, &delivery, cancel).await,
                    Some(Err(err)) => break Err(AmqpError::ConsumerError(key.clone(), err.to_string())),
                    None => break Err(AmqpError::ConsumerError(key.clone(), "consumer stream closed".to_owned())),
                },
            }
        };

        close_channel(&channel).await;
        result
    }

    async fn dispatch(
        &self,
        tracer: &BoxedTracer,
        def: &ConsumerDefinition,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) {
        let queue = def.descriptor.queue_name();
        let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, queue);
        let ctx = ctx.with_value(cancel.clone());

        let tracked = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| format!("{}|{}", def.descriptor.key(), id));
        let tracked = tracked.as_deref();

        let msg = ConsumerMessage {
            queue: queue.to_owned(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            msg_type: delivery.properties.kind().as_ref().map(|kind| kind.to_string()),
            data: delivery.data.clone(),
            retry_count: self.attempts.retry_count(
                tracked,
                &delivery.properties,
                delivery.redelivered,
            ),
        };

        debug!(
            "received: {} - exchange: {}",
            queue,
            delivery.exchange.to_string(),
        );

        match process(
            &delivery.acker,
            def.handler.as_ref(),
            &ctx,
            &msg,
            &def.cfg.consume,
            cancel,
        )
        .await
        {
            Ok(Disposition::Ack) => {
                self.attempts.record(tracked, Disposition::Ack);
                span.set_status(Status::Ok);
            }
            Ok(other) => {
                self.attempts.record(tracked, other);
                span.set_status(Status::Error {
                    description: Cow::from(format!("handler failed, {:?}", other)),
                });
            }
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error consume msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        span.end();
    }
}

#[async_trait]
impl ConsumerRunner for RabbitMQConsumer {
    async fn run(
        &self,
        def: &ConsumerDefinition,
        cancel: CancellationToken,
        state: &watch::Sender<ConsumerState>,
    ) -> Result<(), AmqpError> {
        state.send_replace(ConsumerState::Declaring);

        let result = self.consume(def, &cancel, state).await;

        state.send_replace(match result {
            Ok(()) => ConsumerState::ClosedGracefully,
            Err(_) => ConsumerState::ClosedByError,
        });

        result
    }
}
