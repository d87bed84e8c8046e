// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes single messages and batches to the exchange of a queue
//! descriptor, optionally waiting for publisher confirms. Publishes are bounded
//! by a deadline and by the caller's cancellation token; there are no retries
//! here, see [`crate::registry`] for the retrying send wrapper.
//!
//! The publisher owns its channel and recreates it, redeclaring the exchange,
//! whenever it is missing or closed.

use crate::{
    channel::{close_channel, ConnectionManager},
    configs::{PublishConfirmConfigs, QueueConfigs},
    errors::AmqpError,
    otel,
    queue::QueueDescriptor,
    topology::{ensure_channel, ChannelRole},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{trace::TraceContextExt, Context};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Mutex,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages that survive broker restarts
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Typed header values attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i32),
    LongInt(i64),
    Uint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::Int(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// An outgoing message: opaque payload plus optional type and headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub headers: HashMap<String, HeaderValues>,
}

impl PublishMessage {
    pub fn new(data: &[u8]) -> Self {
        PublishMessage {
            data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Serializes `payload` as JSON and sets the JSON content type.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self, AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::PublishingError(err.to_string())
        })?;

        Ok(PublishMessage {
            data,
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            ..Default::default()
        })
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    fn properties(&self, mut headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        for (key, value) in self.headers.clone() {
            headers.insert(ShortString::from(key), value.into());
        }

        let mut props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }

        if let Some(msg_type) = &self.msg_type {
            props = props.with_type(ShortString::from(msg_type.as_str()));
        }

        props
    }
}

/// Broker answer to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfirmOutcome {
    Ack,
    Nack,
    NotRequested,
}

pub(crate) type PendingConfirm = BoxFuture<'static, Result<ConfirmOutcome, AmqpError>>;

/// Where messages are written. The broker implementation is a channel bound
/// to the exchange and routing key of a descriptor.
#[async_trait]
pub(crate) trait MessageSink: Send + Sync {
    /// Name used in errors and logs.
    fn target(&self) -> &str;

    /// Writes the message and returns the future of its confirmation.
    async fn send(&self, msg: &PublishMessage) -> Result<PendingConfirm, AmqpError>;
}

struct ChannelSink {
    channel: Channel,
    exchange: String,
    routing_key: String,
    target: String,
}

impl ChannelSink {
    fn new(channel: Channel, descriptor: &QueueDescriptor) -> Self {
        ChannelSink {
            channel,
            exchange: descriptor.exchange_name().to_owned(),
            routing_key: descriptor.publish_routing_key().to_owned(),
            target: descriptor.key(),
        }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    fn target(&self) -> &str {
        &self.target
    }

    async fn send(&self, msg: &PublishMessage) -> Result<PendingConfirm, AmqpError> {
        let tracer = otel::tracer();
        let ctx = otel::producer_context(&tracer, &Context::current(), &self.exchange);

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&ctx, &mut headers);

        let result = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                msg.properties(headers),
            )
            .await;
        ctx.span().end();

        let confirm = match result {
            Err(err) => {
                error!(error = err.to_string(), descriptor = self.target, "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => Ok(ConfirmOutcome::Nack),
                Ok(confirmation) if confirmation.is_ack() => Ok(ConfirmOutcome::Ack),
                Ok(_) => Ok(ConfirmOutcome::NotRequested),
                Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            }
        }))
    }
}

/// Runs `fut` until it completes, the deadline passes or the caller cancels.
async fn within<F: Future>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: F,
    on_timeout: impl FnOnce() -> AmqpError,
) -> Result<F::Output, AmqpError> {
    if Instant::now() >= deadline {
        return Err(on_timeout());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AmqpError::Cancelled),
        res = timeout_at(deadline, fut) => res.map_err(|_| on_timeout()),
    }
}

fn confirm_result(outcome: ConfirmOutcome, target: &str) -> Result<(), AmqpError> {
    match outcome {
        ConfirmOutcome::Nack => {
            warn!(descriptor = target, "broker nacked published message");
            Err(AmqpError::PublishNackError(target.to_owned()))
        }
        ConfirmOutcome::Ack | ConfirmOutcome::NotRequested => Ok(()),
    }
}

fn stops_batch(err: &AmqpError) -> bool {
    matches!(
        err,
        AmqpError::PublishTimeoutError(_) | AmqpError::ConfirmTimeoutError(_) | AmqpError::Cancelled
    )
}

pub(crate) async fn publish_one<S: MessageSink + ?Sized>(
    sink: &S,
    msg: &PublishMessage,
    deadline: Instant,
    confirm: bool,
    cancel: &CancellationToken,
) -> Result<(), AmqpError> {
    let target = sink.target().to_owned();

    let pending = within(deadline, cancel, sink.send(msg), || {
        AmqpError::PublishTimeoutError(target.clone())
    })
    .await??;

    if !confirm {
        return Ok(());
    }

    let outcome = within(deadline, cancel, pending, || {
        AmqpError::ConfirmTimeoutError(target.clone())
    })
    .await??;

    confirm_result(outcome, &target)
}

pub(crate) async fn publish_all<S: MessageSink + ?Sized>(
    sink: &S,
    msgs: &[PublishMessage],
    deadline: Instant,
    confirm: bool,
    cancel: &CancellationToken,
) -> Result<(), AmqpError> {
    if msgs.is_empty() {
        return Ok(());
    }

    let target = sink.target().to_owned();
    let total = msgs.len();
    let mut failed = Vec::new();
    let mut first: Option<AmqpError> = None;
    let mut pending = Vec::with_capacity(total);

    for (idx, msg) in msgs.iter().enumerate() {
        let sent = within(deadline, cancel, sink.send(msg), || {
            AmqpError::PublishTimeoutError(target.clone())
        })
        .await
        .and_then(|res| res);

        match sent {
            Ok(confirmation) => pending.push(confirmation),
            Err(err) => {
                failed.push(idx);
                let stop = stops_batch(&err);
                first.get_or_insert(err);
                if stop {
                    failed.extend(idx + 1..total);
                    break;
                }
            }
        }
    }

    if confirm && first.is_none() {
        for (idx, confirmation) in pending.into_iter().enumerate() {
            let confirmed = within(deadline, cancel, confirmation, || {
                AmqpError::ConfirmTimeoutError(target.clone())
            })
            .await
            .and_then(|res| res)
            .and_then(|outcome| confirm_result(outcome, &target));

            if let Err(err) = confirmed {
                failed.push(idx);
                let stop = stops_batch(&err);
                first.get_or_insert(err);
                if stop {
                    failed.extend(idx + 1..total);
                    break;
                }
            }
        }
    }

    match first {
        None => Ok(()),
        Some(first) => {
            error!(
                descriptor = target,
                failed = failed.len(),
                total = total,
                "failure to publish batch"
            );
            Err(AmqpError::BatchPublishError {
                failed,
                total,
                first: Box::new(first),
            })
        }
    }
}

/// Publishing capability handed out by the producer registry.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one persistent message. `timeout` defaults to the confirm
    /// timeout, or 5 seconds.
    async fn publish(
        &self,
        cancel: &CancellationToken,
        msg: &PublishMessage,
        timeout: Option<Duration>,
    ) -> Result<(), AmqpError>;

    /// Publishes messages in order under one shared deadline. An empty batch
    /// succeeds without touching the network.
    async fn publish_batch(
        &self,
        cancel: &CancellationToken,
        msgs: &[PublishMessage],
        timeout: Option<Duration>,
    ) -> Result<(), AmqpError>;

    /// Drops the current channel so the next publish opens and redeclares a
    /// fresh one.
    async fn reset(&self);

    /// Closes the channel. The shared connection is left open.
    async fn close(&self);
}

/// RabbitMQ implementation of the Publisher trait for one queue descriptor.
pub struct RabbitMQPublisher {
    descriptor: QueueDescriptor,
    cfg: QueueConfigs,
    connections: Arc<ConnectionManager>,
    channel: Mutex<Option<Channel>>,
}

impl RabbitMQPublisher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        descriptor: &QueueDescriptor,
        confirm: PublishConfirmConfigs,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            descriptor: descriptor.clone(),
            cfg: QueueConfigs {
                confirm,
                ..Default::default()
            },
            connections,
            channel: Mutex::new(None),
        })
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    /// Opens and prepares the channel if there is no usable one, bounded by
    /// the default publish timeout.
    pub async fn ensure_channel(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        self.bounded_sink(cancel, self.deadline(None)).await.map(|_| ())
    }

    /// [`sink`](Self::sink) under the publish deadline. Dial, channel open and
    /// exchange declare all count against it.
    async fn bounded_sink(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ChannelSink, AmqpError> {
        within(deadline, cancel, self.sink(), || {
            warn!(descriptor = %self.descriptor, "timeout preparing the publisher channel");
            AmqpError::PublishTimeoutError(self.descriptor.key())
        })
        .await?
    }

    async fn sink(&self) -> Result<ChannelSink, AmqpError> {
        let mut current = self.channel.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.status().connected() {
                return Ok(ChannelSink::new(channel.clone(), &self.descriptor));
            }
            debug!(descriptor = %self.descriptor, "publisher channel closed, reopening");
        }

        let channel = ensure_channel(
            &self.connections,
            &self.descriptor,
            &self.cfg,
            ChannelRole::Producer,
        )
        .await?;
        *current = Some(channel.clone());

        Ok(ChannelSink::new(channel, &self.descriptor))
    }

    fn deadline(&self, timeout: Option<Duration>) -> Instant {
        Instant::now() + timeout.unwrap_or_else(|| self.cfg.confirm.default_timeout())
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        msg: &PublishMessage,
        timeout: Option<Duration>,
    ) -> Result<(), AmqpError> {
        let deadline = self.deadline(timeout);
        let sink = self.bounded_sink(cancel, deadline).await?;

        publish_one(&sink, msg, deadline, self.cfg.confirm.enabled, cancel).await
    }

    async fn publish_batch(
        &self,
        cancel: &CancellationToken,
        msgs: &[PublishMessage],
        timeout: Option<Duration>,
    ) -> Result<(), AmqpError> {
        if msgs.is_empty() {
            return Ok(());
        }

        let deadline = self.deadline(timeout);
        let sink = self.bounded_sink(cancel, deadline).await?;

        publish_all(&sink, msgs, deadline, self.cfg.confirm.enabled, cancel).await
    }

    async fn reset(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            close_channel(&channel).await;
        }
    }

    async fn close(&self) {
        self.reset().await;
        debug!(descriptor = %self.descriptor, "publisher closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ConnectionManager,
        configs::{BrokerConfigs, RabbitMQConfigs},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    /// Sink double: optional send delay, scripted failures and confirm outcomes.
    struct FakeSink {
        delay: Duration,
        fail_at: Vec<usize>,
        outcome: ConfirmOutcome,
        confirm_delay: Duration,
        sent: AtomicUsize,
        payloads: StdMutex<Vec<Vec<u8>>>,
    }

    impl FakeSink {
        fn new() -> Self {
            FakeSink {
                delay: Duration::ZERO,
                fail_at: vec![],
                outcome: ConfirmOutcome::Ack,
                confirm_delay: Duration::ZERO,
                sent: AtomicUsize::new(0),
                payloads: StdMutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl MessageSink for FakeSink {
        fn target(&self) -> &str {
            "default|orders|shop|direct|created"
        }

        async fn send(&self, msg: &PublishMessage) -> Result<PendingConfirm, AmqpError> {
            let idx = self.sent.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_at.contains(&idx) {
                return Err(AmqpError::PublishingError(format!("refused {}", idx)));
            }
            self.payloads.lock().unwrap().push(msg.data.clone());

            let outcome = self.outcome;
            let confirm_delay = self.confirm_delay;
            Ok(Box::pin(async move {
                tokio::time::sleep(confirm_delay).await;
                Ok(outcome)
            }))
        }
    }

    fn batch(n: usize) -> Vec<PublishMessage> {
        (0..n)
            .map(|i| PublishMessage::new(format!("msg-{}", i).as_bytes()))
            .collect()
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn publish_without_confirms_succeeds_after_send() {
        let sink = FakeSink {
            outcome: ConfirmOutcome::Nack,
            ..FakeSink::new()
        };

        let res = publish_one(&sink, &PublishMessage::new(b"hello"), in_secs(5), false, &CancellationToken::new()).await;

        assert_eq!(res, Ok(()));
        assert_eq!(sink.payloads.lock().unwrap().clone(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn confirmed_nack_is_a_delivery_failure() {
        let sink = FakeSink {
            outcome: ConfirmOutcome::Nack,
            ..FakeSink::new()
        };

        let res = publish_one(&sink, &PublishMessage::new(b"hello"), in_secs(5), true, &CancellationToken::new()).await;

        assert!(matches!(res, Err(AmqpError::PublishNackError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_confirm_times_out() {
        let sink = FakeSink {
            confirm_delay: Duration::from_secs(60),
            ..FakeSink::new()
        };

        let res = publish_one(&sink, &PublishMessage::new(b"hello"), in_secs(1), true, &CancellationToken::new()).await;

        assert!(matches!(res, Err(AmqpError::ConfirmTimeoutError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_send_times_out() {
        let sink = FakeSink {
            delay: Duration::from_secs(10),
            ..FakeSink::new()
        };

        let res = publish_one(&sink, &PublishMessage::new(b"hello"), in_secs(1), false, &CancellationToken::new()).await;

        assert!(matches!(res, Err(AmqpError::PublishTimeoutError(_))));
    }

    #[tokio::test]
    async fn empty_batch_never_touches_the_sink() {
        let sink = FakeSink::new();

        let res = publish_all(&sink, &[], in_secs(5), true, &CancellationToken::new()).await;

        assert_eq!(res, Ok(()));
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_batch_on_publisher_skips_the_network() {
        let connections = ConnectionManager::new(BrokerConfigs::new("test"));
        let publisher = RabbitMQPublisher::new(
            connections,
            &QueueDescriptor::new("unconfigured", "orders"),
            PublishConfirmConfigs::default(),
        );

        let res = publisher.publish_batch(&CancellationToken::new(), &[], None).await;

        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn batch_publishes_in_order_and_waits_every_confirm() {
        let sink = FakeSink::new();

        let res = publish_all(&sink, &batch(3), in_secs(5), true, &CancellationToken::new()).await;

        assert_eq!(res, Ok(()));
        assert_eq!(
            sink.payloads.lock().unwrap().clone(),
            vec![b"msg-0".to_vec(), b"msg-1".to_vec(), b"msg-2".to_vec()]
        );
    }

    #[tokio::test]
    async fn batch_reports_failed_indices_and_first_error() {
        let sink = FakeSink {
            fail_at: vec![1, 3],
            ..FakeSink::new()
        };

        let res = publish_all(&sink, &batch(4), in_secs(5), false, &CancellationToken::new()).await;

        assert_eq!(
            res,
            Err(AmqpError::BatchPublishError {
                failed: vec![1, 3],
                total: 4,
                first: Box::new(AmqpError::PublishingError("refused 1".to_owned())),
            })
        );
        assert_eq!(sink.sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_stops_when_the_deadline_expires() {
        let sink = FakeSink {
            delay: Duration::from_millis(400),
            ..FakeSink::new()
        };

        let res = publish_all(&sink, &batch(5), in_secs(1), false, &CancellationToken::new()).await;

        match res {
            Err(AmqpError::BatchPublishError { failed, total, first }) => {
                assert_eq!(total, 5);
                assert_eq!(failed, vec![2, 3, 4]);
                assert!(matches!(*first, AmqpError::PublishTimeoutError(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(sink.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn canceling_a_long_batch_returns_promptly() {
        let sink = Arc::new(FakeSink {
            delay: Duration::from_millis(200),
            ..FakeSink::new()
        });
        let cancel = CancellationToken::new();
        let msgs = batch(100);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let res = publish_all(sink.as_ref(), &msgs, in_secs(60), true, &cancel).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        match res {
            Err(AmqpError::BatchPublishError { failed, first, .. }) => {
                assert_eq!(failed.len(), 100);
                assert_eq!(*first, AmqpError::Cancelled);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn batch_nack_fails_the_batch() {
        let sink = FakeSink {
            outcome: ConfirmOutcome::Nack,
            ..FakeSink::new()
        };

        let res = publish_all(&sink, &batch(2), in_secs(5), true, &CancellationToken::new()).await;

        match res {
            Err(AmqpError::BatchPublishError { failed, first, .. }) => {
                assert_eq!(failed, vec![0, 1]);
                assert!(matches!(*first, AmqpError::PublishNackError(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    /// A broker address that accepts TCP connections and never speaks AMQP.
    fn silent_broker() -> (std::net::TcpListener, Arc<ConnectionManager>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let connections = ConnectionManager::new(BrokerConfigs::new("test").broker(
            "silent",
            RabbitMQConfigs {
                host: "127.0.0.1".to_owned(),
                port,
                ..Default::default()
            },
        ));
        (listener, connections)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_timeout_bounds_the_dial() {
        let (_listener, connections) = silent_broker();
        let publisher = RabbitMQPublisher::new(
            connections,
            &QueueDescriptor::new("silent", "orders"),
            PublishConfirmConfigs::default(),
        );

        let started = std::time::Instant::now();
        let res = publisher
            .publish(
                &CancellationToken::new(),
                &PublishMessage::new(b"hello"),
                Some(Duration::from_millis(200)),
            )
            .await;

        assert!(matches!(res, Err(AmqpError::PublishTimeoutError(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_interrupts_a_hanging_dial() {
        let (_listener, connections) = silent_broker();
        let publisher = RabbitMQPublisher::new(
            connections,
            &QueueDescriptor::new("silent", "orders"),
            PublishConfirmConfigs::default(),
        );
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let res = publisher
            .publish_batch(&cancel, &batch(3), Some(Duration::from_secs(30)))
            .await;

        assert_eq!(res, Err(AmqpError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn properties_are_persistent_and_carry_headers() {
        let msg = PublishMessage::new(b"{}")
            .msg_type("order.created")
            .header("tenant", HeaderValues::LongString("acme".to_owned()));

        let props = msg.properties(BTreeMap::new());

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(props.kind().as_ref().map(|k| k.as_str()), Some("order.created"));
        assert!(props.message_id().is_some());
        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }

    #[test]
    fn json_messages_set_the_content_type() {
        let msg = PublishMessage::json(&serde_json::json!({"id": 1})).expect("json");

        assert_eq!(msg.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(msg.data, br#"{"id":1}"#.to_vec());
    }
}
