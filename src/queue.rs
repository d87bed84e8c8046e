// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue descriptor that identifies a logical queue
//! across the client layer, the dead-letter naming rules derived from it, and
//! the queue and binding definitions installed by the topology.

use crate::{configs::DeadLetterConfigs, exchange::ExchangeKind};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt, time::Duration};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = ".dlx";
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";

const DESCRIPTOR_SEPARATOR: &str = "|";

/// Immutable identity of a logical queue.
///
/// Two descriptors with identical fields are the same logical queue. The
/// canonical string form returned by [`QueueDescriptor::key`] is used as cache
/// key and as log correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDescriptor {
    broker_alias: String,
    queue: String,
    exchange: String,
    kind: ExchangeKind,
    routing_key: String,
}

impl QueueDescriptor {
    /// Creates a descriptor for a queue on the default exchange.
    pub fn new(broker_alias: &str, queue: &str) -> QueueDescriptor {
        QueueDescriptor {
            broker_alias: broker_alias.to_owned(),
            queue: queue.to_owned(),
            exchange: "".to_owned(),
            kind: ExchangeKind::Direct,
            routing_key: "".to_owned(),
        }
    }

    /// Routes the queue through the given exchange.
    pub fn exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchange = name.to_owned();
        self.kind = kind;
        self
    }

    /// Sets the binding and publishing routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn broker_alias(&self) -> &str {
        &self.broker_alias
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn binding_key(&self) -> &str {
        &self.routing_key
    }

    /// Canonical string form: `alias|queue|exchange|kind|routing_key`.
    pub fn key(&self) -> String {
        [
            self.broker_alias.as_str(),
            self.queue.as_str(),
            self.exchange.as_str(),
            self.kind.as_str(),
            self.routing_key.as_str(),
        ]
        .join(DESCRIPTOR_SEPARATOR)
    }

    /// Routing key used when publishing. The default exchange routes by queue
    /// name, so the queue name is used when no exchange is set.
    pub fn publish_routing_key(&self) -> &str {
        if self.exchange.is_empty() {
            return &self.queue;
        }
        &self.routing_key
    }

    /// Dead-letter exchange: explicit config, else `<exchange>.dlx`, else
    /// `<queue>.dlx`.
    pub fn dead_letter_exchange(&self, cfg: &DeadLetterConfigs) -> String {
        if let Some(name) = non_empty(&cfg.exchange) {
            return name.to_owned();
        }
        if self.exchange.is_empty() {
            return format!("{}{}", self.queue, DEAD_LETTER_EXCHANGE_SUFFIX);
        }
        format!("{}{}", self.exchange, DEAD_LETTER_EXCHANGE_SUFFIX)
    }

    /// Dead-letter queue: explicit config, else `<queue>.dlq`.
    pub fn dead_letter_queue(&self, cfg: &DeadLetterConfigs) -> String {
        match non_empty(&cfg.queue) {
            Some(name) => name.to_owned(),
            None => format!("{}{}", self.queue, DEAD_LETTER_QUEUE_SUFFIX),
        }
    }

    /// Dead-letter routing key: explicit config, else the queue's routing key.
    pub fn dead_letter_routing_key(&self, cfg: &DeadLetterConfigs) -> String {
        match non_empty(&cfg.routing_key) {
            Some(key) => key.to_owned(),
            None => self.routing_key.clone(),
        }
    }
}

impl fmt::Display for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Definition of a RabbitMQ queue with its declare arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the message Time-To-Live of the queue. A zero TTL is ignored.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.ttl = Some(ttl);
        }
        self
    }

    /// Routes rejected messages to the given exchange and routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Declare arguments for this queue.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(LongLongInt::from(millis)),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: "".to_owned(),
            routing_key: "".to_owned(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> QueueDescriptor {
        QueueDescriptor::new("default", "orders")
            .exchange("shop", ExchangeKind::Topic)
            .routing_key("order.created")
    }

    #[test]
    fn key_joins_every_field() {
        assert_eq!(orders().key(), "default|orders|shop|topic|order.created");
        assert_eq!(orders().to_string(), orders().key());
    }

    #[test]
    fn identical_fields_are_the_same_queue() {
        assert_eq!(orders(), orders());
        assert_ne!(orders(), orders().routing_key("order.paid"));
    }

    #[test]
    fn dead_letter_names_are_derived_from_the_descriptor() {
        let cfg = DeadLetterConfigs::enabled();
        let d = orders();

        assert_eq!(d.dead_letter_exchange(&cfg), "shop.dlx");
        assert_eq!(d.dead_letter_queue(&cfg), "orders.dlq");
        assert_eq!(d.dead_letter_routing_key(&cfg), "order.created");
    }

    #[test]
    fn dead_letter_exchange_falls_back_to_the_queue_name() {
        let cfg = DeadLetterConfigs::enabled();
        let d = QueueDescriptor::new("default", "emails");

        assert_eq!(d.dead_letter_exchange(&cfg), "emails.dlx");
        assert_eq!(d.dead_letter_exchange(&cfg), d.dead_letter_exchange(&cfg));
    }

    #[test]
    fn explicit_dead_letter_config_wins() {
        let cfg = DeadLetterConfigs {
            enabled: true,
            exchange: Some("errors".to_owned()),
            queue: Some("orders.failed".to_owned()),
            routing_key: Some("failed".to_owned()),
            message_ttl: Duration::ZERO,
        };
        let d = orders();

        assert_eq!(d.dead_letter_exchange(&cfg), "errors");
        assert_eq!(d.dead_letter_queue(&cfg), "orders.failed");
        assert_eq!(d.dead_letter_routing_key(&cfg), "failed");
    }

    #[test]
    fn empty_overrides_are_treated_as_unset() {
        let cfg = DeadLetterConfigs {
            enabled: true,
            exchange: Some("".to_owned()),
            ..Default::default()
        };

        assert_eq!(orders().dead_letter_exchange(&cfg), "shop.dlx");
    }

    #[test]
    fn default_exchange_publishes_by_queue_name() {
        assert_eq!(
            QueueDescriptor::new("default", "emails").publish_routing_key(),
            "emails"
        );
        assert_eq!(orders().publish_routing_key(), "order.created");
    }

    #[test]
    fn queue_arguments_carry_dead_letter_and_ttl() {
        let args = QueueDefinition::new("orders.dlq")
            .durable()
            .ttl(Duration::from_secs(60))
            .dead_letter("shop.dlx", "order.created")
            .arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("shop.dlx")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(60_000))
        );
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(QueueDefinition::new("orders").arguments().inner().is_empty());
    }
}
