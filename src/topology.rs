// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker topology a queue descriptor needs before a
//! channel can be used. Declarations are idempotent, so every fresh channel
//! re-runs them.
//!
//! The main components are:
//! - `TopologyDefinition`: ordered list of exchange, queue and binding steps
//! - `Topology` trait: installs a definition on the broker
//! - `AmqpTopology`: implementation of the Topology trait for a lapin channel
//! - `ensure_channel`: opens a channel for a producer or consumer and prepares it

use crate::{
    channel::{close_channel, ConnectionManager},
    configs::{PublishConfirmConfigs, QueueConfigs},
    errors::{AmqpError, DeclareStep},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// What a channel is prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Declares only the exchange; queues and bindings belong to consumers.
    Producer,
    /// Declares exchange, queue, binding, dead-letter pair and QoS.
    Consumer,
}

impl ChannelRole {
    /// Whether the channel is put into confirm mode. Consumers never publish.
    pub fn confirms(self, cfg: &PublishConfirmConfigs) -> bool {
        self == ChannelRole::Producer && cfg.enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopologyStep {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

/// Ordered set of declarations. Steps are installed in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDefinition {
    pub(crate) steps: Vec<TopologyStep>,
}

impl TopologyDefinition {
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.steps.push(TopologyStep::Exchange(def));
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.steps.push(TopologyStep::Queue(def));
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.steps.push(TopologyStep::Binding(binding));
        self
    }

    /// Builds the declarations a descriptor needs for the given role.
    ///
    /// For consumers with dead-lettering enabled the dead-letter exchange,
    /// queue and binding are declared before the main queue.
    pub fn for_role(descriptor: &QueueDescriptor, cfg: &QueueConfigs, role: ChannelRole) -> Self {
        let mut def = TopologyDefinition::default();

        if !descriptor.exchange_name().is_empty() {
            def = def.exchange(
                ExchangeDefinition::new(descriptor.exchange_name())
                    .kind(descriptor.exchange_kind())
                    .durable(),
            );
        }

        if role == ChannelRole::Producer {
            return def;
        }

        let mut queue = QueueDefinition::new(descriptor.queue_name()).durable();

        if cfg.dead_letter.enabled {
            let dlx = descriptor.dead_letter_exchange(&cfg.dead_letter);
            let dlq = descriptor.dead_letter_queue(&cfg.dead_letter);
            let dl_key = descriptor.dead_letter_routing_key(&cfg.dead_letter);

            def = def
                .exchange(ExchangeDefinition::new(&dlx).kind(ExchangeKind::Direct).durable())
                .queue(
                    QueueDefinition::new(&dlq)
                        .durable()
                        .ttl(cfg.dead_letter.message_ttl),
                )
                .queue_binding(QueueBinding::new(&dlq).exchange(&dlx).routing_key(&dl_key));

            queue = queue.dead_letter(&dlx, &dl_key);
        }

        def = def.queue(queue);

        if !descriptor.exchange_name().is_empty() {
            def = def.queue_binding(
                QueueBinding::new(descriptor.queue_name())
                    .exchange(descriptor.exchange_name())
                    .routing_key(descriptor.binding_key()),
            );
        }

        def
    }
}

/// Trait defining the interface for topology installation.
#[async_trait]
pub trait Topology {
    /// Installs every step of the definition, stopping at the first failure.
    async fn install(&self, def: &TopologyDefinition) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: &'tp Channel,
    descriptor: String,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp Channel, descriptor: &QueueDescriptor) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            descriptor: descriptor.key(),
        }
    }

    fn declare_error(&self, step: DeclareStep, name: &str, err: lapin::Error) -> AmqpError {
        error!(
            error = err.to_string(),
            step = %step,
            name = name,
            descriptor = self.descriptor,
            "failure to declare topology"
        );
        AmqpError::DeclareError {
            step,
            name: name.to_owned(),
            descriptor: self.descriptor.clone(),
            reason: err.to_string(),
        }
    }

    async fn install_exchange(&self, exch: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        self.channel
            .exchange_declare(
                &exch.name,
                exch.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exch.durable,
                    auto_delete: exch.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.declare_error(DeclareStep::Exchange, &exch.name, err))?;

        debug!("exchange: {} was created", exch.name);
        Ok(())
    }

    async fn install_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| self.declare_error(DeclareStep::Queue, &def.name, err))?;

        debug!("queue: {} was created", def.name);
        Ok(())
    }

    async fn binding_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.declare_error(DeclareStep::Binding, &binding.queue_name, err))?;

        Ok(())
    }
}

#[async_trait]
impl<'tp> Topology for AmqpTopology<'tp> {
    async fn install(&self, def: &TopologyDefinition) -> Result<(), AmqpError> {
        for step in &def.steps {
            match step {
                TopologyStep::Exchange(exch) => self.install_exchange(exch).await?,
                TopologyStep::Queue(queue) => self.install_queue(queue).await?,
                TopologyStep::Binding(binding) => self.binding_queue(binding).await?,
            }
        }

        Ok(())
    }
}

/// Opens a channel for `descriptor` and prepares it for `role`.
///
/// The connection is ensured first. Any failing declare step closes the
/// channel and surfaces a [`AmqpError::DeclareError`] naming the step.
pub async fn ensure_channel(
    connections: &ConnectionManager,
    descriptor: &QueueDescriptor,
    cfg: &QueueConfigs,
    role: ChannelRole,
) -> Result<Channel, AmqpError> {
    let channel = connections.open_channel(descriptor.broker_alias()).await?;

    if let Err(err) = prepare(&channel, descriptor, cfg, role).await {
        close_channel(&channel).await;
        return Err(err);
    }

    debug!(descriptor = %descriptor, role = ?role, "channel ready");
    Ok(channel)
}

async fn prepare(
    channel: &Channel,
    descriptor: &QueueDescriptor,
    cfg: &QueueConfigs,
    role: ChannelRole,
) -> Result<(), AmqpError> {
    let topology = AmqpTopology::new(channel, descriptor);
    topology
        .install(&TopologyDefinition::for_role(descriptor, cfg, role))
        .await?;

    if role == ChannelRole::Consumer {
        channel
            .basic_qos(cfg.consume.prefetch(), BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                topology.declare_error(DeclareStep::QoS, descriptor.queue_name(), err)
            })?;
    }

    if role.confirms(&cfg.confirm) {
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                topology.declare_error(DeclareStep::ConfirmMode, descriptor.queue_name(), err)
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::DeadLetterConfigs;
    use std::time::Duration;

    fn orders() -> QueueDescriptor {
        QueueDescriptor::new("default", "orders")
            .exchange("shop", ExchangeKind::Topic)
            .routing_key("order.*")
    }

    fn names(def: &TopologyDefinition) -> Vec<String> {
        def.steps
            .iter()
            .map(|step| match step {
                TopologyStep::Exchange(e) => format!("exchange:{}", e.name),
                TopologyStep::Queue(q) => format!("queue:{}", q.name),
                TopologyStep::Binding(b) => format!("bind:{}->{}", b.queue_name, b.exchange_name),
            })
            .collect()
    }

    #[test]
    fn only_producers_enter_confirm_mode() {
        let enabled = PublishConfirmConfigs::enabled(Duration::from_secs(1));

        assert!(ChannelRole::Producer.confirms(&enabled));
        assert!(!ChannelRole::Producer.confirms(&PublishConfirmConfigs::default()));
        assert!(!ChannelRole::Consumer.confirms(&enabled));
    }

    #[test]
    fn producer_declares_only_the_exchange() {
        let def = TopologyDefinition::for_role(&orders(), &QueueConfigs::default(), ChannelRole::Producer);

        assert_eq!(names(&def), vec!["exchange:shop"]);
    }

    #[test]
    fn producer_on_default_exchange_declares_nothing() {
        let def = TopologyDefinition::for_role(
            &QueueDescriptor::new("default", "emails"),
            &QueueConfigs::default(),
            ChannelRole::Producer,
        );

        assert!(def.steps.is_empty());
    }

    #[test]
    fn consumer_declares_durable_queue_and_binding() {
        let def = TopologyDefinition::for_role(&orders(), &QueueConfigs::default(), ChannelRole::Consumer);

        assert_eq!(
            names(&def),
            vec!["exchange:shop", "queue:orders", "bind:orders->shop"]
        );
        match &def.steps[1] {
            TopologyStep::Queue(q) => {
                assert!(q.durable);
                assert!(q.arguments().inner().is_empty());
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn consumer_declares_dead_letter_pair_before_the_main_queue() {
        let cfg = QueueConfigs {
            dead_letter: DeadLetterConfigs {
                message_ttl: Duration::from_secs(3600),
                ..DeadLetterConfigs::enabled()
            },
            ..Default::default()
        };

        let def = TopologyDefinition::for_role(&orders(), &cfg, ChannelRole::Consumer);

        assert_eq!(
            names(&def),
            vec![
                "exchange:shop",
                "exchange:shop.dlx",
                "queue:orders.dlq",
                "bind:orders.dlq->shop.dlx",
                "queue:orders",
                "bind:orders->shop",
            ]
        );

        match (&def.steps[2], &def.steps[4]) {
            (TopologyStep::Queue(dlq), TopologyStep::Queue(main)) => {
                assert_eq!(dlq.ttl, Some(Duration::from_secs(3600)));
                assert_eq!(main.ttl, None);
                assert_eq!(main.dead_letter_exchange.as_deref(), Some("shop.dlx"));
                assert_eq!(main.dead_letter_routing_key.as_deref(), Some("order.*"));
            }
            other => panic!("unexpected steps {:?}", other),
        }
    }

    #[test]
    fn exchanges_are_durable_and_keep_their_kind() {
        let def = TopologyDefinition::for_role(&orders(), &QueueConfigs::default(), ChannelRole::Consumer);

        match &def.steps[0] {
            TopologyStep::Exchange(e) => {
                assert!(e.durable);
                assert!(!e.delete);
                assert_eq!(e.kind, ExchangeKind::Topic);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
