// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Application-facing entry point. A dispatcher owns one connection manager,
//! one producer registry and one consumer supervisor, and wires them together:
//!
//! - [`RabbitMQDispatcher::consume`] starts a supervised consumer in the
//!   background and returns once it is scheduled.
//! - [`RabbitMQDispatcher::send`] and [`RabbitMQDispatcher::send_batch`]
//!   publish through the shared per-descriptor producer with retries.
//! - [`RabbitMQDispatcher::shutdown`] stops consumers, closes producers and
//!   then the connections.

use crate::{
    channel::ConnectionManager,
    configs::{BrokerConfigs, PublishConfirmConfigs, QueueConfigs, SendRetryPolicy},
    consumer::{ConsumerDefinition, ConsumerState, RabbitMQConsumer},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::PublishMessage,
    queue::QueueDescriptor,
    registry::{AmqpProducerFactory, ProducerRegistry},
    supervisor::ConsumerSupervisor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// RabbitMQ dispatcher composing consumers and producers over shared
/// connections.
pub struct RabbitMQDispatcher {
    connections: Arc<ConnectionManager>,
    registry: Arc<ProducerRegistry>,
    supervisor: Arc<ConsumerSupervisor>,
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// # Parameters
    /// * `cfg` - Broker aliases and application name
    /// * `confirm` - Publisher confirm settings used by every producer
    ///
    /// # Returns
    /// A dispatcher with no consumer started and no connection dialed yet
    pub fn new(cfg: BrokerConfigs, confirm: PublishConfirmConfigs) -> Self {
        Self::with_retry_policy(cfg, confirm, SendRetryPolicy::default())
    }

    /// Assembles a dispatcher from already built collaborators.
    pub fn from_parts(
        connections: Arc<ConnectionManager>,
        registry: Arc<ProducerRegistry>,
        supervisor: Arc<ConsumerSupervisor>,
    ) -> Self {
        RabbitMQDispatcher {
            connections,
            registry,
            supervisor,
        }
    }

    /// Same as [`new`](Self::new) with a custom send retry policy.
    pub fn with_retry_policy(
        cfg: BrokerConfigs,
        confirm: PublishConfirmConfigs,
        retry: SendRetryPolicy,
    ) -> Self {
        let connections = ConnectionManager::new(cfg);

        let registry = ProducerRegistry::new(Arc::new(AmqpProducerFactory::new(
            connections.clone(),
            confirm,
        )))
        .retry_policy(retry);

        let supervisor = ConsumerSupervisor::new(RabbitMQConsumer::new(connections.clone()));

        Self::from_parts(connections, Arc::new(registry), supervisor)
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ConsumerSupervisor> {
        &self.supervisor
    }

    /// Starts consuming `descriptor` with `handler` under supervision.
    ///
    /// Returns as soon as the consumer is scheduled. Declare and channel
    /// failures after that point are logged and retried by the supervisor;
    /// check [`state`](Self::state) for health.
    ///
    /// # Parameters
    /// * `descriptor` - Queue to consume, with its exchange and binding
    /// * `cfg` - Prefetch, retry and dead-letter settings of the queue
    /// * `handler` - Handler invoked once per delivery
    ///
    /// # Returns
    /// `ConfigError` when the broker alias is unknown, `Cancelled` after
    /// shutdown, `Ok(())` otherwise
    pub fn consume(
        &self,
        descriptor: &QueueDescriptor,
        cfg: QueueConfigs,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        self.connections
            .configs()
            .connection_string(descriptor.broker_alias())
            .inspect_err(|err| {
                error!(error = err.to_string(), descriptor = %descriptor, "unable to consume");
            })?;

        self.supervisor
            .start(ConsumerDefinition::new(descriptor, cfg, handler))?;

        info!(descriptor = %descriptor, "consumer scheduled");
        Ok(())
    }

    /// Publishes one message, retrying per the registry policy.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        descriptor: &QueueDescriptor,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError> {
        self.registry.send(cancel, descriptor, msg).await
    }

    /// Publishes messages in order, retrying the whole batch per the registry
    /// policy.
    pub async fn send_batch(
        &self,
        cancel: &CancellationToken,
        descriptor: &QueueDescriptor,
        msgs: &[PublishMessage],
    ) -> Result<(), AmqpError> {
        self.registry.send_batch(cancel, descriptor, msgs).await
    }

    pub fn state(&self, descriptor: &QueueDescriptor) -> Option<ConsumerState> {
        self.supervisor.state(descriptor)
    }

    pub async fn stop(&self, descriptor: &QueueDescriptor) {
        self.supervisor.stop(descriptor).await
    }

    /// Stops every consumer, then closes producers and connections.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.registry.close_all().await;
        self.connections.close_all().await;
        info!("dispatcher shut down");
    }
}
