// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Registry
//!
//! Keeps at most one live publisher per queue descriptor so unrelated call
//! sites reuse one warmed channel instead of dialing per send. The registry is
//! an explicit object; share it with `Arc` where it is needed.
//!
//! Builds happen outside the lock. When two callers race on the same
//! descriptor, the first insert wins and the other instance is closed.

use crate::{
    channel::ConnectionManager,
    configs::{PublishConfirmConfigs, SendRetryPolicy},
    errors::AmqpError,
    publisher::{PublishMessage, Publisher, RabbitMQPublisher},
    queue::QueueDescriptor,
};
use async_trait::async_trait;
use std::{
    collections::{hash_map::Entry, HashMap},
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Builds ready-to-use publishers for the registry.
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    async fn build(&self, descriptor: &QueueDescriptor) -> Result<Arc<dyn Publisher>, AmqpError>;
}

/// Builds [`RabbitMQPublisher`]s with their channel already declared.
pub struct AmqpProducerFactory {
    connections: Arc<ConnectionManager>,
    confirm: PublishConfirmConfigs,
}

impl AmqpProducerFactory {
    pub fn new(connections: Arc<ConnectionManager>, confirm: PublishConfirmConfigs) -> Self {
        AmqpProducerFactory {
            connections,
            confirm,
        }
    }
}

#[async_trait]
impl ProducerFactory for AmqpProducerFactory {
    async fn build(&self, descriptor: &QueueDescriptor) -> Result<Arc<dyn Publisher>, AmqpError> {
        let publisher =
            RabbitMQPublisher::new(self.connections.clone(), descriptor, self.confirm.clone());
        publisher.ensure_channel(&CancellationToken::new()).await?;

        Ok(publisher)
    }
}

pub struct ProducerRegistry {
    factory: Arc<dyn ProducerFactory>,
    retry: SendRetryPolicy,
    producers: RwLock<HashMap<String, Arc<dyn Publisher>>>,
}

impl ProducerRegistry {
    pub fn new(factory: Arc<dyn ProducerFactory>) -> Self {
        ProducerRegistry {
            factory,
            retry: SendRetryPolicy::default(),
            producers: RwLock::new(HashMap::default()),
        }
    }

    pub fn retry_policy(mut self, retry: SendRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn len(&self) -> usize {
        self.producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the publisher of `descriptor`, building it on first use.
    pub async fn get_or_create(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<Arc<dyn Publisher>, AmqpError> {
        let key = descriptor.key();

        if let Some(producer) = self
            .producers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(producer.clone());
        }

        debug!(descriptor = key, "building producer");
        let built = self.factory.build(descriptor).await.inspect_err(|err| {
            error!(error = err.to_string(), descriptor = key, "failure to build producer");
        })?;

        let winner = match self
            .producers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
        {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(built.clone());
                None
            }
        };

        match winner {
            None => Ok(built),
            Some(winner) => {
                debug!(descriptor = key, "producer built concurrently, discarding duplicate");
                built.close().await;
                Ok(winner)
            }
        }
    }

    /// Closes and forgets the publisher of `descriptor`, if any.
    pub async fn remove(&self, descriptor: &QueueDescriptor) {
        let removed = self
            .producers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&descriptor.key());

        if let Some(producer) = removed {
            producer.close().await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<dyn Publisher>> = self
            .producers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, producer)| producer)
            .collect();

        for producer in drained {
            producer.close().await;
        }
    }

    /// Publishes through the shared publisher, retrying failed attempts.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        descriptor: &QueueDescriptor,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError> {
        self.with_retry(cancel, descriptor, |producer| async move {
            producer.publish(cancel, msg, None).await
        })
        .await
    }

    /// Publishes a batch through the shared publisher, retrying failed attempts.
    pub async fn send_batch(
        &self,
        cancel: &CancellationToken,
        descriptor: &QueueDescriptor,
        msgs: &[PublishMessage],
    ) -> Result<(), AmqpError> {
        self.with_retry(cancel, descriptor, |producer| async move {
            producer.publish_batch(cancel, msgs, None).await
        })
        .await
    }

    /// Runs `op` up to `attempts` times. A failed attempt resets the channel so
    /// the next one redeclares, then waits the fixed backoff.
    async fn with_retry<F, Fut>(
        &self,
        cancel: &CancellationToken,
        descriptor: &QueueDescriptor,
        op: F,
    ) -> Result<(), AmqpError>
    where
        F: Fn(Arc<dyn Publisher>) -> Fut,
        Fut: Future<Output = Result<(), AmqpError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut last = AmqpError::InternalError;

        for attempt in 1..=attempts {
            let producer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                producer = self.get_or_create(descriptor) => producer,
            };

            let result = match producer {
                Ok(producer) => {
                    let result = op(producer.clone()).await;
                    if result.is_err() {
                        producer.reset().await;
                    }
                    result
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        descriptor = %descriptor,
                        attempt = attempt,
                        "send failed"
                    );
                    last = err;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                    _ = tokio::time::sleep(self.retry.backoff) => {}
                }
            }
        }

        error!(error = last.to_string(), descriptor = %descriptor, "send retries exhausted");
        Err(last)
    }
}
