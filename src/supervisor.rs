// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Supervisor
//!
//! Runs each consumer in its own task and restarts it after a fixed delay when
//! it ends with an error. A consumer that returns because it was canceled is
//! not restarted.
//!
//! Every supervised descriptor owns one cancellation token, a child of the
//! supervisor's root token, for its whole lifetime across restarts. `stop`
//! cancels that token; `shutdown` cancels the root.

use crate::{
    consumer::{ConsumerDefinition, ConsumerRunner, ConsumerState},
    errors::AmqpError,
    queue::QueueDescriptor,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

struct Supervised {
    token: CancellationToken,
    state: watch::Receiver<ConsumerState>,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct ConsumerSupervisor {
    runner: Arc<dyn ConsumerRunner>,
    restart_delay: Duration,
    root: CancellationToken,
    generation: AtomicU64,
    consumers: Mutex<HashMap<String, Supervised>>,
}

impl ConsumerSupervisor {
    pub fn new(runner: Arc<dyn ConsumerRunner>) -> Arc<ConsumerSupervisor> {
        Self::with_restart_delay(runner, DEFAULT_RESTART_DELAY)
    }

    pub fn with_restart_delay(
        runner: Arc<dyn ConsumerRunner>,
        restart_delay: Duration,
    ) -> Arc<ConsumerSupervisor> {
        Arc::new(ConsumerSupervisor {
            runner,
            restart_delay,
            root: CancellationToken::new(),
            generation: AtomicU64::new(0),
            consumers: Mutex::new(HashMap::default()),
        })
    }

    /// Starts supervising `def` in the background and returns immediately.
    ///
    /// A descriptor that is already supervised is canceled and replaced; the
    /// new consumer begins once the previous one has exited. Fails with
    /// [`AmqpError::Cancelled`] after [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>, def: ConsumerDefinition) -> Result<(), AmqpError> {
        if self.root.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }

        let key = def.descriptor().key();
        let token = self.root.child_token();
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = consumers.remove(&key).map(|old| {
            debug!(descriptor = key, "replacing supervised consumer");
            old.token.cancel();
            old.handle
        });

        let handle = tokio::spawn(self.clone().supervise(
            def,
            token.clone(),
            state_tx,
            generation,
            previous,
        ));

        consumers.insert(
            key,
            Supervised {
                token,
                state: state_rx,
                generation,
                handle,
            },
        );

        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        def: ConsumerDefinition,
        token: CancellationToken,
        state: watch::Sender<ConsumerState>,
        generation: u64,
        previous: Option<JoinHandle<()>>,
    ) {
        let key = def.descriptor().key();

        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.runner.run(&def, token.clone(), &state).await {
                Ok(()) => {
                    info!(descriptor = key, "consumer stopped");
                    break;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        descriptor = key,
                        "consumer closed, restarting in {:?}",
                        self.restart_delay
                    );

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.restart_delay) => {}
                    }
                }
            }
        }

        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        if consumers
            .get(&key)
            .is_some_and(|entry| entry.generation == generation)
        {
            consumers.remove(&key);
        }
    }

    /// Stops the consumer of `descriptor` and waits for it to exit. Unknown or
    /// already stopped descriptors are ignored.
    pub async fn stop(&self, descriptor: &QueueDescriptor) {
        let removed = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&descriptor.key());

        if let Some(entry) = removed {
            entry.token.cancel();
            let _ = entry.handle.await;
            debug!(descriptor = %descriptor, "consumer stop requested");
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Supervised> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &drained {
            entry.token.cancel();
        }

        for entry in drained {
            let _ = entry.handle.await;
        }
    }

    /// Cancels every consumer and refuses further starts.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.stop_all().await;
    }

    pub fn is_running(&self, descriptor: &QueueDescriptor) -> bool {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.key())
            .is_some_and(|entry| !entry.token.is_cancelled())
    }

    /// Last reported state of the consumer of `descriptor`, if supervised.
    pub fn state(&self, descriptor: &QueueDescriptor) -> Option<ConsumerState> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.key())
            .map(|entry| *entry.state.borrow())
    }

    pub fn len(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
