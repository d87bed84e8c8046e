// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the long-lived broker connections, one per broker alias,
//! and opens channels on them. Connections are dialed lazily and only redialed
//! when a caller asks for one and the cached handle is gone or closed; dial
//! failures are returned as-is and never retried here.

use crate::{configs::BrokerConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, warn};

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Connection of one alias. Dials hold this lock only, so a slow broker never
/// stalls callers of another alias.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Caches one connection per broker alias.
pub struct ConnectionManager {
    cfg: BrokerConfigs,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    pub fn new(cfg: BrokerConfigs) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            cfg,
            slots: Mutex::new(HashMap::default()),
        })
    }

    pub fn configs(&self) -> &BrokerConfigs {
        &self.cfg
    }

    /// Returns the cached connection for `alias`, dialing a fresh one when
    /// there is none or the cached one is no longer connected.
    pub async fn ensure_connection(&self, alias: &str) -> Result<Arc<Connection>, AmqpError> {
        let uri = self.cfg.connection_string(alias)?;

        let slot = self.slot(alias);
        let mut current = slot.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!(alias = alias, "cached amqp connection is closed, dialing again");
        }

        debug!(alias = alias, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.app_name.clone()));

        let conn = match Connection::connect(&uri, options).await {
            Ok(c) => Ok(Arc::new(c)),
            Err(err) => {
                error!(error = err.to_string(), alias = alias, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!(alias = alias, "amqp connected");

        *current = Some(conn.clone());
        Ok(conn)
    }

    fn slot(&self, alias: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(alias.to_owned())
            .or_default()
            .clone()
    }

    /// Opens a new channel on the connection of `alias`.
    pub async fn open_channel(&self, alias: &str) -> Result<Channel, AmqpError> {
        let conn = self.ensure_connection(alias).await?;

        debug!(alias = alias, "creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!(alias = alias, "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), alias = alias, "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    /// Whether a connected handle is cached for `alias`. An alias whose dial
    /// is still in progress is not usable yet.
    pub async fn is_usable(&self, alias: &str) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned();

        let Some(slot) = slot else {
            return false;
        };

        let usable = match slot.try_lock() {
            Ok(current) => current
                .as_ref()
                .map(|conn| conn.status().connected())
                .unwrap_or(false),
            Err(_) => false,
        };
        usable
    }

    /// Closes and forgets the connection of `alias`. Unknown aliases are a no-op.
    pub async fn close(&self, alias: &str) {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias);

        if let Some(slot) = slot {
            close_slot(alias, &slot).await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (alias, slot) in drained {
            close_slot(&alias, &slot).await;
        }
    }
}

async fn close_slot(alias: &str, slot: &Slot) {
    let conn = slot.lock().await.take();
    if let Some(conn) = conn {
        close_connection(alias, &conn).await;
    }
}

async fn close_connection(alias: &str, conn: &Connection) {
    if !conn.status().connected() {
        return;
    }

    if let Err(err) = conn.close(CLOSE_REPLY_SUCCESS, "closing").await {
        warn!(error = err.to_string(), alias = alias, "failure to close the connection");
    }
}

/// Closes a channel if it is still open, logging failures.
pub(crate) async fn close_channel(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }

    if let Err(err) = channel.close(CLOSE_REPLY_SUCCESS, "closing").await {
        warn!(error = err.to_string(), "failure to close the channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::RabbitMQConfigs;
    use std::time::Duration;

    #[tokio::test]
    async fn unresolved_alias_is_reported_before_dialing() {
        let manager = ConnectionManager::new(
            BrokerConfigs::new("test").broker("default", RabbitMQConfigs::default()),
        );

        let err = manager.ensure_connection("missing").await.unwrap_err();

        assert!(matches!(err, AmqpError::ConfigError(_)));
        assert!(!manager.is_usable("missing").await);
    }

    #[tokio::test]
    async fn dial_failure_is_a_connection_error() {
        let manager = ConnectionManager::new(BrokerConfigs::new("test").broker(
            "default",
            RabbitMQConfigs {
                host: "127.0.0.1".to_owned(),
                port: 1,
                ..Default::default()
            },
        ));

        let err = manager.open_channel("default").await.unwrap_err();

        assert!(matches!(err, AmqpError::ConnectionError(_)));
        assert!(!manager.is_usable("default").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hanging_dial_does_not_block_other_aliases() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = |port| RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port,
            ..Default::default()
        };
        let manager = ConnectionManager::new(
            BrokerConfigs::new("test")
                .broker("silent", broker(port))
                .broker("down", broker(1)),
        );

        let hanging = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_connection("silent").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let res = tokio::time::timeout(Duration::from_secs(2), manager.ensure_connection("down"))
            .await
            .expect("dial of another alias completes");
        assert!(matches!(res, Err(AmqpError::ConnectionError(_))));

        let usable = tokio::time::timeout(Duration::from_secs(1), manager.is_usable("silent"))
            .await
            .expect("is_usable never waits on a dial");
        assert!(!usable);

        hanging.abort();
    }

    #[tokio::test]
    async fn closing_unknown_alias_is_a_no_op() {
        let manager = ConnectionManager::new(BrokerConfigs::new("test"));

        manager.close("nothing").await;
        manager.close_all().await;
    }
}
