// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the broker connection and channel of one setup. `open` keeps dialing
//! until it succeeds or the setup is cancelled, and wires the close
//! notification of every new connection into the reconnect supervisor's
//! event queue. Each connection gets a generation number so notifications
//! from a connection that was already replaced can be told apart.

use crate::{
    channel::{BrokerChannel, Connector},
    errors::AmqpError,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A close notification raised by the connection of `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub error: AmqpError,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<dyn BrokerChannel>>>,
    generation: AtomicU64,
    lost: Arc<AtomicU64>,
    retry_interval: Duration,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Creates a manager and the receiving end of its close notifications.
    pub fn new(
        connector: Arc<dyn Connector>,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();

        let manager = ConnectionManager {
            connector,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            lost: Arc::new(AtomicU64::new(0)),
            retry_interval,
            shutdown,
            events,
        };

        (manager, receiver)
    }

    /// Generation of the connection currently in use; 0 before the first open.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Opens a connection and channel, retrying on a fixed interval.
    ///
    /// Only returns `None` when the setup is cancelled. The previous channel,
    /// if any, is replaced and closed.
    pub async fn open(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            info!(attempt, "trying to open rabbitmq connection");

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                opened = self.connector.open() => opened,
            };

            match opened {
                Ok(channel) => {
                    // generation and channel change together under the write lock
                    let mut current = self.current.write().await;
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let (events, lost) = (self.events.clone(), self.lost.clone());
                    channel.notify_on_close(Box::new(move |error| {
                        lost.fetch_max(generation, Ordering::SeqCst);
                        let _ = events.send(ConnectionEvent { generation, error });
                    }));

                    let previous = current.replace(channel.clone());
                    drop(current);
                    if let Some(previous) = previous {
                        self.discard(previous).await;
                    }

                    info!(generation, "rabbitmq connection established");
                    return Some(channel);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        retry_in = ?self.retry_interval,
                        "error opening rabbitmq connection"
                    );
                    if !self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps one retry interval; `false` when cancelled meanwhile.
    pub async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    /// The channel currently in use.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.current.read().await.clone().ok_or(AmqpError::ChannelError)
    }

    /// The channel currently in use, with the generation of its connection.
    pub async fn current(&self) -> Result<(u64, Arc<dyn BrokerChannel>), AmqpError> {
        let current = self.current.read().await;
        let channel = current.clone().ok_or(AmqpError::ChannelError)?;
        Ok((self.generation(), channel))
    }

    /// Whether the connection of `generation` has reported its close.
    pub fn is_lost(&self, generation: u64) -> bool {
        generation > 0 && self.lost.load(Ordering::SeqCst) >= generation
    }

    /// Closes the channel and its connection, logging failures.
    pub async fn close(&self) {
        let Some(channel) = self.current.write().await.take() else {
            debug!("no connection to close");
            return;
        };

        match channel.close().await {
            Ok(()) => info!("rabbitmq connection closed"),
            Err(err) => error!(error = err.to_string(), "error closing connection"),
        }
    }

    async fn discard(&self, channel: Arc<dyn BrokerChannel>) {
        match tokio::time::timeout(self.retry_interval, channel.close()).await {
            Ok(Ok(())) => debug!("previous connection closed"),
            Ok(Err(err)) => debug!(error = err.to_string(), "previous connection already gone"),
            Err(_) => debug!("timed out closing previous connection"),
        }
    }
}
