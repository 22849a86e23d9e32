// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Setup Runtime
//!
//! The running state behind a `QueuePublisher` or `QueueConsumer`: the
//! connection manager, the registered subscription, the shutdown token and
//! the task tracker that acts as the setup's wait-group.
//!
//! Every setup owns one supervisor task. It waits for close notifications
//! from the connection manager and heals the setup: reopen, redeclare the
//! topology, reapply QoS and resubscribe the handler. Consumers retry forever;
//! publishers give up after `max_reconnect_attempts` reconnects.

use crate::{
    channel::{BrokerChannel, Connector},
    connection::{ConnectionEvent, ConnectionManager},
    dispatcher,
    errors::AmqpError,
    message::ConsumerHandler,
    setup::SetupDefinition,
};
use futures_util::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Publisher,
    Consumer,
}

/// The dispatch task of one subscription and the token that stops it.
struct Dispatch {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// The registered handler and the connection it currently consumes on.
///
/// `generation` is 0 while no dispatch is live, which makes the next restore
/// subscribe.
struct Subscription {
    handler: Arc<dyn ConsumerHandler>,
    generation: u64,
    dispatch: Option<Dispatch>,
}

impl Subscription {
    /// Stops the previous dispatch and waits for it to exit.
    ///
    /// The handler in flight runs to completion; no further delivery of the
    /// old stream is taken.
    async fn retire(&mut self) {
        if let Some(previous) = self.dispatch.take() {
            previous.stop.cancel();
            if let Err(err) = previous.task.await {
                debug!(error = err.to_string(), "previous dispatch ended abnormally");
            }
        }
        self.generation = 0;
    }
}

pub(crate) struct Runtime {
    pub(crate) definition: SetupDefinition,
    role: Role,
    pub(crate) manager: ConnectionManager,
    subscription: Mutex<Option<Subscription>>,
    pub(crate) shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Runtime {
    /// Connects, installs the topology and starts the reconnect supervisor.
    ///
    /// Connection failures are retried until the setup is cancelled; topology
    /// failures are returned to the caller.
    pub(crate) async fn start(
        definition: SetupDefinition,
        connector: Arc<dyn Connector>,
        role: Role,
    ) -> Result<Arc<Runtime>, AmqpError> {
        let shutdown = match &definition.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (manager, events) =
            ConnectionManager::new(connector, definition.reconnect_interval, shutdown.clone());

        let channel = manager.open().await.ok_or(AmqpError::Cancelled)?;

        let runtime = Arc::new(Runtime {
            definition,
            role,
            manager,
            subscription: Mutex::new(None),
            shutdown,
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });

        if let Err(err) = runtime.prepare(channel.as_ref()).await {
            error!(error = err.to_string(), "failure to prepare the queue setup");
            runtime.shutdown.cancel();
            runtime.manager.close().await;
            return Err(err);
        }

        runtime.tracker.spawn(supervise(
            Arc::downgrade(&runtime),
            events,
            runtime.shutdown.clone(),
        ));

        info!(
            queue = runtime.queue_name(),
            role = ?role,
            "rabbitmq setup started"
        );

        Ok(runtime)
    }

    pub(crate) fn queue_name(&self) -> &str {
        self.definition.topology.queue_name()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Declares the topology and, for manual-ack consumers, the prefetch.
    async fn prepare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.definition.topology.install(channel).await?;

        let consumer = &self.definition.consumer;
        if self.role == Role::Consumer && !consumer.auto_ack {
            channel.basic_qos(consumer.prefetch).await?;
        }

        Ok(())
    }

    /// Registers the setup's only subscription and starts dispatching to it.
    ///
    /// When the connection is lost while subscribing, the handler is kept and
    /// the reconnect supervisor subscribes it on the next connection.
    pub(crate) async fn register(
        self: &Arc<Self>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(AmqpError::AlreadyConsuming);
        }
        if self.is_closed() {
            return Err(AmqpError::Cancelled);
        }

        let (generation, channel) = self.manager.current().await?;
        let mut registered = Subscription {
            handler,
            generation: 0,
            dispatch: None,
        };

        match self.subscribe(channel, registered.handler.clone()).await {
            Ok(dispatch) => {
                registered.generation = generation;
                registered.dispatch = Some(dispatch);
            }
            Err(err)
                if self.manager.is_lost(generation) || self.manager.generation() != generation =>
            {
                warn!(
                    error = err.to_string(),
                    generation,
                    "connection lost while subscribing, resubscribing after reconnect"
                );
            }
            Err(err) => return Err(err),
        }

        *subscription = Some(registered);
        Ok(())
    }

    async fn subscribe(
        self: &Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Dispatch, AmqpError> {
        let consumer = &self.definition.consumer;
        let queue = self.queue_name().to_owned();

        let deliveries = channel
            .basic_consume(&queue, &consumer.tag, consumer.options(), consumer.args.clone())
            .await?;

        let stop = self.shutdown.child_token();
        let dispatch = dispatcher::dispatch(
            deliveries,
            handler,
            self.definition.retry.clone(),
            channel,
            queue,
            stop.clone(),
        );
        let runtime = Arc::downgrade(self);

        let task = self.tracker.spawn(async move {
            if AssertUnwindSafe(dispatch).catch_unwind().await.is_err() {
                error!("dispatch loop panicked, closing the queue setup");
                if let Some(runtime) = runtime.upgrade() {
                    tokio::spawn(async move { runtime.close().await });
                }
            }
        });

        Ok(Dispatch { stop, task })
    }

    /// Opens a fresh connection and restores the setup on it.
    ///
    /// Returns `false` only when the setup was cancelled meanwhile.
    async fn reconnect(self: &Arc<Self>) -> bool {
        loop {
            let Some(channel) = self.manager.open().await else {
                return false;
            };
            // only the supervisor reopens, so this is the generation of `channel`
            let generation = self.manager.generation();

            match self.restore(channel, generation).await {
                Ok(()) => {
                    info!(queue = self.queue_name(), "rabbitmq setup restored");
                    return true;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        "failure to restore the queue setup, retrying"
                    );
                    if !self.manager.pause().await {
                        return false;
                    }
                }
            }
        }
    }

    /// Redeclares the topology on `channel` and moves the subscription onto it.
    ///
    /// The previous dispatch is retired first, so deliveries are never handled
    /// by two dispatch tasks at once.
    async fn restore(
        self: &Arc<Self>,
        channel: Arc<dyn BrokerChannel>,
        generation: u64,
    ) -> Result<(), AmqpError> {
        self.prepare(channel.as_ref()).await?;

        let mut guard = self.subscription.lock().await;
        let Some(subscription) = guard.as_mut() else {
            return Ok(());
        };
        if subscription.generation == generation {
            debug!(generation, "subscription already on the current connection");
            return Ok(());
        }

        subscription.retire().await;
        let dispatch = self.subscribe(channel, subscription.handler.clone()).await?;
        subscription.generation = generation;
        subscription.dispatch = Some(dispatch);

        Ok(())
    }

    /// Stops the setup: cancels background work, waits for in-flight
    /// handlers, then closes the channel and connection.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("queue setup already closed");
            return;
        }

        info!(queue = self.queue_name(), "closing rabbitmq setup");

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.manager.close().await;

        info!(queue = self.queue_name(), "rabbitmq setup closed");
    }
}

async fn supervise(
    runtime: Weak<Runtime>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    let mut attempts: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let Some(runtime) = runtime.upgrade() else {
            return;
        };

        if event.generation != runtime.manager.generation() {
            debug!(generation = event.generation, "ignoring close of a replaced connection");
            continue;
        }
        if runtime.is_closed() {
            return;
        }

        attempts += 1;
        warn!(
            error = event.error.to_string(),
            attempt = attempts,
            "rabbitmq connection lost, reconnecting"
        );

        if runtime.role == Role::Publisher && attempts > runtime.definition.max_reconnect_attempts {
            error!(
                attempts = runtime.definition.max_reconnect_attempts,
                "max reconnect attempts reached, publisher stays disconnected"
            );
            return;
        }

        if !runtime.reconnect().await {
            return;
        }
    }
}
