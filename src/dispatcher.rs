// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! `QueueConsumer` is the consuming side of a queue setup. A single handler
//! is registered with `consume`; deliveries are dispatched to it one at a
//! time, in receipt order, by one task per live connection. The subscription
//! survives reconnects: the supervisor resubscribes the same handler on every
//! new channel.

use crate::{
    channel::{BrokerChannel, Connector, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    message::ConsumerHandler,
    retry::RetryPolicy,
    runtime::{Role, Runtime},
    setup::SetupDefinition,
    shutdown::shutdown_signal,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct QueueConsumer {
    runtime: Arc<Runtime>,
}

impl QueueConsumer {
    /// Connects and declares the topology, including the consumer prefetch.
    ///
    /// Keeps retrying the connection until it succeeds or the setup's parent
    /// token is cancelled; declaration errors are returned immediately.
    pub async fn start(
        definition: SetupDefinition,
        connector: Arc<dyn Connector>,
    ) -> Result<QueueConsumer, AmqpError> {
        let runtime = Runtime::start(definition, connector, Role::Consumer).await?;
        Ok(QueueConsumer { runtime })
    }

    /// Starts delivering messages to `handler`.
    ///
    /// A setup has at most one handler; a second call fails with
    /// `AmqpError::AlreadyConsuming`.
    pub async fn consume(&self, handler: Arc<dyn ConsumerHandler>) -> Result<(), AmqpError> {
        self.runtime.register(handler).await
    }

    pub fn queue_name(&self) -> &str {
        self.runtime.queue_name()
    }

    /// Stops dispatching, waits for the handler in flight and closes the connection.
    pub async fn close(&self) {
        self.runtime.close().await
    }

    /// Blocks until SIGINT or SIGTERM, then closes the setup.
    pub async fn wait_for_signal_and_shutdown(&self) {
        shutdown_signal().await;
        info!(queue = self.queue_name(), "shutdown signal received");
        self.close().await
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.runtime.shutdown.cancel();
    }
}

/// Feeds the deliveries of one subscription to its handler until the stream
/// ends or `shutdown` is cancelled. A stream error ends it as well.
///
/// Cancellation is only observed between deliveries, so the handler in flight
/// always completes.
pub(crate) async fn dispatch(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn ConsumerHandler>,
    retry: Arc<dyn RetryPolicy>,
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    shutdown: CancellationToken,
) {
    let tracer = global::tracer("amqp consumer");
    info!(queue = queue.as_str(), pid = std::process::id(), "consumer ready");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(queue = queue.as_str(), "dispatch cancelled");
                break;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                consume(
                    &tracer,
                    delivery,
                    handler.as_ref(),
                    retry.as_ref(),
                    channel.clone(),
                    &queue,
                )
                .await
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                break;
            }
            None => {
                debug!(queue = queue.as_str(), "delivery stream closed");
                break;
            }
        }
    }
}
