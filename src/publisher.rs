// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Publisher
//!
//! `QueuePublisher` is the publishing side of a queue setup. Messages go to
//! the setup's exchange (or the default exchange when none is configured)
//! with the queue name as routing key unless the publisher definition
//! overrides it. Every message is stamped with the default metadata and the
//! caller's trace context.

use crate::{
    channel::Connector,
    errors::AmqpError,
    message::MessageEnvelope,
    otel,
    runtime::{Role, Runtime},
    setup::SetupDefinition,
    shutdown::shutdown_signal,
};
use chrono::Utc;
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Publishing options and default message metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherDefinition {
    pub(crate) mandatory: bool,
    pub(crate) immediate: bool,
    pub(crate) content_type: String,
    pub(crate) delivery_mode: u8,
    pub(crate) app_id: String,
    pub(crate) routing_key: Option<String>,
}

impl PublisherDefinition {
    /// Creates publishing defaults: JSON content type and transient delivery.
    ///
    /// # Parameters
    /// * `app_id` - The `app_id` stamped on every message
    ///
    /// # Returns
    /// A new publisher definition
    pub fn new(app_id: &str) -> PublisherDefinition {
        PublisherDefinition {
            mandatory: false,
            immediate: false,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            delivery_mode: DELIVERY_MODE_TRANSIENT,
            app_id: app_id.to_owned(),
            routing_key: None,
        }
    }

    /// Sets the mandatory flag: unroutable messages are returned by the broker
    /// instead of being dropped.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets the immediate flag.
    ///
    /// RabbitMQ 3.0 and later refuse it and close the channel.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Overrides the content type of published messages.
    ///
    /// # Parameters
    /// * `content_type` - A MIME type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Asks the broker to store messages on disk.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DELIVERY_MODE_PERSISTENT;
        self
    }

    /// Sets the `app_id` stamped on every message.
    ///
    /// # Parameters
    /// * `app_id` - The application name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = app_id.to_owned();
        self
    }

    /// Publishes with `key` instead of the queue name.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    fn options(&self) -> BasicPublishOptions {
        BasicPublishOptions {
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }

    fn properties(&self, headers: FieldTable) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_delivery_mode(self.delivery_mode)
            .with_app_id(ShortString::from(self.app_id.as_str()))
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(headers)
    }
}

pub struct QueuePublisher {
    runtime: Arc<Runtime>,
}

impl QueuePublisher {
    /// Connects and declares the topology of `definition`.
    ///
    /// Keeps retrying the connection until it succeeds or the setup's parent
    /// token is cancelled; declaration errors are returned immediately.
    pub async fn start(
        definition: SetupDefinition,
        connector: Arc<dyn Connector>,
    ) -> Result<QueuePublisher, AmqpError> {
        let runtime = Runtime::start(definition, connector, Role::Publisher).await?;
        Ok(QueuePublisher { runtime })
    }

    pub fn exchange_name(&self) -> &str {
        self.runtime.definition.topology.exchange_name()
    }

    pub fn routing_key(&self) -> &str {
        self.runtime
            .definition
            .publisher
            .routing_key
            .as_deref()
            .unwrap_or(self.runtime.queue_name())
    }

    /// Publishes one message with the default metadata.
    ///
    /// Fails with `AmqpError::Cancelled` once the setup shuts down; wrap it in
    /// `tokio::time::timeout` to bound the wait on a stalled broker.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), AmqpError> {
        self.publish_with_headers(payload, FieldTable::default())
            .await
    }

    /// Serializes `envelope` and publishes it.
    pub async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<(), AmqpError> {
        self.publish(&envelope.to_vec()?).await
    }

    /// Publishes one message carrying extra `headers`.
    pub async fn publish_with_headers(
        &self,
        payload: &[u8],
        mut headers: FieldTable,
    ) -> Result<(), AmqpError> {
        let shutdown = &self.runtime.shutdown;
        if shutdown.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }

        let definition = &self.runtime.definition.publisher;
        otel::inject(&Context::current(), &mut headers);

        let channel = self.runtime.manager.channel().await?;
        let exchange = self.exchange_name();
        let routing_key = self.routing_key();

        debug!(exchange, routing_key, "publishing message");

        let published = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(AmqpError::Cancelled),
            published = channel.basic_publish(
                exchange,
                routing_key,
                definition.options(),
                payload,
                definition.properties(headers),
            ) => published,
        };

        if let Err(err) = &published {
            error!(error = err.to_string(), "error publishing message");
        }

        published
    }

    /// Publishes every payload, continuing past failures.
    ///
    /// Returns one result per payload, in input order.
    pub async fn batch_publish<I>(&self, payloads: I) -> Vec<Result<(), AmqpError>>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut results = vec![];
        for payload in payloads {
            results.push(self.publish(payload.as_ref()).await);
        }

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            error!(failed, total = results.len(), "batch publish finished with errors");
        }

        results
    }

    /// Closes the channel and connection; publishing afterwards fails.
    pub async fn close(&self) {
        self.runtime.close().await
    }

    /// Blocks until SIGINT or SIGTERM, then closes the setup.
    pub async fn wait_for_signal_and_shutdown(&self) {
        shutdown_signal().await;
        info!(queue = self.runtime.queue_name(), "shutdown signal received");
        self.close().await
    }
}

impl Drop for QueuePublisher {
    fn drop(&mut self) {
        self.runtime.shutdown.cancel();
    }
}
