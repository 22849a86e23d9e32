// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages, Deliveries and Handlers
//!
//! `MessageEnvelope` is the JSON convention shared by publishers and
//! consumers. `Delivery` is one received message together with the means to
//! settle it, and `ConsumerHandler` is what user code implements to process
//! envelopes.

use crate::errors::AmqpError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use lapin::BasicProperties;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// The event envelope carried in message bodies.
///
/// Every field is optional on the wire; missing fields keep their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Event type name, e.g. `cart-item-created`.
    #[serde(default)]
    pub event_type: String,
    /// Publication date as an RFC 3339 string.
    #[serde(default, rename = "date")]
    pub timestamp: String,
    /// Opaque payload, interpreted only by handlers.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, rename = "current_exchange_name")]
    pub origin_exchange: String,
    #[serde(default, rename = "total_re_hit")]
    pub retry_count: i64,
}

impl MessageEnvelope {
    /// Creates an envelope for `event_type` stamped with the current time.
    pub fn new(event_type: &str, data: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope {
            event_type: event_type.to_owned(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            data,
            origin_exchange: String::new(),
            retry_count: 0,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.origin_exchange = exchange.to_owned();
        self
    }

    /// Serializes the envelope into a message body.
    pub fn to_vec(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::PublishingError(err.to_string()))
    }
}

/// Settles a delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One message received by a consumer.
#[derive(Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    auto_ack: bool,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        data: Vec<u8>,
        auto_ack: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            auto_ack,
            acker,
        }
    }

    /// Whether the broker considered this delivery acknowledged on send.
    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Acknowledges the delivery; a no-op for auto-ack subscriptions.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker.ack().await
    }

    /// Rejects the delivery; a no-op for auto-ack subscriptions.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("auto_ack", &self.auto_ack)
            .field("len", &self.data.len())
            .finish()
    }
}

/// User code processing the envelopes of a subscription.
///
/// Returning an error or panicking routes the delivery to the retry policy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &MessageEnvelope) -> Result<(), AmqpError>;
}

/// Adapts an async closure into a `ConsumerHandler`.
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<HandlerFn<F>>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<F, Fut> ConsumerHandler for HandlerFn<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: &MessageEnvelope) -> Result<(), AmqpError> {
        (self.0)(msg.clone()).await
    }
}
