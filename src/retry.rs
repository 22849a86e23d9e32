// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-letter Policy
//!
//! A delivery whose handler failed is handed to a `RetryPolicy`. The default
//! policy, `RequeueWithCount`, republishes the message to the back of the
//! queue it came from with an incremented `x-retry` header, and rejects the
//! delivery it received. Once the count passes the limit the message is only rejected,
//! which lets the queue's dead-letter arguments route it to the DLQ.

use crate::{channel::BrokerChannel, message::Delivery};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use std::sync::Arc;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

/// Header carrying the number of times a message was retried.
pub const AMQP_HEADERS_RETRY: &str = "x-retry";

pub const DEFAULT_MAX_RETRY: i64 = 3;

/// Reads a retry counter out of a header value of any numeric width.
///
/// Floats are truncated; anything that is not a number counts as 0.
pub fn decode_retry_count(value: &AMQPValue) -> i64 {
    match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::Float(v) => *v as i64,
        AMQPValue::Double(v) => *v as i64,
        _ => 0,
    }
}

/// The `x-retry` count carried by a message, when the header is present.
pub(crate) fn header_retry_count(properties: &BasicProperties) -> Option<i64> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_RETRY))
        .map(decode_retry_count)
}

/// The `x-retry` count carried by a message; 0 when absent.
pub fn retry_count(properties: &BasicProperties) -> i64 {
    header_retry_count(properties).unwrap_or_default()
}

/// Decides what happens to a delivery whose handler failed.
///
/// Implementations settle the delivery themselves; the dispatch loop neither
/// acks nor rejects it afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn retry(&self, channel: Arc<dyn BrokerChannel>, queue: &str, delivery: Delivery);
}

/// Republishes failed messages up to `max_retry` times, then dead-letters them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueWithCount {
    pub max_retry: i64,
}

impl Default for RequeueWithCount {
    fn default() -> Self {
        RequeueWithCount {
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl RequeueWithCount {
    pub fn new(max_retry: i64) -> RequeueWithCount {
        RequeueWithCount { max_retry }
    }

    fn next_properties(properties: &BasicProperties, count: i64) -> BasicProperties {
        let mut headers = properties.headers().clone().unwrap_or_default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY),
            AMQPValue::LongLongInt(count),
        );

        properties
            .clone()
            .with_headers(headers)
            .with_timestamp(Utc::now().timestamp() as u64)
    }
}

#[async_trait]
impl RetryPolicy for RequeueWithCount {
    async fn retry(&self, channel: Arc<dyn BrokerChannel>, queue: &str, delivery: Delivery) {
        let count = retry_count(&delivery.properties).max(0).saturating_add(1);

        if count > self.max_retry {
            info!(
                queue,
                retries = count - 1,
                "max retries reached, sending message to the dead-letter queue"
            );
        } else {
            debug!(queue, count, "republishing failed message");

            let properties = Self::next_properties(&delivery.properties, count);
            if let Err(err) = channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &delivery.data,
                    properties,
                )
                .await
            {
                error!(error = err.to_string(), "error republishing message for retry");
            }
        }

        if let Err(err) = delivery.reject(false).await {
            error!(error = err.to_string(), "error whiling reject msg");
        }
    }
}
