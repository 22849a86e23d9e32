// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Handling of a single delivery: decode the envelope, run the handler in a
//! panic-safe scope, then either acknowledge the delivery or hand it to the
//! retry policy. Nothing in here fails the dispatch loop; problems are logged
//! and recorded on the delivery's trace span.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    message::{ConsumerHandler, Delivery, MessageEnvelope},
    otel,
    retry::{self, RetryPolicy},
};
use futures_util::FutureExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Subscription options of the setup's consumer.
///
/// Manual acknowledgment with a prefetch of one is the default: each consumer
/// holds at most one unacknowledged delivery at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) tag: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) prefetch: u16,
    pub(crate) args: FieldTable,
}

impl Default for ConsumerDefinition {
    fn default() -> Self {
        ConsumerDefinition {
            tag: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            prefetch: 1,
            args: FieldTable::default(),
        }
    }
}

impl ConsumerDefinition {
    pub fn new() -> ConsumerDefinition {
        ConsumerDefinition::default()
    }

    /// Sets the consumer tag.
    ///
    /// # Parameters
    /// * `tag` - The tag; empty lets the broker generate one
    ///
    /// # Returns
    /// Self for method chaining
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Lets the broker consider deliveries acknowledged once sent.
    ///
    /// Handlers then cannot trigger retries: acks and rejects become no-ops and
    /// no prefetch is applied.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Requests exclusive access; the broker refuses other consumers on the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Asks the broker not to deliver messages published on this connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Subscribes without waiting for the broker's confirmation.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets how many unacknowledged deliveries the broker may push at once.
    ///
    /// Ignored with auto-ack.
    ///
    /// # Parameters
    /// * `count` - The prefetch count
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Sets the raw consume arguments, e.g. `x-priority`.
    ///
    /// # Parameters
    /// * `args` - The argument table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn args(mut self, args: FieldTable) -> Self {
        self.args = args;
        self
    }

    pub(crate) fn options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }
}

/// Decodes a delivery body, falling back to an empty envelope.
///
/// The `x-retry` header, when present, wins over the body's retry count.
pub(crate) fn decode_envelope(delivery: &Delivery) -> MessageEnvelope {
    let mut envelope = match serde_json::from_slice::<MessageEnvelope>(&delivery.data) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = err.to_string(), "failure to parse payload, using empty envelope");
            MessageEnvelope::default()
        }
    };

    if let Some(count) = retry::header_retry_count(&delivery.properties) {
        envelope.retry_count = count;
    }

    envelope
}

/// Processes one delivery.
///
/// This function:
/// 1. Decodes the envelope and opens a consumer span
/// 2. Runs the handler, catching panics
/// 3. Acknowledges on success, unless the subscription auto-acks
/// 4. Routes errors and panics to the retry policy
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
    retry: &dyn RetryPolicy,
    channel: Arc<dyn BrokerChannel>,
    queue: &str,
) {
    let envelope = decode_envelope(&delivery);
    let span_name = if envelope.event_type.is_empty() {
        queue
    } else {
        envelope.event_type.as_str()
    };
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, span_name);

    debug!(
        "received: {} - exchange: {}",
        envelope.event_type, delivery.exchange,
    );

    let outcome = AssertUnwindSafe(async { handler.exec(&ctx, &envelope).await })
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(AmqpError::ConsumerError(panic_message(panic.as_ref()))),
    };

    let Some(failure) = failure else {
        debug!("message successfully processed");
        match delivery.ack().await {
            Err(e) => {
                error!(error = e.to_string(), "error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
            }
            Ok(()) => span.set_status(Status::Ok),
        }
        return;
    };

    warn!(
        error = failure.to_string(),
        event_type = envelope.event_type,
        "error whiling handling msg, handing it to the retry policy"
    );
    span.record_error(&failure);
    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    retry.retry(channel, queue, delivery).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_owned()
    }
}
