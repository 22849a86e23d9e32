// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Declare options and arguments for the setup's queue, including dead-letter
//! routing. Rejected messages that exhaust their retries leave the queue
//! through these dead-letter arguments; the retry policy never publishes to
//! the dead-letter destination itself.

use lapin::{
    options::{QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Where rejected messages of a queue are routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeadLetter {
    /// A `<queue>-dlq` queue declared next to the main queue.
    Queue,
    /// A user-managed exchange and routing key.
    Exchange { exchange: String, routing_key: String },
}

/// Declare options of the setup's queue.
///
/// Defaults to a non-durable, non-exclusive queue without extra arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter: Option<DeadLetter>,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a queue definition with default settings.
    pub fn new() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// Makes the queue survive broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue when its last consumer unsubscribes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the queue passive, checking for existence without creating it.
    ///
    /// A passive declare of a missing queue fails the setup.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Declares without waiting for the broker's confirmation.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message time-to-live.
    ///
    /// # Parameters
    /// * `ttl` - Time-to-live in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Caps the number of ready messages in the queue.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Caps the total body size of ready messages in the queue.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Declares a `<queue>-dlq` queue and dead-letters rejected messages into it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dlq(mut self) -> Self {
        self.dead_letter = Some(DeadLetter::Queue);
        self
    }

    /// Dead-letters rejected messages to an exchange managed elsewhere.
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange
    /// * `routing_key` - The routing key used when dead-lettering
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some(DeadLetter::Exchange {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self
    }

    /// Adds a raw queue argument.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Name of the dead-letter queue to declare alongside `queue`, if any.
    pub(crate) fn dlq_name(&self, queue: &str) -> Option<String> {
        match self.dead_letter {
            Some(DeadLetter::Queue) => Some(format!("{}-dlq", queue)),
            _ => None,
        }
    }

    /// Computes the declare arguments of `queue`.
    pub(crate) fn arguments(&self, queue: &str) -> FieldTable {
        let mut args = self.args.clone();

        let dead_letter = match &self.dead_letter {
            Some(DeadLetter::Queue) => Some((String::new(), format!("{}-dlq", queue))),
            Some(DeadLetter::Exchange {
                exchange,
                routing_key,
            }) => Some((exchange.clone(), routing_key.clone())),
            None => None,
        };

        if let Some((exchange, routing_key)) = dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange)),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key)),
            );
        }

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// Binding of the setup's queue to its exchange.
///
/// The queue and exchange names come from the setup itself; only the routing
/// key and the binding arguments are configurable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) routing_key: String,
    pub(crate) no_wait: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    /// Creates a binding with an empty routing key.
    pub fn new() -> QueueBinding {
        QueueBinding::default()
    }

    /// Sets the routing key the queue is bound with.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Binds without waiting for the broker's confirmation.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a binding argument, e.g. `x-match` for headers exchanges.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn options(&self) -> QueueBindOptions {
        QueueBindOptions {
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.args.clone())
    }
}
