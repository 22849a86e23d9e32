// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the connector and channel seam for tests.
//!
//! It models just enough of RabbitMQ to exercise the setup: idempotent
//! declarations, default and named exchange routing, one live consumer per
//! queue, acks and rejects with dead-letter arguments, and forced connection
//! drops that requeue unacknowledged messages.

use crate::{
    channel::{BrokerChannel, CloseNotifier, Connector, DeliveryStream},
    errors::AmqpError,
    message::{Acknowledger, Delivery},
    queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub mandatory: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Stored {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

struct ExchangeRecord {
    kind: String,
    durable: bool,
    internal: bool,
}

struct QueueRecord {
    options: QueueDeclareOptions,
    args: FieldTable,
    messages: VecDeque<Stored>,
}

struct ConsumerRecord {
    connection: u64,
    queue: String,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: Stored,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    live: HashMap<u64, Vec<CloseNotifier>>,
    failing_connects: usize,
    connects: usize,
    clean_closes: usize,
    exchanges: BTreeMap<String, ExchangeRecord>,
    queues: BTreeMap<String, QueueRecord>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<ConsumerRecord>,
    consume_calls: usize,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    published: Vec<Published>,
    acks: Vec<u64>,
    rejects: Vec<(u64, bool)>,
    prefetch: Vec<u16>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Shared,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Opens a connection, panicking when the broker refuses it.
    pub async fn connect(&self) -> Arc<dyn BrokerChannel> {
        self.open().await.expect("memory broker refused the connection")
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().failing_connects = count;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn clean_closes(&self) -> usize {
        self.state.lock().unwrap().clean_closes
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Simulates the network dropping every open connection.
    pub fn drop_connections(&self) {
        let notifiers = {
            let mut state = self.state.lock().unwrap();
            let ids: Vec<u64> = state.live.keys().copied().collect();
            let mut notifiers = vec![];
            for id in ids {
                if let Some(list) = state.live.remove(&id) {
                    notifiers.extend(list);
                }
                state.release_connection(&self.state, id);
            }
            notifiers
        };

        for notify in notifiers {
            notify(AmqpError::ConnectionLost("connection reset by peer".to_owned()));
        }
    }

    /// Routes a message through the default exchange, as a producer would.
    pub fn send(&self, queue: &str, data: &[u8], properties: BasicProperties) {
        let mut state = self.state.lock().unwrap();
        let stored = Stored {
            exchange: String::new(),
            routing_key: queue.to_owned(),
            properties,
            data: data.to_vec(),
            redelivered: false,
        };
        state
            .route(&self.state, "", queue, stored)
            .expect("default exchange routing failed");
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().rejects.clone()
    }

    pub fn prefetch(&self) -> Vec<u16> {
        self.state.lock().unwrap().prefetch.clone()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        let state = self.state.lock().unwrap();
        state.queues.get(name).map(|queue| queue.args.clone())
    }

    /// Messages waiting in a queue, not yet handed to a consumer.
    pub fn messages(&self, name: &str) -> Vec<Stored> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(name)
            .map(|queue| queue.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exchanges(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        state
            .exchanges
            .iter()
            .map(|(name, record)| (name.clone(), record.kind.clone()))
            .collect()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    /// Consumers attached through a live connection.
    pub fn consumer_count(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    /// Every `basic.consume` ever accepted.
    pub fn consume_calls(&self) -> usize {
        self.state.lock().unwrap().consume_calls
    }
}

impl BrokerState {
    fn ensure_live(&self, connection: u64) -> Result<(), AmqpError> {
        if self.live.contains_key(&connection) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError)
        }
    }

    fn route(
        &mut self,
        shared: &Shared,
        exchange: &str,
        routing_key: &str,
        message: Stored,
    ) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let record = self.exchanges.get(exchange).ok_or_else(|| {
                AmqpError::PublishingError(format!("no exchange `{}`", exchange))
            })?;
            let fanout = record.kind == "fanout" || record.kind == "headers";
            self.bindings
                .iter()
                .filter(|(_, ex, key)| ex == exchange && (fanout || key == routing_key))
                .map(|(queue, _, _)| queue.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
                self.pump(shared, &target);
            }
        }

        Ok(())
    }

    fn pump(&mut self, shared: &Shared, queue: &str) {
        loop {
            let Some(index) = self.consumers.iter().position(|c| c.queue == queue) else {
                return;
            };
            let Some(message) = self
                .queues
                .get_mut(queue)
                .and_then(|record| record.messages.pop_front())
            else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let no_ack = self.consumers[index].no_ack;
            let connection = self.consumers[index].connection;
            let delivery = Delivery::new(
                &message.exchange,
                &message.routing_key,
                message.redelivered,
                message.properties.clone(),
                message.data.clone(),
                no_ack,
                Arc::new(MemoryAcker {
                    state: shared.clone(),
                    tag,
                }),
            );

            if self.consumers[index].tx.send(Ok(delivery)).is_err() {
                self.consumers.remove(index);
                if let Some(record) = self.queues.get_mut(queue) {
                    record.messages.push_front(message);
                }
                continue;
            }

            if !no_ack {
                self.unacked.insert(
                    tag,
                    Unacked {
                        connection,
                        queue: queue.to_owned(),
                        message,
                    },
                );
            }
        }
    }

    /// Drops the consumers of a connection and requeues what they held.
    fn release_connection(&mut self, shared: &Shared, connection: u64) {
        self.consumers.retain(|c| c.connection != connection);

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();

        let mut queues = vec![];
        for tag in tags.into_iter().rev() {
            if let Some(Unacked { queue, mut message, .. }) = self.unacked.remove(&tag) {
                message.redelivered = true;
                if let Some(record) = self.queues.get_mut(&queue) {
                    record.messages.push_front(message);
                }
                queues.push(queue);
            }
        }

        for queue in queues {
            self.pump(shared, &queue);
        }
    }

    fn dead_letter(&mut self, shared: &Shared, queue: &str, message: Stored) {
        let Some(record) = self.queues.get(queue) else {
            return;
        };
        let text = |key: &str| match record.args.inner().get(key) {
            Some(AMQPValue::LongString(value)) => Some(value.to_string()),
            _ => None,
        };

        let Some(exchange) = text(AMQP_HEADERS_DEAD_LETTER_EXCHANGE) else {
            return;
        };
        let routing_key =
            text(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).unwrap_or(message.routing_key.clone());

        let message = Stored {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            ..message
        };
        let _ = self.route(shared, &exchange, &routing_key, message);
    }
}

struct MemoryAcker {
    state: Shared,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        match state.unacked.remove(&self.tag) {
            Some(_) => {
                state.acks.push(self.tag);
                Ok(())
            }
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        let Some(Unacked { queue, message, .. }) = state.unacked.remove(&self.tag) else {
            return Err(AmqpError::RejectMessageError);
        };
        state.rejects.push((self.tag, requeue));

        if requeue {
            if let Some(record) = state.queues.get_mut(&queue) {
                record.messages.push_front(Stored {
                    redelivered: true,
                    ..message
                });
            }
            state.pump(&self.state, &queue);
        } else {
            state.dead_letter(&self.state, &queue, message);
        }

        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        state.live.insert(connection, vec![]);

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            connection,
        }))
    }
}

struct MemoryChannel {
    state: Shared,
    connection: u64,
}

fn kind_name(kind: &ExchangeKind) -> String {
    match kind {
        ExchangeKind::Direct => "direct".to_owned(),
        ExchangeKind::Fanout => "fanout".to_owned(),
        ExchangeKind::Headers => "headers".to_owned(),
        ExchangeKind::Topic => "topic".to_owned(),
        ExchangeKind::Custom(name) => name.clone(),
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn notify_on_close(&self, notifier: CloseNotifier) {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.live.get_mut(&self.connection) {
            list.push(notifier);
        }
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_live(self.connection)?;

        let kind = kind_name(&kind);
        match state.exchanges.get(exchange) {
            Some(existing)
                if existing.kind != kind
                    || existing.durable != options.durable
                    || existing.internal != options.internal =>
            {
                Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
            }
            Some(_) => Ok(()),
            None if options.passive => Err(AmqpError::DeclareExchangeError(exchange.to_owned())),
            None => {
                state.exchanges.insert(
                    exchange.to_owned(),
                    ExchangeRecord {
                        kind,
                        durable: options.durable,
                        internal: options.internal,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_live(self.connection)?;

        match state.queues.get(queue) {
            Some(existing)
                if existing.options.durable != options.durable
                    || existing.options.exclusive != options.exclusive
                    || existing.options.auto_delete != options.auto_delete
                    || existing.args != arguments =>
            {
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            Some(_) => Ok(()),
            None if options.passive => Err(AmqpError::DeclareQueueError(queue.to_owned())),
            None => {
                state.queues.insert(
                    queue.to_owned(),
                    QueueRecord {
                        options,
                        args: arguments,
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_live(self.connection)?;

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_live(self.connection)?;
        state.prefetch.push(prefetch_count);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state
            .ensure_live(self.connection)
            .map_err(|_| AmqpError::PublishingError("channel closed".to_owned()))?;

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: payload.to_vec(),
            mandatory: options.mandatory,
        });

        let message = Stored {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
            redelivered: false,
        };
        let shared = self.state.clone();
        state.route(&shared, exchange, routing_key, message)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.ensure_live(self.connection)?;

        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consume_calls += 1;
        state.consumers.push(ConsumerRecord {
            connection: self.connection,
            queue: queue.to_owned(),
            no_ack: options.no_ack,
            tx,
        });
        let shared = self.state.clone();
        state.pump(&shared, queue);

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(&self.connection).is_none() {
            return Err(AmqpError::ConnectionError("connection already closed".to_owned()));
        }
        state.clean_closes += 1;
        let shared = self.state.clone();
        state.release_connection(&shared, self.connection);
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub(crate) async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
