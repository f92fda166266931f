// src/rabbitmq/memory.rs
//! In-memory broker for tests and single-process runs.
//!
//! Implements the same [`Connector`] / [`BrokerConnection`] / [`BrokerChannel`]
//! seam as the lapin client, with enough AMQP 0-9-1 behaviour to exercise the
//! bus end to end:
//! - topic (`*` / `#`), direct, fanout and headers exchanges (headers route
//!   like fanout), plus the default `""` exchange
//! - per-channel prefetch and delivery tags, ack / nack / requeue
//! - fault injection: unreachable broker, failing or stalled consumes,
//!   failing connects, forced connection closure, blocked and callback
//!   exception notifications
//!
//! ```
//! use eshop_event_bus::rabbitmq::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.fail_next_connects(2);
//! assert_eq!(broker.connect_attempts(), 0);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use super::broker::{
    Arguments, BrokerChannel, BrokerConnection, ChannelErrorCallback, ConnectionEvent,
    ConnectionEventSink, Connector, DeliveryStream, ExchangeOptions, IncomingDelivery,
    MessageProperties, QueueInfo, QueueOptions,
};
use super::errors::{BusError, Result};
use super::topology::ExchangeKind;

type SharedSink = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;
type SharedCallback = Arc<dyn Fn(BusError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack { requeue: bool },
}

/// One acknowledgement as the broker received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub channel: u16,
    pub delivery_tag: u64,
    pub kind: AckKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    sender: UnboundedSender<Result<IncomingDelivery>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    callbacks: Vec<SharedCallback>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch))
    }
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    next_channel: AtomicU16,
    sinks: Mutex<Vec<SharedSink>>,
}

struct BrokerState {
    reachable: bool,
    failing_connects: u32,
    failing_consumes: u32,
    stalling_consumes: u32,
    connect_attempts: u32,
    exchange_declarations: u32,
    queue_declarations: u32,
    next_connection: u64,
    next_channel: u64,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: Vec<Arc<ConnectionShared>>,
    channels: HashMap<u64, ChannelState>,
    acknowledgements: Vec<Acknowledgement>,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            reachable: true,
            failing_connects: 0,
            failing_consumes: 0,
            stalling_consumes: 0,
            connect_attempts: 0,
            exchange_declarations: 0,
            queue_declarations: 0,
            next_connection: 0,
            next_channel: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: Vec::new(),
            channels: HashMap::new(),
            acknowledgements: Vec::new(),
            published: Vec::new(),
        }
    }

    fn channel_mut(&mut self, key: u64) -> Result<&mut ChannelState> {
        match self.channels.get_mut(&key) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(BusError::Channel("channel is closed".to_string())),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Requeues the channel's unacked messages and drops its consumers.
    fn close_channel(&mut self, key: u64) -> Vec<SharedCallback> {
        let Some(channel) = self.channels.get_mut(&key) else {
            return Vec::new();
        };
        if !channel.open {
            return Vec::new();
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);
        let callbacks = std::mem::take(&mut channel.callbacks);

        for (_, (queue, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != key);
        }
        callbacks
    }

    fn close_connection(&mut self, connection: &ConnectionShared) -> Vec<SharedCallback> {
        connection.open.store(false, Ordering::SeqCst);
        let keys: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == connection.id)
            .map(|(key, _)| *key)
            .collect();

        let mut callbacks = Vec::new();
        for key in keys {
            callbacks.extend(self.close_channel(key));
        }
        self.connections.retain(|c| c.id != connection.id);
        callbacks
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self) {
        let BrokerState {
            queues, channels, ..
        } = self;

        for (queue_name, queue) in queues.iter_mut() {
            'messages: while !queue.ready.is_empty() {
                let count = queue.consumers.len();
                let mut delivered = false;

                for offset in 0..count {
                    let index = (queue.next_consumer + offset) % count;
                    let slot = &queue.consumers[index];
                    let Some(channel) = channels.get_mut(&slot.channel) else {
                        continue;
                    };
                    if !channel.has_capacity() {
                        continue;
                    }

                    let Some(message) = queue.ready.pop_front() else {
                        break 'messages;
                    };
                    channel.next_tag += 1;
                    let delivery = IncomingDelivery {
                        delivery_tag: channel.next_tag,
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        properties: message.properties.clone(),
                        body: message.body.clone(),
                    };

                    if slot.sender.unbounded_send(Ok(delivery)).is_err() {
                        // Receiver went away; put the message back and drop the slot.
                        queue.ready.push_front(message);
                        queue.consumers.remove(index);
                        continue 'messages;
                    }

                    channel
                        .unacked
                        .insert(channel.next_tag, (queue_name.clone(), message));
                    queue.next_consumer = (index + 1) % count;
                    delivered = true;
                    break;
                }

                if !delivered {
                    break;
                }
            }
        }
    }
}

/// A process-local broker. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An unreachable broker refuses every connection attempt.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    pub fn fail_next_consumes(&self, count: u32) {
        self.state().failing_consumes = count;
    }

    /// The next `count` consumes register the consumer but never return,
    /// like a `basic.consume` whose `consume-ok` is still in flight.
    pub fn stall_next_consumes(&self, count: u32) {
        self.state().stalling_consumes = count;
    }

    /// Closes every open connection as if the broker went away, firing the
    /// shutdown notification and the channel error callbacks.
    pub fn kill_connections(&self) {
        let (sinks, callbacks) = {
            let mut state = self.state();
            let connections: Vec<Arc<ConnectionShared>> = state.connections.clone();
            let mut sinks = Vec::new();
            let mut callbacks = Vec::new();
            for connection in connections {
                sinks.extend(lock(&connection.sinks).iter().cloned());
                callbacks.extend(state.close_connection(&connection));
            }
            state.dispatch();
            (sinks, callbacks)
        };

        for sink in sinks {
            sink(ConnectionEvent::Shutdown(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
        }
        for callback in callbacks {
            callback(BusError::Channel(
                "channel closed because its connection was lost".to_string(),
            ));
        }
    }

    /// Fires the blocked notification on every open connection.
    pub fn block_connections(&self) {
        self.notify(ConnectionEvent::Blocked("low on memory".to_string()));
    }

    /// Fires the callback exception notification on every open connection.
    pub fn raise_callback_error(&self) {
        self.notify(ConnectionEvent::CallbackError(
            "connection event handler panicked".to_string(),
        ));
    }

    fn notify(&self, event: ConnectionEvent) {
        let sinks: Vec<SharedSink> = {
            let state = self.state();
            state
                .connections
                .iter()
                .flat_map(|c| lock(&c.sinks).iter().cloned().collect::<Vec<_>>())
                .collect()
        };
        for sink in sinks {
            sink(event.clone());
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn exchange_declarations(&self) -> u32 {
        self.state().exchange_declarations
    }

    pub fn queue_declarations(&self) -> u32 {
        self.state().queue_declarations
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(name).copied()
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state()
            .channels
            .values()
            .map(|ch| ch.unacked.len())
            .sum()
    }

    pub fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.state().acknowledgements.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if !state.reachable {
            return Err(BusError::Broker("None of the specified endpoints were reachable".to_string()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::Broker("connection refused".to_string()));
        }

        state.next_connection += 1;
        let shared = Arc::new(ConnectionShared {
            id: state.next_connection,
            open: AtomicBool::new(true),
            next_channel: AtomicU16::new(0),
            sinks: Mutex::new(Vec::new()),
        });
        state.connections.push(shared.clone());

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            shared,
        }))
    }
}

pub struct MemoryConnection {
    broker: InMemoryBroker,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        "in-memory".to_string()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BusError::Broker("connection is closed".to_string()));
        }

        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.broker.state();
        state.next_channel += 1;
        let key = state.next_channel;
        state.channels.insert(
            key,
            ChannelState {
                connection: self.shared.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                callbacks: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            key,
            id,
        }))
    }

    fn on_event(&self, sink: ConnectionEventSink) {
        lock(&self.shared.sinks).push(Arc::from(sink));
    }

    async fn close(&self, _reply_code: u16, _reason: &str) -> Result<()> {
        let mut state = self.broker.state();
        if !self.is_open() {
            return Err(BusError::Broker("connection already closed".to_string()));
        }
        state.close_connection(&self.shared);
        state.dispatch();
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: InMemoryBroker,
    key: u64,
    id: u16,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .state()
            .channels
            .get(&self.key)
            .is_some_and(|ch| ch.open)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
        _arguments: &Arguments,
    ) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;
        state.exchange_declarations += 1;

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                name, kind, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueOptions,
        _arguments: &Arguments,
    ) -> Result<QueueInfo> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;
        state.queue_declarations += 1;

        let queue = state.queues.entry(name.to_string()).or_default();
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: u32::try_from(queue.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(queue.consumers.len()).unwrap_or(u32::MAX),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?.prefetch = prefetch_count;
        state.dispatch();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;

        let targets = state.route(exchange, routing_key)?;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: body.to_vec(),
            redelivered: false,
        };
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }

        state.published.push(PublishedMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            properties: message.properties,
            body: message.body,
        });
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (receiver, stall) = {
            let mut state = self.broker.state();
            state.channel_mut(self.key)?;

            if state.failing_consumes > 0 {
                state.failing_consumes -= 1;
                return Err(BusError::Broker("basic.consume was interrupted".to_string()));
            }

            let (sender, receiver) = unbounded();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)))?;
            queue_state.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                channel: self.key,
                sender,
            });
            state.dispatch();

            let stall = state.stalling_consumes > 0;
            if stall {
                state.stalling_consumes -= 1;
            }
            (receiver, stall)
        };

        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.state();
        let channel = state.channel_mut(self.key)?;
        if channel.unacked.remove(&delivery_tag).is_none() {
            return Err(BusError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }

        state.acknowledgements.push(Acknowledgement {
            channel: self.id,
            delivery_tag,
            kind: AckKind::Ack,
        });
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.state();
        let channel = state.channel_mut(self.key)?;
        let Some((queue, mut message)) = channel.unacked.remove(&delivery_tag) else {
            return Err(BusError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&queue) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        state.acknowledgements.push(Acknowledgement {
            channel: self.id,
            delivery_tag,
            kind: AckKind::Nack { requeue },
        });
        state.dispatch();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;
        let key = self.key;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == key && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self, _reply_code: u16, _reason: &str) -> Result<()> {
        let mut state = self.broker.state();
        state.channel_mut(self.key)?;
        state.close_channel(self.key);
        state.dispatch();
        Ok(())
    }

    fn on_error(&self, callback: ChannelErrorCallback) {
        if let Some(channel) = self.broker.state().channels.get_mut(&self.key) {
            channel.callbacks.push(Arc::from(callback));
        }
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && words_match(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && words_match(rest, &words[1..]),
    }
}
