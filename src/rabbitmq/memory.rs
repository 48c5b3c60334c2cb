// src/rabbitmq/memory.rs
//! An in-process stand-in for a RabbitMQ server.
//!
//! Routing follows AMQP 0.9.1 for the subset the client uses: direct exchanges, the default
//! exchange routing on queue name, silent drops for unroutable messages, and auto-acknowledged
//! deliveries. Errors that close a channel on a real server (inequivalent redeclare, unknown
//! exchange) close the memory session too. Fault injection hooks let tests kill every open
//! connection, refuse new ones, or make bindings fail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::debug;

use super::backend::{
    Backend, ExchangeDescriptor, QueueDescriptor, RawDelivery, RawDeliveryStream, Session,
};
use super::errors::{RabbitMQError, Result};

/// Counters describing everything the broker has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections_opened: usize,
    pub live_sessions: usize,
    pub queue_declarations: usize,
    pub exchange_declarations: usize,
    pub bindings_created: usize,
    pub published: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct MemoryConsumer {
    tag: String,
    session: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Result<RawDelivery>>,
}

struct MemoryQueue {
    descriptor: QueueDescriptor,
    ready: VecDeque<RawDelivery>,
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn new(descriptor: QueueDescriptor) -> Self {
        Self {
            descriptor,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Hand the delivery to the next live consumer, or park it until one subscribes.
    fn enqueue(&mut self, delivery: RawDelivery) {
        self.consumers
            .retain(|c| c.session.load(Ordering::SeqCst) && !c.sender.is_closed());

        let mut pending = Some(delivery);
        while let Some(delivery) = pending.take() {
            if self.consumers.is_empty() {
                self.ready.push_back(delivery);
                break;
            }
            let index = self.next_consumer % self.consumers.len();
            self.next_consumer = self.next_consumer.wrapping_add(1);
            if let Err(rejected) = self.consumers[index].sender.unbounded_send(Ok(delivery)) {
                self.consumers.remove(index);
                if let Ok(delivery) = rejected.into_inner() {
                    pending = Some(delivery);
                }
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, ExchangeDescriptor>,
    bindings: HashSet<Binding>,
    sessions: Vec<Arc<AtomicBool>>,
    stats: MemoryStats,
    refuse_connections: bool,
    fail_bindings: bool,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8], content_type: &str) {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        for name in targets {
            let Some(queue) = self.queues.get_mut(&name) else {
                debug!(exchange, routing_key, "Dropping unroutable message");
                continue;
            };
            self.next_delivery_tag += 1;
            queue.enqueue(RawDelivery {
                data: payload.to_vec(),
                delivery_tag: self.next_delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                content_type: Some(content_type.to_string()),
            });
        }
    }
}

/// Cloning yields another handle onto the same broker.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.lock();
        MemoryStats {
            live_sessions: state
                .sessions
                .iter()
                .filter(|s| s.load(Ordering::SeqCst))
                .count(),
            ..state.stats
        }
    }

    /// Drop every open connection, the way a broker restart or network partition would.
    /// Consumer streams end and parked sessions report themselves closed.
    pub fn kill_connections(&self) {
        let mut state = self.lock();
        for session in state.sessions.drain(..) {
            session.store(false, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn set_fail_bindings(&self, fail: bool) {
        self.lock().fail_bindings = fail;
    }

    pub fn queue(&self, name: &str) -> Option<QueueDescriptor> {
        let state = self.lock();
        state.queues.get(name).map(|q| QueueDescriptor {
            message_count: q.ready.len() as u32,
            consumer_count: q.consumers.len() as u32,
            ..q.descriptor.clone()
        })
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDescriptor> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        })
    }

    /// Every binding as `(exchange, queue, routing_key)`.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock()
            .bindings
            .iter()
            .map(|b| (b.exchange.clone(), b.queue.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Publish bytes as an outside producer would, bypassing any client.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let mut state = self.lock();
        state.stats.published += 1;
        state.route(exchange, routing_key, payload, "application/octet-stream");
    }

    /// Consumer tags currently registered on `queue`.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    // Poisoning is ignored; broker state stays consistent between statements.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Backend for MemoryBackend {
    type Session = MemorySession;

    async fn open(&self, uri: &str) -> Result<MemorySession> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(RabbitMQError::ConnectionError(format!(
                "Failed to connect: connection refused ({})",
                uri
            )));
        }

        let live = Arc::new(AtomicBool::new(true));
        state.sessions.push(live.clone());
        state.stats.connections_opened += 1;

        Ok(MemorySession {
            live,
            state: self.state.clone(),
        })
    }
}

pub struct MemorySession {
    live: Arc<AtomicBool>,
    state: Arc<Mutex<BrokerState>>,
}

impl MemorySession {
    fn lock_live(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock_state(&self.state);
        if !self.live.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("Channel is closed".to_string()));
        }
        Ok(state)
    }

    /// Close the session as a server-side channel exception would.
    fn fail(&self, err: RabbitMQError) -> RabbitMQError {
        if self.live.swap(false, Ordering::SeqCst) {
            self.detach(&mut lock_state(&self.state));
        }
        err
    }

    /// Forget this session and every consumer registered through it.
    fn detach(&self, state: &mut BrokerState) {
        state.sessions.retain(|s| !Arc::ptr_eq(s, &self.live));
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| !Arc::ptr_eq(&c.session, &self.live));
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<QueueDescriptor> {
        let mut state = self.lock_live()?;
        state.stats.queue_declarations += 1;

        let existing = state
            .queues
            .entry(queue.name.clone())
            .or_insert_with(|| MemoryQueue::new(queue.clone()));

        if !existing.descriptor.is_equivalent(queue) {
            let message = format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                queue.name
            );
            drop(state);
            return Err(self.fail(RabbitMQError::TopologyError(message)));
        }

        Ok(QueueDescriptor {
            message_count: existing.ready.len() as u32,
            consumer_count: existing.consumers.len() as u32,
            ..existing.descriptor.clone()
        })
    }

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        let mut state = self.lock_live()?;
        state.stats.exchange_declarations += 1;

        let existing = state
            .exchanges
            .entry(exchange.name.clone())
            .or_insert_with(|| exchange.clone());

        if *existing != *exchange {
            let message = format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                exchange.name
            );
            drop(state);
            return Err(self.fail(RabbitMQError::TopologyError(message)));
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock_live()?;

        let failure = if state.fail_bindings {
            Some(format!("Failed to bind queue '{}': injected failure", queue))
        } else if !state.queues.contains_key(queue) {
            Some(format!("NOT_FOUND - no queue '{}'", queue))
        } else if !state.exchanges.contains_key(exchange) {
            Some(format!("NOT_FOUND - no exchange '{}'", exchange))
        } else {
            None
        };
        if let Some(message) = failure {
            drop(state);
            return Err(self.fail(RabbitMQError::TopologyError(message)));
        }

        state.stats.bindings_created += 1;
        state.bindings.insert(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let mut state = self.lock_live()?;
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            drop(state);
            return Err(self.fail(RabbitMQError::PublishError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            ))));
        }

        state.stats.published += 1;
        state.route(exchange, routing_key, payload, content_type);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<RawDeliveryStream> {
        let mut state = self.lock_live()?;
        let Some(target) = state.queues.get_mut(queue) else {
            drop(state);
            return Err(self.fail(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            ))));
        };

        let (sender, receiver) = mpsc::unbounded();
        target.consumers.push(MemoryConsumer {
            tag: consumer_tag.to_string(),
            session: self.live.clone(),
            sender,
        });
        for delivery in std::mem::take(&mut target.ready) {
            target.enqueue(delivery);
        }

        Ok(receiver.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.live.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.detach(&mut lock_state(&self.state));
        Ok(())
    }
}
