// src/broker/memory.rs

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{Broker, BrokerError, ExchangeKind};

/// One message accepted by `publish`, as recorded in the publish log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Queues the message was delivered to; empty when it was unroutable.
    pub delivered_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

/// A broker living entirely in process memory, with AMQP exchange
/// semantics. Used by tests and by `leadflow run --memory-broker`.
#[derive(Debug)]
pub struct InMemoryBroker {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, VecDeque<Vec<u8>>>,
    bindings: DashMap<String, Vec<Binding>>,
    log: RwLock<Vec<Published>>,
    unroutable: AtomicU64,
    available: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            bindings: DashMap::new(),
            log: RwLock::new(Vec::new()),
            unroutable: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Sorted names of all existing queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// `(exchange, routing_key)` pairs the queue is bound with.
    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for entry in self.bindings.iter() {
            for binding in entry.value().iter().filter(|b| b.queue == queue) {
                found.push((entry.key().clone(), binding.routing_key.clone()));
            }
        }
        found.sort();
        found
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of the messages waiting in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Takes the oldest message off `queue`, the way a worker would.
    pub fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.queues.get_mut(queue).and_then(|mut q| q.pop_front())
    }

    pub fn published(&self) -> Vec<Published> {
        match self.log.read() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn unroutable_count(&self) -> u64 {
        self.unroutable.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker switched off".into()))
        }
    }

    fn record(&self, published: Published) {
        match self.log.write() {
            Ok(mut log) => log.push(published),
            Err(poisoned) => poisoned.into_inner().push(published),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_available()?;
        self.exchanges.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn assert_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_available()?;
        self.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        let mut bound = self.bindings.entry(exchange.to_string()).or_default();
        if !bound.contains(&binding) {
            bound.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if let Some(mut bound) = self.bindings.get_mut(exchange) {
            bound.retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if let Some((_, dropped)) = self.queues.remove(name) {
            debug!("deleted queue {} with {} pending message(s)", name, dropped.len());
        }
        for mut bound in self.bindings.iter_mut() {
            bound.retain(|b| b.queue != name);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_available()?;
        if !self.has_exchange(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let targets: Vec<String> = self
            .bindings
            .get(exchange)
            .map(|bound| {
                bound
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered_to = Vec::with_capacity(targets.len());
        for queue in targets {
            if let Some(mut q) = self.queues.get_mut(&queue) {
                q.push_back(payload.clone());
                delivered_to.push(queue);
            }
        }

        if delivered_to.is_empty() {
            self.unroutable.fetch_add(1, Ordering::SeqCst);
            trace!("dropped unroutable message on {} / {}", exchange, routing_key);
        }

        self.record(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            delivered_to,
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
