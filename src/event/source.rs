//! Message bus port.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// Message bus failure. Always transient from the consumer point of view.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("kafka error: {0}")]
    Kafka(String),
    #[error("source is not connected")]
    NotConnected,
    #[error("source lock poisoned")]
    Poisoned,
}

/// One message read from a topic partition.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Ordered stream of messages of a single topic, read by a consumer group.
#[async_trait]
pub trait EventSource: Send {
    /// Join the group and resolve the starting position.
    async fn connect(&mut self) -> Result<(), BusError>;

    /// Next batch of messages, in partition order. May be empty.
    async fn poll(&mut self) -> Result<Vec<Delivery>, BusError>;

    /// Advance the group position past `delivery`.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

#[derive(Debug, Default)]
struct MemoryQueue {
    pending: VecDeque<Delivery>,
    acked: Vec<Delivery>,
    next_offset: i64,
}

/// Queue-backed [`EventSource`].
///
/// Clones share the same queue, so a handle kept aside can push messages
/// and inspect acknowledgements while a consumer owns another.
#[derive(Clone, Debug)]
pub struct MemorySource {
    topic: String,
    queue: Arc<Mutex<MemoryQueue>>,
}

impl MemorySource {
    /// Create a new empty [`MemorySource`].
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue: Arc::default(),
        }
    }

    /// Append a message on partition 0.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> Result<i64, BusError> {
        let mut queue = self.queue.lock().map_err(|_| BusError::Poisoned)?;
        let offset = queue.next_offset;
        queue.next_offset += 1;
        queue.pending.push_back(Delivery {
            topic: self.topic.clone(),
            partition: 0,
            offset,
            payload: payload.into(),
        });

        Ok(offset)
    }

    /// Offsets acknowledged so far, in order.
    pub fn acked(&self) -> Vec<i64> {
        self.queue
            .lock()
            .map(|queue| queue.acked.iter().map(|d| d.offset).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn connect(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<Delivery>, BusError> {
        let mut queue = self.queue.lock().map_err(|_| BusError::Poisoned)?;
        Ok(queue.pending.drain(..).collect())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut queue = self.queue.lock().map_err(|_| BusError::Poisoned)?;
        queue.acked.push(delivery.clone());
        Ok(())
    }
}
