//! Kafka implementation of [`EventSource`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kafka::consumer::{Consumer, FetchOffset, GroupOffsetStorage};

use crate::event::{BusError, Delivery, EventSource};

const FETCH_MAX_WAIT: Duration = Duration::from_millis(500);

/// Topic subscription of one consumer group.
///
/// The `kafka` client is blocking: every call runs on the blocking pool.
pub struct KafkaSource {
    hosts: Vec<String>,
    topic: String,
    group: String,
    consumer: Option<Arc<Mutex<Consumer>>>,
}

impl KafkaSource {
    /// Create a new [`KafkaSource`]. Nothing is opened before `connect`.
    pub fn new(
        hosts: Vec<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            hosts,
            topic: topic.into(),
            group: group.into(),
            consumer: None,
        }
    }

    fn consumer(&self) -> Result<Arc<Mutex<Consumer>>, BusError> {
        self.consumer.clone().ok_or(BusError::NotConnected)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Consumer) -> Result<T, kafka::Error> + Send + 'static,
    {
        let consumer = self.consumer()?;

        tokio::task::spawn_blocking(move || {
            let mut consumer = consumer.lock().map_err(|_| BusError::Poisoned)?;
            f(&mut consumer).map_err(|err| BusError::Kafka(err.to_string()))
        })
        .await
        .map_err(|err| BusError::Kafka(err.to_string()))?
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn connect(&mut self) -> Result<(), BusError> {
        let hosts = self.hosts.clone();
        let topic = self.topic.clone();
        let group = self.group.clone();

        let consumer = tokio::task::spawn_blocking(move || {
            Consumer::from_hosts(hosts)
                .with_topic(topic)
                .with_group(group)
                .with_fallback_offset(FetchOffset::Earliest)
                .with_offset_storage(Some(GroupOffsetStorage::Kafka))
                .with_fetch_max_wait_time(FETCH_MAX_WAIT)
                .create()
        })
        .await
        .map_err(|err| BusError::Kafka(err.to_string()))?
        .map_err(|err| BusError::Kafka(err.to_string()))?;

        tracing::info!(topic = %self.topic, group = %self.group, "kafka consumer connected");

        self.consumer = Some(Arc::new(Mutex::new(consumer)));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<Delivery>, BusError> {
        self.blocking(|consumer| {
            let sets = consumer.poll()?;
            let mut deliveries = Vec::new();

            for set in sets.iter() {
                for message in set.messages() {
                    deliveries.push(Delivery {
                        topic: set.topic().to_owned(),
                        partition: set.partition(),
                        offset: message.offset,
                        payload: message.value.to_vec(),
                    });
                }
            }

            Ok(deliveries)
        })
        .await
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let topic = delivery.topic.clone();
        let partition = delivery.partition;
        let offset = delivery.offset;

        self.blocking(move |consumer| {
            consumer.consume_message(&topic, partition, offset)?;
            consumer.commit_consumed()
        })
        .await
    }
}
