//! Long-lived worker applying one topic to the user store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::crypto::Decryptor;
use crate::event::{Delivery, Event, EventKind, EventSource, Outcome, apply};
use crate::user::UserRepository;

const IDLE_POLL: Duration = Duration::from_millis(200);

/// Lifecycle of an [`EventConsumer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Ready,
    Consuming,
    Error,
    Stopped,
}

/// Exponential backoff between retries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial,
            max: self.max,
        }
    }
}

struct Backoff {
    next: Duration,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = (current * 2).min(self.max);
        Some(current)
    }
}

/// What happened to a delivery handed to [`EventConsumer::handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Applied or discarded, then acknowledged.
    Acknowledged,
    /// Shutdown requested before acknowledgement. It will be redelivered.
    Interrupted,
}

/// Consumer of one event kind.
///
/// A message is acknowledged only once applied to the store, or once known
/// to be unusable. Store and bus failures are retried in place, so messages
/// of the topic are applied strictly in delivery order.
pub struct EventConsumer<S> {
    kind: EventKind,
    source: S,
    decryptor: Arc<dyn Decryptor>,
    repo: Arc<dyn UserRepository>,
    retry: RetryPolicy,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Receiver<bool>,
}

impl<S: EventSource> EventConsumer<S> {
    /// Create a new [`EventConsumer`].
    ///
    /// It stops once `shutdown` holds `true` or its sender is dropped.
    pub fn new(
        kind: EventKind,
        source: S,
        decryptor: Arc<dyn Decryptor>,
        repo: Arc<dyn UserRepository>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);

        Self {
            kind,
            source,
            decryptor,
            repo,
            retry: RetryPolicy::default(),
            state,
            shutdown,
        }
    }

    /// Update retry backoff.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Watch state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(kind = %self.kind, ?previous, ?state, "consumer state changed");
        }
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep for `duration` unless a shutdown comes first.
    /// Returns `true` when the consumer must stop.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            changed = self.shutdown.changed() => changed.is_err() || self.is_stopped(),
        }
    }

    /// Connect, then consume until shutdown.
    pub async fn run(mut self) {
        if self.connect().await {
            self.consume().await;
        }

        self.set_state(ConsumerState::Stopped);
        tracing::info!(kind = %self.kind, "consumer stopped");
    }

    async fn connect(&mut self) -> bool {
        let mut delays = self.retry.delays();

        loop {
            if self.is_stopped() {
                return false;
            }

            self.set_state(ConsumerState::Connecting);
            match self.source.connect().await {
                Ok(()) => {
                    self.set_state(ConsumerState::Ready);
                    tracing::info!(kind = %self.kind, "consumer ready");
                    return true;
                },
                Err(err) => {
                    tracing::error!(kind = %self.kind, error = %err, "failed to connect consumer");
                    self.set_state(ConsumerState::Error);

                    let delay = delays.next().unwrap_or(self.retry.max);
                    if self.pause(delay).await {
                        return false;
                    }
                },
            }
        }
    }

    async fn consume(&mut self) {
        let mut delays = self.retry.delays();

        while !self.is_stopped() {
            let deliveries = match self.source.poll().await {
                Ok(deliveries) => {
                    delays = self.retry.delays();
                    self.set_state(ConsumerState::Consuming);
                    deliveries
                },
                Err(err) => {
                    tracing::error!(kind = %self.kind, error = %err, "failed to poll messages");
                    self.set_state(ConsumerState::Error);

                    let delay = delays.next().unwrap_or(self.retry.max);
                    if self.pause(delay).await {
                        return;
                    }
                    continue;
                },
            };

            if deliveries.is_empty() {
                if self.pause(IDLE_POLL).await {
                    return;
                }
                continue;
            }

            for delivery in &deliveries {
                if self.handle(delivery).await == Handled::Interrupted {
                    return;
                }
            }
        }
    }

    /// Decode, apply then acknowledge a single delivery.
    pub async fn handle(&mut self, delivery: &Delivery) -> Handled {
        match Event::decode(self.kind, &delivery.payload, self.decryptor.as_ref()) {
            Ok(event) => {
                if !self.apply_with_retry(&event, delivery).await {
                    return Handled::Interrupted;
                }
            },
            Err(err) => {
                tracing::warn!(
                    kind = %self.kind,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "message discarded"
                );
                record(self.kind, "discarded");
            },
        }

        self.acknowledge(delivery).await
    }

    /// Retry `event` until applied. Returns `false` on shutdown.
    async fn apply_with_retry(&mut self, event: &Event, delivery: &Delivery) -> bool {
        let mut delays = self.retry.delays();

        loop {
            match apply(event, self.repo.as_ref()).await {
                Ok(outcome) => {
                    tracing::debug!(
                        kind = %self.kind,
                        user_id = %event.id(),
                        offset = delivery.offset,
                        ?outcome,
                        "event applied"
                    );
                    record(self.kind, match outcome {
                        Outcome::Applied => "applied",
                        Outcome::Skipped => "skipped",
                    });
                    self.set_state(ConsumerState::Consuming);
                    return true;
                },
                Err(err) => {
                    tracing::error!(
                        kind = %self.kind,
                        user_id = %event.id(),
                        offset = delivery.offset,
                        error = %err,
                        "failed to apply event, retrying"
                    );
                    record(self.kind, "retried");
                    self.set_state(ConsumerState::Error);

                    let delay = delays.next().unwrap_or(self.retry.max);
                    if self.pause(delay).await {
                        return false;
                    }
                },
            }
        }
    }

    async fn acknowledge(&mut self, delivery: &Delivery) -> Handled {
        let mut delays = self.retry.delays();

        loop {
            match self.source.ack(delivery).await {
                Ok(()) => return Handled::Acknowledged,
                Err(err) => {
                    tracing::error!(
                        kind = %self.kind,
                        offset = delivery.offset,
                        error = %err,
                        "failed to acknowledge message"
                    );
                    self.set_state(ConsumerState::Error);

                    let delay = delays.next().unwrap_or(self.retry.max);
                    if self.pause(delay).await {
                        return Handled::Interrupted;
                    }
                },
            }
        }
    }
}

fn record(kind: EventKind, outcome: &'static str) {
    metrics::counter!(
        "consumer_messages_total",
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::event::MemorySource;
    use crate::event::tests::{cipher, envelope};
    use crate::user::{
        MemoryUserRepository, Profile, Projection, StoreError, User,
    };

    const FAST: RetryPolicy = RetryPolicy {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
    };

    /// Fails the first `failures` mutations.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryUserRepository,
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl FlakyRepository {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Default::default()
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable(Box::new(
                    std::io::Error::other("connection refused"),
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl UserRepository for FlakyRepository {
        async fn find_by_id(&self, id: &str) -> Result<User, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_all(&self, projection: &Projection) -> Result<Vec<User>, StoreError> {
            self.inner.find_all(projection).await
        }

        async fn upsert(&self, id: &str, profile: &Profile) -> Result<(), StoreError> {
            self.check()?;
            self.inner.upsert(id, profile).await
        }

        async fn update(&self, id: &str, profile: &Profile) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.update(id, profile).await
        }

        async fn delete_by_id(&self, id: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.delete_by_id(id).await
        }
    }

    fn consumer(
        kind: EventKind,
        source: MemorySource,
        repo: Arc<dyn UserRepository>,
    ) -> (EventConsumer<MemorySource>, watch::Sender<bool>) {
        let (stop, shutdown) = watch::channel(false);
        let consumer = EventConsumer::new(kind, source, Arc::new(cipher()), repo, shutdown)
            .with_retry(FAST);

        (consumer, stop)
    }

    async fn wait_acked(source: &MemorySource, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.acked().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages were not acknowledged in time");
    }

    #[test]
    fn test_backoff_is_capped() {
        let delays = RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
        }
        .delays()
        .take(4)
        .collect::<Vec<_>>();

        assert_eq!(
            delays,
            [100, 200, 300, 300].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn test_run_skips_malformed_and_keeps_going() {
        let cipher = cipher();
        let source = MemorySource::new("user-edit");
        let repo = Arc::new(MemoryUserRepository::new());
        repo.upsert("u1", &Profile {
            username: Some("alice".into()),
            email: Some("a@x.com".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        source.push(envelope(&cipher, "definitely not json")).unwrap();
        source.push(b"{ broken envelope".to_vec()).unwrap();
        source.push(envelope(&cipher, r#"{"id":"u1","email":"b@x.com"}"#)).unwrap();
        source.push(envelope(&cipher, r#"{"id":"ghost","email":"c@x.com"}"#)).unwrap();

        let (consumer, stop) = consumer(EventKind::Edited, source.clone(), repo.clone());
        let mut state = consumer.state();
        assert_eq!(*state.borrow(), ConsumerState::Idle);

        let worker = tokio::spawn(consumer.run());
        wait_acked(&source, 4).await;

        assert_eq!(source.acked(), [0, 1, 2, 3]);
        let user = repo.find_by_id("u1").await.unwrap();
        assert_eq!(user.profile.email.as_deref(), Some("b@x.com"));
        assert_eq!(user.profile.username.as_deref(), Some("alice"));
        assert_eq!(repo.len(), 1);

        stop.send(true).unwrap();
        worker.await.unwrap();
        state.wait_for(|s| *s == ConsumerState::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_is_retried_before_ack() {
        let cipher = cipher();
        let source = MemorySource::new("user-create");
        let repo = Arc::new(FlakyRepository::failing(3));
        let (mut consumer, _stop) = consumer(EventKind::Created, source.clone(), repo.clone());

        source.push(envelope(&cipher, r#"{"id":"u1","username":"alice"}"#)).unwrap();
        let mut source_handle = source.clone();
        let deliveries = source_handle.poll().await.unwrap();

        assert_eq!(consumer.handle(&deliveries[0]).await, Handled::Acknowledged);
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(source.acked(), [0]);
        assert!(repo.inner.find_by_id("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_during_retry_leaves_message_unacked() {
        let cipher = cipher();
        let source = MemorySource::new("user-delete");
        let repo = Arc::new(FlakyRepository::failing(usize::MAX));
        let (mut consumer, stop) = consumer(EventKind::Deleted, source.clone(), repo);
        let mut state = consumer.state();

        source.push(envelope(&cipher, r#"{"id":"u1"}"#)).unwrap();
        let mut source_handle = source.clone();
        let deliveries = source_handle.poll().await.unwrap();

        let worker = tokio::spawn(async move { consumer.handle(&deliveries[0]).await });
        state.wait_for(|s| *s == ConsumerState::Error).await.unwrap();
        stop.send(true).unwrap();

        assert_eq!(worker.await.unwrap(), Handled::Interrupted);
        assert!(source.acked().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_redelivery() {
        let cipher = cipher();
        let source = MemorySource::new("user-create");
        let repo = Arc::new(MemoryUserRepository::new());
        let json = r#"{"id":"u1","username":"alice","email":"a@x.com"}"#;

        source.push(envelope(&cipher, json)).unwrap();
        source.push(envelope(&cipher, json)).unwrap();

        let (consumer, stop) = consumer(EventKind::Created, source.clone(), repo.clone());
        let worker = tokio::spawn(consumer.run());
        wait_acked(&source, 2).await;
        stop.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(repo.len(), 1);
        let user = repo.find_by_id("u1").await.unwrap();
        assert_eq!(user.profile.username.as_deref(), Some("alice"));
    }
}
