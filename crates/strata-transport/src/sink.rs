use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use strata_core::{unwrap, CloseError, Message, SharedMessage, Status, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::group::TaskGroup;

const IN_FLIGHT_BUFFER: usize = 256;

/// Derives a partition key from the innermost message.
pub type KeyFn = Arc<dyn Fn(&dyn Message) -> Bytes + Send + Sync>;

/// Resolves once the broker has confirmed (or rejected) one record.
pub type DeliveryFuture = BoxFuture<'static, Result<(), TransportError>>;

/// Outbound record handed to a backend producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    /// `None` selects the backend's default partitioner.
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// Per-call producer created by a [`SinkBackend`].
#[async_trait]
pub trait Producer: Send {
    /// Queues `record` for delivery and returns its confirmation.
    ///
    /// An error here is fatal to the publish call.
    async fn enqueue(&mut self, record: ProducerRecord) -> Result<DeliveryFuture, TransportError>;

    /// Waits for every queued record to be confirmed or failed.
    async fn flush(&mut self) -> Result<(), TransportError>;
}

/// Backend producer side of a broker connection.
#[async_trait]
pub trait SinkBackend: Send + Sync + 'static {
    type Producer: Producer + 'static;

    fn producer(&self, topic: &str) -> Result<Self::Producer, TransportError>;

    async fn status(&self, topic: &str) -> Result<Status, TransportError>;

    fn close(&self) -> Result<(), CloseError>;
}

/// Producer side of a broker connection.
#[async_trait]
pub trait AsyncMessageSink: Send + Sync {
    /// Publishes everything received on `messages` and reports each message
    /// on `confirmations` once the broker accepted it.
    ///
    /// Confirmations arrive in whatever order the broker reports them.
    async fn publish_messages(
        &self,
        cancel: CancellationToken,
        confirmations: mpsc::Sender<SharedMessage>,
        messages: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError>;

    async fn status(&self) -> Result<Status, TransportError>;

    fn close(&self) -> Result<(), CloseError>;
}

/// Publish pipeline over any [`SinkBackend`].
pub struct TransportSink<B> {
    backend: B,
    topic: Arc<str>,
    key_fn: Option<KeyFn>,
}

impl<B: SinkBackend> TransportSink<B> {
    pub fn new(backend: B, topic: impl Into<Arc<str>>) -> Self {
        Self {
            backend,
            topic: topic.into(),
            key_fn: None,
        }
    }

    /// Keys every record with `key_fn`; an empty key means "no key".
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Builds the record for `message`, keyed on the unwrapped original.
    pub fn record_for(&self, message: &dyn Message) -> Result<ProducerRecord, TransportError> {
        let payload = message.data()?;
        let key = self
            .key_fn
            .as_ref()
            .map(|key_fn| key_fn(unwrap(message)))
            .filter(|key| !key.is_empty());
        Ok(ProducerRecord { key, payload })
    }

    async fn publish_loop(
        &self,
        cancel: &CancellationToken,
        producer: &mut B::Producer,
        mut messages: mpsc::Receiver<SharedMessage>,
        in_flight: mpsc::Sender<(SharedMessage, DeliveryFuture)>,
    ) -> Result<(), TransportError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!(topic = %self.topic, "message channel closed, draining confirmations");
                        return Ok(());
                    }
                },
            };

            let record = self.record_for(&*message)?;
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                queued = producer.enqueue(record) => queued?,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = in_flight.send((message, delivery)) => {
                    if sent.is_err() {
                        // Relay failed; its error is reported by the task group.
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<B: SinkBackend> AsyncMessageSink for TransportSink<B> {
    async fn publish_messages(
        &self,
        cancel: CancellationToken,
        confirmations: mpsc::Sender<SharedMessage>,
        messages: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError> {
        let mut producer = self.backend.producer(&self.topic)?;

        let mut tasks = TaskGroup::new(&cancel);
        let scope = tasks.token();
        let (in_flight_tx, in_flight_rx) = mpsc::channel(IN_FLIGHT_BUFFER);
        tasks.spawn(
            "confirm",
            relay_confirmations(scope.clone(), in_flight_rx, confirmations),
        );

        let published = self
            .publish_loop(&scope, &mut producer, messages, in_flight_tx)
            .await;
        if published.is_err() {
            scope.cancel();
        }
        let relayed = tasks.wait().await;
        let result = published.and(relayed);

        if cancel.is_cancelled() {
            debug!(topic = %self.topic, "publish cancelled, pending records left unflushed");
            return result;
        }
        let flushed = producer.flush().await;
        if let Err(err) = &flushed {
            debug!(topic = %self.topic, error = %err, "producer flush failed");
        }
        result.and(flushed)
    }

    async fn status(&self) -> Result<Status, TransportError> {
        self.backend.status(&self.topic).await
    }

    fn close(&self) -> Result<(), CloseError> {
        self.backend.close()
    }
}

impl<B> fmt::Debug for TransportSink<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink")
            .field("topic", &self.topic)
            .field("keyed", &self.key_fn.is_some())
            .finish()
    }
}

/// Forwards confirmations in completion order until the in-flight stream is
/// closed and drained, a delivery fails, or the scope is cancelled.
///
/// Deliveries keep being watched while a confirmation waits for room on
/// `confirmations`, so a failure surfaces even if the caller reads slowly.
async fn relay_confirmations(
    cancel: CancellationToken,
    mut pending: mpsc::Receiver<(SharedMessage, DeliveryFuture)>,
    confirmations: mpsc::Sender<SharedMessage>,
) -> Result<(), TransportError> {
    let mut in_flight = FuturesUnordered::new();
    let mut confirmed = VecDeque::new();
    let mut pending_open = true;
    let mut receiver_open = true;

    loop {
        if !pending_open && in_flight.is_empty() && confirmed.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            Some((message, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                outcome?;
                if receiver_open {
                    confirmed.push_back(message);
                }
            }
            permit = confirmations.reserve(), if receiver_open && !confirmed.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(message) = confirmed.pop_front() {
                        permit.send(message);
                        trace!("delivery confirmed");
                    }
                }
                Err(_) => {
                    debug!("confirmation receiver dropped, discarding further confirmations");
                    receiver_open = false;
                    confirmed.clear();
                }
            },
            next = pending.recv(), if pending_open => match next {
                Some((message, delivery)) => {
                    in_flight.push(async move { (message, delivery.await) });
                }
                None => pending_open = false,
            },
        }
    }
}
