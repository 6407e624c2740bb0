use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as _;
use rdkafka::ClientContext;
use strata_core::{CloseError, Status, TransportError};
use strata_transport::{
    close_all, Close, ConsumerGroup, OffsetCommitter, OwnedHandle, PartitionClaim, Record,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaSourceConfig;
use crate::error::KafkaBackendError;
use crate::status::fetch_topic_status;

const PARTITION_FEED_CAPACITY: usize = 256;

type GroupConsumer = StreamConsumer<GroupContext>;

#[derive(Debug)]
enum RebalanceEvent {
    Revoked(i32),
    Assigned(i32),
}

/// Reports partition revocations to the session dispatcher.
struct GroupContext {
    topic: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl GroupContext {
    fn notify(&self, event: RebalanceEvent) {
        // Only fails once the consumer group is gone.
        let _ = self.events.send(event);
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            for element in partitions.elements_for_topic(&self.topic) {
                debug!(topic = %self.topic, partition = element.partition(), "partition revoked");
                self.notify(RebalanceEvent::Revoked(element.partition()));
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                for element in partitions.elements_for_topic(&self.topic) {
                    self.notify(RebalanceEvent::Assigned(element.partition()));
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => warn!(topic = %self.topic, error = %err, "rebalance failed"),
        }
    }
}

/// Commit hook shared by every claim of one consumer.
struct KafkaSession {
    consumer: Arc<GroupConsumer>,
}

impl OffsetCommitter for KafkaSession {
    fn mark_offset(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError> {
        match self.consumer.store_offset(topic, partition, next_offset) {
            Ok(()) => Ok(()),
            Err(KafkaError::StoreOffset(RDKafkaErrorCode::State)) => {
                // The partition was revoked since delivery; its new owner
                // re-reads from the last committed position.
                debug!(topic, partition, next_offset, "offset store on revoked partition ignored");
                Ok(())
            }
            Err(err) => Err(TransportError::backend(err)),
        }
    }
}

/// Kafka consumer-group membership for one topic.
///
/// The group is joined when the value is built; [`ConsumerGroup::join`]
/// turns the assigned partitions into claims.
pub struct KafkaConsumerGroup {
    topic: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<RebalanceEvent>>>,
    group: OwnedHandle<Arc<GroupConsumer>>,
    client: OwnedHandle<Arc<GroupConsumer>>,
}

impl KafkaConsumerGroup {
    pub fn connect(config: &KafkaSourceConfig) -> Result<Self, KafkaBackendError> {
        let client_config = config.client_config()?;
        if !config.offsets_retention.is_zero() {
            info!(
                retention = ?config.offsets_retention,
                "offset retention is governed by the broker; client setting ignored"
            );
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            topic: config.topic.clone(),
            events: events_tx,
        };
        let consumer: GroupConsumer = client_config
            .create_with_context(context)
            .map_err(KafkaBackendError::Client)?;
        let consumer = Arc::new(consumer);
        let client = OwnedHandle::new("kafka client", Arc::clone(&consumer));

        if let Err(source) = consumer.subscribe(&[config.topic.as_str()]) {
            if let Err(err) = client.close() {
                warn!(error = %err, "closing kafka client after failed subscribe");
            }
            return Err(KafkaBackendError::Subscribe {
                topic: config.topic.clone(),
                source,
            });
        }
        let group = OwnedHandle::with_closer("kafka consumer group", consumer, |consumer| {
            consumer.unsubscribe();
            Ok(())
        });

        info!(
            topic = %config.topic,
            group = %config.consumer_group,
            offset = ?config.offset,
            "joined kafka consumer group"
        );
        Ok(Self {
            topic: config.topic.clone(),
            events: Mutex::new(Some(events_rx)),
            group,
            client,
        })
    }

    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<RebalanceEvent>, TransportError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::backend("consumer group session already active"))
    }

    fn return_events(&self, events: mpsc::UnboundedReceiver<RebalanceEvent>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }
}

/// Consumer errors that end the session instead of being retried.
///
/// librdkafka retries broker and network trouble on its own; what reaches
/// `recv` with one of these codes will not clear up by polling again.
fn is_fatal(err: &KafkaError) -> bool {
    if matches!(err, KafkaError::MessageConsumptionFatal(_)) {
        return true;
    }
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
        )
    )
}

/// Open claim of one partition.
struct Feed {
    records: mpsc::Sender<Record>,
    revoked: CancellationToken,
}

/// Per-session routing of records into partition claims.
struct Dispatcher {
    topic: Arc<str>,
    session: Arc<dyn OffsetCommitter>,
    cancel: CancellationToken,
    claims: mpsc::Sender<PartitionClaim>,
    feeds: HashMap<i32, Feed>,
}

impl Dispatcher {
    fn apply(&mut self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Revoked(partition) => {
                // Buffered records are dropped; a later owner re-reads them
                // from the committed offset.
                if let Some(feed) = self.feeds.remove(&partition) {
                    feed.revoked.cancel();
                }
            }
            RebalanceEvent::Assigned(partition) => {
                debug!(topic = %self.topic, partition, "partition assigned");
            }
        }
    }

    /// Hands `record` to its partition claim, opening the claim on first use.
    /// Returns `false` once the session is over.
    async fn route(&mut self, partition: i32, record: Record) -> bool {
        if !self.feeds.contains_key(&partition) {
            let (feed, records) = mpsc::channel(PARTITION_FEED_CAPACITY);
            let revoked = CancellationToken::new();
            let claim = PartitionClaim {
                topic: Arc::clone(&self.topic),
                partition,
                session: Arc::clone(&self.session),
                records,
                revoked: revoked.clone(),
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                sent = self.claims.send(claim) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            self.feeds.insert(
                partition,
                Feed {
                    records: feed,
                    revoked,
                },
            );
        }

        let Some(feed) = self.feeds.get(&partition) else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = feed.records.send(record) => sent.is_ok(),
        }
    }
}

fn to_record<M: rdkafka::message::Message>(message: &M) -> Record {
    Record {
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn join(
        &self,
        topic: Arc<str>,
        cancel: CancellationToken,
        claims: mpsc::Sender<PartitionClaim>,
    ) -> Result<(), TransportError> {
        let consumer = self.group.get().map_err(TransportError::backend)?;
        let mut events = self.take_events()?;
        let mut dispatcher = Dispatcher {
            topic,
            session: Arc::new(KafkaSession {
                consumer: Arc::clone(&consumer),
            }),
            cancel: cancel.clone(),
            claims,
            feeds: HashMap::new(),
        };

        let outcome = loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(event) = events.recv() => {
                    dispatcher.apply(event);
                    continue;
                }
                received = consumer.recv() => {
                    received.map(|message| (message.partition(), to_record(&message)))
                }
            };

            // Revocations reported during the poll apply before routing.
            while let Ok(event) = events.try_recv() {
                dispatcher.apply(event);
            }

            match received {
                Ok((partition, record)) => {
                    if !dispatcher.route(partition, record).await {
                        break Ok(());
                    }
                }
                Err(err) => {
                    if let Some((code, reason)) = consumer.client().fatal_error() {
                        break Err(KafkaBackendError::Fatal { code, reason });
                    }
                    if is_fatal(&err) {
                        break Err(KafkaBackendError::Consume {
                            topic: self.topic.clone(),
                            source: err,
                        });
                    }
                    warn!(topic = %dispatcher.topic, error = %err, "kafka consumer error");
                }
            }
        };

        self.return_events(events);
        match outcome {
            Ok(()) => {
                debug!(topic = %self.topic, "kafka consumer group session ended");
                Ok(())
            }
            Err(err) => {
                error!(topic = %self.topic, error = %err, "kafka consumer group session failed");
                Err(err.into())
            }
        }
    }

    async fn status(&self, topic: &str) -> Result<Status, TransportError> {
        let consumer = self.client.get().map_err(TransportError::backend)?;
        fetch_topic_status(topic, move |topic, timeout| {
            consumer.fetch_metadata(Some(topic), timeout)
        })
        .await
    }

    fn close(&self) -> Result<(), CloseError> {
        close_all([&self.group as &dyn Close, &self.client as &dyn Close])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCommits;

    impl OffsetCommitter for NoCommits {
        fn mark_offset(&self, _: &str, _: i32, _: i64) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn dispatcher(claims: mpsc::Sender<PartitionClaim>) -> Dispatcher {
        Dispatcher {
            topic: Arc::from("orders"),
            session: Arc::new(NoCommits),
            cancel: CancellationToken::new(),
            claims,
            feeds: HashMap::new(),
        }
    }

    fn record(offset: i64) -> Record {
        Record {
            offset,
            key: None,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn authorization_and_unknown_topic_errors_are_fatal() {
        for code in [
            RDKafkaErrorCode::TopicAuthorizationFailed,
            RDKafkaErrorCode::GroupAuthorizationFailed,
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ] {
            assert!(is_fatal(&KafkaError::MessageConsumption(code)), "{code:?}");
        }
        assert!(is_fatal(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
    }

    #[test]
    fn broker_trouble_is_retried() {
        for code in [
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::AllBrokersDown,
            RDKafkaErrorCode::PartitionEOF,
        ] {
            assert!(!is_fatal(&KafkaError::MessageConsumption(code)), "{code:?}");
        }
    }

    #[tokio::test]
    async fn revocation_ends_the_claim_before_reassignment() {
        let (claims_tx, mut claims_rx) = mpsc::channel(4);
        let mut dispatcher = dispatcher(claims_tx);

        assert!(dispatcher.route(0, record(10)).await);
        assert!(dispatcher.route(0, record(11)).await);
        let first = claims_rx.try_recv().expect("claim opened on first record");
        assert!(claims_rx.try_recv().is_err(), "one claim per partition");

        dispatcher.apply(RebalanceEvent::Revoked(0));
        assert!(first.revoked.is_cancelled());
        dispatcher.apply(RebalanceEvent::Assigned(0));

        assert!(dispatcher.route(0, record(10)).await);
        let mut second = claims_rx.try_recv().expect("reassignment opens a new claim");
        assert!(!second.revoked.is_cancelled());
        assert_eq!(second.records.try_recv().expect("routed").offset, 10);
    }
}
