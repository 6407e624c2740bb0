//! In-memory consumer group and producer backend.
//!
//! Used by the pipeline tests and by local dry runs; both sides support
//! failure injection so error paths can be exercised without a broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{self, FutureExt};
use strata_core::{BoxError, CloseError, Status, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delivery::OffsetCommitter;
use crate::funnel::{PartitionClaim, Record};
use crate::handle::{close_all, Close, OwnedHandle};
use crate::sink::{DeliveryFuture, Producer, ProducerRecord, SinkBackend};
use crate::source::ConsumerGroup;

const FEED_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failing_closer(
    failure: &Arc<Mutex<Option<String>>>,
) -> impl Fn(()) -> Result<(), BoxError> + Send + Sync + 'static {
    let failure = Arc::clone(failure);
    move |()| match lock(&failure).take() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

/// Offset commit observed by the in-memory group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub topic: String,
    pub partition: i32,
    pub next_offset: i64,
}

#[derive(Debug, Default)]
struct MemorySession {
    commits: Mutex<Vec<Commit>>,
}

impl OffsetCommitter for MemorySession {
    fn mark_offset(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError> {
        lock(&self.commits).push(Commit {
            topic: topic.to_string(),
            partition,
            next_offset,
        });
        Ok(())
    }
}

struct Feed {
    records: mpsc::Sender<Record>,
    revoked: CancellationToken,
}

/// Receiving half of a feed, not yet handed to a session.
struct OpenFeed {
    partition: i32,
    records: mpsc::Receiver<Record>,
    revoked: CancellationToken,
}

impl OpenFeed {
    fn into_claim(self, topic: Arc<str>, session: Arc<dyn OffsetCommitter>) -> PartitionClaim {
        PartitionClaim {
            topic,
            partition: self.partition,
            session,
            records: self.records,
            revoked: self.revoked,
        }
    }
}

#[derive(Default)]
struct GroupState {
    feeds: BTreeMap<i32, Feed>,
    next_offsets: HashMap<i32, i64>,
    unclaimed: Vec<OpenFeed>,
    joined: Option<(Arc<str>, mpsc::Sender<PartitionClaim>)>,
    join_failure: Option<String>,
    status: Option<Status>,
}

impl GroupState {
    /// Opens a fresh feed for `partition`, revoking any previous claim on it.
    fn open_feed(&mut self, partition: i32) -> OpenFeed {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let revoked = CancellationToken::new();
        let feed = Feed {
            records: tx,
            revoked: revoked.clone(),
        };
        if let Some(previous) = self.feeds.insert(partition, feed) {
            previous.revoked.cancel();
        }
        self.next_offsets.entry(partition).or_insert(0);
        OpenFeed {
            partition,
            records: rx,
            revoked,
        }
    }
}

/// Consumer group whose partitions are fed by the test.
pub struct MemoryConsumerGroup {
    state: Mutex<GroupState>,
    session: Arc<MemorySession>,
    close_failure: Arc<Mutex<Option<String>>>,
    group_handle: OwnedHandle<()>,
    client: OwnedHandle<()>,
}

impl MemoryConsumerGroup {
    /// Creates a group member owning partitions `0..partitions`.
    pub fn new(partitions: i32) -> Self {
        let close_failure = Arc::new(Mutex::new(None));
        let group = Self {
            state: Mutex::new(GroupState::default()),
            session: Arc::new(MemorySession::default()),
            group_handle: OwnedHandle::with_closer(
                "consumer group",
                (),
                failing_closer(&close_failure),
            ),
            client: OwnedHandle::new("client", ()),
            close_failure,
        };
        for partition in 0..partitions {
            group.assign(partition);
        }
        group
    }

    /// Assigns `partition` to this member, as a rebalance would.
    pub fn assign(&self, partition: i32) {
        let mut state = lock(&self.state);
        let feed = state.open_feed(partition);
        state.unclaimed.retain(|pending| pending.partition != partition);
        let joined = state
            .joined
            .as_ref()
            .map(|(topic, claims)| (Arc::clone(topic), claims.clone()));
        match joined {
            Some((topic, claims)) => {
                let claim = feed.into_claim(topic, self.session());
                if let Err(err) = claims.try_send(claim) {
                    debug!(partition, error = %err, "claim not delivered to a live session");
                }
            }
            None => state.unclaimed.push(feed),
        }
    }

    /// Revokes `partition`. Its claim ends at once and records it has not
    /// yet taken are dropped; offsets keep counting from where they were.
    pub fn revoke(&self, partition: i32) {
        let mut state = lock(&self.state);
        if let Some(feed) = state.feeds.remove(&partition) {
            feed.revoked.cancel();
        }
        state.unclaimed.retain(|pending| pending.partition != partition);
    }

    fn session(&self) -> Arc<dyn OffsetCommitter> {
        Arc::clone(&self.session) as Arc<dyn OffsetCommitter>
    }

    /// Appends a record to `partition` and returns its offset.
    pub fn append(&self, partition: i32, payload: impl Into<Bytes>) -> Result<i64, TransportError> {
        self.append_keyed(partition, None, payload)
    }

    pub fn append_keyed(
        &self,
        partition: i32,
        key: Option<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<i64, TransportError> {
        let mut state = lock(&self.state);
        let Some(feed) = state.feeds.get(&partition) else {
            return Err(TransportError::Config(format!(
                "partition {partition} is not assigned"
            )));
        };
        let offset = state.next_offsets.get(&partition).copied().unwrap_or(0);
        feed.records.try_send(Record {
            offset,
            key,
            payload: payload.into(),
        })
        .map_err(|err| TransportError::backend(format!("partition {partition} feed: {err}")))?;
        state.next_offsets.insert(partition, offset + 1);
        Ok(offset)
    }

    /// Every commit made so far, in commit order.
    pub fn commits(&self) -> Vec<Commit> {
        lock(&self.session.commits).clone()
    }

    pub fn fail_next_join(&self, reason: impl Into<String>) {
        lock(&self.state).join_failure = Some(reason.into());
    }

    /// Makes the next consumer-group close fail with `reason`.
    pub fn fail_group_close(&self, reason: impl Into<String>) {
        *lock(&self.close_failure) = Some(reason.into());
    }

    pub fn set_status(&self, status: Status) {
        lock(&self.state).status = Some(status);
    }
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    async fn join(
        &self,
        topic: Arc<str>,
        cancel: CancellationToken,
        claims: mpsc::Sender<PartitionClaim>,
    ) -> Result<(), TransportError> {
        self.group_handle
            .with(|_| ())
            .map_err(TransportError::backend)?;

        let pending = {
            let mut state = lock(&self.state);
            if let Some(reason) = state.join_failure.take() {
                return Err(TransportError::backend(reason));
            }
            // Feeds whose claim ended with an earlier session are reopened.
            let stale: Vec<i32> = state
                .feeds
                .iter()
                .filter(|(_, feed)| feed.records.is_closed())
                .map(|(partition, _)| *partition)
                .collect();
            for partition in stale {
                let feed = state.open_feed(partition);
                state.unclaimed.push(feed);
            }
            state.joined = Some((Arc::clone(&topic), claims.clone()));
            std::mem::take(&mut state.unclaimed)
        };

        for feed in pending {
            let claim = feed.into_claim(Arc::clone(&topic), self.session());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = claims.send(claim) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        cancel.cancelled().await;
        lock(&self.state).joined = None;
        debug!(topic = %topic, "left in-memory consumer group");
        Ok(())
    }

    async fn status(&self, _topic: &str) -> Result<Status, TransportError> {
        if self.client.is_closed() {
            return Ok(Status::failed("connection shutdown"));
        }
        Ok(lock(&self.state).status.clone().unwrap_or_else(Status::healthy))
    }

    fn close(&self) -> Result<(), CloseError> {
        close_all([&self.group_handle as &dyn Close, &self.client as &dyn Close])
    }
}

type Confirmation = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct SinkState {
    published: Vec<ProducerRecord>,
    manual: bool,
    unconfirmed: BTreeMap<usize, Confirmation>,
    enqueue_failure: Option<String>,
    flush_failure: Option<String>,
    flushes: usize,
    status: Option<Status>,
}

/// Producer backend recording everything it is asked to publish.
///
/// By default every record is confirmed as soon as it is enqueued; a
/// [`MemorySink::manual`] sink holds confirmations until the test releases
/// them by sequence number.
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
    client: OwnedHandle<()>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            client: OwnedHandle::new("client", ()),
        }
    }

    pub fn manual() -> Self {
        let sink = Self::new();
        lock(&sink.state).manual = true;
        sink
    }

    /// Records enqueued so far; the index is the sequence number.
    pub fn published(&self) -> Vec<ProducerRecord> {
        lock(&self.state).published.clone()
    }

    /// Sequence numbers still awaiting confirmation.
    pub fn unconfirmed(&self) -> Vec<usize> {
        lock(&self.state).unconfirmed.keys().copied().collect()
    }

    /// Confirms record `seq`; false if it is not pending.
    pub fn confirm(&self, seq: usize) -> bool {
        self.resolve(seq, Ok(()))
    }

    pub fn reject(&self, seq: usize, reason: impl Into<String>) -> bool {
        self.resolve(seq, Err(TransportError::backend(reason.into())))
    }

    fn resolve(&self, seq: usize, outcome: Result<(), TransportError>) -> bool {
        match lock(&self.state).unconfirmed.remove(&seq) {
            Some(confirmation) => confirmation.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn fail_next_enqueue(&self, reason: impl Into<String>) {
        lock(&self.state).enqueue_failure = Some(reason.into());
    }

    pub fn fail_next_flush(&self, reason: impl Into<String>) {
        lock(&self.state).flush_failure = Some(reason.into());
    }

    pub fn flushes(&self) -> usize {
        lock(&self.state).flushes
    }

    pub fn set_status(&self, status: Status) {
        lock(&self.state).status = Some(status);
    }
}

pub struct MemoryProducer {
    state: Arc<Mutex<SinkState>>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn enqueue(&mut self, record: ProducerRecord) -> Result<DeliveryFuture, TransportError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.enqueue_failure.take() {
            return Err(TransportError::backend(reason));
        }

        let seq = state.published.len();
        state.published.push(record);
        if !state.manual {
            return Ok(future::ready(Ok(())).boxed());
        }

        let (tx, rx) = oneshot::channel();
        state.unconfirmed.insert(seq, tx);
        Ok(async move {
            rx.await.unwrap_or_else(|_| {
                Err(TransportError::backend(format!(
                    "delivery {seq} abandoned before confirmation"
                )))
            })
        }
        .boxed())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.flushes += 1;
        match state.flush_failure.take() {
            Some(reason) => Err(TransportError::backend(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SinkBackend for MemorySink {
    type Producer = MemoryProducer;

    fn producer(&self, _topic: &str) -> Result<MemoryProducer, TransportError> {
        self.client.with(|_| ()).map_err(TransportError::backend)?;
        Ok(MemoryProducer {
            state: Arc::clone(&self.state),
        })
    }

    async fn status(&self, _topic: &str) -> Result<Status, TransportError> {
        if self.client.is_closed() {
            return Ok(Status::failed("connection shutdown"));
        }
        Ok(lock(&self.state).status.clone().unwrap_or_else(Status::healthy))
    }

    fn close(&self) -> Result<(), CloseError> {
        close_all([&self.client as &dyn Close])
    }
}
