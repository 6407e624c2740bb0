use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use strata_core::{DiscardPayload, Message, MessageError, TransportError};

/// Session-side commit hook of a backend consumer group.
pub trait OffsetCommitter: Send + Sync {
    /// Marks `next_offset` as the position to resume from on `partition`.
    fn mark_offset(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError>;
}

/// One consumed record awaiting acknowledgement.
///
/// Every delivery is its own allocation; acknowledgements are matched by
/// identity, so instances are never reused. The payload may be discarded
/// early while the commit coordinates stay available.
pub struct PendingDelivery {
    topic: Arc<str>,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    payload: Mutex<Option<Bytes>>,
    session: Arc<dyn OffsetCommitter>,
}

impl PendingDelivery {
    pub fn new(
        topic: Arc<str>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        payload: Bytes,
        session: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            payload: Mutex::new(Some(payload)),
            session,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn is_discarded(&self) -> bool {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Commits this delivery's position through the session that produced it.
    ///
    /// The committed position is the next offset to consume, whether or not
    /// the payload has been discarded.
    pub fn commit(&self) -> Result<(), TransportError> {
        self.session
            .mark_offset(&self.topic, self.partition, self.offset + 1)
    }
}

impl Message for PendingDelivery {
    fn data(&self) -> Result<Bytes, MessageError> {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MessageError::PayloadDiscarded)
    }

    fn as_discardable(&self) -> Option<&dyn DiscardPayload> {
        Some(self)
    }
}

impl DiscardPayload for PendingDelivery {
    fn discard_payload(&self) {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDelivery")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
