use std::sync::Arc;

use async_trait::async_trait;
use strata_core::{CloseError, SharedMessage, Status, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ack_queue::process_acks;
use crate::funnel::{PartitionClaim, PartitionFunnel};
use crate::group::TaskGroup;

const REGISTRATION_BUFFER: usize = 64;
const CLAIM_BUFFER: usize = 16;

/// Consumer side of a broker connection.
#[async_trait]
pub trait AsyncMessageSource: Send + Sync {
    /// Streams messages into `messages` and commits what arrives on `acks`.
    ///
    /// Acknowledgements must arrive in exactly the order messages were
    /// delivered; anything else ends the call with
    /// [`TransportError::InvalidAck`]. Cancelling `cancel` ends the call
    /// with `Ok(())`.
    async fn consume_messages(
        &self,
        cancel: CancellationToken,
        messages: mpsc::Sender<SharedMessage>,
        acks: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError>;

    async fn status(&self) -> Result<Status, TransportError>;

    /// Releases the underlying connection. Only the first call succeeds.
    fn close(&self) -> Result<(), CloseError>;
}

/// Backend consumer-group session driver.
#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    /// Joins the group for `topic` and sends a claim for every partition
    /// assigned to this member, until cancelled or the session fails.
    ///
    /// Dropping `claims` ends the claim stream. Rebalances close the record
    /// channel of revoked claims and may send new ones.
    async fn join(
        &self,
        topic: Arc<str>,
        cancel: CancellationToken,
        claims: mpsc::Sender<PartitionClaim>,
    ) -> Result<(), TransportError>;

    async fn status(&self, topic: &str) -> Result<Status, TransportError>;

    /// Leaves the group, then closes the client; every failure is kept.
    fn close(&self) -> Result<(), CloseError>;
}

/// Ordered-acknowledgement source over any [`ConsumerGroup`].
pub struct TransportSource<G> {
    group: Arc<G>,
    topic: Arc<str>,
}

impl<G: ConsumerGroup> TransportSource<G> {
    pub fn new(group: G, topic: impl Into<Arc<str>>) -> Self {
        Self {
            group: Arc::new(group),
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &G {
        &self.group
    }
}

#[async_trait]
impl<G: ConsumerGroup> AsyncMessageSource for TransportSource<G> {
    async fn consume_messages(
        &self,
        cancel: CancellationToken,
        messages: mpsc::Sender<SharedMessage>,
        acks: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError> {
        let mut tasks = TaskGroup::new(&cancel);
        let scope = tasks.token();
        let (registrations_tx, registrations_rx) = mpsc::channel(REGISTRATION_BUFFER);

        tasks.spawn("ack", process_acks(scope.clone(), registrations_rx, acks));

        let group = Arc::clone(&self.group);
        let topic = Arc::clone(&self.topic);
        tasks.spawn("delivery", async move {
            let (claims_tx, claims_rx) = mpsc::channel(CLAIM_BUFFER);
            let funnel = PartitionFunnel::new(scope.clone(), registrations_tx, messages);
            info!(topic = %topic, "joining consumer group");
            let result = tokio::try_join!(
                group.join(Arc::clone(&topic), scope.clone(), claims_tx),
                funnel.run(claims_rx),
            )
            .map(|_| ());
            // The call lives as long as its group session.
            scope.cancel();
            debug!(topic = %topic, ok = result.is_ok(), "consumer group session ended");
            result
        });

        tasks.wait().await
    }

    async fn status(&self) -> Result<Status, TransportError> {
        self.group.status(&self.topic).await
    }

    fn close(&self) -> Result<(), CloseError> {
        self.group.close()
    }
}
