use std::sync::Arc;

use bytes::Bytes;
use strata_core::{SharedMessage, TransportError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::delivery::{OffsetCommitter, PendingDelivery};

/// A record as read from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// One partition assigned to this consumer for the current group session.
///
/// The claim ends when the backend closes `records` or cancels `revoked`.
/// Revocation ends it at once: records still buffered in `records` are
/// dropped, so a later claim on the same partition never interleaves with
/// this one.
pub struct PartitionClaim {
    pub topic: Arc<str>,
    pub partition: i32,
    pub session: Arc<dyn OffsetCommitter>,
    pub records: mpsc::Receiver<Record>,
    pub revoked: CancellationToken,
}

/// Merges concurrently consumed partition claims into one ordered stream.
///
/// Partition tasks hand their deliveries to a single forwarder, which
/// registers each one for acknowledgement tracking and then hands it to the
/// caller before taking the next. Registration order is therefore exactly the
/// order the caller receives.
pub struct PartitionFunnel {
    cancel: CancellationToken,
    registrations: mpsc::Sender<Arc<PendingDelivery>>,
    messages: mpsc::Sender<SharedMessage>,
}

impl PartitionFunnel {
    pub fn new(
        cancel: CancellationToken,
        registrations: mpsc::Sender<Arc<PendingDelivery>>,
        messages: mpsc::Sender<SharedMessage>,
    ) -> Self {
        Self {
            cancel,
            registrations,
            messages,
        }
    }

    /// Spawns one task per incoming claim until the claim stream ends or the
    /// scope is cancelled, then waits for every partition task and for the
    /// forwarder to drain.
    pub async fn run(self, claims: mpsc::Receiver<PartitionClaim>) -> Result<(), TransportError> {
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        let forwarding = forward(
            self.cancel.clone(),
            handoff_rx,
            self.registrations,
            self.messages,
        );
        let claiming = claim_partitions(self.cancel, claims, handoff_tx);
        let ((), claimed) = tokio::join!(forwarding, claiming);
        claimed
    }
}

async fn claim_partitions(
    cancel: CancellationToken,
    mut claims: mpsc::Receiver<PartitionClaim>,
    handoff: mpsc::Sender<Arc<PendingDelivery>>,
) -> Result<(), TransportError> {
    let mut partitions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            claim = claims.recv() => match claim {
                Some(claim) => {
                    partitions.spawn(drain_claim(cancel.clone(), claim, handoff.clone()));
                }
                None => break,
            },
            Some(joined) = partitions.join_next(), if !partitions.is_empty() => {
                joined.map_err(partition_task_failed)?;
            }
        }
    }

    drop(handoff);
    while let Some(joined) = partitions.join_next().await {
        joined.map_err(partition_task_failed)?;
    }
    Ok(())
}

fn partition_task_failed(err: JoinError) -> TransportError {
    TransportError::TaskFailed(format!("partition task: {err}"))
}

async fn drain_claim(
    cancel: CancellationToken,
    claim: PartitionClaim,
    handoff: mpsc::Sender<Arc<PendingDelivery>>,
) {
    let PartitionClaim {
        topic,
        partition,
        session,
        mut records,
        revoked,
    } = claim;
    debug!(topic = %topic, partition, "partition claim started");

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = revoked.cancelled() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let delivery = Arc::new(PendingDelivery::new(
            Arc::clone(&topic),
            partition,
            record.offset,
            record.key,
            record.payload,
            Arc::clone(&session),
        ));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = revoked.cancelled() => break,
            sent = handoff.send(delivery) => {
                if sent.is_err() {
                    // The forwarder is gone; the scope is about to be cancelled.
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }

    if revoked.is_cancelled() {
        debug!(topic = %topic, partition, "partition claim revoked, buffered records dropped");
    }
    debug!(topic = %topic, partition, "partition claim ended");
}

/// Registers, then forwards, one delivery at a time.
async fn forward(
    cancel: CancellationToken,
    mut handoff: mpsc::Receiver<Arc<PendingDelivery>>,
    registrations: mpsc::Sender<Arc<PendingDelivery>>,
    messages: mpsc::Sender<SharedMessage>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = handoff.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = registrations.send(Arc::clone(&delivery)) => {
                if sent.is_err() {
                    // The ack task is gone; the scope is about to be cancelled.
                    cancel.cancelled().await;
                    break;
                }
            }
        }

        let (partition, offset) = (delivery.partition(), delivery.offset());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = messages.send(delivery) => {
                if sent.is_err() {
                    debug!(partition, "message receiver dropped, waiting for cancellation");
                    cancel.cancelled().await;
                    break;
                }
            }
        }
        trace!(partition, offset, "delivery forwarded");
    }
}
