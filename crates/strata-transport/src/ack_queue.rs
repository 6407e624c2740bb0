use std::collections::VecDeque;
use std::sync::Arc;

use strata_core::{same_message, InvalidAckError, Message, SharedMessage, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::delivery::PendingDelivery;

/// Deliveries awaiting acknowledgement, oldest first.
///
/// The queue spans every partition of one consume call. Only the head may be
/// acknowledged.
#[derive(Debug)]
pub struct AckQueue<D = PendingDelivery> {
    pending: VecDeque<Arc<D>>,
}

impl<D> Default for AckQueue<D> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<D: Message> AckQueue<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a freshly registered delivery.
    pub fn push(&mut self, delivery: Arc<D>) {
        self.pending.push_back(delivery);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn head(&self) -> Option<&Arc<D>> {
        self.pending.front()
    }

    /// Pops the head if `acked` is that very delivery.
    ///
    /// Matching is by identity. On mismatch the queue is left untouched and
    /// the error names the delivery that should have been acknowledged.
    pub fn acknowledge(&mut self, acked: &SharedMessage) -> Result<Arc<D>, InvalidAckError> {
        match self.pending.pop_front() {
            None => Err(InvalidAckError {
                acked: Arc::clone(acked),
                expected: None,
            }),
            Some(head) if same_message(&**acked, &*head) => Ok(head),
            Some(head) => {
                let expected: SharedMessage = head.clone();
                self.pending.push_front(head);
                Err(InvalidAckError {
                    acked: Arc::clone(acked),
                    expected: Some(expected),
                })
            }
        }
    }
}

/// Ack-processing loop of a consume call.
///
/// Registrations are always drained ahead of acknowledgements: the funnel
/// registers a delivery before forwarding it, so any ack the caller can send
/// refers to a delivery that is already buffered here.
pub async fn process_acks(
    cancel: CancellationToken,
    mut registrations: mpsc::Receiver<Arc<PendingDelivery>>,
    mut acks: mpsc::Receiver<SharedMessage>,
) -> Result<(), TransportError> {
    let mut queue = AckQueue::new();
    let mut registrations_open = true;
    let mut acks_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pending = queue.len(), "ack processing cancelled");
                return Ok(());
            }
            registered = registrations.recv(), if registrations_open => match registered {
                Some(delivery) => queue.push(delivery),
                None => registrations_open = false,
            },
            ack = acks.recv(), if acks_open => match ack {
                Some(ack) => {
                    let delivery = queue.acknowledge(&ack)?;
                    delivery.commit()?;
                    trace!(
                        topic = delivery.topic(),
                        partition = delivery.partition(),
                        offset = delivery.offset(),
                        "delivery acknowledged"
                    );
                }
                None => {
                    debug!("ack channel closed by caller");
                    acks_open = false;
                }
            },
        }
    }
}
