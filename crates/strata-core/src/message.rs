use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Shared handle to a message travelling through a pipeline.
///
/// Sources hand out one fresh allocation per delivery and expect the very
/// same allocation back as the acknowledgement.
pub type SharedMessage = Arc<dyn Message>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("attempt to use payload after discarding")]
    PayloadDiscarded,
}

/// Opaque byte payload exchanged with a broker backend.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// Returns the payload bytes.
    fn data(&self) -> Result<Bytes, MessageError>;

    /// Returns the wrapped message when `self` is a decorator.
    ///
    /// Decorators added by upstream layers for their own bookkeeping must
    /// return the message they wrap so that `unwrap` can reach the original.
    fn original(&self) -> Option<&dyn Message> {
        None
    }

    /// Exposes the payload-discard capability, if supported.
    fn as_discardable(&self) -> Option<&dyn DiscardPayload> {
        None
    }
}

/// Messages able to release their payload while staying acknowledgeable.
pub trait DiscardPayload {
    /// Releases the payload memory. Later `data()` calls fail; repeated
    /// discards are no-ops.
    fn discard_payload(&self);
}

/// Follows `original()` until the innermost message is reached.
pub fn unwrap(message: &dyn Message) -> &dyn Message {
    let mut current = message;
    while let Some(inner) = current.original() {
        current = inner;
    }
    current
}

/// Identity comparison: true only when both refer to the same allocation.
///
/// Payload bytes are irrelevant; two deliveries carrying identical bytes are
/// still different messages.
pub fn same_message(a: &dyn Message, b: &dyn Message) -> bool {
    std::ptr::eq(
        a as *const dyn Message as *const (),
        b as *const dyn Message as *const (),
    )
}

/// Plain in-memory message, typically used on the publishing side.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMessage {
    payload: Bytes,
}

impl RawMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Convenience constructor returning a ready-to-send shared message.
    pub fn shared(payload: impl Into<Bytes>) -> SharedMessage {
        Arc::new(Self::new(payload))
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Message for RawMessage {
    fn data(&self) -> Result<Bytes, MessageError> {
        Ok(self.payload.clone())
    }
}
