use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::message::{MessageError, SharedMessage};

/// Boxed backend error, carried verbatim through the pipelines.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by source and sink operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid caller configuration; raised at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Caller broke the ordered acknowledgement contract.
    #[error(transparent)]
    InvalidAck(#[from] InvalidAckError),
    /// Message capability failure (e.g. reading a discarded payload).
    #[error(transparent)]
    Message(#[from] MessageError),
    /// Backend or network failure, propagated as reported.
    #[error(transparent)]
    Backend(BoxError),
    /// One or more owned handles failed to close.
    #[error(transparent)]
    Close(#[from] CloseError),
    /// An internal pipeline task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

impl TransportError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Acknowledgement that does not identify the head of the pending queue.
pub struct InvalidAckError {
    /// The message the caller acknowledged.
    pub acked: SharedMessage,
    /// The message that should have been acknowledged, `None` when nothing
    /// was awaiting acknowledgement.
    pub expected: Option<SharedMessage>,
}

impl fmt::Debug for InvalidAckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidAckError")
            .field("acked", &self.acked)
            .field("expected", &self.expected)
            .finish()
    }
}

impl fmt::Display for InvalidAckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected {
            Some(expected) => write!(
                f,
                "message acknowledgement out of order: acked {:?}, expected {:?}",
                self.acked, expected
            ),
            None => write!(
                f,
                "message acknowledgement out of order: acked {:?}, but no message is awaiting acknowledgement",
                self.acked
            ),
        }
    }
}

impl StdError for InvalidAckError {}

/// Aggregate of every failure seen while closing owned handles.
#[derive(Debug, Default)]
pub struct CloseError {
    errors: Vec<BoxError>,
}

impl CloseError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl Into<BoxError>) {
        self.errors.push(err.into());
    }

    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), CloseError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => write!(f, "1 error occurred while closing:")?,
            n => write!(f, "{n} errors occurred while closing:")?,
        }
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl StdError for CloseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors
            .first()
            .map(|err| err.as_ref() as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::{CloseError, InvalidAckError, TransportError};
    use crate::message::{MessageError, RawMessage};
    use std::io;

    #[test]
    fn close_error_keeps_every_failure() {
        let mut err = CloseError::new();
        err.push(io::Error::new(io::ErrorKind::Other, "group close failed"));
        err.push("client close failed");

        assert_eq!(err.len(), 2);
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred while closing:"));
        assert!(text.contains("group close failed"));
        assert!(text.contains("client close failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn empty_close_error_is_ok() {
        assert!(CloseError::new().into_result().is_ok());
    }

    #[test]
    fn invalid_ack_display_distinguishes_empty_queue() {
        let empty = InvalidAckError {
            acked: RawMessage::shared("a"),
            expected: None,
        };
        assert!(empty.to_string().contains("no message is awaiting"));

        let mismatched = InvalidAckError {
            acked: RawMessage::shared("a"),
            expected: Some(RawMessage::shared("b")),
        };
        assert!(mismatched.to_string().contains("expected RawMessage"));
    }

    #[test]
    fn backend_errors_are_reported_verbatim() {
        let err = TransportError::backend(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "broker went away",
        ));
        assert_eq!(err.to_string(), "broker went away");

        let err = TransportError::from(MessageError::PayloadDiscarded);
        assert_eq!(err.to_string(), "attempt to use payload after discarding");
    }
}
