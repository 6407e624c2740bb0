//! Core strata primitives shared across crates.
//!
//! Includes the message capability traits, the generic status report, and
//! the error taxonomy surfaced by every source and sink.

pub mod error;
pub mod message;
pub mod status;

pub use error::{BoxError, CloseError, InvalidAckError, TransportError};
pub use message::{
    same_message, unwrap, DiscardPayload, Message, MessageError, RawMessage, SharedMessage,
};
pub use status::Status;
