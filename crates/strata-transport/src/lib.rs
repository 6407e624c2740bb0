//! Backend-neutral publish/consume pipelines for strata.
//!
//! Backends only implement the narrow [`source::ConsumerGroup`] and
//! [`sink::SinkBackend`] contracts; ordering, acknowledgement tracking and
//! cancellation live here.

pub mod ack_queue;
pub mod delivery;
pub mod funnel;
pub mod group;
pub mod handle;
pub mod memory;
pub mod sink;
pub mod source;

pub use ack_queue::AckQueue;
pub use delivery::{OffsetCommitter, PendingDelivery};
pub use funnel::{PartitionClaim, PartitionFunnel, Record};
pub use group::TaskGroup;
pub use handle::{close_all, Close, HandleError, OwnedHandle};
pub use sink::{
    AsyncMessageSink, DeliveryFuture, KeyFn, Producer, ProducerRecord, SinkBackend, TransportSink,
};
pub use source::{AsyncMessageSource, ConsumerGroup, TransportSource};
