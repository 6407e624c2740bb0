//! Kafka backend for strata.
//!
//! [`KafkaSource`] consumes a topic as part of a consumer group and commits
//! offsets as deliveries are acknowledged; [`KafkaSink`] publishes to a
//! topic and reports broker confirmations.

pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod status;

use async_trait::async_trait;
use strata_core::{CloseError, SharedMessage, Status, TransportError};
use strata_transport::{AsyncMessageSink, AsyncMessageSource, TransportSink, TransportSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::{
    KafkaSinkConfig, KafkaSourceConfig, KafkaVersion, StartOffset, OFFSET_NEWEST, OFFSET_OLDEST,
};
pub use consumer::KafkaConsumerGroup;
pub use error::KafkaBackendError;
pub use producer::{KafkaProducer, KafkaProducerBackend};
pub use status::TopicHealth;

/// Ordered-acknowledgement source reading one Kafka topic.
pub struct KafkaSource {
    inner: TransportSource<KafkaConsumerGroup>,
}

impl KafkaSource {
    pub fn new(config: KafkaSourceConfig) -> Result<Self, TransportError> {
        let group = KafkaConsumerGroup::connect(&config)?;
        Ok(Self {
            inner: TransportSource::new(group, config.topic),
        })
    }
}

#[async_trait]
impl AsyncMessageSource for KafkaSource {
    async fn consume_messages(
        &self,
        cancel: CancellationToken,
        messages: mpsc::Sender<SharedMessage>,
        acks: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError> {
        self.inner.consume_messages(cancel, messages, acks).await
    }

    async fn status(&self) -> Result<Status, TransportError> {
        self.inner.status().await
    }

    fn close(&self) -> Result<(), CloseError> {
        self.inner.close()
    }
}

/// Publishing sink writing to one Kafka topic.
pub struct KafkaSink {
    inner: TransportSink<KafkaProducerBackend>,
}

impl KafkaSink {
    pub fn new(config: KafkaSinkConfig) -> Result<Self, TransportError> {
        let backend = KafkaProducerBackend::connect(&config)?;
        let mut inner = TransportSink::new(backend, config.topic);
        if let Some(key_fn) = config.key_fn {
            inner = inner.with_key_fn(key_fn);
        }
        Ok(Self { inner })
    }
}

#[async_trait]
impl AsyncMessageSink for KafkaSink {
    async fn publish_messages(
        &self,
        cancel: CancellationToken,
        confirmations: mpsc::Sender<SharedMessage>,
        messages: mpsc::Receiver<SharedMessage>,
    ) -> Result<(), TransportError> {
        self.inner
            .publish_messages(cancel, confirmations, messages)
            .await
    }

    async fn status(&self) -> Result<Status, TransportError> {
        self.inner.status().await
    }

    fn close(&self) -> Result<(), CloseError> {
        self.inner.close()
    }
}
