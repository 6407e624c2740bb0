use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use strata_core::{CloseError, Status, TransportError};
use strata_transport::{
    close_all, Close, DeliveryFuture, OwnedHandle, Producer, ProducerRecord, SinkBackend,
};
use tracing::{debug, info};

use crate::config::KafkaSinkConfig;
use crate::error::KafkaBackendError;
use crate::status::fetch_topic_status;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Kafka producer connection shared by every publish call of a sink.
pub struct KafkaProducerBackend {
    client: OwnedHandle<FutureProducer>,
}

impl KafkaProducerBackend {
    pub fn connect(config: &KafkaSinkConfig) -> Result<Self, KafkaBackendError> {
        let producer: FutureProducer = config
            .client_config()?
            .create()
            .map_err(KafkaBackendError::Client)?;
        info!(
            topic = %config.topic,
            keyed = config.key_fn.is_some(),
            max_message_bytes = config.max_message_bytes,
            "kafka producer created"
        );
        Ok(Self {
            client: OwnedHandle::new("kafka client", producer),
        })
    }
}

/// Producer of one publish call.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn enqueue(&mut self, record: ProducerRecord) -> Result<DeliveryFuture, TransportError> {
        loop {
            let mut future_record =
                FutureRecord::<[u8], [u8]>::to(&self.topic).payload(&record.payload[..]);
            if let Some(key) = &record.key {
                future_record = future_record.key(&key[..]);
            }

            let queued = self.producer.send_result(future_record).map_err(|(err, _)| err);
            match queued {
                Ok(delivery) => {
                    return Ok(async move {
                        match delivery.await {
                            Ok(Ok(_)) => Ok(()),
                            Ok(Err((err, _))) => Err(TransportError::backend(err)),
                            Err(_) => Err(TransportError::backend(
                                "producer dropped before delivery was reported",
                            )),
                        }
                    }
                    .boxed());
                }
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    debug!(topic = %self.topic, "producer queue full, backing off");
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(err) => return Err(TransportError::backend(err)),
            }
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
            .await
            .map_err(|err| TransportError::TaskFailed(format!("producer flush: {err}")))?
            .map_err(TransportError::backend)
    }
}

#[async_trait]
impl SinkBackend for KafkaProducerBackend {
    type Producer = KafkaProducer;

    fn producer(&self, topic: &str) -> Result<KafkaProducer, TransportError> {
        Ok(KafkaProducer {
            producer: self.client.get().map_err(TransportError::backend)?,
            topic: topic.to_string(),
        })
    }

    async fn status(&self, topic: &str) -> Result<Status, TransportError> {
        let producer = self.client.get().map_err(TransportError::backend)?;
        fetch_topic_status(topic, move |topic, timeout| {
            producer.client().fetch_metadata(Some(topic), timeout)
        })
        .await
    }

    fn close(&self) -> Result<(), CloseError> {
        close_all([&self.client as &dyn Close])
    }
}
