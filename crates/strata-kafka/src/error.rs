use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use strata_core::TransportError;
use thiserror::Error;

/// Failures of the Kafka backend.
#[derive(Debug, Error)]
pub enum KafkaBackendError {
    #[error("at least one broker is required")]
    NoBrokers,
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("invalid start offset {0}: expected -2 (oldest) or -1 (newest)")]
    InvalidOffset(i64),
    #[error("invalid kafka version {0:?}: expected major.minor.patch[.build]")]
    InvalidVersion(String),
    #[error("failed to create kafka client: {0}")]
    Client(#[source] KafkaError),
    #[error("failed to join consumer group for topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: KafkaError,
    },
    #[error("consuming topic {topic} failed: {source}")]
    Consume {
        topic: String,
        #[source]
        source: KafkaError,
    },
    #[error("kafka client failed permanently ({code:?}): {reason}")]
    Fatal {
        code: RDKafkaErrorCode,
        reason: String,
    },
}

impl KafkaBackendError {
    fn is_config(&self) -> bool {
        matches!(
            self,
            Self::NoBrokers | Self::Missing(_) | Self::InvalidOffset(_) | Self::InvalidVersion(_)
        )
    }
}

impl From<KafkaBackendError> for TransportError {
    fn from(err: KafkaBackendError) -> Self {
        if err.is_config() {
            TransportError::Config(err.to_string())
        } else {
            TransportError::backend(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KafkaBackendError;
    use rdkafka::error::RDKafkaErrorCode;
    use strata_core::TransportError;

    #[test]
    fn config_failures_map_to_config_errors() {
        let err = TransportError::from(KafkaBackendError::InvalidOffset(7));
        assert!(matches!(err, TransportError::Config(_)));
        assert_eq!(
            err.to_string(),
            "invalid configuration: invalid start offset 7: expected -2 (oldest) or -1 (newest)"
        );

        let err = TransportError::from(KafkaBackendError::Missing("topic"));
        assert_eq!(err.to_string(), "invalid configuration: topic must not be empty");
    }

    #[test]
    fn runtime_failures_map_to_backend_errors() {
        let err = TransportError::from(KafkaBackendError::Fatal {
            code: RDKafkaErrorCode::Fatal,
            reason: "producer fenced".to_string(),
        });
        assert!(matches!(err, TransportError::Backend(_)));
        assert!(err.to_string().contains("producer fenced"));
    }
}
