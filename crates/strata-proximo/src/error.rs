use strata_core::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProximoError {
    #[error("proximo broker address must not be empty")]
    MissingBroker,
    #[error("failed to dial {broker}")]
    Dial {
        broker: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("proximo connection is already closed")]
    Closed,
    #[error("unknown connection state: {0}")]
    UnknownState(i32),
}

impl From<ProximoError> for TransportError {
    fn from(err: ProximoError) -> Self {
        match err {
            ProximoError::MissingBroker => TransportError::Config(err.to_string()),
            other => TransportError::backend(other),
        }
    }
}
