use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use strata_core::Status;
use tonic::client::Grpc;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

use crate::config::ProximoDialConfig;
use crate::error::ProximoError;
use crate::state::{probe_status, ConnectivityState};

/// Builds the channel endpoint for `config` without connecting.
pub fn endpoint(config: &ProximoDialConfig) -> Result<Endpoint, ProximoError> {
    if config.broker.trim().is_empty() {
        return Err(ProximoError::MissingBroker);
    }
    let dial_error = |source| ProximoError::Dial {
        broker: config.broker.clone(),
        source,
    };

    let mut endpoint = Endpoint::from_shared(config.endpoint_uri()).map_err(dial_error)?;
    if !config.insecure {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().with_webpki_roots())
            .map_err(dial_error)?;
    }
    if let Some(keep_alive) = config.keep_alive {
        endpoint = endpoint
            .http2_keep_alive_interval(keep_alive.time)
            .keep_alive_timeout(keep_alive.timeout);
    }
    Ok(endpoint)
}

/// A channel to a proximo server with its tracked connectivity.
///
/// Dialing is lazy; the first RPC or an explicit [`connect`] establishes the
/// transport.
///
/// [`connect`]: ProximoConnection::connect
#[derive(Debug)]
pub struct ProximoConnection {
    broker: String,
    endpoint: Endpoint,
    channel: Mutex<Option<Channel>>,
    state: AtomicI32,
    max_recv_msg_size: usize,
}

impl ProximoConnection {
    /// Must be called from within a tokio runtime.
    pub fn dial(config: &ProximoDialConfig) -> Result<Self, ProximoError> {
        let endpoint = endpoint(config)?;
        let channel = endpoint.connect_lazy();
        debug!(broker = %config.broker, insecure = config.insecure, "proximo channel dialed");
        Ok(Self {
            broker: config.broker.clone(),
            endpoint,
            channel: Mutex::new(Some(channel)),
            state: AtomicI32::new(ConnectivityState::Idle.as_raw()),
            max_recv_msg_size: config.max_recv_msg_size(),
        })
    }

    /// Connects eagerly, replacing the lazy channel on success.
    pub async fn connect(&self) -> Result<(), ProximoError> {
        if self.state() == ConnectivityState::Shutdown {
            return Err(ProximoError::Closed);
        }
        self.set_state(ConnectivityState::Connecting);
        match self.endpoint.connect().await {
            Ok(channel) => {
                let mut slot = self.lock();
                if slot.is_none() {
                    return Err(ProximoError::Closed);
                }
                *slot = Some(channel);
                self.set_state(ConnectivityState::Ready);
                info!(broker = %self.broker, "proximo connection ready");
                Ok(())
            }
            Err(source) => {
                if self.state() != ConnectivityState::Shutdown {
                    self.set_state(ConnectivityState::TransientFailure);
                }
                warn!(broker = %self.broker, error = %source, "proximo connection failed");
                Err(ProximoError::Dial {
                    broker: self.broker.clone(),
                    source,
                })
            }
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Channel for building RPC clients.
    pub fn channel(&self) -> Result<Channel, ProximoError> {
        self.lock().clone().ok_or(ProximoError::Closed)
    }

    /// gRPC client over the current channel, bounded by the configured
    /// receive limit. Generated service clients wrap this.
    pub fn client(&self) -> Result<Grpc<Channel>, ProximoError> {
        let channel = self.channel()?;
        Ok(Grpc::new(channel).max_decoding_message_size(self.max_recv_msg_size))
    }

    /// Largest response [`client`](Self::client) accepts.
    pub fn max_decoding_message_size(&self) -> usize {
        self.max_recv_msg_size
    }

    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> Result<Status, ProximoError> {
        probe_status(self.state())
    }

    pub fn close(&self) -> Result<(), ProximoError> {
        let channel = self.lock().take().ok_or(ProximoError::Closed)?;
        self.set_state(ConnectivityState::Shutdown);
        drop(channel);
        debug!(broker = %self.broker, "proximo connection closed");
        Ok(())
    }

    fn set_state(&self, state: ConnectivityState) {
        self.state.store(state.as_raw(), Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
