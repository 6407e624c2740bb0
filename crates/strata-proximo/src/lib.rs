//! Connection plumbing for the proximo gRPC proxy.
//!
//! Dials a channel with optional TLS and keep-alive and reports its
//! connectivity as a strata [`Status`](strata_core::Status).

pub mod config;
pub mod connection;
pub mod error;
pub mod state;

pub use config::{KeepAlive, ProximoDialConfig, DEFAULT_MAX_RECV_MSG_SIZE};
pub use connection::{endpoint, ProximoConnection};
pub use error::ProximoError;
pub use state::{probe_status, ConnectivityState};
