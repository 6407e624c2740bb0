use std::fmt;

use strata_core::Status;

use crate::error::ProximoError;

/// Connectivity of a gRPC channel, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
    Unrecognized(i32),
}

impl ConnectivityState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            4 => Self::Shutdown,
            other => Self::Unrecognized(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Ready => 2,
            Self::TransientFailure => 3,
            Self::Shutdown => 4,
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("IDLE"),
            Self::Connecting => f.write_str("CONNECTING"),
            Self::Ready => f.write_str("READY"),
            Self::TransientFailure => f.write_str("TRANSIENT_FAILURE"),
            Self::Shutdown => f.write_str("SHUTDOWN"),
            Self::Unrecognized(raw) => write!(f, "Invalid-State({raw})"),
        }
    }
}

/// Maps channel connectivity onto a status report.
pub fn probe_status(state: ConnectivityState) -> Result<Status, ProximoError> {
    match state {
        ConnectivityState::Idle | ConnectivityState::Ready => Ok(Status::healthy()),
        ConnectivityState::Connecting => Ok(Status::degraded("connecting")),
        ConnectivityState::TransientFailure => Ok(Status::degraded("transient failure")),
        ConnectivityState::Shutdown => Ok(Status::failed("connection shutdown")),
        ConnectivityState::Unrecognized(raw) => Err(ProximoError::UnknownState(raw)),
    }
}
