use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Receive limit applied when none is configured.
pub const DEFAULT_MAX_RECV_MSG_SIZE: usize = 64 * 1024 * 1024;

/// HTTP/2 keep-alive pings sent on the proximo channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    /// Interval between pings.
    #[serde(with = "humantime_serde")]
    pub time: Duration,
    /// How long to wait for a ping response before the connection is
    /// considered broken.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProximoDialConfig {
    /// `host:port`, or a full `http(s)://` URI.
    pub broker: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub keep_alive: Option<KeepAlive>,
    /// Zero or negative selects [`DEFAULT_MAX_RECV_MSG_SIZE`].
    #[serde(default)]
    pub max_recv_msg_size: i64,
}

impl ProximoDialConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            insecure: false,
            keep_alive: None,
            max_recv_msg_size: 0,
        }
    }

    pub fn max_recv_msg_size(&self) -> usize {
        usize::try_from(self.max_recv_msg_size)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_MAX_RECV_MSG_SIZE)
    }

    /// Endpoint URI; bare addresses get a scheme matching the security mode.
    pub fn endpoint_uri(&self) -> String {
        let broker = self.broker.trim();
        if broker.contains("://") {
            return broker.to_string();
        }
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{broker}")
    }
}

#[cfg(test)]
mod tests {
    use super::{KeepAlive, ProximoDialConfig, DEFAULT_MAX_RECV_MSG_SIZE};
    use std::time::Duration;

    #[test]
    fn receive_limit_defaults_when_unset_or_negative() {
        let mut config = ProximoDialConfig::new("proximo:6868");
        assert_eq!(config.max_recv_msg_size(), DEFAULT_MAX_RECV_MSG_SIZE);
        config.max_recv_msg_size = -5;
        assert_eq!(config.max_recv_msg_size(), DEFAULT_MAX_RECV_MSG_SIZE);
        config.max_recv_msg_size = 1024;
        assert_eq!(config.max_recv_msg_size(), 1024);
    }

    #[test]
    fn scheme_follows_security_mode() {
        let mut config = ProximoDialConfig::new("proximo:6868");
        assert_eq!(config.endpoint_uri(), "https://proximo:6868");
        config.insecure = true;
        assert_eq!(config.endpoint_uri(), "http://proximo:6868");
        config.broker = "https://proximo.internal".to_string();
        assert_eq!(config.endpoint_uri(), "https://proximo.internal");
    }

    #[test]
    fn keep_alive_parses_human_durations() {
        let config: ProximoDialConfig = serde_json::from_str(
            r#"{"broker":"proximo:6868","keep_alive":{"time":"30s","timeout":"5s"}}"#,
        )
        .expect("config should parse");
        assert_eq!(
            config.keep_alive,
            Some(KeepAlive {
                time: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
            })
        );
        assert!(!config.insecure);
    }
}
