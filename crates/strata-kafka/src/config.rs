use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use strata_transport::KeyFn;

use crate::error::KafkaBackendError;

/// Metadata refresh interval used when none is configured.
pub const DEFAULT_METADATA_REFRESH: Duration = Duration::from_secs(10 * 60);

/// Largest request the client accepts unless a bigger message size is set.
pub const DEFAULT_REQUEST_CEILING: usize = 100 * 1024 * 1024;

/// Raw offset selecting the oldest retained record.
pub const OFFSET_OLDEST: i64 = -2;
/// Raw offset selecting only records produced after joining.
pub const OFFSET_NEWEST: i64 = -1;

const PRODUCER_RETRIES: u32 = 3;
const PRODUCER_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a consumer group without a committed position starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    Oldest,
    #[default]
    Newest,
}

impl StartOffset {
    /// Interprets a raw offset: `-2` oldest, `-1` newest, `0` unset.
    pub fn from_raw(raw: i64) -> Result<Self, KafkaBackendError> {
        match raw {
            OFFSET_OLDEST => Ok(Self::Oldest),
            OFFSET_NEWEST | 0 => Ok(Self::Newest),
            other => Err(KafkaBackendError::InvalidOffset(other)),
        }
    }

    fn auto_offset_reset(self) -> &'static str {
        match self {
            Self::Oldest => "earliest",
            Self::Newest => "latest",
        }
    }
}

/// Broker protocol version, `major.minor.patch` (`0.x` releases carry a
/// fourth component).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaVersion {
    parts: [u32; 4],
    len: usize,
}

impl FromStr for KafkaVersion {
    type Err = KafkaBackendError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || KafkaBackendError::InvalidVersion(raw.to_string());

        let mut parts = [0_u32; 4];
        let mut len = 0;
        for component in raw.split('.') {
            if len == parts.len() || component.is_empty() {
                return Err(invalid());
            }
            if !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            parts[len] = component.parse().map_err(|_| invalid())?;
            len += 1;
        }

        let expected = if parts[0] == 0 { 4 } else { 3 };
        if len != expected {
            return Err(invalid());
        }
        Ok(Self { parts, len })
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts[..self.len].iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

fn parse_version(version: Option<&str>) -> Result<Option<KafkaVersion>, KafkaBackendError> {
    match version.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some),
    }
}

fn base_client_config(brokers: &[String]) -> Result<ClientConfig, KafkaBackendError> {
    let brokers: Vec<&str> = brokers
        .iter()
        .map(|broker| broker.trim())
        .filter(|broker| !broker.is_empty())
        .collect();
    if brokers.is_empty() {
        return Err(KafkaBackendError::NoBrokers);
    }

    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", brokers.join(","));
    Ok(client_config)
}

fn require(value: &str, name: &'static str) -> Result<(), KafkaBackendError> {
    if value.trim().is_empty() {
        return Err(KafkaBackendError::Missing(name));
    }
    Ok(())
}

/// Consumer-group source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    #[serde(default)]
    pub offset: StartOffset,
    /// Zero selects [`DEFAULT_METADATA_REFRESH`].
    #[serde(default, with = "humantime_serde")]
    pub metadata_refresh_frequency: Duration,
    /// Accepted for compatibility; committed offsets are retained for as
    /// long as the broker is configured to keep them.
    #[serde(default, with = "humantime_serde")]
    pub offsets_retention: Duration,
    #[serde(default)]
    pub version: Option<String>,
}

impl KafkaSourceConfig {
    pub fn new(
        brokers: Vec<String>,
        topic: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            consumer_group: consumer_group.into(),
            offset: StartOffset::default(),
            metadata_refresh_frequency: Duration::ZERO,
            offsets_retention: Duration::ZERO,
            version: None,
        }
    }

    pub fn metadata_refresh(&self) -> Duration {
        if self.metadata_refresh_frequency.is_zero() {
            DEFAULT_METADATA_REFRESH
        } else {
            self.metadata_refresh_frequency
        }
    }

    /// Builds the consumer client settings.
    ///
    /// Offsets are stored only when a delivery is acknowledged and then
    /// committed by the client in the background.
    pub fn client_config(&self) -> Result<ClientConfig, KafkaBackendError> {
        require(&self.topic, "topic")?;
        require(&self.consumer_group, "consumer group")?;
        let version = parse_version(self.version.as_deref())?;

        let mut client_config = base_client_config(&self.brokers)?;
        client_config
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", self.offset.auto_offset_reset())
            .set(
                "topic.metadata.refresh.interval.ms",
                self.metadata_refresh().as_millis().to_string(),
            );
        if let Some(version) = version {
            client_config.set("broker.version.fallback", version.to_string());
        }
        Ok(client_config)
    }
}

/// Producer sink settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Zero keeps the client default.
    #[serde(default)]
    pub max_message_bytes: usize,
    /// Partition key derivation; keyed records use the hash partitioner.
    #[serde(skip)]
    pub key_fn: Option<KeyFn>,
    #[serde(default)]
    pub version: Option<String>,
}

impl KafkaSinkConfig {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            max_message_bytes: 0,
            key_fn: None,
            version: None,
        }
    }

    pub fn client_config(&self) -> Result<ClientConfig, KafkaBackendError> {
        require(&self.topic, "topic")?;
        let version = parse_version(self.version.as_deref())?;

        let mut client_config = base_client_config(&self.brokers)?;
        client_config
            .set("acks", "all")
            .set("message.send.max.retries", PRODUCER_RETRIES.to_string())
            .set(
                "request.timeout.ms",
                PRODUCER_REQUEST_TIMEOUT.as_millis().to_string(),
            )
            .set(
                "partitioner",
                if self.key_fn.is_some() {
                    "murmur2_random"
                } else {
                    "random"
                },
            );

        if self.max_message_bytes > 0 {
            client_config.set("message.max.bytes", self.max_message_bytes.to_string());
            if self.max_message_bytes > DEFAULT_REQUEST_CEILING {
                client_config.set(
                    "receive.message.max.bytes",
                    self.max_message_bytes.to_string(),
                );
            }
        }
        if let Some(version) = version {
            client_config.set("broker.version.fallback", version.to_string());
        }
        Ok(client_config)
    }
}

impl fmt::Debug for KafkaSinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSinkConfig")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("keyed", &self.key_fn.is_some())
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        KafkaSinkConfig, KafkaSourceConfig, KafkaVersion, StartOffset, DEFAULT_REQUEST_CEILING,
    };
    use crate::error::KafkaBackendError;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use strata_core::Message;

    fn brokers() -> Vec<String> {
        vec!["kafka-1:9092".to_string(), " kafka-2:9092 ".to_string()]
    }

    #[test]
    fn raw_offsets_follow_client_convention() {
        assert_eq!(StartOffset::from_raw(-2).unwrap(), StartOffset::Oldest);
        assert_eq!(StartOffset::from_raw(-1).unwrap(), StartOffset::Newest);
        assert_eq!(StartOffset::from_raw(0).unwrap(), StartOffset::Newest);
        assert!(matches!(
            StartOffset::from_raw(42),
            Err(KafkaBackendError::InvalidOffset(42))
        ));
    }

    #[test]
    fn versions_parse_like_broker_releases() {
        for raw in ["2.1.0", "0.10.2.1", "3.6.1"] {
            let version: KafkaVersion = raw.parse().expect("valid version");
            assert_eq!(version.to_string(), raw);
        }
        for raw in ["2.1", "0.10.2", "1.x.0", "2.1.0.0", "", "1..0"] {
            assert!(raw.parse::<KafkaVersion>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn source_client_config_stores_offsets_manually() {
        let mut config = KafkaSourceConfig::new(brokers(), "orders", "billing");
        config.offset = StartOffset::Oldest;
        config.version = Some("2.1.0".to_string());

        let client = config.client_config().expect("valid config");
        assert_eq!(client.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(client.get("group.id"), Some("billing"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("topic.metadata.refresh.interval.ms"), Some("600000"));
        assert_eq!(client.get("broker.version.fallback"), Some("2.1.0"));
    }

    #[test]
    fn source_config_rejects_missing_fields() {
        let config = KafkaSourceConfig::new(Vec::new(), "orders", "billing");
        assert!(matches!(config.client_config(), Err(KafkaBackendError::NoBrokers)));

        let config = KafkaSourceConfig::new(brokers(), "orders", " ");
        assert!(matches!(
            config.client_config(),
            Err(KafkaBackendError::Missing("consumer group"))
        ));

        let mut config = KafkaSourceConfig::new(brokers(), "orders", "billing");
        config.version = Some("banana".to_string());
        assert!(matches!(
            config.client_config(),
            Err(KafkaBackendError::InvalidVersion(_))
        ));
    }

    #[test]
    fn source_config_deserializes_humantime_durations() {
        let config: KafkaSourceConfig = serde_json::from_str(
            r#"{
                "brokers": ["localhost:9092"],
                "topic": "orders",
                "consumer_group": "billing",
                "offset": "oldest",
                "metadata_refresh_frequency": "30s"
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.offset, StartOffset::Oldest);
        assert_eq!(config.metadata_refresh(), Duration::from_secs(30));
        assert!(config.offsets_retention.is_zero());
    }

    #[test]
    fn sink_client_config_picks_partitioner_from_key_fn() {
        let config = KafkaSinkConfig::new(brokers(), "orders");
        let client = config.client_config().expect("valid config");
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("message.send.max.retries"), Some("3"));
        assert_eq!(client.get("request.timeout.ms"), Some("60000"));
        assert_eq!(client.get("partitioner"), Some("random"));
        assert_eq!(client.get("message.max.bytes"), None);

        let mut keyed = KafkaSinkConfig::new(brokers(), "orders");
        keyed.key_fn = Some(Arc::new(|_: &dyn Message| Bytes::from_static(b"k")));
        let client = keyed.client_config().expect("valid config");
        assert_eq!(client.get("partitioner"), Some("murmur2_random"));
    }

    #[test]
    fn large_messages_raise_the_request_ceiling() {
        let mut config = KafkaSinkConfig::new(brokers(), "orders");
        config.max_message_bytes = 1_000_000;
        let client = config.client_config().expect("valid config");
        assert_eq!(client.get("message.max.bytes"), Some("1000000"));
        assert_eq!(client.get("receive.message.max.bytes"), None);

        config.max_message_bytes = DEFAULT_REQUEST_CEILING + 1;
        let client = config.client_config().expect("valid config");
        let expected = (DEFAULT_REQUEST_CEILING + 1).to_string();
        assert_eq!(client.get("receive.message.max.bytes"), Some(expected.as_str()));
    }
}
