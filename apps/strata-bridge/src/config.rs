use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use strata_kafka::{KafkaSinkConfig, KafkaSourceConfig, StartOffset};

use crate::commands::key_prefix;

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(deserialize_with = "deserialize_list")]
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    pub offset: StartOffset,
    #[serde(with = "humantime_serde")]
    pub metadata_refresh: Duration,
    #[serde(with = "humantime_serde")]
    pub offsets_retention: Duration,
    pub version: Option<String>,
    pub max_message_bytes: usize,
    /// Keys published records by their first bytes; zero publishes unkeyed.
    pub key_prefix_len: usize,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element::<String>()? {
                vec.extend(split_list(&element));
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl BridgeConfig {
    /// Layers defaults, then `config_path`, then `STRATA_*` variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("brokers", "localhost:9092")?
            .set_default("topic", "")?
            .set_default("consumer_group", "strata-bridge")?
            .set_default("offset", "newest")?
            .set_default("metadata_refresh", "10m")?
            .set_default("offsets_retention", "0s")?
            .set_default("version", None::<String>)?
            .set_default("max_message_bytes", 0)?
            .set_default("key_prefix_len", 0)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("STRATA").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn source_config(&self) -> KafkaSourceConfig {
        KafkaSourceConfig {
            offset: self.offset,
            metadata_refresh_frequency: self.metadata_refresh,
            offsets_retention: self.offsets_retention,
            version: self.version.clone(),
            ..KafkaSourceConfig::new(self.brokers.clone(), &self.topic, &self.consumer_group)
        }
    }

    pub fn sink_config(&self) -> KafkaSinkConfig {
        KafkaSinkConfig {
            max_message_bytes: self.max_message_bytes,
            key_fn: (self.key_prefix_len > 0).then(|| key_prefix(self.key_prefix_len)),
            version: self.version.clone(),
            ..KafkaSinkConfig::new(self.brokers.clone(), &self.topic)
        }
    }
}
