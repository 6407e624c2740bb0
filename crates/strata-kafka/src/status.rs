use std::time::Duration;

use rdkafka::error::KafkaResult;
use rdkafka::metadata::Metadata;
use strata_core::{Status, TransportError};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Cluster view of one topic, reduced from broker metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicHealth {
    pub brokers: usize,
    pub topic_found: bool,
    pub topic_error: Option<String>,
    pub partitions: usize,
    pub leaderless: Vec<i32>,
}

impl TopicHealth {
    pub fn from_metadata(metadata: &Metadata, topic: &str) -> Self {
        let mut health = Self {
            brokers: metadata.brokers().len(),
            ..Self::default()
        };
        let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return health;
        };

        health.topic_found = true;
        health.topic_error = found.error().map(|code| format!("{code:?}"));
        health.partitions = found.partitions().len();
        health.leaderless = found
            .partitions()
            .iter()
            .filter(|partition| partition.leader() < 0)
            .map(|partition| partition.id())
            .collect();
        health
    }

    pub fn status(&self, topic: &str) -> Status {
        let mut problems = Vec::new();
        if self.brokers == 0 {
            problems.push("no brokers available".to_string());
        }
        if !self.topic_found {
            problems.push(format!("topic {topic} not found"));
        }
        if let Some(err) = &self.topic_error {
            problems.push(format!("topic {topic} metadata error: {err}"));
        }
        if self.topic_found && self.topic_error.is_none() && self.partitions == 0 {
            problems.push(format!("topic {topic} has no partitions"));
        }
        for partition in &self.leaderless {
            problems.push(format!("partition {partition} of topic {topic} has no leader"));
        }

        Status {
            working: problems.is_empty(),
            problems,
        }
    }
}

/// Fetches topic metadata off the async runtime and summarises it.
pub(crate) async fn fetch_topic_status<F>(topic: &str, fetch: F) -> Result<Status, TransportError>
where
    F: FnOnce(&str, Duration) -> KafkaResult<Metadata> + Send + 'static,
{
    let owned_topic = topic.to_string();
    let health = tokio::task::spawn_blocking(move || {
        fetch(&owned_topic, METADATA_TIMEOUT)
            .map(|metadata| TopicHealth::from_metadata(&metadata, &owned_topic))
    })
    .await
    .map_err(|err| TransportError::TaskFailed(format!("metadata fetch: {err}")))?
    .map_err(TransportError::backend)?;
    Ok(health.status(topic))
}

#[cfg(test)]
mod tests {
    use super::TopicHealth;

    fn healthy() -> TopicHealth {
        TopicHealth {
            brokers: 3,
            topic_found: true,
            topic_error: None,
            partitions: 6,
            leaderless: Vec::new(),
        }
    }

    #[test]
    fn healthy_topic_is_working() {
        let status = healthy().status("orders");
        assert!(status.working);
        assert!(status.problems.is_empty());
    }

    #[test]
    fn every_problem_is_listed() {
        let health = TopicHealth {
            leaderless: vec![2, 5],
            ..healthy()
        };
        let status = health.status("orders");
        assert!(!status.working);
        assert_eq!(
            status.problems,
            vec![
                "partition 2 of topic orders has no leader".to_string(),
                "partition 5 of topic orders has no leader".to_string(),
            ]
        );
    }

    #[test]
    fn missing_topic_and_brokers_are_reported() {
        let status = TopicHealth::default().status("orders");
        assert!(!status.working);
        assert_eq!(status.problems.len(), 2);
        assert!(status.problems[1].contains("topic orders not found"));
    }
}
