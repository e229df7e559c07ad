//! Kafka source (rdkafka `StreamConsumer`).
//!
//! Joins the consumer group with auto-commit disabled; offsets are only
//! committed through [`StreamSource::commit`] after the batch is stored.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::error::TrafficError;

use super::{
    StreamMessage, StreamPosition, StreamSource, highest_per_partition, lowest_per_partition,
};

/// Once a batch has its first message, wait at most this long for each
/// further one.
const FOLLOW_UP_WAIT: Duration = Duration::from_millis(5);

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    group_id: String,
}

impl KafkaSource {
    /// Creates the consumer, checks the brokers answer within
    /// `metadata_timeout`, and subscribes to `topic`.
    pub async fn connect(
        brokers: &[String],
        topic: &str,
        group_id: &str,
        auto_offset_reset: &str,
        metadata_timeout: Duration,
    ) -> Result<Self, TrafficError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .create()
            .map_err(|e| TrafficError::Stream(format!("failed to create kafka consumer: {e}")))?;
        let consumer = Arc::new(consumer);

        let client = Arc::clone(&consumer);
        let metadata_topic = topic.to_owned();
        tokio::task::spawn_blocking(move || {
            client
                .fetch_metadata(Some(&metadata_topic), metadata_timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| TrafficError::Stream(format!("metadata request panicked: {e}")))?
        .map_err(|e| TrafficError::Stream(format!("brokers unreachable: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| TrafficError::Stream(format!("failed to subscribe to {topic}: {e}")))?;

        info!(topic, group_id, brokers = %brokers.join(","), "kafka consumer subscribed");
        Ok(Self {
            consumer,
            topic: topic.to_owned(),
            group_id: group_id.to_owned(),
        })
    }
}

impl StreamSource for KafkaSource {
    async fn poll_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamMessage>, TrafficError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max {
            let wait = if batch.is_empty() {
                deadline.saturating_duration_since(tokio::time::Instant::now())
            } else {
                FOLLOW_UP_WAIT
            };
            if wait.is_zero() {
                break;
            }

            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => batch.push(StreamMessage {
                    position: StreamPosition::new(message.partition(), message.offset()),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                }),
                Ok(Err(e)) if batch.is_empty() => {
                    return Err(TrafficError::Stream(format!("kafka receive failed: {e}")));
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "kafka receive failed, returning partial batch");
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        let highest = highest_per_partition(positions);
        if highest.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, offset) in highest {
            list.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| TrafficError::Stream(format!("invalid commit offset: {e}")))?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| TrafficError::Stream(format!("commit task panicked: {e}")))?
            .map_err(|e| TrafficError::Stream(format!("offset commit failed: {e}")))
    }

    async fn rewind(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        let targets = lowest_per_partition(positions);
        if targets.is_empty() {
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            for (partition, offset) in targets {
                consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
                debug!(topic = %topic, partition, offset, "seeked back for redelivery");
            }
            Ok::<_, rdkafka::error::KafkaError>(())
        })
        .await
        .map_err(|e| TrafficError::Stream(format!("seek task panicked: {e}")))?
        .map_err(|e| TrafficError::Stream(format!("seek failed: {e}")))
    }

    fn describe(&self) -> String {
        format!("kafka(topic={}, group={})", self.topic, self.group_id)
    }
}
