//! In-process partitioned topic with consumer-group offsets.
//!
//! Behaves like a broker for the pieces the consumer relies on: messages
//! are retained after delivery, committed offsets survive the consumer, and
//! a new consumer in the same group resumes at the committed offset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::TrafficError;

use super::{
    StreamMessage, StreamPosition, StreamSource, highest_per_partition, lowest_per_partition,
};

#[derive(Debug, Default)]
struct TopicState {
    partitions: Vec<Vec<Bytes>>,
    /// (group, partition) -> next offset to consume
    committed: HashMap<(String, i32), i64>,
}

#[derive(Debug, Default)]
struct TopicInner {
    state: Mutex<TopicState>,
    published: Notify,
}

/// Shared handle to an in-memory topic.
#[derive(Debug, Clone)]
pub struct MemoryTopic {
    inner: Arc<TopicInner>,
}

impl MemoryTopic {
    /// A topic with `partitions` partitions (at least one).
    pub fn new(partitions: usize) -> Self {
        let state = TopicState {
            partitions: vec![Vec::new(); partitions.max(1)],
            committed: HashMap::new(),
        };
        Self {
            inner: Arc::new(TopicInner {
                state: Mutex::new(state),
                published: Notify::new(),
            }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.state().partitions.len()
    }

    /// Appends a message and wakes waiting consumers.
    pub fn publish(
        &self,
        partition: i32,
        payload: impl Into<Bytes>,
    ) -> Result<StreamPosition, TrafficError> {
        let position = {
            let mut state = self.state();
            let log = usize::try_from(partition)
                .ok()
                .and_then(|p| state.partitions.get_mut(p))
                .ok_or_else(|| TrafficError::Stream(format!("unknown partition {partition}")))?;
            log.push(payload.into());
            StreamPosition::new(partition, log.len() as i64 - 1)
        };
        self.inner.published.notify_waiters();
        Ok(position)
    }

    /// Messages in a partition, delivered or not.
    pub fn len(&self, partition: i32) -> usize {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.state().partitions.get(p).map(Vec::len))
            .unwrap_or(0)
    }

    /// A group member reading `partitions`, starting at the group's
    /// committed offsets (or the beginning).
    pub fn consumer(&self, group: impl Into<String>, partitions: Vec<i32>) -> MemoryStream {
        let group = group.into();
        let positions = {
            let state = self.state();
            partitions
                .iter()
                .map(|p| {
                    let next = state
                        .committed
                        .get(&(group.clone(), *p))
                        .copied()
                        .unwrap_or(0);
                    (*p, next)
                })
                .collect()
        };
        MemoryStream {
            topic: self.clone(),
            group,
            partitions,
            positions,
        }
    }

    /// A member reading every partition.
    pub fn consumer_all(&self, group: impl Into<String>) -> MemoryStream {
        let partitions = (0..self.partition_count() as i32).collect();
        self.consumer(group, partitions)
    }

    /// Next offset the group will consume from `partition`, if it ever committed.
    pub fn committed_offset(&self, group: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_owned(), partition))
            .copied()
    }

    fn state(&self) -> MutexGuard<'_, TopicState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One consumer on a [`MemoryTopic`].
#[derive(Debug)]
pub struct MemoryStream {
    topic: MemoryTopic,
    group: String,
    partitions: Vec<i32>,
    /// partition -> next offset to read
    positions: HashMap<i32, i64>,
}

impl MemoryStream {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next offset this consumer will read from `partition`.
    pub fn position(&self, partition: i32) -> Option<i64> {
        self.positions.get(&partition).copied()
    }

    fn take(&mut self, max: usize) -> Vec<StreamMessage> {
        let state = self.topic.state();
        let mut batch = Vec::new();

        for partition in &self.partitions {
            if batch.len() >= max {
                break;
            }
            let Some(log) = usize::try_from(*partition)
                .ok()
                .and_then(|p| state.partitions.get(p))
            else {
                continue;
            };
            let next = self.positions.entry(*partition).or_insert(0);
            while batch.len() < max {
                let Some(payload) = usize::try_from(*next).ok().and_then(|o| log.get(o)) else {
                    break;
                };
                batch.push(StreamMessage {
                    position: StreamPosition::new(*partition, *next),
                    payload: payload.clone(),
                });
                *next += 1;
            }
        }
        batch
    }
}

impl StreamSource for MemoryStream {
    async fn poll_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamMessage>, TrafficError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let inner = Arc::clone(&self.topic.inner);

        loop {
            let published = inner.published.notified();
            tokio::pin!(published);
            // register before checking so a publish in between is not missed
            published.as_mut().enable();

            let batch = self.take(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut published => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn commit(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        let mut state = self.topic.state();
        for (partition, offset) in highest_per_partition(positions) {
            let next = offset + 1;
            state
                .committed
                .entry((self.group.clone(), partition))
                .and_modify(|c| *c = (*c).max(next))
                .or_insert(next);
        }
        Ok(())
    }

    async fn rewind(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        for (partition, offset) in lowest_per_partition(positions) {
            self.positions.insert(partition, offset);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory(group={}, partitions={:?})", self.group, self.partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_returns_published_messages_in_order() {
        let topic = MemoryTopic::new(1);
        for i in 0..3 {
            topic.publish(0, format!("m{i}")).unwrap();
        }
        let mut consumer = topic.consumer_all("g");
        let batch = consumer.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].position, StreamPosition::new(0, 2));
        assert_eq!(batch[0].payload, Bytes::from("m0"));
    }

    #[tokio::test]
    async fn poll_respects_max() {
        let topic = MemoryTopic::new(2);
        for i in 0..4 {
            topic.publish(i % 2, "x").unwrap();
        }
        let mut consumer = topic.consumer_all("g");
        assert_eq!(consumer.poll_batch(3, Duration::from_millis(10)).await.unwrap().len(), 3);
        assert_eq!(consumer.poll_batch(3, Duration::from_millis(10)).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_waits_for_timeout() {
        let topic = MemoryTopic::new(1);
        let mut consumer = topic.consumer_all("g");
        let started = tokio::time::Instant::now();
        let batch = consumer.poll_batch(10, Duration::from_secs(1)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let topic = MemoryTopic::new(1);
        let mut consumer = topic.consumer_all("g");
        let publisher = topic.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(0, "late").unwrap();
        });
        let batch = consumer.poll_batch(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn new_consumer_resumes_at_committed_offset() {
        let topic = MemoryTopic::new(1);
        for _ in 0..5 {
            topic.publish(0, "x").unwrap();
        }
        let mut first = topic.consumer_all("g");
        let batch = first.poll_batch(3, Duration::from_millis(10)).await.unwrap();
        let positions: Vec<_> = batch.iter().map(|m| m.position).collect();
        first.commit(&positions).await.unwrap();
        assert_eq!(topic.committed_offset("g", 0), Some(3));

        let mut second = topic.consumer_all("g");
        let rest = second.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].position.offset, 3);

        // other groups start from the beginning
        let mut other = topic.consumer_all("other");
        assert_eq!(other.poll_batch(10, Duration::from_millis(10)).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn commit_never_moves_backwards() {
        let topic = MemoryTopic::new(1);
        let mut consumer = topic.consumer_all("g");
        consumer.commit(&[StreamPosition::new(0, 7)]).await.unwrap();
        consumer.commit(&[StreamPosition::new(0, 2)]).await.unwrap();
        assert_eq!(topic.committed_offset("g", 0), Some(8));
    }

    #[tokio::test]
    async fn rewind_redelivers() {
        let topic = MemoryTopic::new(1);
        for _ in 0..4 {
            topic.publish(0, "x").unwrap();
        }
        let mut consumer = topic.consumer_all("g");
        let batch = consumer.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        let positions: Vec<_> = batch.iter().skip(1).map(|m| m.position).collect();
        consumer.rewind(&positions).await.unwrap();
        assert_eq!(consumer.position(0), Some(1));

        let again = consumer.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again[0].position.offset, 1);
    }

    #[test]
    fn publish_to_unknown_partition_fails() {
        let topic = MemoryTopic::new(1);
        assert!(topic.publish(3, "x").is_err());
        assert!(topic.publish(-1, "x").is_err());
        assert_eq!(topic.len(0), 0);
    }
}
