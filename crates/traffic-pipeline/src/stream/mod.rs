//! Stream sources -- where raw traffic payloads come from.
//!
//! A [`StreamSource`] hands out micro-batches of [`StreamMessage`]s and
//! accepts commits of the positions whose records are durably stored.
//! Nothing is committed automatically: a position that is never committed
//! is delivered again after a rewind or a restart.
//!
//! | source | partitions | use |
//! |---|---|---|
//! | [`MemoryStream`] | any | tests, `memory` backend |
//! | [`JsonLinesSource`] | 1 | replay of captured traffic |
//! | `KafkaSource` | broker-assigned | production (feature `kafka`) |

pub mod jsonl;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use crate::error::TrafficError;

pub use jsonl::JsonLinesSource;
#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;
pub use memory::{MemoryStream, MemoryTopic};

/// Location of one message in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPosition {
    pub partition: i32,
    pub offset: i64,
}

impl StreamPosition {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub position: StreamPosition,
    pub payload: Bytes,
}

/// Highest offset per partition. Committing `n` marks everything up to and
/// including `n` as done.
pub fn highest_per_partition(positions: &[StreamPosition]) -> BTreeMap<i32, i64> {
    let mut highest = BTreeMap::new();
    for pos in positions {
        highest
            .entry(pos.partition)
            .and_modify(|o: &mut i64| *o = (*o).max(pos.offset))
            .or_insert(pos.offset);
    }
    highest
}

/// Lowest offset per partition, the point to seek back to on rewind.
pub fn lowest_per_partition(positions: &[StreamPosition]) -> BTreeMap<i32, i64> {
    let mut lowest = BTreeMap::new();
    for pos in positions {
        lowest
            .entry(pos.partition)
            .and_modify(|o: &mut i64| *o = (*o).min(pos.offset))
            .or_insert(pos.offset);
    }
    lowest
}

/// A consumer-group member reading from the traffic stream.
///
/// Each worker owns exactly one source, hence `&mut self`.
pub trait StreamSource: Send + Sync + 'static {
    /// Up to `max` messages. Returns early with what it has once `timeout`
    /// passes; an empty batch is not an error.
    fn poll_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<StreamMessage>, TrafficError>> + Send;

    /// Marks `positions` (and everything before them, per partition) done.
    fn commit(
        &mut self,
        positions: &[StreamPosition],
    ) -> impl Future<Output = Result<(), TrafficError>> + Send;

    /// Seeks back so the lowest of `positions` per partition is delivered next.
    fn rewind(
        &mut self,
        positions: &[StreamPosition],
    ) -> impl Future<Output = Result<(), TrafficError>> + Send;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Source chosen from `stream.backend`.
pub enum StreamBackend {
    Memory(MemoryStream),
    JsonLines(JsonLinesSource),
    #[cfg(feature = "kafka")]
    Kafka(KafkaSource),
}

impl StreamSource for StreamBackend {
    async fn poll_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamMessage>, TrafficError> {
        match self {
            Self::Memory(s) => s.poll_batch(max, timeout).await,
            Self::JsonLines(s) => s.poll_batch(max, timeout).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.poll_batch(max, timeout).await,
        }
    }

    async fn commit(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        match self {
            Self::Memory(s) => s.commit(positions).await,
            Self::JsonLines(s) => s.commit(positions).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.commit(positions).await,
        }
    }

    async fn rewind(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        match self {
            Self::Memory(s) => s.rewind(positions).await,
            Self::JsonLines(s) => s.rewind(positions).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.rewind(positions).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Memory(s) => s.describe(),
            Self::JsonLines(s) => s.describe(),
            #[cfg(feature = "kafka")]
            Self::Kafka(s) => s.describe(),
        }
    }
}
