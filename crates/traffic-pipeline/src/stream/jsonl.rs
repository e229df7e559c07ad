//! JSON Lines replay source.
//!
//! Reads one traffic payload per line from a file, as a single partition
//! whose offsets are line numbers (0-based). Lines are handed over as raw
//! bytes; invalid UTF-8 or JSON is left to the record parser, so a bad line
//! costs one offset and nothing else. Blank lines are skipped but still take
//! an offset. At end of file the source waits out the poll timeout, so a
//! file that is still being appended to is followed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tracing::{debug, warn};

use crate::error::TrafficError;

use super::{StreamMessage, StreamPosition, StreamSource, highest_per_partition};

const PARTITION: i32 = 0;

type LineReader = Split<BufReader<File>>;

pub struct JsonLinesSource {
    path: PathBuf,
    lines: LineReader,
    /// Offset of the next line to be read.
    next_offset: i64,
    /// Highest committed offset.
    committed: Option<i64>,
}

impl JsonLinesSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrafficError> {
        let path = path.as_ref().to_path_buf();
        let lines = Self::open_lines(&path).await?;
        Ok(Self {
            path,
            lines,
            next_offset: 0,
            committed: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed_offset(&self) -> Option<i64> {
        self.committed
    }

    async fn open_lines(path: &Path) -> Result<LineReader, TrafficError> {
        let file = File::open(path).await.map_err(|e| {
            TrafficError::Stream(format!("failed to open {}: {e}", path.display()))
        })?;
        Ok(BufReader::new(file).split(b'\n'))
    }

    /// Next line without its terminator (`\n` or `\r\n`).
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, TrafficError> {
        let line = self
            .lines
            .next_segment()
            .await
            .map_err(|e| TrafficError::Stream(format!("failed to read {}: {e}", self.path.display())))?;
        Ok(line.map(|mut line| {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        }))
    }
}

impl StreamSource for JsonLinesSource {
    async fn poll_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamMessage>, TrafficError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max {
            let line = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                // keep what was read; the error surfaces on the next poll
                Err(e) if !batch.is_empty() => {
                    warn!(error = %e, lines = batch.len(), "replay read failed mid-batch");
                    break;
                }
                Err(e) => return Err(e),
            };
            let offset = self.next_offset;
            self.next_offset += 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            batch.push(StreamMessage {
                position: StreamPosition::new(PARTITION, offset),
                payload: Bytes::from(line),
            });
        }

        if batch.is_empty() {
            tokio::time::sleep_until(deadline).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        if let Some(offset) = highest_per_partition(positions).get(&PARTITION) {
            self.committed = Some(self.committed.map_or(*offset, |c| c.max(*offset)));
        }
        Ok(())
    }

    async fn rewind(&mut self, positions: &[StreamPosition]) -> Result<(), TrafficError> {
        let Some(target) = positions
            .iter()
            .filter(|p| p.partition == PARTITION)
            .map(|p| p.offset)
            .min()
        else {
            return Ok(());
        };

        self.lines = Self::open_lines(&self.path).await?;
        self.next_offset = 0;
        while self.next_offset < target {
            if self.next_line().await?.is_none() {
                break;
            }
            self.next_offset += 1;
        }
        debug!(path = %self.path.display(), offset = self.next_offset, "rewound replay file");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("jsonl({})", self.path.display())
    }
}
