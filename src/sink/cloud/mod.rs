//! Cloud-storage sink: rows buffer in memory per wall-time bucket and
//! materialize as files on flush; resolved timestamps become `.RESOLVED`
//! marker objects whose names slot lexicographically after every file they
//! cover.
//!
//! Consumers list the prefix in name order and treat a marker as a barrier:
//! every strictly-earlier filename is final.

pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::encoder::Encoder;
use crate::error::{SinkError, SinkResult};
use crate::hlc::HlcTimestamp;
use crate::sink::cloud::storage::ExportStorageFactory;
use crate::sink::metrics::SinkMetrics;
use crate::sink::{Format, Sink, TopicSet};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// `YYYYMMDDHHMMSS` plus nine zero-padded nanosecond digits: fixed width, so
/// lexicographic filename order is chronological order.
fn format_bucket(wall_ns: i64) -> SinkResult<String> {
    let secs = wall_ns.div_euclid(NANOS_PER_SEC);
    let nanos = wall_ns.rem_euclid(NANOS_PER_SEC) as u32;
    let instant = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
        SinkError::Encode(format!(
            "timestamp {wall_ns}ns is outside the representable range"
        ))
    })?;
    Ok(format!("{}{:09}", instant.format("%Y%m%d%H%M%S"), nanos))
}

/// Buffer identity: one file per bucket, topic, and schema version. The
/// per-instance sink id is appended to the filename so concurrent writers to
/// one prefix never overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FileKey {
    bucket_start: i64,
    topic: String,
    schema_id: u64,
}

pub struct CloudStorageSink {
    storage: Arc<dyn ExportStorageFactory>,
    topics: TopicSet,
    bucket_ns: i64,
    format: Format,
    sink_id: Uuid,
    buffers: BTreeMap<FileKey, Vec<u8>>,
    buffered_bytes: usize,
    /// Largest timestamp whose coverage this instance has proven. Rows at or
    /// below it are duplicates from a replay and are dropped.
    local_resolved: HlcTimestamp,
    closed: bool,
    metrics: SinkMetrics,
}

impl CloudStorageSink {
    pub fn new(
        storage: Arc<dyn ExportStorageFactory>,
        topics: TopicSet,
        bucket_size: Duration,
        format: Format,
        metrics: SinkMetrics,
    ) -> Self {
        let sink_id = Uuid::new_v4();
        info!(%sink_id, ?bucket_size, topics = topics.len(), "opening cloud storage sink");
        Self {
            storage,
            topics,
            bucket_ns: bucket_size.as_nanos() as i64,
            format,
            sink_id,
            buffers: BTreeMap::new(),
            buffered_bytes: 0,
            local_resolved: HlcTimestamp::default(),
            closed: false,
            metrics,
        }
    }

    pub fn sink_id(&self) -> Uuid {
        self.sink_id
    }

    /// Number of open in-memory file buffers.
    pub fn buffered_files(&self) -> usize {
        self.buffers.len()
    }

    fn bucket_start(&self, ts: HlcTimestamp) -> i64 {
        // Wall portion only: logical ticks never split a bucket.
        ts.wall_ns.div_euclid(self.bucket_ns) * self.bucket_ns
    }

    fn data_file_name(&self, key: &FileKey) -> SinkResult<String> {
        Ok(format!(
            "{}-{}-{}-{}{}",
            format_bucket(key.bucket_start)?,
            key.topic,
            key.schema_id,
            self.sink_id,
            self.format.extension(),
        ))
    }

    /// Marker instant: one nanosecond before the start of the bucket
    /// containing `resolved`. That places the marker after every data file
    /// of the previous bucket and before every file of the current one.
    fn resolved_file_name(&self, resolved: HlcTimestamp) -> SinkResult<String> {
        let marker_ns = self.bucket_start(resolved) - 1;
        Ok(format!("{}.RESOLVED", format_bucket(marker_ns)?))
    }

    async fn write_object(&self, name: &str, contents: Bytes) -> SinkResult<()> {
        // Fresh handle per write; the sink keeps no storage connection.
        let mut handle = self.storage.open()?;
        let result = handle.write_file(name, contents).await;
        handle.close().await?;
        result
    }
}

#[async_trait]
impl Sink for CloudStorageSink {
    async fn emit_row(
        &mut self,
        table: &str,
        _key: Bytes,
        value: Bytes,
        updated: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        if updated <= self.local_resolved {
            // Already covered by a prior run of this changefeed.
            debug!(%updated, watermark = %self.local_resolved, "dropping replayed row");
            return Ok(());
        }
        let topic = self.topics.topic_for(table)?;
        let key = FileKey {
            bucket_start: self.bucket_start(updated),
            topic: topic.name.clone(),
            schema_id: topic.schema_id,
        };

        let buffer = self.buffers.entry(key).or_default();
        buffer.extend_from_slice(&value);
        buffer.extend_from_slice(self.format.delimiter());
        self.buffered_bytes += value.len() + self.format.delimiter().len();
        self.metrics.set_buffered_bytes(self.buffered_bytes as i64);
        self.metrics.inc_emitted_rows();
        // TODO: integrate a memory accountant and fail emissions once a
        // configured budget is exceeded instead of buffering without bound.
        Ok(())
    }

    async fn emit_resolved_timestamp(
        &mut self,
        encoder: &dyn Encoder,
        resolved: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        // No per-topic resolved concept here: one global marker object,
        // written through (not buffered) so the caller can retry on failure.
        let payload = encoder.encode_resolved_timestamp("", resolved)?;
        let name = self.resolved_file_name(resolved)?;
        self.write_object(&name, payload).await?;

        self.local_resolved = self.local_resolved.max(resolved);
        self.metrics.inc_files_written(1);
        self.metrics.inc_emitted_resolved();
        Ok(())
    }

    async fn flush(&mut self, ts: HlcTimestamp) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.local_resolved = self.local_resolved.max(ts);

        // Name order equals bucket order here, so earlier files always hit
        // the store before any marker that covers them.
        let to_write: Vec<FileKey> = self
            .buffers
            .keys()
            .filter(|key| key.bucket_start < ts.wall_ns)
            .cloned()
            .collect();

        let mut evict: Vec<FileKey> = Vec::new();
        let mut files_written = 0u64;
        for key in to_write {
            let name = self.data_file_name(&key)?;
            let contents = Bytes::from(self.buffers[&key].clone());
            if let Err(err) = self.write_object(&name, contents).await {
                // Unwritten buffers stay put and retry on the next flush.
                self.metrics.inc_flush_failure();
                return Err(err);
            }
            files_written += 1;
            if key.bucket_start + self.bucket_ns < ts.wall_ns {
                // Bucket fully in the past: nothing can land in it again.
                evict.push(key);
            }
        }

        for key in evict {
            if let Some(buffer) = self.buffers.remove(&key) {
                self.buffered_bytes -= buffer.len();
            }
        }
        self.metrics.set_buffered_bytes(self.buffered_bytes as i64);
        self.metrics.inc_files_written(files_written);
        self.metrics.inc_flush();
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        // Buffers are discarded, not flushed.
        self.buffers.clear();
        self.buffered_bytes = 0;
        self.closed = true;
        Ok(())
    }
}
