//! In-process sink used by tests and by the core changefeed loop before a
//! real destination is attached: emissions queue in memory and are popped by
//! the consumer.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use crate::encoder::Encoder;
use crate::error::{SinkError, SinkResult};
use crate::hlc::HlcTimestamp;
use crate::sink::{Sink, TopicSet};

/// One queued emission. Unused fields stay `None`: a row carries topic, key,
/// and value; a resolved timestamp carries only the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRow {
    pub topic: Option<String>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct BufferSink {
    topics: TopicSet,
    rows: VecDeque<BufferedRow>,
    closed: bool,
}

impl BufferSink {
    pub fn new(topics: TopicSet) -> Self {
        Self {
            topics,
            rows: VecDeque::new(),
            closed: false,
        }
    }

    /// Pop the oldest queued emission.
    pub fn pop(&mut self) -> Option<BufferedRow> {
        self.rows.pop_front()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl Sink for BufferSink {
    async fn emit_row(
        &mut self,
        table: &str,
        key: Bytes,
        value: Bytes,
        _updated: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let topic = self.topics.topic_for(table)?.name.clone();
        self.rows.push_back(BufferedRow {
            topic: Some(topic),
            key: Some(key),
            value: Some(value),
        });
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
        // No per-topic resolved concept: encode with an empty topic.
        let payload = encoder.encode_resolved_timestamp("", resolved)?;
        self.rows.push_back(BufferedRow {
            topic: None,
            key: None,
            value: Some(payload),
        });
        Ok(())
    }

    async fn flush(&mut self, _ts: HlcTimestamp) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        self.closed = true;
        Ok(())
    }
}
