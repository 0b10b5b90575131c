//! Test-only relational sink: rows land in a single `sink_rows` table with a
//! synthetic partition column, so ordering tests can assert the same
//! per-(topic, partition) guarantees the Kafka sink gives.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::encoder::Encoder;
use crate::error::{SinkError, SinkResult};
use crate::hlc::HlcTimestamp;
use crate::sink::kafka::partitioner::partition_for_key;
use crate::sink::metrics::SinkMetrics;
use crate::sink::{Sink, TopicSet};

/// Fixed synthetic partition count per topic.
pub const SQL_SINK_PARTITIONS: i32 = 3;

/// Rows buffered before an implicit flush kicks in.
const BATCH_ROWS: usize = 3;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sink_rows (
  topic STRING,
  partition INT,
  message_id INT,
  key BYTES,
  value BYTES,
  resolved BYTES,
  PRIMARY KEY (topic, partition, message_id)
)
"#;

/// Node-local generator for unique, strictly increasing message ids. Clock
/// driven so ids stay roughly sortable across restarts; ties and clock
/// regressions fall back to last-plus-one.
#[derive(Debug, Default)]
struct MessageIdGen {
    last: i64,
}

impl MessageIdGen {
    fn next(&mut self) -> i64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(self.last + 1);
        self.last = now.max(self.last + 1);
        self.last
    }
}

#[derive(Debug)]
struct SqlRow {
    topic: String,
    partition: i32,
    message_id: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    resolved: Option<Vec<u8>>,
}

pub struct SqlSink {
    pool: Option<PgPool>,
    topics: TopicSet,
    rows: Vec<SqlRow>,
    ids: MessageIdGen,
    metrics: SinkMetrics,
}

impl SqlSink {
    /// Connect and create the sink table if it does not exist yet.
    /// Connection faults are retryable; the supervisor rebuilds.
    pub async fn connect(dsn: &str, topics: TopicSet, metrics: SinkMetrics) -> SinkResult<Self> {
        info!(topics = topics.len(), "connecting sql sink");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(dsn)
            .await
            .map_err(|e| SinkError::retryable(SinkError::Sqlx(e)))?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        Ok(Self {
            pool: Some(pool),
            topics,
            rows: Vec::new(),
            ids: MessageIdGen::default(),
            metrics,
        })
    }

    fn push_row(&mut self, row: SqlRow) {
        self.rows.push(row);
    }

    /// Write the buffered rows as one multi-row INSERT and truncate the
    /// buffer. No-op when empty.
    async fn flush_rows(&mut self) -> SinkResult<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let pool = self.pool.as_ref().ok_or(SinkError::Closed)?;

        debug!(rows = self.rows.len(), "flushing sql sink batch");
        {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO sink_rows ("topic", "partition", "message_id", "key", "value", "resolved") "#,
            );
            qb.push_values(self.rows.iter(), |mut b, row| {
                b.push_bind(row.topic.as_str())
                    .push_bind(row.partition)
                    .push_bind(row.message_id)
                    .push_bind(row.key.as_deref())
                    .push_bind(row.value.as_deref())
                    .push_bind(row.resolved.as_deref());
            });
            qb.build().execute(pool).await?;
        }
        self.rows.clear();
        Ok(())
    }

    async fn maybe_flush(&mut self) -> SinkResult<()> {
        if self.rows.len() >= BATCH_ROWS {
            self.flush_rows().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for SqlSink {
    async fn emit_row(
        &mut self,
        table: &str,
        key: Bytes,
        value: Bytes,
        _updated: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.pool.is_none() {
            return Err(SinkError::Closed);
        }
        let topic = self.topics.topic_for(table)?.name.clone();
        let row = SqlRow {
            topic,
            partition: partition_for_key(&key, SQL_SINK_PARTITIONS),
            message_id: self.ids.next(),
            key: Some(key.to_vec()),
            value: Some(value.to_vec()),
            resolved: None,
        };
        self.push_row(row);
        self.metrics.inc_emitted_rows();
        self.maybe_flush().await
    }

    async fn emit_resolved_timestamp(
        &mut self,
        encoder: &dyn Encoder,
        resolved: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.pool.is_none() {
            return Err(SinkError::Closed);
        }
        // Per-partition ordering here, so each synthetic partition gets its
        // own marker row.
        let topics: Vec<String> = self.topics.iter().map(|t| t.name.clone()).collect();
        for topic in topics {
            let payload = encoder.encode_resolved_timestamp(&topic, resolved)?;
            for partition in 0..SQL_SINK_PARTITIONS {
                let row = SqlRow {
                    topic: topic.clone(),
                    partition,
                    message_id: self.ids.next(),
                    key: None,
                    value: None,
                    resolved: Some(payload.to_vec()),
                };
                self.push_row(row);
                self.maybe_flush().await?;
            }
        }
        self.metrics.inc_emitted_resolved();
        Ok(())
    }

    async fn flush(&mut self, _ts: HlcTimestamp) -> SinkResult<()> {
        if self.pool.is_none() {
            return Err(SinkError::Closed);
        }
        let result = self.flush_rows().await;
        match &result {
            Ok(()) => self.metrics.inc_flush(),
            Err(_) => self.metrics.inc_flush_failure(),
        }
        result
    }

    fn close(&mut self) -> SinkResult<()> {
        // Dropping the handle releases the pool; buffered rows are discarded.
        self.pool = None;
        self.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::JsonEncoder;
    use crate::sink::WatchedTable;

    #[test]
    fn message_ids_are_strictly_increasing() {
        let mut ids = MessageIdGen::default();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn partition_is_stable_for_equal_keys() {
        let a = partition_for_key(b"k1", SQL_SINK_PARTITIONS);
        let b = partition_for_key(b"k1", SQL_SINK_PARTITIONS);
        assert_eq!(a, b);
        assert!((0..SQL_SINK_PARTITIONS).contains(&a));
    }

    // Needs a reachable Postgres/CockroachDB at SQL_SINK_TEST_DSN.
    #[ignore]
    #[tokio::test]
    async fn writes_batches_and_resolved_rows() {
        let dsn = std::env::var("SQL_SINK_TEST_DSN")
            .unwrap_or_else(|_| "postgres://root@127.0.0.1:26257/defaultdb".to_owned());
        let topics = TopicSet::from_tables(vec![WatchedTable::new("t", 1)]);
        let mut sink = SqlSink::connect(&dsn, topics, SinkMetrics::new().unwrap())
            .await
            .expect("failed to connect");

        for i in 0..7u32 {
            sink.emit_row(
                "t",
                Bytes::from(format!("k{}", i % 2)),
                Bytes::from(format!("v{i}")),
                HlcTimestamp::from_wall(i as i64),
            )
            .await
            .expect("emit failed");
        }
        sink.emit_resolved_timestamp(&JsonEncoder, HlcTimestamp::from_wall(10))
            .await
            .expect("resolved emit failed");
        sink.flush(HlcTimestamp::from_wall(10))
            .await
            .expect("flush failed");
        sink.close().expect("close failed");
    }
}
