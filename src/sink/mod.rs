//! Destination-facing egress layer of the changefeed.
//!
//! A [`Sink`] accepts keyed row emissions and resolved-timestamp markers and
//! delivers them to one destination: a Kafka cluster, a cloud-storage prefix,
//! a test-only SQL table, or an in-process buffer. `flush` is the single
//! synchronization point: once `flush(ts)` returns Ok, every row accepted so
//! far is durably with the destination and the caller may advance its
//! watermark past `ts`.

pub mod buffer;
pub mod cloud;
pub mod kafka;
pub mod metrics;
pub mod sql;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::encoder::Encoder;
use crate::error::{SinkError, SinkResult};
use crate::hlc::HlcTimestamp;
use crate::sink::buffer::BufferSink;
use crate::sink::cloud::CloudStorageSink;
use crate::sink::cloud::storage::{ExportStorageFactory, LocalStorage};
use crate::sink::kafka::{KafkaSink, KafkaSinkConfig};
use crate::sink::metrics::SinkMetrics;
use crate::sink::sql::SqlSink;

/// Uniform emission surface. Callers are single-writer: no two methods are
/// ever invoked concurrently on one instance, which `&mut self` encodes.
///
/// Cancellation is future cancellation. A caller that drops an in-flight
/// `emit_row` or `flush` future must treat the sink as contaminated and close
/// it: the Kafka sink's in-flight accounting is intentionally not rolled back.
#[async_trait]
pub trait Sink: Send {
    /// Enqueue a keyed message on the topic derived from `table`.
    ///
    /// Returns promptly, though it may block on destination backpressure.
    /// Fails if `table` was not declared at construction, if a previously
    /// enqueued message has failed and the failure has not yet been consumed
    /// by `flush`, or if the sink is closed.
    async fn emit_row(
        &mut self,
        table: &str,
        key: Bytes,
        value: Bytes,
        updated: HlcTimestamp,
    ) -> SinkResult<()>;

    /// Emit a resolved-timestamp marker to every topic (and every partition,
    /// where the destination has per-partition ordering).
    async fn emit_resolved_timestamp(
        &mut self,
        encoder: &dyn Encoder,
        resolved: HlcTimestamp,
    ) -> SinkResult<()>;

    /// Block until every message enqueued so far is acknowledged by the
    /// destination. On error, no delivery guarantee holds for any in-flight
    /// message and the caller must rebuild the sink.
    async fn flush(&mut self, ts: HlcTimestamp) -> SinkResult<()>;

    /// Release resources without flushing. Idempotent; emissions after the
    /// first `close` fail.
    fn close(&mut self) -> SinkResult<()>;
}

/// A table under watch, with the schema version its emitted rows carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTable {
    pub name: String,
    pub schema_id: u64,
}

impl WatchedTable {
    pub fn new(name: impl Into<String>, schema_id: u64) -> Self {
        Self {
            name: name.into(),
            schema_id,
        }
    }
}

/// Destination topic for one watched table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub schema_id: u64,
}

/// Finite, closed mapping from watched table to destination topic. Emission
/// on a table outside the set is a fatal error with no side effect.
#[derive(Debug, Clone, Default)]
pub struct TopicSet {
    by_table: BTreeMap<String, Topic>,
}

impl TopicSet {
    /// Topics named exactly after their tables.
    pub fn from_tables(tables: impl IntoIterator<Item = WatchedTable>) -> Self {
        Self::with_topic_namer(tables, |table| table.to_owned())
    }

    /// Topics derived from table names through `namer` (prefixing,
    /// destination-specific sanitization).
    pub fn with_topic_namer(
        tables: impl IntoIterator<Item = WatchedTable>,
        namer: impl Fn(&str) -> String,
    ) -> Self {
        let by_table = tables
            .into_iter()
            .map(|t| {
                let topic = Topic {
                    name: namer(&t.name),
                    schema_id: t.schema_id,
                };
                (t.name, topic)
            })
            .collect();
        Self { by_table }
    }

    pub fn topic_for(&self, table: &str) -> SinkResult<&Topic> {
        self.by_table
            .get(table)
            .ok_or_else(|| SinkError::UndeclaredTopic(table.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.by_table.values()
    }

    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}

/// Which parts of a row the upstream encoder puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// Value bytes only; required by the cloud-storage sinks, whose files
    /// carry no key column.
    ValueOnly,
    /// Key and value.
    KeyValue,
}

/// On-disk / on-wire record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ndjson,
}

impl Format {
    /// File extension including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Ndjson => ".ndjson",
        }
    }

    /// Record delimiter appended after each value in file-shaped sinks.
    pub fn delimiter(&self) -> &'static [u8] {
        match self {
            Format::Ndjson => b"\n",
        }
    }
}

/// Caller-side configuration handed to [`open_sink`] alongside the URI.
#[derive(Clone)]
pub struct SinkOptions {
    pub tables: Vec<WatchedTable>,
    pub envelope: Envelope,
    pub format: Format,
    /// Object-store backend for the cloud schemes. `experimental-nodelocal`
    /// falls back to the local filesystem when absent; the remote schemes
    /// require one.
    pub storage: Option<Arc<dyn ExportStorageFactory>>,
    /// Pre-built metric struct, e.g. to share one registry across sinks.
    pub metrics: Option<SinkMetrics>,
}

impl SinkOptions {
    pub fn new(tables: Vec<WatchedTable>) -> Self {
        Self {
            tables,
            envelope: Envelope::KeyValue,
            format: Format::Ndjson,
            storage: None,
            metrics: None,
        }
    }
}

const CLOUD_SCHEMES: &[&str] = &[
    "experimental-s3",
    "experimental-gs",
    "experimental-nodelocal",
    "experimental-http",
    "experimental-https",
    "experimental-azure",
];

/// Select and construct a sink from a destination URI.
///
/// All validation happens before any external resource is opened: an invalid
/// URI, unknown scheme, or unconsumed query parameter fails synchronously
/// with nothing to tear down. Transient construction faults (broker connect,
/// storage reachability) come back wrapped retryable so the supervisor can
/// rebuild.
pub async fn open_sink(uri: &str, opts: SinkOptions) -> SinkResult<Box<dyn Sink>> {
    if opts.tables.is_empty() {
        return Err(SinkError::Config(anyhow::anyhow!(
            "a sink needs at least one watched table"
        )));
    }
    let parsed = Url::parse(uri).map_err(|e| SinkError::InvalidUri {
        uri: uri.to_owned(),
        reason: e.to_string(),
    })?;
    let mut params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
    let scheme = parsed.scheme().to_ascii_lowercase();

    let metrics = match opts.metrics.clone() {
        Some(m) => m,
        None => SinkMetrics::new()?,
    };

    match scheme.as_str() {
        "buffer" => {
            reject_unknown_params(&params)?;
            Ok(Box::new(BufferSink::new(TopicSet::from_tables(
                opts.tables,
            ))))
        }

        "kafka" => {
            if params.remove("schema_topic").is_some() {
                return Err(SinkError::Unsupported("schema_topic"));
            }
            let topic_prefix = params.remove("topic_prefix").unwrap_or_default();
            reject_unknown_params(&params)?;

            let host = parsed.host_str().ok_or_else(|| SinkError::InvalidUri {
                uri: uri.to_owned(),
                reason: "kafka URIs must carry a broker host".to_owned(),
            })?;
            let brokers = match parsed.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            };

            let topics = TopicSet::with_topic_namer(opts.tables, |table| {
                kafka::sanitize_topic(&format!("{topic_prefix}{table}"))
            });
            let sink = KafkaSink::connect(KafkaSinkConfig::new(brokers), topics, metrics).await?;
            Ok(Box::new(sink))
        }

        s if CLOUD_SCHEMES.contains(&s) => {
            let raw = params
                .remove("bucket_size")
                .ok_or(SinkError::MissingParameter("bucket_size"))?;
            let bucket_size =
                humantime::parse_duration(&raw).map_err(|e| SinkError::InvalidParameter {
                    name: "bucket_size",
                    reason: e.to_string(),
                })?;
            if bucket_size.is_zero() {
                return Err(SinkError::InvalidParameter {
                    name: "bucket_size",
                    reason: "must be positive".to_owned(),
                });
            }
            reject_unknown_params(&params)?;

            if opts.envelope != Envelope::ValueOnly {
                return Err(SinkError::InvalidParameter {
                    name: "envelope",
                    reason: "cloud storage sinks require the value-only envelope".to_owned(),
                });
            }

            let storage: Arc<dyn ExportStorageFactory> = match opts.storage {
                Some(factory) => factory,
                None if s == "experimental-nodelocal" => Arc::new(LocalStorage::new(parsed.path())),
                None => return Err(SinkError::MissingParameter("storage backend")),
            };

            // Reachability check before accepting the configuration.
            let mut probe = storage.open().map_err(SinkError::retryable)?;
            probe.close().await.map_err(SinkError::retryable)?;

            let sink = CloudStorageSink::new(
                storage,
                TopicSet::from_tables(opts.tables),
                bucket_size,
                opts.format,
                metrics,
            );
            Ok(Box::new(sink))
        }

        "experimental-sql" => {
            let mut forwarded: Vec<(String, String)> = Vec::new();
            for name in ["sslcert", "sslkey", "sslmode", "sslrootcert"] {
                if let Some(value) = params.remove(name) {
                    forwarded.push((name.to_owned(), value));
                }
            }
            reject_unknown_params(&params)?;

            let mut dsn = parsed.clone();
            dsn.set_scheme("postgres")
                .map_err(|_| SinkError::InvalidUri {
                    uri: uri.to_owned(),
                    reason: "cannot rewrite scheme to postgres".to_owned(),
                })?;
            dsn.set_query(None);
            if !forwarded.is_empty() {
                let mut pairs = dsn.query_pairs_mut();
                for (name, value) in &forwarded {
                    pairs.append_pair(name, value);
                }
            }

            let sink =
                SqlSink::connect(dsn.as_str(), TopicSet::from_tables(opts.tables), metrics).await?;
            Ok(Box::new(sink))
        }

        other => Err(SinkError::UnknownScheme(other.to_owned())),
    }
}

fn reject_unknown_params(params: &BTreeMap<String, String>) -> SinkResult<()> {
    match params.keys().next() {
        Some(key) => Err(SinkError::UnknownParameter(key.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::cloud::storage::MemoryStorage;

    fn tables() -> Vec<WatchedTable> {
        vec![
            WatchedTable::new("orders", 1),
            WatchedTable::new("users", 1),
        ]
    }

    fn expect_err<T>(result: SinkResult<T>) -> SinkError {
        match result {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn topic_set_rejects_undeclared_tables() {
        let topics = TopicSet::from_tables(tables());
        assert_eq!(topics.len(), 2);
        assert_eq!(topics.topic_for("orders").unwrap().name, "orders");
        assert!(matches!(
            topics.topic_for("payments"),
            Err(SinkError::UndeclaredTopic(t)) if t == "payments"
        ));
    }

    #[tokio::test]
    async fn empty_table_set_is_rejected() {
        let err = expect_err(open_sink("buffer://", SinkOptions::new(Vec::new())).await);
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[tokio::test]
    async fn unknown_scheme_fails() {
        let err = expect_err(open_sink("carrier-pigeon://loft", SinkOptions::new(tables())).await);
        assert!(matches!(err, SinkError::UnknownScheme(s) if s == "carrier-pigeon"));
    }

    #[tokio::test]
    async fn unknown_parameter_fails_before_construction() {
        let err = expect_err(open_sink("buffer://?frobnicate=1", SinkOptions::new(tables())).await);
        assert!(matches!(err, SinkError::UnknownParameter(p) if p == "frobnicate"));
    }

    #[tokio::test]
    async fn kafka_schema_topic_is_unsupported() {
        let err = expect_err(
            open_sink(
                "kafka://broker:9092?schema_topic=s",
                SinkOptions::new(tables()),
            )
            .await,
        );
        assert!(matches!(err, SinkError::Unsupported("schema_topic")));
    }

    #[tokio::test]
    async fn cloud_requires_bucket_size() {
        let mut opts = SinkOptions::new(tables());
        opts.envelope = Envelope::ValueOnly;
        opts.storage = Some(Arc::new(MemoryStorage::default()));
        let err = expect_err(open_sink("experimental-s3://bucket/prefix", opts).await);
        assert!(matches!(err, SinkError::MissingParameter("bucket_size")));
    }

    #[tokio::test]
    async fn cloud_rejects_malformed_bucket_size() {
        let mut opts = SinkOptions::new(tables());
        opts.envelope = Envelope::ValueOnly;
        opts.storage = Some(Arc::new(MemoryStorage::default()));
        let err = expect_err(
            open_sink("experimental-s3://bucket/prefix?bucket_size=shortly", opts).await,
        );
        assert!(matches!(
            err,
            SinkError::InvalidParameter {
                name: "bucket_size",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cloud_requires_value_only_envelope() {
        let mut opts = SinkOptions::new(tables());
        opts.storage = Some(Arc::new(MemoryStorage::default()));
        let err =
            expect_err(open_sink("experimental-s3://bucket/prefix?bucket_size=10s", opts).await);
        assert!(matches!(
            err,
            SinkError::InvalidParameter {
                name: "envelope",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cloud_sink_constructs_with_supplied_storage() {
        let mut opts = SinkOptions::new(tables());
        opts.envelope = Envelope::ValueOnly;
        opts.storage = Some(Arc::new(MemoryStorage::default()));
        let sink = open_sink("experimental-s3://bucket/prefix?bucket_size=10s", opts).await;
        assert!(sink.is_ok());
    }

    #[tokio::test]
    async fn buffer_sink_constructs() {
        assert!(
            open_sink("buffer://", SinkOptions::new(tables()))
                .await
                .is_ok()
        );
    }
}
