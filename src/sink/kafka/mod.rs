//! Kafka sink: one producer connection, pipelined produce with in-flight
//! accounting, and a flush barrier driven by delivery callbacks.
//!
//! librdkafka's poll thread plays the background-worker role: every
//! `delivery()` callback decrements the in-flight counter, latches the first
//! error, and fires the pending flush signal when the counter drains.

mod flush;
pub mod partitioner;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, Producer, ProducerContext, PurgeConfig, ThreadedProducer,
};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use crate::encoder::Encoder;
use crate::error::{SinkError, SinkResult};
use crate::hlc::HlcTimestamp;
use crate::sink::kafka::flush::{FlushCheck, FlushTracker};
use crate::sink::kafka::partitioner::KeyHashPartitioner;
use crate::sink::metrics::SinkMetrics;
use crate::sink::{Sink, TopicSet};

/// Kafka topic names allow `[a-zA-Z0-9._-]` up to 249 bytes; everything else
/// in a table-derived name is replaced with `_`.
pub fn sanitize_topic(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(249);
    out
}

#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    pub brokers: String,
    /// How often the per-topic partition list is refreshed for resolved
    /// fan-out. Staleness is tolerable: a newly created partition misses
    /// this marker and observes the next one.
    pub metadata_refresh: Duration,
    /// Broker metadata RPC timeout.
    pub metadata_timeout: Duration,
    /// Delivery report deadline. Bounds how long a flush can wait on a
    /// wedged broker before the failure is surfaced.
    pub message_timeout: Duration,
}

impl KafkaSinkConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            metadata_refresh: Duration::from_secs(60),
            metadata_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
        }
    }
}

/// Hard cap on messages queued in the producer. A full queue surfaces as
/// QueueFull, which the emit path turns into backpressure.
const PRODUCER_QUEUE_CAP: usize = 1000;

/// Pause between QueueFull retries while waiting for the producer queue to
/// drain.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

struct SinkProducerContext {
    tracker: Arc<FlushTracker>,
    partitioner: KeyHashPartitioner,
}

impl ClientContext for SinkProducerContext {}

impl ProducerContext<KeyHashPartitioner> for SinkProducerContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: ()) {
        match result {
            Ok(_) => {
                self.tracker.completed(Ok(()));
            }
            Err((err, _)) => {
                warn!(error = %err, "kafka delivery failed");
                self.tracker.completed(Err(err.clone()));
            }
        }
    }

    fn get_custom_partitioner(&self) -> Option<&KeyHashPartitioner> {
        Some(&self.partitioner)
    }
}

pub struct KafkaSink {
    producer: Option<ThreadedProducer<SinkProducerContext, KeyHashPartitioner>>,
    topics: TopicSet,
    tracker: Arc<FlushTracker>,
    metrics: SinkMetrics,
    config: KafkaSinkConfig,
    /// Partition ids per topic, for resolved fan-out.
    partitions: BTreeMap<String, Vec<i32>>,
    partitions_refreshed: Option<Instant>,
}

impl KafkaSink {
    /// Build the producer and verify the cluster is reachable. Connectivity
    /// failures come back retryable so the supervisor can rebuild.
    pub async fn connect(
        config: KafkaSinkConfig,
        topics: TopicSet,
        metrics: SinkMetrics,
    ) -> SinkResult<Self> {
        info!(brokers = %config.brokers, topics = topics.len(), "connecting kafka sink");

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            // Positive broker acknowledgements; a local write is not enough.
            .set("acks", "all")
            // Dispatch immediately when the link is idle, batch when busy.
            .set("linger.ms", "0")
            .set(
                "queue.buffering.max.messages",
                PRODUCER_QUEUE_CAP.to_string(),
            )
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            );

        let tracker = Arc::new(FlushTracker::default());
        let context = SinkProducerContext {
            tracker: Arc::clone(&tracker),
            partitioner: KeyHashPartitioner,
        };
        let producer: ThreadedProducer<SinkProducerContext, KeyHashPartitioner> = client_config
            .create_with_context(context)
            .map_err(SinkError::retryable)?;

        // Reachability check before the sink is handed out.
        producer
            .client()
            .fetch_metadata(None, Timeout::After(config.metadata_timeout))
            .map_err(SinkError::retryable)?;

        Ok(Self {
            producer: Some(producer),
            topics,
            tracker,
            metrics,
            config,
            partitions: BTreeMap::new(),
            partitions_refreshed: None,
        })
    }

    /// Messages submitted to the producer and not yet acknowledged.
    pub fn inflight(&self) -> u64 {
        self.tracker.inflight()
    }

    /// Hand one record to the producer, treating a full queue as
    /// backpressure rather than failure.
    async fn produce(&self, mut record: BaseRecord<'_, [u8], [u8]>) -> SinkResult<()> {
        let producer = self.producer.as_ref().ok_or(SinkError::Closed)?;
        let inflight = self.tracker.submitted();
        self.metrics.set_inflight(inflight as i64);
        loop {
            match producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), rejected)) => {
                    record = rejected;
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((err, _)) => {
                    self.tracker.abandoned();
                    return Err(SinkError::Kafka(err));
                }
            }
        }
    }

    /// Refresh the per-topic partition lists if the cache has aged out.
    fn refresh_partitions(&mut self) -> SinkResult<()> {
        let fresh = self
            .partitions_refreshed
            .is_some_and(|at| at.elapsed() < self.config.metadata_refresh);
        if fresh {
            return Ok(());
        }
        let producer = self.producer.as_ref().ok_or(SinkError::Closed)?;

        let mut partitions = BTreeMap::new();
        for topic in self.topics.iter() {
            let metadata = producer
                .client()
                .fetch_metadata(
                    Some(&topic.name),
                    Timeout::After(self.config.metadata_timeout),
                )
                .map_err(SinkError::retryable)?;
            let ids: Vec<i32> = metadata
                .topics()
                .iter()
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            debug!(topic = %topic.name, partitions = ids.len(), "refreshed partition metadata");
            partitions.insert(topic.name.clone(), ids);
        }
        self.partitions = partitions;
        self.partitions_refreshed = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn emit_row(
        &mut self,
        table: &str,
        key: Bytes,
        value: Bytes,
        _updated: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.producer.is_none() {
            return Err(SinkError::Closed);
        }
        // A delivery failure poisons the sink until a flush consumes it.
        if let Some(err) = self.tracker.latched_error() {
            return Err(SinkError::retryable(SinkError::Kafka(err)));
        }
        let topic = self.topics.topic_for(table)?.name.clone();

        let record = BaseRecord::<[u8], [u8]>::to(&topic)
            .key(key.as_ref())
            .payload(value.as_ref());
        self.produce(record).await?;
        self.metrics.inc_emitted_rows();
        Ok(())
    }

    async fn emit_resolved_timestamp(
        &mut self,
        encoder: &dyn Encoder,
        resolved: HlcTimestamp,
    ) -> SinkResult<()> {
        if self.producer.is_none() {
            return Err(SinkError::Closed);
        }
        self.refresh_partitions()?;

        // Destinations with per-partition ordering get the marker on every
        // known partition; librdkafka copies the payload at enqueue, so one
        // encoded buffer per topic is enough.
        let topics: Vec<(String, Vec<i32>)> = self
            .topics
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    self.partitions.get(&t.name).cloned().unwrap_or_default(),
                )
            })
            .collect();

        for (topic, partitions) in topics {
            let payload = encoder.encode_resolved_timestamp(&topic, resolved)?;
            for partition in partitions {
                let record = BaseRecord::<[u8], [u8]>::to(&topic)
                    .partition(partition)
                    .payload(payload.as_ref());
                self.produce(record).await?;
            }
        }
        self.metrics.inc_emitted_resolved();
        Ok(())
    }

    async fn flush(&mut self, _ts: HlcTimestamp) -> SinkResult<()> {
        if self.producer.is_none() {
            return Err(SinkError::Closed);
        }
        let result = match self.tracker.begin_flush() {
            FlushCheck::Idle => Ok(()),
            FlushCheck::Failed(err) => Err(SinkError::retryable(SinkError::Kafka(err))),
            FlushCheck::Pending(signal) => {
                // The signal sender only drops with the tracker itself; either
                // way, the sticky error is the source of truth after waking.
                let _ = signal.await;
                match self.tracker.take_error() {
                    Some(err) => Err(SinkError::retryable(SinkError::Kafka(err))),
                    None => Ok(()),
                }
            }
        };
        self.metrics.set_inflight(self.tracker.inflight() as i64);
        match &result {
            Ok(()) => self.metrics.inc_flush(),
            Err(_) => self.metrics.inc_flush_failure(),
        }
        result
    }

    fn close(&mut self) -> SinkResult<()> {
        if let Some(producer) = self.producer.take() {
            // close() does not flush: drop whatever is still queued.
            producer.purge(PurgeConfig::default().queue().inflight());
        }
        Ok(())
    }
}
