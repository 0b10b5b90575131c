use crate::error::SinkResult;

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Per-sink metric struct. Cloned into each sink instance; all clones share
/// the same registry, so one scrape covers every sink a job opened.
#[derive(Clone, Debug)]
pub struct SinkMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    // --------------------------------------------
    // Throughput
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub emitted_rows_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub emitted_resolved_total: IntCounter,

    // --------------------------------------------
    // Flush outcomes
    // --------------------------------------------
    #[cfg(feature = "metrics")]
    pub flushes_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub flush_failures_total: IntCounter,

    // --------------------------------------------
    // Backpressure-ish signals
    // --------------------------------------------
    /// Messages submitted to the Kafka producer and not yet acknowledged.
    #[cfg(feature = "metrics")]
    pub inflight_messages: IntGauge,

    /// Bytes buffered in memory by the cloud-storage sink.
    #[cfg(feature = "metrics")]
    pub buffered_bytes: IntGauge,

    #[cfg(feature = "metrics")]
    pub files_written_total: IntCounter,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl SinkMetrics {
    pub fn new() -> SinkResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let emitted_rows_total = IntCounter::with_opts(Opts::new(
                "changefeed_sink_emitted_rows_total",
                "Rows accepted by the sink",
            ))?;

            let emitted_resolved_total = IntCounter::with_opts(Opts::new(
                "changefeed_sink_emitted_resolved_total",
                "Resolved timestamps emitted by the sink",
            ))?;

            let flushes_total = IntCounter::with_opts(Opts::new(
                "changefeed_sink_flushes_total",
                "Successful sink flushes",
            ))?;

            let flush_failures_total = IntCounter::with_opts(Opts::new(
                "changefeed_sink_flush_failures_total",
                "Sink flushes that surfaced an error",
            ))?;

            let inflight_messages = IntGauge::with_opts(Opts::new(
                "changefeed_sink_inflight_messages",
                "Messages submitted to the producer and not yet acknowledged",
            ))?;

            let buffered_bytes = IntGauge::with_opts(Opts::new(
                "changefeed_sink_buffered_bytes",
                "Bytes buffered in memory awaiting flush (cloud storage sink)",
            ))?;

            let files_written_total = IntCounter::with_opts(Opts::new(
                "changefeed_sink_files_written_total",
                "Files written to object storage (data files and resolved markers)",
            ))?;

            registry.register(Box::new(emitted_rows_total.clone()))?;
            registry.register(Box::new(emitted_resolved_total.clone()))?;
            registry.register(Box::new(flushes_total.clone()))?;
            registry.register(Box::new(flush_failures_total.clone()))?;
            registry.register(Box::new(inflight_messages.clone()))?;
            registry.register(Box::new(buffered_bytes.clone()))?;
            registry.register(Box::new(files_written_total.clone()))?;

            Ok(Self {
                registry,
                emitted_rows_total,
                emitted_resolved_total,
                flushes_total,
                flush_failures_total,
                inflight_messages,
                buffered_bytes,
                files_written_total,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> SinkResult<String> {
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ------------------------------------------------------------
    // No-op helpers (compile away when metrics feature is off)
    // ------------------------------------------------------------

    #[inline]
    pub fn inc_emitted_rows(&self) {
        #[cfg(feature = "metrics")]
        self.emitted_rows_total.inc();
    }

    #[inline]
    pub fn inc_emitted_resolved(&self) {
        #[cfg(feature = "metrics")]
        self.emitted_resolved_total.inc();
    }

    #[inline]
    pub fn inc_flush(&self) {
        #[cfg(feature = "metrics")]
        self.flushes_total.inc();
    }

    #[inline]
    pub fn inc_flush_failure(&self) {
        #[cfg(feature = "metrics")]
        self.flush_failures_total.inc();
    }

    #[inline]
    pub fn set_inflight(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.inflight_messages.set(_n);
    }

    #[inline]
    pub fn set_buffered_bytes(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.buffered_bytes.set(_n);
    }

    #[inline]
    pub fn inc_files_written(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.files_written_total.inc_by(_n);
    }
}
