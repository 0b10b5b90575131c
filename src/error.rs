use thiserror::Error;

/// Crate-wide result type.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Stable textual marker carried by every retryable error.
///
/// The supervisor may see these errors flattened to strings after crossing a
/// distributed-query boundary, so recognition falls back to substring match on
/// this exact text. Changing it breaks mixed-version clusters; see the pinning
/// test below.
pub const RETRYABLE_SINK_ERROR_MARKER: &str = "retryable changefeed sink error";

#[derive(Debug, Error)]
pub enum SinkError {
    // =========
    // URI / options / construction
    // =========
    #[error("invalid sink URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported sink scheme: {0}")]
    UnknownScheme(String),

    #[error("unknown sink parameter: {0}")]
    UnknownParameter(String),

    #[error("missing sink parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid sink parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("{0} is not yet supported")]
    Unsupported(&'static str),

    #[error("sink configuration error: {0}")]
    Config(#[source] anyhow::Error),

    // =========
    // Emission
    // =========
    #[error("cannot emit to undeclared topic for table '{0}'")]
    UndeclaredTopic(String),

    #[error("sink is closed")]
    Closed,

    #[error("failed to encode resolved timestamp: {0}")]
    Encode(String),

    // =========
    // External systems
    // =========
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    // =========
    // Metrics / Prometheus
    // =========
    #[error("Prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========
    // Retryable wrapper
    // =========
    /// Transient infrastructure fault. The outer supervisor tears the sink
    /// down and rebuilds it from the last committed watermark instead of
    /// failing the changefeed.
    #[error("retryable changefeed sink error: {0}")]
    Retryable(#[source] Box<SinkError>),
}

impl SinkError {
    /// Wrap an error as retryable. Already-retryable errors pass through
    /// unchanged so the marker appears exactly once in the message.
    pub fn retryable(err: impl Into<SinkError>) -> SinkError {
        match err.into() {
            e @ SinkError::Retryable(_) => e,
            e => SinkError::Retryable(Box::new(e)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable(_))
    }
}

/// Recognize a retryable sink error by type identity or, for errors that were
/// flattened to text at a process boundary, by the stable marker substring.
pub fn is_retryable_sink_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(sink_err) = e.downcast_ref::<SinkError>() {
            if sink_err.is_retryable() {
                return true;
            }
        }
        cur = e.source();
    }
    err.to_string().contains(RETRYABLE_SINK_ERROR_MARKER)
}
