use bytes::Bytes;

use crate::error::SinkResult;
use crate::hlc::HlcTimestamp;

/// Row/resolved-timestamp encoding is owned upstream by the changefeed job;
/// sinks only need the resolved-timestamp half of it.
pub trait Encoder: Send + Sync {
    /// Encode a resolved-timestamp payload for `topic`.
    ///
    /// `topic` may be empty when the destination has no per-topic resolved
    /// concept (the buffer and object-store sinks).
    fn encode_resolved_timestamp(&self, topic: &str, resolved: HlcTimestamp) -> SinkResult<Bytes>;
}

/// ndjson resolved payloads, e.g. `{"resolved":"1700000000000000000.0000000000"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode_resolved_timestamp(&self, _topic: &str, resolved: HlcTimestamp) -> SinkResult<Bytes> {
        let payload = serde_json::json!({ "resolved": resolved.to_string() });
        Ok(Bytes::from(serde_json::to_vec(&payload)?))
    }
}
