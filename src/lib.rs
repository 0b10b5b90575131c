//! Egress layer of a changefeed: delivery of row-level changes and resolved
//! timestamps to Kafka, cloud storage, a test-only SQL table, or an
//! in-process buffer, behind one [`Sink`] contract.
//!
//! The changefeed job owns change capture, row encoding, and the retry
//! supervisor; this crate owns partitioning, batching, and the
//! flush-ordering protocol that makes watermark advancement safe. Delivery
//! is at-least-once: duplicates are expected, losses are not.

pub mod encoder;
pub mod error;
pub mod hlc;
pub mod sink;

pub use encoder::{Encoder, JsonEncoder};
pub use error::{RETRYABLE_SINK_ERROR_MARKER, SinkError, SinkResult, is_retryable_sink_error};
pub use hlc::HlcTimestamp;
pub use sink::{Envelope, Format, Sink, SinkOptions, Topic, TopicSet, WatchedTable, open_sink};

#[cfg(test)]
mod tests;
