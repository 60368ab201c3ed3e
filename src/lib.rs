//! Market-data feed loader library.
//!
//! This crate provides the core types and logic used by the `feed-loader`
//! ingest binary and the `dump` inspection tool:
//!
//! - `protocol`: wire types of the binary transport (header, envelope,
//!   trade/quote/price-level messages) and a frame builder for fixtures
//! - `decoder`: pure payload decoder with `mLength` resynchronization,
//!   typecode filtering and partial results on truncation
//! - `encoding`: record to key/value mappings persisted by sinks
//! - `batch`: per-worker write accumulator and flush thresholds
//! - `sink`: storage capability plus in-memory, framed-file and
//!   single-writer adapters
//! - `record`: CRC-checked frame log schema shared by the file sink and `dump`
//! - `source`: payload sources feeding the pipeline
//! - `pipeline`: bounded queue, worker pool and drain/abort handling
pub mod batch;
pub mod decoder;
pub mod encoding;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod record;
pub mod sink;
pub mod source;

pub use batch::{Batch, BatchAccumulator, FlushThreshold};
pub use decoder::{DecodeOptions, Decoded, MessageCountMode, SeenSymbols, decode};
pub use encoding::{CompositeKeyEncoder, Encoder, TimeKeyEncoder};
pub use error::{DecodeError, PipelineError, SinkError, Truncation};
pub use pipeline::{ErrorPolicy, IngestionPipeline, PipelineConfig, PipelineStats};
pub use protocol::Record;
pub use sink::{FramedFileSink, MemorySink, SerializedSink, Sink};
pub use source::{PacketSource, PayloadFile};
