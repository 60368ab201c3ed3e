use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use time::macros::format_description;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feed_loader::batch::FlushThreshold;
use feed_loader::decoder::{DecodeOptions, MessageCountMode};
use feed_loader::encoding::{CompositeKeyEncoder, Encoder, TimeKeyEncoder};
use feed_loader::pipeline::{ErrorPolicy, IngestionPipeline, PipelineConfig, default_workers};
use feed_loader::protocol::TypecodeSet;
use feed_loader::sink::{FramedFileSink, SerializedSink, Sink};
use feed_loader::source::PayloadFile;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnError {
    /// Stop the run on the first malformed payload
    Abort,
    /// Log it, keep what decoded, continue
    Skip,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Encoding {
    /// Time-ordered unique keys
    Composite,
    /// Legacy `::<timestamp>` keys, one entry per nanosecond
    Time,
}

#[derive(Debug, Parser)]
#[command(version, about = "Decode market-data transport payloads and load them into a frame log")]
struct Args {
    /// Payload captures ([len:u32][payload]..., optionally gzipped); `-` reads stdin
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output log path; defaults to loads/feed_YYYY_MM_DD.log
    #[arg(long, env = "FEED_OUT")]
    out: Option<PathBuf>,

    /// Typecodes to decode (e.g. T85 for trades and price levels)
    #[arg(long, env = "FEED_ALLOW", default_value = "T85")]
    allow: String,

    /// Worker threads; defaults to twice the available parallelism
    #[arg(long, env = "FEED_WORKERS")]
    workers: Option<usize>,

    /// Payloads buffered between reader and workers
    #[arg(long, env = "FEED_QUEUE", default_value_t = 1024)]
    queue: usize,

    /// Flush a worker's batch after this many writes
    #[arg(long, env = "FEED_BATCH_RECORDS", default_value_t = 4096)]
    batch_records: usize,

    /// Flush by accumulated key+value bytes instead of record count
    #[arg(long, env = "FEED_BATCH_BYTES")]
    batch_bytes: Option<usize>,

    /// Walk message_count - 1 messages per frame
    #[arg(long, default_value_t = false)]
    skip_last: bool,

    /// Decode bytes past payload_length as further transport frames
    #[arg(long, default_value_t = false)]
    chained: bool,

    /// Write symbol:: dictionary entries
    #[arg(long, default_value_t = false)]
    symbols: bool,

    #[arg(long, value_enum, env = "FEED_ON_ERROR", default_value_t = OnError::Abort)]
    on_error: OnError,

    #[arg(long, value_enum, env = "FEED_ENCODING", default_value_t = Encoding::Composite)]
    encoding: Encoding,

    /// Route batches through one dedicated writer thread with this queue depth
    #[arg(long)]
    writer_queue: Option<usize>,
}

fn default_out_path() -> PathBuf {
    let stamp = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .format(format_description!("[year]_[month]_[day]"))
        .unwrap_or_else(|_| "undated".to_string());
    let mut p = PathBuf::from("loads");
    p.push(format!("feed_{stamp}.log"));
    p
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let allowed = TypecodeSet::from_chars(&args.allow);
    if allowed.iter().next().is_none() {
        bail!("--allow must name at least one typecode");
    }
    let config = PipelineConfig {
        workers: args.workers.unwrap_or_else(default_workers),
        queue_capacity: args.queue,
        threshold: match args.batch_bytes {
            Some(n) => FlushThreshold::Bytes(n),
            None => FlushThreshold::Records(args.batch_records),
        },
        decode: DecodeOptions {
            allowed,
            message_count: if args.skip_last { MessageCountMode::SkipLast } else { MessageCountMode::Declared },
            chained: args.chained,
            keep_generic: false,
        },
        on_decode_error: match args.on_error {
            OnError::Abort => ErrorPolicy::Abort,
            OnError::Skip => ErrorPolicy::SkipPayload,
        },
        symbol_dictionary: args.symbols,
    };
    let encoder: Arc<dyn Encoder> = match args.encoding {
        Encoding::Composite => Arc::new(CompositeKeyEncoder),
        Encoding::Time => Arc::new(TimeKeyEncoder),
    };

    let out_path = args.out.clone().unwrap_or_else(default_out_path);
    let file_sink = FramedFileSink::open(&out_path, encoder.name())
        .with_context(|| format!("open output {}", out_path.display()))?;
    let sink: Arc<dyn Sink> = match args.writer_queue {
        Some(depth) => Arc::new(SerializedSink::spawn(Arc::new(file_sink), depth).context("start writer stage")?),
        None => Arc::new(file_sink),
    };

    info!(
        out = %out_path.display(),
        encoding = encoder.name(),
        allow = ?config.decode.allowed,
        workers = config.workers,
        "loading"
    );
    let started = Instant::now();
    let pipeline = IngestionPipeline::spawn(config, encoder, sink).context("start pipeline")?;

    let mut read_error = None;
    'inputs: for input in &args.inputs {
        let source = match PayloadFile::open(input) {
            Ok(s) => s,
            Err(e) => {
                read_error = Some(anyhow::Error::new(e).context(format!("open {}", input.display())));
                break;
            }
        };
        let mut payloads = 0usize;
        for payload in source {
            let payload = match payload {
                Ok(p) => p,
                Err(e) => {
                    read_error = Some(anyhow::Error::new(e).context(format!("read {}", input.display())));
                    break 'inputs;
                }
            };
            if pipeline.submit(payload).is_err() {
                warn!(input = %input.display(), "pipeline stopped accepting payloads");
                break 'inputs;
            }
            payloads += 1;
        }
        info!(input = %input.display(), payloads, "input queued");
    }

    // Drain whatever was queued before surfacing a read failure.
    let stats = pipeline.finish().context("ingest")?;
    if let Some(e) = read_error {
        return Err(e);
    }
    info!(
        payloads = stats.payloads,
        records = stats.records,
        writes = stats.writes,
        batches = stats.batches,
        decode_errors = stats.decode_errors,
        empty = stats.empty_payloads,
        mib = stats.bytes as f64 / (1 << 20) as f64,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "done"
    );
    Ok(())
}
