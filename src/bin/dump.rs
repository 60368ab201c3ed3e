use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use feed_loader::batch::Write;
use feed_loader::encoding::{Encoder, by_name};
use feed_loader::protocol::format_timestamp;
use feed_loader::record::{FrameReader, RecordFrame};

#[derive(Debug, Parser)]
#[command(about = "Print the contents of a feed-loader frame log")]
struct Args {
    /// Log written by feed-loader
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Stop after this many writes
    #[arg(long)]
    limit: Option<usize>,

    /// Print keys and values as hex instead of decoding them
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// Only print per-typecode counts
    #[arg(long, default_value_t = false)]
    summary: bool,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn line(encoder: Option<&Arc<dyn Encoder>>, write: &Write, raw: bool) -> String {
    let described = if raw { None } else { encoder.and_then(|e| e.describe(write)) };
    described.unwrap_or_else(|| format!("{} => {}", hex(&write.key), hex(&write.value)))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
    let out = std::io::stdout();
    let mut out = BufWriter::new(out.lock());

    let mut encoder: Option<Arc<dyn Encoder>> = None;
    let mut frames = 0usize;
    let mut writes = 0usize;
    let mut kinds: BTreeMap<String, usize> = BTreeMap::new();

    'frames: for frame in FrameReader::new(BufReader::new(file)) {
        let frame = frame.with_context(|| format!("read frame {frames}"))?;
        frames += 1;
        match frame {
            RecordFrame::Header(h) => {
                let created = i64::try_from(h.created_unix_ns).map(format_timestamp).unwrap_or_default();
                eprintln!("Header: v{} encoding={} created={}", h.version, h.encoding, created);
                encoder = by_name(&h.encoding);
                if encoder.is_none() {
                    eprintln!("unknown encoding {:?}, printing raw", h.encoding);
                }
            }
            RecordFrame::Batch(batch) => {
                if frames == 1 {
                    return Err(anyhow!("log does not start with a header frame"));
                }
                for write in batch.iter() {
                    if args.limit.is_some_and(|n| writes >= n) {
                        break 'frames;
                    }
                    writes += 1;
                    if args.summary {
                        *kinds.entry(kind_of(write)).or_default() += 1;
                    } else {
                        writeln!(out, "{}", line(encoder.as_ref(), write, args.raw))?;
                    }
                }
            }
        }
    }

    for (kind, n) in &kinds {
        writeln!(out, "{kind:>8} {n}")?;
    }
    out.flush()?;
    eprintln!("Read {frames} frames, {writes} writes.");
    Ok(())
}

/// Coarse bucket for `--summary`: the key prefix plus the typecode byte when present.
fn kind_of(write: &Write) -> String {
    use feed_loader::encoding::{MESSAGE_PREFIX, SYMBOL_PREFIX, TIME_PREFIX};
    if write.key.starts_with(SYMBOL_PREFIX) {
        "symbol".to_string()
    } else if let Some(rest) = write.key.strip_prefix(MESSAGE_PREFIX) {
        rest.get(8).map_or("message".to_string(), |t| char::from(*t).to_string())
    } else if write.key.starts_with(TIME_PREFIX) {
        write.value.first().map_or("time".to_string(), |t| char::from(*t).to_string())
    } else {
        "other".to_string()
    }
}
