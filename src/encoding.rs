//! Record to key/value encodings.
//!
//! Encoding is a storage concern: the decoder produces [`Record`]s and an
//! [`Encoder`] turns each one into a single [`Write`] whose key layout suits
//! the backend.
//!
//! - [`CompositeKeyEncoder`] keys are `m: | ts | typecode | symbol | crc32(value)`
//!   with an order-preserving big-endian timestamp, so ordered stores range-scan
//!   by time and re-ingesting a capture rewrites identical keys.
//! - [`TimeKeyEncoder`] keeps the legacy `:: | be(ts)` layout. Records sharing a
//!   timestamp share a key, so on overwrite-on-conflict stores the last one wins.
//!
//! Both write `symbol::<SYM>` with an empty value for [`Record::SymbolSeen`].
use std::sync::Arc;

use crc32fast::Hasher as Crc32;

use crate::batch::Write;
use crate::protocol::{Price, QUOTE, Reader, Record, Symbol, format_timestamp};

pub const SYMBOL_PREFIX: &[u8] = b"symbol::";
pub const MESSAGE_PREFIX: &[u8] = b"m:";
pub const TIME_PREFIX: &[u8] = b"::";

pub trait Encoder: Send + Sync {
    /// Name persisted alongside encoded data.
    fn name(&self) -> &'static str;

    /// `None` when this encoding does not store the record.
    fn encode(&self, record: &Record) -> Option<Write>;

    /// Human-readable rendering of a write produced by [`Encoder::encode`].
    fn describe(&self, write: &Write) -> Option<String>;
}

/// Look an encoder up by its persisted name.
pub fn by_name(name: &str) -> Option<Arc<dyn Encoder>> {
    match name {
        "composite" => Some(Arc::new(CompositeKeyEncoder)),
        "time" => Some(Arc::new(TimeKeyEncoder)),
        _ => None,
    }
}

fn symbol_write(symbol: &Symbol) -> Write {
    let mut key = SYMBOL_PREFIX.to_vec();
    key.extend_from_slice(symbol.trimmed());
    Write { key, value: Vec::new() }
}

fn describe_symbol(key: &[u8]) -> Option<String> {
    key.strip_prefix(SYMBOL_PREFIX)
        .map(|s| format!("symbol {}", String::from_utf8_lossy(s)))
}

/// Maps signed nanoseconds onto bytes that sort in time order.
fn ordered_timestamp(ts: i64) -> [u8; 8] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}

fn unordered_timestamp(raw: [u8; 8]) -> i64 {
    (u64::from_be_bytes(raw) ^ (1 << 63)) as i64
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeKeyEncoder;

impl Encoder for CompositeKeyEncoder {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn encode(&self, record: &Record) -> Option<Write> {
        let mut value = Vec::with_capacity(32);
        let (timestamp, typecode, symbol) = match record {
            Record::SymbolSeen(s) => return Some(symbol_write(s)),
            Record::Trade(t) => {
                value.push(t.envelope.flags.0);
                value.extend_from_slice(&t.order.size.to_le_bytes());
                value.extend_from_slice(&t.order.price.0.to_le_bytes());
                (t.envelope.timestamp, t.envelope.typecode, t.envelope.symbol)
            }
            Record::PriceLevel(p) => {
                value.push(p.envelope.flags.0);
                value.extend_from_slice(&p.order.size.to_le_bytes());
                value.extend_from_slice(&p.order.price.0.to_le_bytes());
                (p.envelope.timestamp, p.envelope.typecode, p.envelope.symbol)
            }
            Record::Quote(q) => {
                value.push(q.envelope.flags.0);
                value.extend_from_slice(&q.bid_size.to_le_bytes());
                value.extend_from_slice(&q.bid_price.0.to_le_bytes());
                value.extend_from_slice(&q.ask_price.0.to_le_bytes());
                value.extend_from_slice(&q.ask_size.to_le_bytes());
                (q.envelope.timestamp, q.envelope.typecode, q.envelope.symbol)
            }
            Record::Generic(g) => {
                // No envelope guarantee; the body itself is the value.
                value.extend_from_slice(&g.body);
                (0, g.typecode, Symbol([b' '; 8]))
            }
        };

        let mut hasher = Crc32::new();
        hasher.update(&value);
        let mut key = Vec::with_capacity(MESSAGE_PREFIX.len() + 8 + 1 + 8 + 4);
        key.extend_from_slice(MESSAGE_PREFIX);
        key.extend_from_slice(&ordered_timestamp(timestamp));
        key.push(typecode);
        key.extend_from_slice(&symbol.0);
        key.extend_from_slice(&hasher.finalize().to_be_bytes());
        Some(Write { key, value })
    }

    fn describe(&self, write: &Write) -> Option<String> {
        if let Some(s) = describe_symbol(&write.key) {
            return Some(s);
        }
        let mut k = Reader::new(write.key.strip_prefix(MESSAGE_PREFIX)?);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(k.bytes(8)?);
        let ts = unordered_timestamp(ts);
        let typecode = k.u8()?;
        let mut sym = [0u8; 8];
        sym.copy_from_slice(k.bytes(8)?);
        let symbol = Symbol(sym);

        let mut v = Reader::new(&write.value);
        let head = format!("{} {} {:<8}", format_timestamp(ts), char::from(typecode), symbol);
        let body = match typecode {
            QUOTE => {
                let flags = v.u8()?;
                let (bid_size, bid, ask, ask_size) = (v.u32()?, Price(v.i64()?), Price(v.i64()?), v.u32()?);
                format!("{bid_size} @ {bid} / {ask} @ {ask_size} flags={flags:08b}")
            }
            _ if write.value.len() == 13 => {
                let flags = v.u8()?;
                let (size, price) = (v.u32()?, Price(v.i64()?));
                format!("{size} @ {price} flags={flags:08b}")
            }
            _ => format!("{} opaque bytes", write.value.len()),
        };
        Some(format!("{head} {body}"))
    }
}

/// `::` + big-endian timestamp key; value is
/// `typecode | f32 price | u32 size | symbol text` (quotes carry both sides).
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeKeyEncoder;

impl Encoder for TimeKeyEncoder {
    fn name(&self) -> &'static str {
        "time"
    }

    fn encode(&self, record: &Record) -> Option<Write> {
        let (envelope, sides) = match record {
            Record::SymbolSeen(s) => return Some(symbol_write(s)),
            Record::Generic(_) => return None,
            Record::Trade(t) => (&t.envelope, vec![(t.order.price, t.order.size)]),
            Record::PriceLevel(p) => (&p.envelope, vec![(p.order.price, p.order.size)]),
            Record::Quote(q) => (&q.envelope, vec![(q.bid_price, q.bid_size), (q.ask_price, q.ask_size)]),
        };
        let mut key = TIME_PREFIX.to_vec();
        key.extend_from_slice(&envelope.timestamp.to_be_bytes());
        let mut value = vec![envelope.typecode];
        for (price, size) in sides {
            value.extend_from_slice(&(price.value() as f32).to_le_bytes());
            value.extend_from_slice(&size.to_le_bytes());
        }
        value.extend_from_slice(envelope.symbol.trimmed());
        Some(Write { key, value })
    }

    fn describe(&self, write: &Write) -> Option<String> {
        if let Some(s) = describe_symbol(&write.key) {
            return Some(s);
        }
        let raw: [u8; 8] = write.key.strip_prefix(TIME_PREFIX)?.try_into().ok()?;
        let ts = i64::from_be_bytes(raw);
        let mut v = Reader::new(&write.value);
        let typecode = v.u8()?;
        let sides = if typecode == QUOTE { 2 } else { 1 };
        let mut parts = Vec::with_capacity(sides);
        for _ in 0..sides {
            let price = f32::from_le_bytes(v.bytes(4)?.try_into().ok()?);
            let size = v.u32()?;
            parts.push(format!("{size} @ {price:.4}"));
        }
        let symbol = String::from_utf8_lossy(v.bytes(v.remaining())?);
        Some(format!("{} {} {:<8} {}", format_timestamp(ts), char::from(typecode), symbol, parts.join(" / ")))
    }
}
