//! Wire layout of the market-data transport.
//!
//! Every payload starts with a fixed 40-byte [`TransportHeader`] followed by
//! `message_count` length-prefixed message frames. All integers are
//! little-endian. Each message body begins with an 18-byte [`Envelope`]
//! (`typecode`, `flags`, `timestamp`, `symbol`) followed by variant fields:
//!
//! | typecode | variant            | fields after envelope                         |
//! |----------|--------------------|-----------------------------------------------|
//! | `T`      | [`TradeReport`]    | `size:u32 price:i64` (+ unparsed `trade_id`)  |
//! | `Q`      | [`QuoteUpdate`]    | `bid_size:u32 bid:i64 ask:i64 ask_size:u32`   |
//! | `8`/`5`  | [`PriceLevelUpdate`] | `size:u32 price:i64`                        |
//!
//! The `encode` methods write the same layout back out; they exist so tests
//! and tooling can synthesize captures.
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 40;
pub const LENGTH_PREFIX_SIZE: usize = 2;
pub const ENVELOPE_SIZE: usize = 18;
pub const ORDER_SIZE: usize = 12;
pub const TRADE_SIZE: usize = ENVELOPE_SIZE + ORDER_SIZE;
pub const QUOTE_SIZE: usize = ENVELOPE_SIZE + 24;
pub const PRICE_LEVEL_SIZE: usize = ENVELOPE_SIZE + ORDER_SIZE;

/// Fixed-point price scale: raw / 10_000 is the decimal price.
pub const PRICE_SCALE: f64 = 10_000.0;

pub const TRADE: u8 = b'T';
pub const QUOTE: u8 = b'Q';
pub const BID_LEVEL: u8 = b'8';
pub const ASK_LEVEL: u8 = b'5';

/// Bounds-checked little-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Reader positioned at `pos`, clamped to the end of `buf`.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos: pos.min(buf.len()) }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut tmp = [0u8; N];
        tmp.copy_from_slice(self.bytes(N)?);
        Some(tmp)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportHeader {
    pub version: u8,
    pub reserved: u8,
    pub message_protocol: u16,
    pub channel_id: u32,
    pub session_id: u32,
    /// Bytes following the header that belong to this frame.
    pub payload_length: u16,
    pub message_count: u16,
    pub stream_offset: i64,
    pub first_message_seq_num: i64,
    /// Send time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TransportHeader {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            version: r.u8()?,
            reserved: r.u8()?,
            message_protocol: r.u16()?,
            channel_id: r.u32()?,
            session_id: r.u32()?,
            payload_length: r.u16()?,
            message_count: r.u16()?,
            stream_offset: r.i64()?,
            first_message_seq_num: r.i64()?,
            timestamp: r.i64()?,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.reserved);
        out.extend_from_slice(&self.message_protocol.to_le_bytes());
        out.extend_from_slice(&self.channel_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.payload_length.to_le_bytes());
        out.extend_from_slice(&self.message_count.to_le_bytes());
        out.extend_from_slice(&self.stream_offset.to_le_bytes());
        out.extend_from_slice(&self.first_message_seq_num.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
    }
}

/// Eight space-padded ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub [u8; 8]);

impl Symbol {
    /// Pad (or cut) `s` to eight bytes.
    pub fn from_str_padded(s: &str) -> Self {
        let mut raw = [b' '; 8];
        for (dst, src) in raw.iter_mut().zip(s.bytes()) {
            *dst = src;
        }
        Symbol(raw)
    }

    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
            .map_or(0, |i| i + 1);
        &self.0[..end]
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.trimmed())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

/// Fixed-point price with four implied decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Price(pub i64);

impl Price {
    pub fn from_raw(raw: i64) -> Self {
        Price(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn value(&self) -> f64 {
        self.0 as f64 / PRICE_SCALE
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.value())
    }
}

/// Per-message flag byte; meaning depends on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub typecode: u8,
    pub flags: Flags,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub symbol: Symbol,
}

impl Envelope {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            typecode: r.u8()?,
            flags: Flags(r.u8()?),
            timestamp: r.i64()?,
            symbol: Symbol(r.array()?),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.typecode);
        out.push(self.flags.0);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.symbol.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub size: u32,
    pub price: Price,
}

impl Order {
    fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self { size: r.u32()?, price: Price(r.i64()?) })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.price.0.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeReport {
    pub envelope: Envelope,
    pub order: Order,
}

impl TradeReport {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self { envelope: Envelope::parse(r)?, order: Order::parse(r)? })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.envelope.encode(out);
        self.order.encode(out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteUpdate {
    pub envelope: Envelope,
    pub bid_size: u32,
    pub bid_price: Price,
    pub ask_price: Price,
    pub ask_size: u32,
}

impl QuoteUpdate {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            envelope: Envelope::parse(r)?,
            bid_size: r.u32()?,
            bid_price: Price(r.i64()?),
            ask_price: Price(r.i64()?),
            ask_size: r.u32()?,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.envelope.encode(out);
        out.extend_from_slice(&self.bid_size.to_le_bytes());
        out.extend_from_slice(&self.bid_price.0.to_le_bytes());
        out.extend_from_slice(&self.ask_price.0.to_le_bytes());
        out.extend_from_slice(&self.ask_size.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevelUpdate {
    pub envelope: Envelope,
    pub order: Order,
}

impl PriceLevelUpdate {
    pub fn parse(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self { envelope: Envelope::parse(r)?, order: Order::parse(r)? })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.envelope.encode(out);
        self.order.encode(out);
    }

    pub fn side(&self) -> Side {
        if self.envelope.typecode == BID_LEVEL { Side::Bid } else { Side::Ask }
    }
}

/// Allowed message whose layout is not modeled; the whole body is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    pub typecode: u8,
    pub body: Vec<u8>,
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Trade(TradeReport),
    Quote(QuoteUpdate),
    PriceLevel(PriceLevelUpdate),
    Generic(GenericMessage),
    /// First sighting of a symbol within one decode call.
    SymbolSeen(Symbol),
}

impl Record {
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Record::Trade(t) => Some(&t.envelope),
            Record::Quote(q) => Some(&q.envelope),
            Record::PriceLevel(p) => Some(&p.envelope),
            Record::Generic(_) | Record::SymbolSeen(_) => None,
        }
    }

    pub fn typecode(&self) -> Option<u8> {
        match self {
            Record::Generic(g) => Some(g.typecode),
            Record::SymbolSeen(_) => None,
            _ => self.envelope().map(|e| e.typecode),
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.envelope().map(|e| e.timestamp)
    }

    pub fn symbol(&self) -> Option<Symbol> {
        match self {
            Record::SymbolSeen(s) => Some(*s),
            _ => self.envelope().map(|e| e.symbol),
        }
    }
}

/// Set of single-byte typecodes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TypecodeSet([u64; 4]);

impl TypecodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every byte of `codes` becomes a member, e.g. `"T85"`.
    pub fn from_chars(codes: &str) -> Self {
        let mut set = Self::new();
        for b in codes.bytes() {
            set.insert(b);
        }
        set
    }

    pub fn insert(&mut self, code: u8) {
        self.0[usize::from(code >> 6)] |= 1u64 << (code & 63);
    }

    pub fn contains(&self, code: u8) -> bool {
        self.0[usize::from(code >> 6)] & (1u64 << (code & 63)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|c| self.contains(*c))
    }
}

impl fmt::Debug for TypecodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: String = self.iter().map(char::from).collect();
        write!(f, "TypecodeSet({codes:?})")
    }
}

/// Assembles one transport frame from message bodies.
///
/// `build` fills in `payload_length` and `message_count` from the appended
/// messages unless they were overridden with [`FrameBuilder::declare_count`].
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder {
    header: TransportHeader,
    messages: Vec<u8>,
    count: u16,
    declared: Option<u16>,
}

impl FrameBuilder {
    pub fn new(header: TransportHeader) -> Self {
        Self { header, ..Default::default() }
    }

    /// Append a raw message body behind its length prefix.
    pub fn message(mut self, body: &[u8]) -> Self {
        let len = u16::try_from(body.len()).unwrap_or(u16::MAX);
        self.messages.extend_from_slice(&len.to_le_bytes());
        self.messages.extend_from_slice(&body[..usize::from(len)]);
        self.count += 1;
        self
    }

    /// Trade with the trailing trade identifier the decoder skips.
    pub fn trade(self, trade: &TradeReport, trade_id: i64) -> Self {
        let mut body = Vec::with_capacity(TRADE_SIZE + 8);
        trade.encode(&mut body);
        body.extend_from_slice(&trade_id.to_le_bytes());
        self.message(&body)
    }

    pub fn quote(self, quote: &QuoteUpdate) -> Self {
        let mut body = Vec::with_capacity(QUOTE_SIZE);
        quote.encode(&mut body);
        self.message(&body)
    }

    pub fn price_level(self, level: &PriceLevelUpdate) -> Self {
        let mut body = Vec::with_capacity(PRICE_LEVEL_SIZE);
        level.encode(&mut body);
        self.message(&body)
    }

    pub fn declare_count(mut self, count: u16) -> Self {
        self.declared = Some(count);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut header = self.header;
        header.payload_length = u16::try_from(self.messages.len()).unwrap_or(u16::MAX);
        header.message_count = self.declared.unwrap_or(self.count);
        let mut out = Vec::with_capacity(HEADER_SIZE + self.messages.len());
        header.encode(&mut out);
        out.extend_from_slice(&self.messages);
        out
    }
}

/// Render a nanosecond epoch timestamp as RFC 3339.
pub fn format_timestamp(ns: i64) -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns))
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{ns}ns"))
}
