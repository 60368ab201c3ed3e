//! Transport frame decoder.
//!
//! [`decode`] walks one payload: header, then `message_count` length-prefixed
//! messages. The length prefix is authoritative for cursor movement, so every
//! message (parsed, skipped, or parsed narrower than its frame) ends with the
//! cursor re-seeked to `frame_start + 2 + m_length`.
//!
//! The decoder is pure. The only state that can outlive a call is the
//! caller-owned [`SeenSymbols`] set used to emit [`Record::SymbolSeen`].
use std::collections::HashSet;

use tracing::{debug, trace};

use crate::error::{DecodeError, Truncation};
use crate::protocol::{
    ASK_LEVEL, BID_LEVEL, GenericMessage, HEADER_SIZE, LENGTH_PREFIX_SIZE, PRICE_LEVEL_SIZE,
    PriceLevelUpdate, QUOTE, QUOTE_SIZE, QuoteUpdate, Reader, Record, Symbol, TRADE, TRADE_SIZE,
    TradeReport, TransportHeader, TypecodeSet,
};

/// Symbols already announced through [`Record::SymbolSeen`].
pub type SeenSymbols = HashSet<Symbol>;

/// How many messages of a frame to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageCountMode {
    /// Walk exactly the declared `message_count`.
    #[default]
    Declared,
    /// Walk `message_count - 1`, leaving the final message untouched.
    SkipLast,
}

impl MessageCountMode {
    pub fn iterations(self, declared: u16) -> usize {
        match self {
            MessageCountMode::Declared => usize::from(declared),
            MessageCountMode::SkipLast => usize::from(declared.saturating_sub(1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Typecodes to parse; everything else is skipped by length.
    pub allowed: TypecodeSet,
    pub message_count: MessageCountMode,
    /// Treat bytes past `header + payload_length` as a further transport frame.
    pub chained: bool,
    /// Emit [`Record::Generic`] for allowed typecodes without a modeled layout.
    pub keep_generic: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            allowed: TypecodeSet::from_chars("T85"),
            message_count: MessageCountMode::Declared,
            chained: false,
            keep_generic: false,
        }
    }
}

impl DecodeOptions {
    pub fn allowing(codes: &str) -> Self {
        Self { allowed: TypecodeSet::from_chars(codes), ..Default::default() }
    }
}

/// Result of one [`decode`] call. Records decoded before an error are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub records: Vec<Record>,
    /// Cursor position when decoding stopped.
    pub consumed: usize,
    /// Transport frames fully walked.
    pub frames: usize,
    pub error: Option<DecodeError>,
}

impl Decoded {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<Record>, DecodeError> {
        match self.error {
            None => Ok(self.records),
            Some(e) => Err(e),
        }
    }
}

/// Layout selected by a typecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Trade,
    Quote,
    PriceLevel,
    Unmodeled,
}

impl MessageKind {
    const fn of(typecode: u8) -> Self {
        match typecode {
            TRADE => MessageKind::Trade,
            QUOTE => MessageKind::Quote,
            BID_LEVEL | ASK_LEVEL => MessageKind::PriceLevel,
            _ => MessageKind::Unmodeled,
        }
    }

    const fn wire_size(self) -> usize {
        match self {
            MessageKind::Trade => TRADE_SIZE,
            MessageKind::Quote => QUOTE_SIZE,
            MessageKind::PriceLevel => PRICE_LEVEL_SIZE,
            MessageKind::Unmodeled => 0,
        }
    }
}

/// Decode every allowed message in `payload`.
///
/// With `seen` supplied, the first record of each symbol not yet in the set
/// is preceded by a [`Record::SymbolSeen`]. Pass a fresh set per payload to
/// keep calls independent.
pub fn decode(payload: &[u8], opts: &DecodeOptions, mut seen: Option<&mut SeenSymbols>) -> Decoded {
    let mut out = Decoded::default();
    let mut base = 0usize;
    loop {
        let rest = &payload[base..];
        match decode_frame(rest, base, opts, seen.as_deref_mut(), &mut out.records) {
            Ok(len) => {
                out.frames += 1;
                base += len;
                out.consumed = base;
            }
            Err((at, e)) => {
                out.consumed = base + at;
                out.error = Some(e);
                break;
            }
        }
        if !opts.chained || base >= payload.len() {
            break;
        }
        trace!(offset = base, "chained transport frame");
    }
    out
}

/// Walk one transport frame at the start of `buf`. Returns its length, or the
/// relative offset of the failure. `base` only shifts reported offsets.
fn decode_frame(
    buf: &[u8],
    base: usize,
    opts: &DecodeOptions,
    mut seen: Option<&mut SeenSymbols>,
    records: &mut Vec<Record>,
) -> Result<usize, (usize, DecodeError)> {
    let header = TransportHeader::parse(&mut Reader::new(buf)).ok_or((
        0,
        DecodeError::Truncated {
            what: Truncation::Header,
            offset: base,
            needed: HEADER_SIZE,
            available: buf.len(),
        },
    ))?;

    let frame_end = if opts.chained {
        (HEADER_SIZE + usize::from(header.payload_length)).min(buf.len())
    } else {
        buf.len()
    };
    let frame = &buf[..frame_end];
    let mut r = Reader::at(frame, HEADER_SIZE);

    for index in 0..opts.message_count.iterations(header.message_count) {
        let frame_start = r.position();
        if r.remaining() == 0 {
            debug!(
                offset = base + frame_start,
                index,
                declared = header.message_count,
                "payload ended before declared message count"
            );
            break;
        }
        let m_length = usize::from(r.u16().ok_or((
            frame_start,
            DecodeError::Truncated {
                what: Truncation::LengthPrefix,
                offset: base + frame_start,
                needed: LENGTH_PREFIX_SIZE,
                available: r.remaining(),
            },
        ))?);

        let body_start = r.position();
        let Some(body) = r.bytes(m_length) else {
            return Err((
                frame_start,
                DecodeError::Truncated {
                    what: Truncation::MessageBody,
                    offset: base + body_start,
                    needed: m_length,
                    available: frame.len() - body_start,
                },
            ));
        };

        let typecode = match body.first() {
            Some(tc) if opts.allowed.contains(*tc) => *tc,
            _ => continue,
        };
        let record = parse_message(typecode, body, opts.keep_generic).map_err(|needed| {
            (
                frame_start,
                DecodeError::ProtocolViolation {
                    offset: base + body_start,
                    reason: format!(
                        "typecode {:?} needs {needed} bytes but frame length is {m_length}",
                        char::from(typecode)
                    ),
                },
            )
        })?;
        let Some(record) = record else { continue };

        if let (Some(set), Some(symbol)) = (seen.as_deref_mut(), record.envelope().map(|e| e.symbol)) {
            if set.insert(symbol) {
                records.push(Record::SymbolSeen(symbol));
            }
        }
        records.push(record);
    }

    let walked = r.position();
    if opts.chained {
        // payload_length is authoritative for where the next frame starts.
        if walked < frame_end {
            debug!(offset = base + walked, skipped = frame_end - walked, "resync to payload length");
        }
        return Ok(frame_end);
    }
    if opts.message_count == MessageCountMode::Declared && r.remaining() > 0 {
        return Err((
            walked,
            DecodeError::ProtocolViolation {
                offset: base + walked,
                reason: format!(
                    "{} trailing bytes after {} declared messages",
                    r.remaining(),
                    header.message_count
                ),
            },
        ));
    }
    Ok(walked)
}

/// Parse a message body whose first byte is `typecode`. `Err` carries the
/// size the layout needs when the body is narrower than that.
fn parse_message(typecode: u8, body: &[u8], keep_generic: bool) -> Result<Option<Record>, usize> {
    let kind = MessageKind::of(typecode);
    let mut r = Reader::new(body);
    let parsed = match kind {
        MessageKind::Trade => TradeReport::parse(&mut r).map(Record::Trade),
        MessageKind::Quote => QuoteUpdate::parse(&mut r).map(Record::Quote),
        MessageKind::PriceLevel => PriceLevelUpdate::parse(&mut r).map(Record::PriceLevel),
        MessageKind::Unmodeled if keep_generic => {
            return Ok(Some(Record::Generic(GenericMessage { typecode, body: body.to_vec() })));
        }
        MessageKind::Unmodeled => return Ok(None),
    };
    parsed.map(Some).ok_or(kind.wire_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Flags, FrameBuilder, Order, Price};

    fn env(typecode: u8, ts: i64, sym: &str) -> Envelope {
        Envelope { typecode, flags: Flags(0), timestamp: ts, symbol: Symbol::from_str_padded(sym) }
    }

    fn trade(ts: i64, sym: &str, size: u32, price: i64) -> TradeReport {
        TradeReport { envelope: env(TRADE, ts, sym), order: Order { size, price: Price(price) } }
    }

    fn level(typecode: u8, ts: i64, sym: &str, size: u32, price: i64) -> PriceLevelUpdate {
        PriceLevelUpdate { envelope: env(typecode, ts, sym), order: Order { size, price: Price(price) } }
    }

    fn frame() -> FrameBuilder {
        FrameBuilder::new(TransportHeader { version: 1, message_protocol: 0x8004, ..Default::default() })
    }

    #[test]
    fn trade_then_unknown_typecode() {
        let unknown = [b'X', 0, 1, 2, 3, 4, 5];
        let payload = frame().trade(&trade(10, "ZIEXT", 100, 1_000_000), 77).message(&unknown).build();
        let out = decode(&payload, &DecodeOptions::allowing("T"), None);
        assert!(out.is_ok(), "{:?}", out.error);
        assert_eq!(out.records, vec![Record::Trade(trade(10, "ZIEXT", 100, 1_000_000))]);
        assert_eq!(out.consumed, HEADER_SIZE + 2 + (TRADE_SIZE + 8) + 2 + unknown.len());
        assert_eq!(out.consumed, payload.len());
        assert_eq!(out.frames, 1);
    }

    #[test]
    fn quote_price_scaling() {
        let q = QuoteUpdate {
            envelope: env(QUOTE, 5, "SPY"),
            bid_size: 100,
            bid_price: Price(12_345_000),
            ask_price: Price(12_346_000),
            ask_size: 200,
        };
        let payload = frame().quote(&q).build();
        let out = decode(&payload, &DecodeOptions::allowing("Q"), None);
        match out.records.as_slice() {
            [Record::Quote(got)] => {
                assert_eq!(got.bid_price.value(), 1234.5);
                assert_eq!(got.ask_price.value(), 1234.6);
                assert_eq!(got.ask_size, 200);
            }
            other => panic!("unexpected records {other:?}"),
        }
    }

    #[test]
    fn disallowed_typecode_consumes_exact_length() {
        let payload = frame()
            .price_level(&level(BID_LEVEL, 1, "A", 5, 10_000))
            .price_level(&level(ASK_LEVEL, 2, "A", 6, 20_000))
            .build();
        let out = decode(&payload, &DecodeOptions::allowing("5"), None);
        assert!(out.is_ok());
        assert_eq!(out.records, vec![Record::PriceLevel(level(ASK_LEVEL, 2, "A", 6, 20_000))]);
        assert_eq!(out.consumed, payload.len());
    }

    #[test]
    fn truncated_length_prefix_keeps_prior_records() {
        let mut payload = frame()
            .trade(&trade(1, "A", 1, 1), 1)
            .trade(&trade(2, "B", 2, 2), 2)
            .declare_count(3)
            .build();
        payload.push(0x1E);
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert_eq!(out.records.len(), 2);
        let err = out.error.expect("error");
        assert_eq!(err.truncation(), Some(Truncation::LengthPrefix));
        assert_eq!(out.consumed, payload.len() - 1);
    }

    #[test]
    fn short_header_fails() {
        let out = decode(&[1, 0, 4], &DecodeOptions::default(), None);
        assert!(out.records.is_empty());
        assert_eq!(out.error.and_then(|e| e.truncation()), Some(Truncation::Header));
    }

    #[test]
    fn overstated_count_ends_cleanly() {
        let payload = frame().trade(&trade(1, "A", 1, 1), 1).declare_count(4).build();
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert!(out.is_ok());
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn body_overrunning_buffer_is_truncated_message() {
        let mut payload = frame().trade(&trade(1, "A", 1, 1), 1).build();
        payload.truncate(payload.len() - 4);
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert!(out.records.is_empty());
        assert_eq!(out.error.and_then(|e| e.truncation()), Some(Truncation::MessageBody));
        assert_eq!(out.consumed, HEADER_SIZE);
    }

    #[test]
    fn frame_narrower_than_layout_is_violation() {
        let mut body = Vec::new();
        trade(1, "A", 1, 1).encode(&mut body);
        body.truncate(20);
        let payload = frame().message(&body).build();
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert!(matches!(out.error, Some(DecodeError::ProtocolViolation { .. })));
    }

    #[test]
    fn skip_last_mode_leaves_final_message() {
        let payload = frame()
            .trade(&trade(1, "A", 1, 1), 1)
            .trade(&trade(2, "A", 1, 1), 2)
            .build();
        let opts = DecodeOptions { message_count: MessageCountMode::SkipLast, ..Default::default() };
        let out = decode(&payload, &opts, None);
        assert!(out.is_ok());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.consumed, HEADER_SIZE + 2 + TRADE_SIZE + 8);
        assert_eq!(MessageCountMode::SkipLast.iterations(0), 0);
    }

    #[test]
    fn symbol_seen_once_per_set() {
        let payload = frame()
            .trade(&trade(1, "A", 1, 1), 1)
            .price_level(&level(BID_LEVEL, 2, "A", 1, 1))
            .trade(&trade(3, "B", 1, 1), 3)
            .build();
        let mut seen = SeenSymbols::new();
        let first = decode(&payload, &DecodeOptions::default(), Some(&mut seen));
        let kinds: Vec<_> = first.records.iter().map(|r| matches!(r, Record::SymbolSeen(_))).collect();
        assert_eq!(kinds, vec![true, false, false, true, false]);

        let again = decode(&payload, &DecodeOptions::default(), Some(&mut seen));
        assert_eq!(again.records.len(), 3);

        let fresh = decode(&payload, &DecodeOptions::default(), Some(&mut SeenSymbols::new()));
        assert_eq!(fresh, first);
    }

    #[test]
    fn decoding_is_repeatable() {
        let payload = frame().trade(&trade(9, "IBM", 3, 4), 0).build();
        let opts = DecodeOptions::default();
        assert_eq!(decode(&payload, &opts, None), decode(&payload, &opts, None));
    }

    #[test]
    fn chained_frames_concatenate() {
        let mut payload = frame().trade(&trade(1, "A", 1, 1), 1).build();
        payload.extend(frame().price_level(&level(ASK_LEVEL, 2, "B", 1, 1)).build());
        let opts = DecodeOptions { chained: true, ..Default::default() };
        let out = decode(&payload, &opts, None);
        assert!(out.is_ok());
        assert_eq!(out.frames, 2);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.consumed, payload.len());

        // Unchained, the second frame is unexplained trailing data.
        let plain = decode(&payload, &DecodeOptions::default(), None);
        assert_eq!(plain.records.len(), 1);
        assert!(matches!(plain.error, Some(DecodeError::ProtocolViolation { .. })));
    }

    #[test]
    fn chained_skip_last_starts_next_frame_at_payload_length() {
        let mut payload = frame().trade(&trade(1, "A", 1, 1), 1).trade(&trade(2, "A", 2, 2), 2).build();
        payload.extend(frame().trade(&trade(3, "B", 3, 3), 3).trade(&trade(4, "B", 4, 4), 4).build());
        let opts = DecodeOptions { chained: true, message_count: MessageCountMode::SkipLast, ..Default::default() };
        let out = decode(&payload, &opts, None);
        assert!(out.is_ok(), "{:?}", out.error);
        assert_eq!(out.frames, 2);
        assert_eq!(
            out.records,
            vec![Record::Trade(trade(1, "A", 1, 1)), Record::Trade(trade(3, "B", 3, 3))]
        );
        assert_eq!(out.consumed, payload.len());
    }

    #[test]
    fn chained_padding_inside_payload_length_is_skipped() {
        let mut first = frame().trade(&trade(1, "A", 1, 1), 1).build();
        first.extend_from_slice(&[0xEE; 4]);
        let padded_len = u16::try_from(first.len() - HEADER_SIZE).unwrap();
        first[12..14].copy_from_slice(&padded_len.to_le_bytes());
        let mut payload = first.clone();
        payload.extend(frame().trade(&trade(2, "B", 2, 2), 2).build());

        let out = decode(&payload, &DecodeOptions { chained: true, ..Default::default() }, None);
        assert!(out.is_ok(), "{:?}", out.error);
        assert_eq!(out.frames, 2);
        assert_eq!(
            out.records,
            vec![Record::Trade(trade(1, "A", 1, 1)), Record::Trade(trade(2, "B", 2, 2))]
        );
        assert_eq!(out.consumed, payload.len());
    }

    #[test]
    fn trailing_bytes_after_declared_messages() {
        let mut payload = frame().trade(&trade(1, "A", 1, 1), 1).build();
        let walked = payload.len();
        payload.extend_from_slice(&[7; 7]);
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.consumed, walked);
        assert!(matches!(
            out.error,
            Some(DecodeError::ProtocolViolation { offset, .. }) if offset == walked
        ));

        // Skipping the last message leaves bytes behind on purpose.
        let opts = DecodeOptions { message_count: MessageCountMode::SkipLast, ..Default::default() };
        assert!(decode(&payload, &opts, None).is_ok());
    }

    #[test]
    fn chained_tail_shorter_than_header() {
        let mut payload = frame().trade(&trade(1, "A", 1, 1), 1).build();
        let head = payload.len();
        payload.extend_from_slice(&[1, 2, 3]);
        let out = decode(&payload, &DecodeOptions { chained: true, ..Default::default() }, None);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.frames, 1);
        assert_eq!(out.consumed, head);
        assert!(matches!(
            out.error,
            Some(DecodeError::Truncated { what: Truncation::Header, offset, .. }) if offset == head
        ));
    }

    #[test]
    fn generic_messages_when_requested() {
        let payload = frame().message(&[b'S', 0, b'O']).build();
        let opts = DecodeOptions { keep_generic: true, ..DecodeOptions::allowing("S") };
        let out = decode(&payload, &opts, None);
        assert_eq!(
            out.records,
            vec![Record::Generic(GenericMessage { typecode: b'S', body: vec![b'S', 0, b'O'] })]
        );
        let skipped = decode(&payload, &DecodeOptions::allowing("S"), None);
        assert!(skipped.records.is_empty());
        assert!(skipped.is_ok());
    }

    #[test]
    fn empty_message_count() {
        let payload = frame().build();
        let out = decode(&payload, &DecodeOptions::default(), None);
        assert!(out.is_ok());
        assert!(out.records.is_empty());
        assert_eq!(out.consumed, HEADER_SIZE);
    }
}
