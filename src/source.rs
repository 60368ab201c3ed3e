//! Payload sources.
//!
//! A [`PacketSource`] yields complete application-layer payloads in arrival
//! order. Reassembling payloads from a packet capture happens upstream; the
//! bundled [`PayloadFile`] reads payloads that were already extracted into
//! `[len:u32 LE][payload]` records, gzip-compressed or not.
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

/// Anything that yields payload buffers, possibly empty, until exhausted.
pub trait PacketSource: Iterator<Item = io::Result<Vec<u8>>> + Send {}

impl<T> PacketSource for T where T: Iterator<Item = io::Result<Vec<u8>>> + Send {}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Length-prefixed payload reader.
pub struct PayloadFile {
    inner: Box<dyn Read + Send>,
    done: bool,
}

impl PayloadFile {
    /// Open `path`, or stdin for `-`. Gzip input is detected by its magic bytes.
    pub fn open(path: &Path) -> io::Result<Self> {
        let raw: Box<dyn Read + Send> = if path.as_os_str() == "-" {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(path)?)
        };
        Self::from_reader(raw)
    }

    pub fn from_reader(raw: Box<dyn Read + Send>) -> io::Result<Self> {
        let mut buffered = BufReader::with_capacity(1 << 20, raw);
        let head = io::BufRead::fill_buf(&mut buffered)?;
        let inner: Box<dyn Read + Send> = if head.starts_with(&GZIP_MAGIC) {
            Box::new(BufReader::new(MultiGzDecoder::new(buffered)))
        } else {
            Box::new(buffered)
        };
        Ok(Self { inner, done: false })
    }
}

impl Iterator for PayloadFile {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut len = [0u8; 4];
        match self.inner.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        if let Err(e) = self.inner.read_exact(&mut payload) {
            self.done = true;
            return Some(Err(e));
        }
        Some(Ok(payload))
    }
}

/// Append one payload in the format [`PayloadFile`] reads.
pub fn write_payload<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds 4 GiB"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Cursor;

    fn encoded(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for p in payloads {
            write_payload(&mut buf, p).unwrap();
        }
        buf
    }

    #[test]
    fn reads_plain_payloads() {
        let buf = encoded(&[b"abc", b"", b"z"]);
        let src = PayloadFile::from_reader(Box::new(Cursor::new(buf))).unwrap();
        let got: Vec<_> = src.collect::<io::Result<_>>().unwrap();
        assert_eq!(got, vec![b"abc".to_vec(), vec![], b"z".to_vec()]);
    }

    #[test]
    fn reads_gzip_payloads() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&encoded(&[b"one", b"two"])).unwrap();
        let buf = gz.finish().unwrap();
        let src = PayloadFile::from_reader(Box::new(Cursor::new(buf))).unwrap();
        let got: Vec<_> = src.collect::<io::Result<_>>().unwrap();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn truncated_payload_reports_error() {
        let mut buf = encoded(&[b"abcdef"]);
        buf.truncate(buf.len() - 2);
        let mut src = PayloadFile::from_reader(Box::new(Cursor::new(buf))).unwrap();
        assert!(src.next().unwrap().is_err());
        assert!(src.next().is_none());
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut src = PayloadFile::from_reader(Box::new(Cursor::new(Vec::new()))).unwrap();
        assert!(src.next().is_none());
    }
}
