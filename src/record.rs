//! Durable frame-log schema shared by the file sink and the `dump` tool.
//!
//! A log is a sequence of frames, each `[len:u32 LE][crc32:u32 LE][payload]`
//! where `payload` is a bincode-encoded [`RecordFrame`]. The first frame is a
//! [`FileHeader`]; every later frame carries one flushed [`Batch`].
use std::io::{self, Read, Write};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::error::SinkError;

pub const LOG_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    /// [`crate::encoding::Encoder::name`] of the writes that follow.
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(FileHeader),
    Batch(Batch),
}

pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> Result<(), SinkError> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds 4 GiB"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Failure while reading a frame log back.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CRC mismatch at frame {frame}: file={stored:#x}, calc={computed:#x}")]
    Crc { frame: usize, stored: u32, computed: u32 },

    #[error("bincode decode failed at frame {frame}: {source}")]
    Decode {
        frame: usize,
        #[source]
        source: bincode::Error,
    },
}

/// Iterator over the frames of a log; stops at a clean end of input.
pub struct FrameReader<R> {
    inner: R,
    frames: usize,
    failed: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, frames: 0, failed: false }
    }

    fn read_one(&mut self) -> Result<Option<RecordFrame>, FrameError> {
        let len = match read_u32(&mut self.inner) {
            Ok(v) => v as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored = read_u32(&mut self.inner)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let computed = hasher.finalize();
        let frame = self.frames;
        if computed != stored {
            return Err(FrameError::Crc { frame, stored, computed });
        }
        let decoded = bincode::deserialize(&payload).map_err(|source| FrameError::Decode { frame, source })?;
        self.frames += 1;
        Ok(Some(decoded))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<RecordFrame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_one() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> RecordFrame {
        RecordFrame::Header(FileHeader { version: LOG_VERSION, created_unix_ns: 1, encoding: "composite".into() })
    }

    #[test]
    fn frames_read_back() {
        let mut batch = Batch::default();
        batch.put(b"k".to_vec(), b"v".to_vec());
        let mut buf = Vec::new();
        write_frame(&mut buf, &header()).unwrap();
        write_frame(&mut buf, &RecordFrame::Batch(batch.clone())).unwrap();

        let frames: Vec<_> = FrameReader::new(Cursor::new(buf)).collect::<Result<_, _>>().unwrap();
        assert_eq!(frames, vec![header(), RecordFrame::Batch(batch)]);
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &header()).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut it = FrameReader::new(Cursor::new(buf));
        assert!(matches!(it.next(), Some(Err(FrameError::Crc { frame: 0, .. }))));
        assert!(it.next().is_none());
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &header()).unwrap();
        buf.truncate(buf.len() - 2);
        let mut it = FrameReader::new(Cursor::new(buf));
        assert!(matches!(it.next(), Some(Err(FrameError::Io(_)))));
    }
}
