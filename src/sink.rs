//! Storage capability consumed by the pipeline, plus the bundled adapters.
//!
//! The pipeline only ever sees `dyn Sink`. Each adapter decides how close to
//! atomic a [`Sink::write_batch`] is:
//!
//! - [`MemorySink`]: one lock per batch over an ordered map; equal keys
//!   overwrite, so re-ingesting with a deterministic encoding adds nothing.
//! - [`FramedFileSink`]: one CRC-checked frame per batch appended to a log.
//!   Re-ingesting appends the same batches again.
//! - [`SerializedSink`]: funnels every batch through one writer thread for
//!   backends that forbid concurrent writers.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Sender, bounded};
use tracing::{debug, error, info};

use crate::batch::Batch;
use crate::error::SinkError;
use crate::record::{FileHeader, LOG_VERSION, RecordFrame, write_frame};

pub trait Sink: Send + Sync {
    /// Store every write of `batch`. Any error is fatal to the caller.
    fn write_batch(&self, batch: Batch) -> Result<(), SinkError>;

    /// Make everything written so far durable. Called once after the last batch.
    fn finish(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Ordered in-memory key/value store.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    batches: AtomicUsize,
    writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct keys stored.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    /// Batches accepted so far.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    /// Writes accepted so far, counting overwrites.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Entries in key order.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl Sink for MemorySink {
    fn write_batch(&self, batch: Batch) -> Result<(), SinkError> {
        let n = batch.len();
        let mut entries = self.entries.lock()?;
        for w in batch.writes {
            entries.insert(w.key, w.value);
        }
        self.writes.fetch_add(n, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Append-only frame log, see [`crate::record`].
pub struct FramedFileSink {
    out: Mutex<BufWriter<File>>,
}

impl FramedFileSink {
    /// Open `path` for appending; a new or empty file gets a [`FileHeader`].
    pub fn open(path: &Path, encoding: &str) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut w = BufWriter::with_capacity(1 << 20, file); // 1 MiB buffer
        if fresh {
            let created_unix_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            write_frame(
                &mut w,
                &RecordFrame::Header(FileHeader {
                    version: LOG_VERSION,
                    created_unix_ns,
                    encoding: encoding.to_string(),
                }),
            )?;
        } else {
            debug!(path = %path.display(), "appending to existing log");
        }
        Ok(Self { out: Mutex::new(w) })
    }
}

impl Sink for FramedFileSink {
    fn write_batch(&self, batch: Batch) -> Result<(), SinkError> {
        let mut w = self.out.lock()?;
        write_frame(&mut *w, &RecordFrame::Batch(batch))?;
        w.flush()?;
        Ok(())
    }

    fn finish(&self) -> Result<(), SinkError> {
        let mut w = self.out.lock()?;
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }
}

/// Single-writer stage fed by its own bounded queue.
///
/// Callers block once `capacity` batches are waiting. The first inner error
/// is latched: every later `write_batch` and `finish` returns it.
pub struct SerializedSink {
    tx: Mutex<Option<Sender<Batch>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl SerializedSink {
    pub fn spawn(inner: Arc<dyn Sink>, capacity: usize) -> Result<Self, SinkError> {
        let (tx, rx) = bounded::<Batch>(capacity.max(1));
        let failure = Arc::new(Mutex::new(None));
        let latch = Arc::clone(&failure);
        let writer = std::thread::Builder::new().name("sink-writer".into()).spawn(move || {
            let fail = |written: usize, e: SinkError| {
                error!(batches = written, "writer stage failed: {e}");
                if let Ok(mut slot) = latch.lock() {
                    slot.get_or_insert(e.to_string());
                }
            };
            let mut written = 0usize;
            for batch in rx.iter() {
                if let Err(e) = inner.write_batch(batch) {
                    // Latched while `rx` is still alive so blocked senders see the cause.
                    fail(written, e);
                    return;
                }
                written += 1;
            }
            match inner.finish() {
                Ok(()) => info!(batches = written, "writer stage drained"),
                Err(e) => fail(written, e),
            }
        })?;
        Ok(Self { tx: Mutex::new(Some(tx)), writer: Mutex::new(Some(writer)), failure })
    }

    fn latched(&self) -> Option<SinkError> {
        self.failure.lock().ok()?.clone().map(SinkError::Writer)
    }
}

impl Sink for SerializedSink {
    fn write_batch(&self, batch: Batch) -> Result<(), SinkError> {
        if let Some(e) = self.latched() {
            return Err(e);
        }
        let tx = self.tx.lock()?.clone().ok_or_else(|| SinkError::Writer("writer stage closed".into()))?;
        tx.send(batch).map_err(|_| {
            self.latched().unwrap_or_else(|| SinkError::Writer("writer stage stopped".into()))
        })
    }

    /// Close the queue, wait for the writer to drain, and report its outcome.
    fn finish(&self) -> Result<(), SinkError> {
        self.tx.lock()?.take();
        if let Some(handle) = self.writer.lock()?.take() {
            handle
                .join()
                .map_err(|_| SinkError::Writer("writer thread panicked".into()))?;
        }
        match self.latched() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FrameReader;
    use std::io::BufReader;

    fn batch(keys: &[&str]) -> Batch {
        let mut b = Batch::default();
        for k in keys {
            b.put(k.as_bytes().to_vec(), b"v".to_vec());
        }
        b
    }

    struct Broken;

    impl Sink for Broken {
        fn write_batch(&self, _batch: Batch) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn memory_sink_overwrites_equal_keys() {
        let sink = MemorySink::new();
        sink.write_batch(batch(&["b", "a"])).unwrap();
        sink.write_batch(batch(&["a", "c"])).unwrap();
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.writes(), 4);
        assert_eq!(sink.batches(), 2);
        let keys: Vec<_> = sink.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(sink.get(b"a"), Some(b"v".to_vec()));
    }

    #[test]
    fn file_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.log");
        {
            let sink = FramedFileSink::open(&path, "composite").unwrap();
            sink.write_batch(batch(&["a"])).unwrap();
            sink.finish().unwrap();
        }
        {
            let sink = FramedFileSink::open(&path, "composite").unwrap();
            sink.write_batch(batch(&["a"])).unwrap();
            sink.finish().unwrap();
        }
        let frames: Vec<_> = FrameReader::new(BufReader::new(File::open(&path).unwrap()))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], RecordFrame::Header(h) if h.encoding == "composite"));
        assert_eq!(frames[1], frames[2]);
    }

    #[test]
    fn serialized_sink_forwards_in_order() {
        let inner = Arc::new(MemorySink::new());
        let stage = SerializedSink::spawn(inner.clone(), 1).unwrap();
        for i in 0..20 {
            stage.write_batch(batch(&[&format!("k{i:02}")])).unwrap();
        }
        stage.finish().unwrap();
        assert_eq!(inner.batches(), 20);
        assert_eq!(inner.len(), 20);
    }

    #[test]
    fn serialized_sink_rejections_carry_the_cause() {
        let stage = SerializedSink::spawn(Arc::new(Broken), 1).unwrap();
        let mut rejected = None;
        for _ in 0..10_000 {
            if let Err(e) = stage.write_batch(batch(&["a"])) {
                rejected = Some(e);
                break;
            }
        }
        assert!(matches!(rejected, Some(SinkError::Writer(msg)) if msg.contains("disk full")));
    }

    #[test]
    fn serialized_sink_latches_failure() {
        let stage = SerializedSink::spawn(Arc::new(Broken), 4).unwrap();
        // The first send is accepted by the queue; the writer fails on it.
        let _ = stage.write_batch(batch(&["a"]));
        assert!(matches!(stage.finish(), Err(SinkError::Writer(msg)) if msg.contains("disk full")));
        assert!(stage.write_batch(batch(&["b"])).is_err());
    }
}
