//! Concurrent ingestion: bounded payload queue, fixed worker pool, sink flushes.
//!
//! ```text
//! PacketSource --submit--> [bounded queue] --> worker 0..N: decode -> encode -> accumulate
//!                                                             `--> Sink::write_batch when due
//! ```
//!
//! The queue is the only thing workers share. Each worker owns its
//! [`BatchAccumulator`] and flushes it synchronously before pulling more
//! payloads once it is due, then exactly once more when the queue is closed
//! and empty. Output order across workers is unspecified; a sink that needs
//! ordering must impose it (see [`crate::sink::SerializedSink`] and the
//! time-ordered keys of [`crate::encoding::CompositeKeyEncoder`]).
//!
//! A fatal worker error latches an abort flag: [`IngestionPipeline::submit`]
//! starts failing, the other workers stop pulling and flush what they hold,
//! and [`IngestionPipeline::finish`] reports the first error.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAccumulator, FlushThreshold};
use crate::decoder::{DecodeOptions, SeenSymbols, decode};
use crate::encoding::Encoder;
use crate::error::{PipelineError, Result};
use crate::sink::Sink;
use crate::source::PacketSource;

/// What a worker does with a payload that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the whole run.
    #[default]
    Abort,
    /// Log, keep the records decoded before the error, and move on.
    SkipPayload,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub threshold: FlushThreshold,
    pub decode: DecodeOptions,
    pub on_decode_error: ErrorPolicy,
    /// Emit `symbol::` dictionary entries, deduplicated per payload.
    pub symbol_dictionary: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: 1024,
            threshold: FlushThreshold::default(),
            decode: DecodeOptions::default(),
            on_decode_error: ErrorPolicy::Abort,
            symbol_dictionary: false,
        }
    }
}

/// Twice the available hardware parallelism.
pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get()) * 2
}

/// Counters summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub payloads: usize,
    pub bytes: usize,
    /// Records produced by the decoder, symbol announcements included.
    pub records: usize,
    /// Writes handed to the sink.
    pub writes: usize,
    pub batches: usize,
    pub decode_errors: usize,
    /// Zero-length payloads, counted and skipped.
    pub empty_payloads: usize,
}

impl PipelineStats {
    fn merge(&mut self, other: &PipelineStats) {
        self.payloads += other.payloads;
        self.bytes += other.bytes;
        self.records += other.records;
        self.writes += other.writes;
        self.batches += other.batches;
        self.decode_errors += other.decode_errors;
        self.empty_payloads += other.empty_payloads;
    }
}

pub struct IngestionPipeline {
    tx: Option<Sender<Vec<u8>>>,
    workers: Vec<JoinHandle<Result<PipelineStats>>>,
    sink: Arc<dyn Sink>,
    aborted: Arc<AtomicBool>,
}

impl IngestionPipeline {
    /// Start `config.workers` workers pulling from a fresh bounded queue.
    pub fn spawn(config: PipelineConfig, encoder: Arc<dyn Encoder>, sink: Arc<dyn Sink>) -> Result<Self> {
        let (tx, rx) = bounded::<Vec<u8>>(config.queue_capacity.max(1));
        let aborted = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);
        let count = config.workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let worker = Worker {
                id,
                rx: rx.clone(),
                encoder: Arc::clone(&encoder),
                sink: Arc::clone(&sink),
                config: Arc::clone(&config),
                aborted: Arc::clone(&aborted),
            };
            let handle = thread::Builder::new()
                .name(format!("ingest-{id}"))
                .spawn(move || worker.run())
                .map_err(PipelineError::Spawn)?;
            workers.push(handle);
        }
        info!(workers = count, queue = config.queue_capacity, "pipeline started");
        Ok(Self { tx: Some(tx), workers, sink, aborted })
    }

    /// Enqueue one payload, blocking while the queue is full.
    pub fn submit(&self, payload: Vec<u8>) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(PipelineError::Aborted);
        }
        let tx = self.tx.as_ref().ok_or(PipelineError::Aborted)?;
        tx.send(payload).map_err(|_| PipelineError::Aborted)
    }

    /// Close the queue, wait for every worker to drain and flush, then finish the sink.
    pub fn finish(mut self) -> Result<PipelineStats> {
        drop(self.tx.take());
        let mut total = PipelineStats::default();
        let mut first_error = None;
        for (id, handle) in self.workers.drain(..).enumerate() {
            match handle.join() {
                Ok(Ok(stats)) => total.merge(&stats),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(PipelineError::WorkerPanicked(id));
                }
            }
        }
        let finished = self.sink.finish();
        if let Some(e) = first_error {
            if let Err(sink_err) = finished {
                error!("sink finish after failed run: {sink_err}");
            }
            return Err(e);
        }
        finished.map_err(PipelineError::SinkFinish)?;
        info!(
            payloads = total.payloads,
            records = total.records,
            batches = total.batches,
            decode_errors = total.decode_errors,
            empty = total.empty_payloads,
            "pipeline drained"
        );
        Ok(total)
    }

    /// Feed `source` through a new pipeline and wait for full drain.
    pub fn run<S: PacketSource>(
        config: PipelineConfig,
        encoder: Arc<dyn Encoder>,
        sink: Arc<dyn Sink>,
        source: S,
    ) -> Result<PipelineStats> {
        let pipeline = Self::spawn(config, encoder, sink)?;
        for payload in source {
            let payload = match payload {
                Ok(p) => p,
                Err(e) => {
                    if let Err(drain_err) = pipeline.finish() {
                        error!("drain after source failure: {drain_err}");
                    }
                    return Err(PipelineError::Source(e));
                }
            };
            if let Err(e) = pipeline.submit(payload) {
                // A worker failed; its error is the one worth reporting.
                return pipeline.finish().and(Err(e));
            }
        }
        pipeline.finish()
    }
}

struct Worker {
    id: usize,
    rx: Receiver<Vec<u8>>,
    encoder: Arc<dyn Encoder>,
    sink: Arc<dyn Sink>,
    config: Arc<PipelineConfig>,
    aborted: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) -> Result<PipelineStats> {
        let mut acc = BatchAccumulator::new(self.config.threshold);
        let mut stats = PipelineStats::default();
        match self.consume(&mut acc, &mut stats) {
            Ok(()) => {}
            Err(e @ PipelineError::SinkWrite { .. }) => return Err(self.fail(e)),
            Err(e) => {
                // Records from earlier payloads are still good.
                let e = self.fail(e);
                if let Err(flush_err) = self.flush(&mut acc, &mut stats) {
                    error!(worker = self.id, "residual flush failed: {flush_err}");
                }
                return Err(e);
            }
        }
        self.flush(&mut acc, &mut stats).map_err(|e| self.fail(e))?;
        debug!(
            worker = self.id,
            payloads = stats.payloads,
            records = stats.records,
            batches = stats.batches,
            "worker drained"
        );
        Ok(stats)
    }

    fn fail(&self, e: PipelineError) -> PipelineError {
        self.aborted.store(true, Ordering::Release);
        error!(worker = self.id, "{e}");
        e
    }

    fn consume(&self, acc: &mut BatchAccumulator, stats: &mut PipelineStats) -> Result<()> {
        let mut seen = SeenSymbols::new();
        for payload in self.rx.iter() {
            if self.aborted.load(Ordering::Acquire) {
                debug!(worker = self.id, "pipeline aborted, stop pulling");
                break;
            }
            stats.payloads += 1;
            stats.bytes += payload.len();
            if payload.is_empty() {
                stats.empty_payloads += 1;
                continue;
            }
            seen.clear();
            let dictionary = self.config.symbol_dictionary.then_some(&mut seen);
            let decoded = decode(&payload, &self.config.decode, dictionary);
            if let Some(err) = decoded.error {
                stats.decode_errors += 1;
                match self.config.on_decode_error {
                    ErrorPolicy::Abort => return Err(PipelineError::Decode { worker: self.id, source: err }),
                    ErrorPolicy::SkipPayload => warn!(
                        worker = self.id,
                        kept = decoded.records.len(),
                        "skipping rest of payload: {err}"
                    ),
                }
            }
            stats.records += decoded.records.len();
            for record in &decoded.records {
                if let Some(write) = self.encoder.encode(record) {
                    acc.push(write);
                    stats.writes += 1;
                }
            }
            if acc.is_due() {
                self.flush(acc, stats)?;
            }
        }
        Ok(())
    }

    fn flush(&self, acc: &mut BatchAccumulator, stats: &mut PipelineStats) -> Result<()> {
        if acc.is_empty() {
            return Ok(());
        }
        let (writes, bytes) = (acc.len(), acc.byte_size());
        self.sink
            .write_batch(acc.take())
            .map_err(|source| PipelineError::SinkWrite { worker: self.id, source })?;
        stats.batches += 1;
        debug!(worker = self.id, writes, bytes, "flushed batch");
        Ok(())
    }
}
