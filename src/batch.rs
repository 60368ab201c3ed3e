//! Per-worker write buffer.
use serde::{Deserialize, Serialize};

/// One encoded key/value pair bound for a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Write {
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub writes: Vec<Write>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Self {
        Self { writes: Vec::with_capacity(n) }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(Write { key, value });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Sum of key and value lengths.
    pub fn byte_size(&self) -> usize {
        self.writes.iter().map(Write::size).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Write> {
        self.writes.iter()
    }
}

/// When a worker must hand its batch to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushThreshold {
    Records(usize),
    Bytes(usize),
}

impl Default for FlushThreshold {
    fn default() -> Self {
        FlushThreshold::Records(4096)
    }
}

/// Buffer of pending writes owned by exactly one worker.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch: Batch,
    bytes: usize,
    threshold: FlushThreshold,
}

impl BatchAccumulator {
    pub fn new(threshold: FlushThreshold) -> Self {
        let cap = match threshold {
            FlushThreshold::Records(n) => n.min(1 << 16),
            FlushThreshold::Bytes(_) => 1024,
        };
        Self { batch: Batch::with_capacity(cap), bytes: 0, threshold }
    }

    pub fn push(&mut self, write: Write) {
        self.bytes += write.size();
        self.batch.writes.push(write);
    }

    pub fn is_due(&self) -> bool {
        match self.threshold {
            FlushThreshold::Records(n) => self.batch.len() >= n.max(1),
            FlushThreshold::Bytes(n) => self.bytes >= n.max(1),
        }
    }

    /// Hand over the pending writes and start a new batch.
    pub fn take(&mut self) -> Batch {
        self.bytes = 0;
        let cap = self.batch.writes.capacity();
        std::mem::replace(&mut self.batch, Batch::with_capacity(cap))
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }
}
