//! Single-writer, multi-reader byte ring (spec.md §4.4).
//!
//! Sized to `(history + pre-roll + client_read_delay) × sample_rate ×
//! bytes_per_sample × channels` by the caller. The writer (stage-1 engine,
//! draining DSP PCM) never blocks on readers — a reader that falls behind
//! by more than `capacity` bytes loses the overwritten prefix; that budget
//! is exactly the contract for "how slow a reader may be" (spec.md §4.4).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type ReaderId = usize;

/// Lifecycle of one fan-out reader (spec.md §3 "Ring buffer" invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderLifecycle {
    /// Registered but not yet consuming.
    Prepared,
    /// Actively consuming; counts against the writer's overwrite budget.
    Enabled,
    /// Not consuming; holds no bytes (invariant: "a disabled reader does not
    /// retain bytes").
    Disabled,
}

struct ReaderState {
    /// Monotonic count of bytes consumed (via `read`/`advance`) or released
    /// (on disable/reset).
    offset: u64,
    lifecycle: ReaderLifecycle,
    /// Last published `(start, end, ftrt)` byte offsets for this reader.
    indices: (usize, usize, usize),
}

struct RingInner {
    data: Vec<u8>,
    capacity: usize,
    /// Monotonic count of bytes written since construction.
    writer_offset: u64,
    readers: Vec<ReaderState>,
}

impl RingInner {
    fn clamp_reader_to_capacity(&mut self, idx: usize) {
        let cap = self.capacity as u64;
        let reader = &mut self.readers[idx];
        if self.writer_offset.saturating_sub(reader.offset) > cap {
            reader.offset = self.writer_offset - cap;
        }
    }
}

/// A contiguous byte ring with exactly one writer and `N` independent
/// readers (spec.md §4.4).
pub struct RingBuffer {
    inner: Arc<Mutex<RingInner>>,
    cv: Arc<Condvar>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingInner {
                data: vec![0u8; capacity.max(1)],
                capacity: capacity.max(1),
                writer_offset: 0,
                readers: Vec::new(),
            })),
            cv: Arc::new(Condvar::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Register a new reader, returning its id. New readers start caught up
    /// to the current writer position (no backlog).
    pub fn add_reader(&self) -> ReaderId {
        let mut inner = self.inner.lock();
        let id = inner.readers.len();
        let writer_offset = inner.writer_offset;
        inner.readers.push(ReaderState {
            offset: writer_offset,
            lifecycle: ReaderLifecycle::Prepared,
            indices: (0, 0, 0),
        });
        id
    }

    pub fn writer(&self) -> RingWriter {
        RingWriter {
            inner: Arc::clone(&self.inner),
            cv: Arc::clone(&self.cv),
        }
    }

    pub fn reader(&self, id: ReaderId) -> RingReader {
        RingReader {
            inner: Arc::clone(&self.inner),
            cv: Arc::clone(&self.cv),
            id,
        }
    }

    /// Publish `(start, end, ftrt)` on every reader in `reader_ids` — used
    /// by the stage-1 engine on each detection (spec.md §4.2, §4.4 "Index
    /// publication"). Visible to readers before the caller observes the
    /// stream's `buffering` transition (spec.md §5 "Ordering guarantees").
    pub fn publish_indices(&self, reader_ids: &[ReaderId], indices: (usize, usize, usize)) {
        let mut inner = self.inner.lock();
        for &id in reader_ids {
            if let Some(reader) = inner.readers.get_mut(id) {
                reader.indices = indices;
            }
        }
    }
}

/// Handle held by the stage-1 engine; the only side able to append bytes.
#[derive(Clone)]
pub struct RingWriter {
    inner: Arc<Mutex<RingInner>>,
    cv: Arc<Condvar>,
}

impl RingWriter {
    /// Append bytes. Never blocks; readers too far behind are clamped
    /// (their unread prefix is considered overwritten).
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let capacity = inner.capacity;
        let start = (inner.writer_offset % capacity as u64) as usize;

        if bytes.len() >= capacity {
            // Larger than the whole ring: only the tail survives.
            let tail = &bytes[bytes.len() - capacity..];
            inner.data[..].copy_from_slice(tail);
        } else {
            let first_len = (capacity - start).min(bytes.len());
            inner.data[start..start + first_len].copy_from_slice(&bytes[..first_len]);
            let remaining = bytes.len() - first_len;
            if remaining > 0 {
                inner.data[..remaining].copy_from_slice(&bytes[first_len..]);
            }
        }

        inner.writer_offset += bytes.len() as u64;
        for idx in 0..inner.readers.len() {
            inner.clamp_reader_to_capacity(idx);
        }
        drop(inner);
        self.cv.notify_all();
    }

    pub fn writer_offset(&self) -> u64 {
        self.inner.lock().writer_offset
    }
}

/// Handle held by one consumer (a stage-2 engine or the client LAB reader).
pub struct RingReader {
    inner: Arc<Mutex<RingInner>>,
    cv: Arc<Condvar>,
    id: ReaderId,
}

impl RingReader {
    /// Read up to `buf.len()` bytes, advancing this reader's position by
    /// the amount actually read. Returns 0 without error when disabled or
    /// when no bytes are available.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let capacity = inner.capacity;
        let reader = &inner.readers[self.id];
        if reader.lifecycle == ReaderLifecycle::Disabled {
            return 0;
        }
        let available = (inner.writer_offset - reader.offset).min(buf.len() as u64) as usize;
        if available == 0 {
            return 0;
        }
        let start = (reader.offset % capacity as u64) as usize;
        let first_len = (capacity - start).min(available);
        buf[..first_len].copy_from_slice(&inner.data[start..start + first_len]);
        let remaining = available - first_len;
        if remaining > 0 {
            buf[first_len..first_len + remaining].copy_from_slice(&inner.data[..remaining]);
        }
        inner.readers[self.id].offset += available as u64;
        available
    }

    /// Skip `n` bytes without copying them out — used to jump to a
    /// computed pre-start offset before the real read loop begins (spec.md
    /// §4.3 step 2).
    pub fn advance(&mut self, n: usize) {
        let mut inner = self.inner.lock();
        let writer_offset = inner.writer_offset;
        let reader = &mut inner.readers[self.id];
        reader.offset = (reader.offset + n as u64).min(writer_offset);
    }

    /// Seek to an absolute byte position in the writer's offset space,
    /// clamped to what the ring still holds — used by a stage-2 worker to
    /// rewind to a detection's pre-roll point, which may be behind this
    /// reader's current position (spec.md §4.3 step 2, "keyword-indices
    /// adjustment").
    pub fn seek_absolute(&mut self, offset: usize) {
        let mut inner = self.inner.lock();
        let writer_offset = inner.writer_offset;
        let capacity = inner.capacity as u64;
        let floor = writer_offset.saturating_sub(capacity);
        let reader = &mut inner.readers[self.id];
        reader.offset = (offset as u64).clamp(floor, writer_offset);
    }

    /// Block until at least `n` bytes are available, the reader is
    /// disabled, or `timeout` elapses. Returns `false` on timeout/disable.
    pub fn wait_for_buffers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let reader = &inner.readers[self.id];
            if reader.lifecycle == ReaderLifecycle::Disabled {
                return false;
            }
            if inner.writer_offset - reader.offset >= n as u64 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let wait_result = self.cv.wait_for(&mut inner, remaining.min(Duration::from_millis(20)));
            if wait_result.timed_out() && Instant::now() >= deadline {
                return false;
            }
        }
    }

    pub fn unread_size(&self) -> usize {
        let inner = self.inner.lock();
        (inner.writer_offset - inner.readers[self.id].offset) as usize
    }

    pub fn get_indices(&self) -> (usize, usize, usize) {
        self.inner.lock().readers[self.id].indices
    }

    /// Catch up to the current writer position, discarding any backlog.
    pub fn reset(&mut self) {
        let mut inner = self.inner.lock();
        let writer_offset = inner.writer_offset;
        let reader = &mut inner.readers[self.id];
        reader.offset = writer_offset;
        reader.indices = (0, 0, 0);
    }

    /// Transition this reader's lifecycle. Disabling releases any retained
    /// bytes immediately (invariant: "a disabled reader does not retain
    /// bytes").
    pub fn update_state(&mut self, lifecycle: ReaderLifecycle) {
        let mut inner = self.inner.lock();
        let writer_offset = inner.writer_offset;
        let reader = &mut inner.readers[self.id];
        reader.lifecycle = lifecycle;
        if lifecycle == ReaderLifecycle::Disabled {
            reader.offset = writer_offset;
        }
        drop(inner);
        self.cv.notify_all();
    }

    pub fn lifecycle(&self) -> ReaderLifecycle {
        self.inner.lock().readers[self.id].lifecycle
    }
}
