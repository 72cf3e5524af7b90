//! Bounded byte ring buffer shared by the decode and render threads

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a bounded-wait write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// All bytes were queued (possibly after evicting the oldest data)
    Written(usize),
    /// Space did not free up within the wait budget, nothing was written
    NoSpace,
    /// The exit flag was raised while waiting, nothing was written
    Exiting,
}

struct Inner {
    data: Box<[u8]>,
    read_pos: usize,
    len: usize,
    /// Bytes lost to overwrite since the last reset
    evicted: u64,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn evict(&mut self, count: usize) {
        let count = count.min(self.len);
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.len -= count;
        self.evicted += count as u64;
    }

    fn push(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        let write_pos = (self.read_pos + self.len) % cap;
        let first = bytes.len().min(cap - write_pos);
        self.data[write_pos..write_pos + first].copy_from_slice(&bytes[..first]);
        let rest = &bytes[first..];
        self.data[..rest.len()].copy_from_slice(rest);
        self.len += bytes.len();
    }

    fn pop(&mut self, buf: &mut [u8]) -> usize {
        let cap = self.capacity();
        let to_read = buf.len().min(self.len);
        let first = to_read.min(cap - self.read_pos);
        buf[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        buf[first..to_read].copy_from_slice(&self.data[..to_read - first]);
        self.read_pos = (self.read_pos + to_read) % cap;
        self.len -= to_read;
        to_read
    }

    /// Queue `bytes`, dropping the oldest queued data to make room
    fn push_overwrite(&mut self, mut bytes: &[u8]) -> usize {
        let cap = self.capacity();
        if bytes.len() > cap {
            self.evicted += (bytes.len() - cap) as u64;
            bytes = &bytes[bytes.len() - cap..];
        }
        let overflow = bytes.len().saturating_sub(self.free());
        self.evict(overflow);
        self.push(bytes);
        bytes.len()
    }
}

/// Fixed-capacity byte FIFO for one producer and one consumer
///
/// Non-blocking `read` returns 0 when empty. Writes either truncate to
/// the free space or, in overwrite mode, evict the oldest bytes.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    overwrite: bool,
}

impl RingBuffer {
    /// Create a truncating ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self::with_mode(capacity, false)
    }

    /// Create a ring buffer that evicts the oldest bytes when full
    pub fn with_overwrite(capacity: usize) -> Self {
        Self::with_mode(capacity, true)
    }

    fn with_mode(capacity: usize, overwrite: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                len: 0,
                evicted: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            overwrite,
        }
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Whether full writes evict old data instead of truncating
    pub fn is_overwrite(&self) -> bool {
        self.overwrite
    }

    /// Bytes queued and ready to read
    pub fn available(&self) -> usize {
        self.inner.lock().len
    }

    /// Bytes that can be written without eviction
    pub fn free_space(&self) -> usize {
        self.inner.lock().free()
    }

    /// Bytes discarded by overwrite since the last reset
    pub fn evicted_bytes(&self) -> u64 {
        self.inner.lock().evicted
    }

    /// Write without waiting
    ///
    /// Returns the number of bytes accepted from `data`.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let written = {
            let mut inner = self.inner.lock();
            if self.overwrite {
                inner.push_overwrite(data)
            } else {
                let n = data.len().min(inner.free());
                inner.push(&data[..n]);
                n
            }
        };
        if written > 0 {
            self.not_empty.notify_one();
        }
        written
    }

    /// Write all of `data`, waiting up to `timeout` for space to free up
    ///
    /// On timeout an overwrite buffer evicts the oldest bytes, a truncating
    /// buffer reports `NoSpace`. The wait is abandoned once `exit` is set
    /// and `wake_all` is called.
    pub fn write_timeout(&self, data: &[u8], timeout: Duration, exit: &AtomicBool) -> WriteStatus {
        if data.is_empty() {
            return WriteStatus::Written(0);
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let needed = data.len().min(inner.capacity());

        while inner.free() < needed {
            if exit.load(Ordering::Acquire) {
                return WriteStatus::Exiting;
            }
            if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        if exit.load(Ordering::Acquire) {
            return WriteStatus::Exiting;
        }

        let written = if inner.free() >= data.len() {
            inner.push(data);
            data.len()
        } else if self.overwrite {
            inner.push_overwrite(data)
        } else {
            return WriteStatus::NoSpace;
        };
        drop(inner);
        self.not_empty.notify_one();
        WriteStatus::Written(written)
    }

    /// Read whatever is queued into `buf` without waiting
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let read = self.inner.lock().pop(buf);
        if read > 0 {
            self.not_full.notify_one();
        }
        read
    }

    /// Read into `buf`, waiting up to `timeout` for data to arrive
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.len == 0 {
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        let read = inner.pop(buf);
        drop(inner);
        if read > 0 {
            self.not_full.notify_one();
        }
        read
    }

    /// Drop all queued bytes
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.read_pos = 0;
            inner.len = 0;
            inner.evicted = 0;
        }
        self.not_full.notify_all();
    }

    /// Wake every waiter so it can re-check its exit condition
    pub fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
