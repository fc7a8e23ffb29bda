//! Fixed-capacity containers.
//!
//! `RingBuffer` holds the most recent bytes of a stream; `BoundedQueue`
//! is the capped FIFO behind the engine's write backpressure.

use std::collections::VecDeque;

use log::debug;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Ring Buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Circular byte store that evicts the oldest data on overflow.
///
/// After any sequence of writes, the buffer holds exactly the last
/// `capacity` bytes written, in order.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes, evicting the oldest content first if needed.
    ///
    /// Inputs larger than the capacity keep only their final
    /// `capacity` bytes.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if data.len() >= self.capacity {
            if !self.buf.is_empty() {
                debug!("ring buffer overflow, dropping {} bytes", self.buf.len());
            }
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            debug!("ring buffer overflow, dropping {} bytes", overflow);
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Remove and return up to `n` bytes from the front.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Bytes currently stored, oldest first, without consuming them.
    pub fn peek(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bounded Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// FIFO queue capped at `maxlen` entries.
///
/// `push` refuses new entries when full instead of evicting; the
/// rejection is the caller's backpressure signal.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    queue: VecDeque<T>,
    maxlen: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(maxlen: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(maxlen),
            maxlen,
        }
    }

    /// Append an item. Returns `false` when the queue is full.
    pub fn push(&mut self, item: T) -> bool {
        if self.queue.len() >= self.maxlen {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.maxlen
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_basic_write_read() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abc");
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.read(2), b"ab");
        assert_eq!(rb.read(10), b"c");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_ring_evicts_oldest_on_overflow() {
        let mut rb = RingBuffer::new(5);
        rb.write(b"12345");
        rb.write(b"AB");
        // last 5 bytes written
        assert_eq!(rb.read(5), b"345AB");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_ring_oversized_input_keeps_tail() {
        let mut rb = RingBuffer::new(5);
        rb.write(b"1234567890");
        assert_eq!(rb.read(5), b"67890");
    }

    #[test]
    fn test_ring_incremental_overflow() {
        let mut rb = RingBuffer::new(5);
        for b in b"abcdefgh" {
            rb.write(&[*b]);
        }
        assert_eq!(rb.peek(), b"defgh");
    }

    #[test]
    fn test_ring_clear() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"xyz");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.capacity(), 4);
    }

    #[test]
    fn test_ring_zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.write(b"data");
        assert!(rb.is_empty());
        assert_eq!(rb.read(4), b"");
    }

    #[test]
    fn test_queue_push_until_full() {
        let mut q = BoundedQueue::new(3);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert!(!q.push(4));
        assert_eq!(q.len(), 3);
        assert!(q.is_full());
    }

    #[test]
    fn test_queue_fifo_order() {
        let mut q = BoundedQueue::new(3);
        q.push("a");
        q.push("b");
        q.push("c");
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        // room again after popping
        assert!(q.push("d"));
        assert_eq!(q.pop(), Some("c"));
        assert_eq!(q.pop(), Some("d"));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_queue_clear() {
        let mut q = BoundedQueue::new(2);
        q.push(1);
        q.push(2);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.maxlen(), 2);
    }
}
