//! Circular buffer for scrollback replay when a client switches to a session.
//!
//! Stores the last N bytes of PTY output so that a late-attaching viewer
//! can receive recent history without the server keeping unbounded output.

/// A fixed-capacity circular byte buffer.
///
/// The arena is allocated once; `start` points at the oldest byte and
/// `len` counts valid bytes, so `len <= capacity` always holds.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Index of the oldest buffered byte.
    start: usize,
    /// Number of valid bytes.
    len: usize,
    /// Total bytes ever appended.
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
            total_written: 0,
        }
    }

    /// Append data, evicting the oldest bytes once full.
    ///
    /// A chunk at least as large as the capacity replaces the whole
    /// buffer with its trailing `capacity` bytes.
    pub fn append(&mut self, data: &[u8]) {
        let capacity = self.buf.len();
        if capacity == 0 || data.is_empty() {
            return;
        }
        self.total_written += data.len() as u64;

        if data.len() >= capacity {
            self.buf.copy_from_slice(&data[data.len() - capacity..]);
            self.start = 0;
            self.len = capacity;
            return;
        }

        // Copy into the free region after the logical end, in at most two runs.
        let end = (self.start + self.len) % capacity;
        let first = data.len().min(capacity - end);
        self.buf[end..end + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }

        let new_len = self.len + data.len();
        if new_len > capacity {
            let overflow = new_len - capacity;
            self.start = (self.start + overflow) % capacity;
            self.len = capacity;
        } else {
            self.len = new_len;
        }
    }

    /// Buffered bytes in chronological order (oldest first).
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        if self.is_empty() {
            return out;
        }
        let capacity = self.buf.len();
        let first = self.len.min(capacity - self.start);
        out.extend_from_slice(&self.buf[self.start..self.start + first]);
        out.extend_from_slice(&self.buf[..self.len - first]);
        out
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes ever appended through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_append_snapshot() {
        let mut rb = RingBuffer::new(10);
        rb.append(b"hello");
        assert_eq!(rb.snapshot(), b"hello");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn wrap_around() {
        let mut rb = RingBuffer::new(5);
        rb.append(b"abcde"); // fills exactly
        rb.append(b"fg"); // overwrites a, b
        assert_eq!(rb.snapshot(), b"cdefg");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn append_exactly_fills_remaining() {
        let mut rb = RingBuffer::new(8);
        rb.append(b"abc");
        rb.append(b"defgh");
        assert_eq!(rb.len(), 8);
        assert_eq!(rb.snapshot(), b"abcdefgh");
        rb.append(b"i");
        assert_eq!(rb.snapshot(), b"bcdefghi");
    }

    #[test]
    fn append_exactly_fills_after_wrap() {
        let mut rb = RingBuffer::new(6);
        rb.append(b"abcdef");
        rb.append(b"gh"); // start = 2
        rb.append(b"ijklmn"); // exactly capacity
        assert_eq!(rb.snapshot(), b"ijklmn");
        rb.append(b"op");
        rb.append(b"q");
        assert_eq!(rb.snapshot(), b"lmnopq");
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut rb = RingBuffer::new(4);
        rb.append(b"xy");
        rb.append(b"0123456789");
        assert_eq!(rb.snapshot(), b"6789");
        assert_eq!(rb.total_written(), 12);
    }

    #[test]
    fn empty_buffer_and_empty_append() {
        let mut rb = RingBuffer::new(10);
        rb.append(b"");
        assert!(rb.is_empty());
        assert_eq!(rb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn zero_capacity() {
        let mut rb = RingBuffer::new(0);
        rb.append(b"test");
        assert!(rb.is_empty());
        assert_eq!(rb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn always_equals_trailing_bytes() {
        // Varying chunk sizes across several wraps, checked against the full stream.
        let capacity = 37;
        let mut rb = RingBuffer::new(capacity);
        let mut all = Vec::new();
        let mut next = 0u8;
        for round in 0..200usize {
            let size = (round * 7 + 3) % 53;
            let chunk: Vec<u8> = (0..size)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            rb.append(&chunk);
            all.extend_from_slice(&chunk);

            assert!(rb.len() <= capacity);
            let expected = &all[all.len().saturating_sub(capacity)..];
            assert_eq!(rb.snapshot(), expected, "mismatch after round {round}");
        }
    }
}
