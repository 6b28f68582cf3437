//! Elastic byte FIFO with read/write cursors
//!
//! Every `Socket` owns two of these: one staging received bytes for the
//! read callback, one holding outbound bytes the kernel would not take
//! synchronously. The invariant throughout is
//! `read_pos <= write_pos <= capacity`, where the write position is the
//! length of the backing vector.
//!
//! # Growth
//!
//! `reserve` first compacts unread bytes to offset 0 and only grows the
//! backing storage if compaction did not free enough room. Compaction
//! never discards unread bytes, and drained bytes always come out in
//! exact append order.

/// Result of [`Buffer::drain_until`].
#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    /// Delimiter found; bytes up to and including it.
    Matched(Vec<u8>),
    /// Delimiter absent; everything readable was drained instead.
    NoMatch(Vec<u8>),
}

impl Drained {
    /// The drained bytes, match or not.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Drained::Matched(b) | Drained::NoMatch(b) => b,
        }
    }

    /// True when the delimiter was found.
    #[inline]
    pub fn matched(&self) -> bool {
        matches!(self, Drained::Matched(_))
    }
}

/// Elastic byte FIFO.
///
/// The readable region is `data[read_pos..]`; appends go past the end
/// of the vector.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl Buffer {
    /// Default initial capacity for socket staging buffers.
    pub const INITIAL_CAPACITY: usize = 4096;

    /// Create an empty buffer with no allocation.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
        }
    }

    /// Create with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Number of readable (appended, not yet drained) bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// True when no bytes are readable.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.data.len()
    }

    /// Bytes that can be appended without compaction or reallocation.
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// The readable region.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Guarantee `writable() >= n`.
    ///
    /// Compacts unread bytes to offset 0 first; grows the backing
    /// storage only if compaction was insufficient.
    pub fn reserve(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.read_pos > 0 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
        let writable = self.data.capacity() - self.data.len();
        if writable < n {
            self.data.reserve(n - writable);
        }
    }

    /// Append bytes, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Append up to `n` bytes produced by `fill`.
    ///
    /// `fill` receives a zeroed scratch region of exactly `n` bytes and
    /// returns how many it actually wrote; the rest is rolled back.
    /// Lets OS-level code receive straight into the buffer without an
    /// intermediate copy buffer.
    pub fn append_with<F>(&mut self, n: usize, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        self.reserve(n);
        let start = self.data.len();
        self.data.resize(start + n, 0);
        let wrote = fill(&mut self.data[start..start + n]);
        debug_assert!(wrote <= n);
        self.data.truncate(start + wrote.min(n));
        wrote
    }

    /// Discard `n` readable bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n).min(self.data.len());
        if self.read_pos == self.data.len() {
            // Nothing readable left; rewind so future appends reuse the
            // full capacity without compaction.
            self.data.clear();
            self.read_pos = 0;
        }
    }

    /// Drain and return every readable byte.
    pub fn drain_all(&mut self) -> Vec<u8> {
        let out = self.data.split_off(self.read_pos);
        self.data.clear();
        self.read_pos = 0;
        out
    }

    /// Drain up to and including `delim`.
    ///
    /// If the delimiter is not present, everything readable is drained
    /// and the miss is reported via [`Drained::NoMatch`] rather than
    /// holding bytes back.
    pub fn drain_until(&mut self, delim: &[u8]) -> Drained {
        if delim.is_empty() {
            return Drained::NoMatch(self.drain_all());
        }
        let readable = self.readable();
        let found = readable
            .windows(delim.len())
            .position(|w| w == delim)
            .map(|i| i + delim.len());
        match found {
            Some(end) => {
                let out = readable[..end].to_vec();
                self.consume(end);
                Drained::Matched(out)
            }
            None => Drained::NoMatch(self.drain_all()),
        }
    }
}
