/// Fixed-capacity receive buffer of a single connection.
///
/// Valid data lives in `buf[start..offset]`, with `start <= offset <= capacity` at all times:
///  `start` is the first byte not yet consumed by framing, `offset` is where the next read goes.
///  The capacity never grows. It bounds the size of a single message, which keeps a misbehaving
///  server from exhausting memory.
pub struct RxBuffer {
    buf: Box<[u8]>,
    start: usize,
    offset: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compaction {
    /// there is still room after `offset`
    None,
    /// unconsumed bytes were moved to the front of the buffer
    Shifted,
    /// the buffer was full with nothing consumed, and its older half was dropped
    DiscardedHalf,
}

impl RxBuffer {
    pub fn new(capacity: usize) -> RxBuffer {
        RxBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn unconsumed_len(&self) -> usize {
        self.offset - self.start
    }

    /// The free space after `offset`, for the next read to go into
    pub fn write_space(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// Marks `n` bytes after `offset` as valid data, after they were written to [RxBuffer::write_space]
    pub fn commit(&mut self, n: usize) {
        assert!(self.offset + n <= self.buf.len(), "this is a bug: committed more than the write space");
        self.offset += n;
    }

    pub fn byte(&self, idx: usize) -> u8 {
        self.buf[idx]
    }

    pub fn slice(&self, from: usize, to: usize) -> &[u8] {
        &self.buf[from..to]
    }

    pub fn consume_to(&mut self, new_start: usize) {
        debug_assert!(new_start >= self.start && new_start <= self.offset);
        self.start = new_start;
    }

    /// Makes room for the next read once the buffer is full. This is a no-op while there is
    ///  free space after `offset`.
    pub fn compact(&mut self) -> Compaction {
        if self.start == self.offset {
            self.start = 0;
            self.offset = 0;
            return Compaction::None;
        }
        if self.offset < self.buf.len() {
            return Compaction::None;
        }

        if self.start == 0 {
            let half = self.buf.len() / 2;
            self.buf.copy_within(half.., 0);
            self.offset = self.buf.len() - half;
            Compaction::DiscardedHalf
        }
        else {
            self.buf.copy_within(self.start..self.offset, 0);
            self.offset -= self.start;
            self.start = 0;
            Compaction::Shifted
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.offset = 0;
    }
}
