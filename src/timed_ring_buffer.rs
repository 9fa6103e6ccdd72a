/// Timestamp returned by [`TimedRingBuffer::peek`] when the queue holds nothing.
pub const NO_DATA: u32 = u32::MAX;

/// Fixed-capacity circular queue pairing every value with a release timestamp.
///
/// Used as a jitter/delay queue: the producer enqueues values tagged with the
/// time they become due, the consumer peeks the head timestamp and dequeues
/// once that time has passed.
///
/// There is no full check. Enqueuing while `N` entries are unread writes over
/// the slot at the write cursor and leaves the read cursor alone, so FIFO order
/// is lost rather than the write rejected. Size `N` for the worst burst.
///
/// No internal locking; share it behind a lock if more than one thread touches it.
pub struct TimedRingBuffer<T, const N: usize> {
    read_pos: usize,
    write_pos: usize,
    timestamps: [u32; N],
    values: [T; N],
}

impl<T: Copy + Default, const N: usize> TimedRingBuffer<T, N> {
    pub fn new() -> Self {
        const { assert!(N > 0, "TimedRingBuffer needs a non-zero capacity") };
        Self {
            read_pos: 0,
            write_pos: 0,
            timestamps: [0; N],
            values: [T::default(); N],
        }
    }

    /// Rewinds both cursors. Stored entries stay in place and get overwritten by later writes.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Timestamp of the next entry to dequeue, or [`NO_DATA`] when empty.
    pub fn peek(&self) -> u32 {
        if self.is_empty() {
            NO_DATA
        } else {
            self.timestamps[self.read_pos]
        }
    }

    /// Pops the head value. An empty queue yields `T::default()`, so check
    /// [`is_empty`](Self::is_empty) first when a default value is meaningful.
    pub fn dequeue(&mut self) -> T {
        if self.is_empty() {
            return T::default();
        }
        let value = self.values[self.read_pos];
        self.read_pos = (self.read_pos + 1) % N;
        value
    }

    pub fn enqueue(&mut self, timestamp: u32, value: T) {
        self.timestamps[self.write_pos] = timestamp;
        self.values[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % N;
    }

    /// Number of unread entries as seen by the cursors.
    pub fn len(&self) -> usize {
        (self.write_pos + N - self.read_pos) % N
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy + Default, const N: usize> Default for TimedRingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
