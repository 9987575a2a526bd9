//! Per-channel byte storage for queues. The buffer is `capacity + mirror`
//! bytes; the trailing `mirror` region stands in for the first `mirror`
//! bytes of the buffer so that any window of at most `mirror` bytes is
//! contiguous across wrap-around. Wrapped read windows copy the wrapped
//! prefix into the mirror region on demand; wrapped write windows are
//! handed out in the mirror region and copied back to the front on commit.
//!
//! Head and count live in the owning queue state (all channels advance in
//! lockstep); the ring only holds bytes.
//!
//! The mirror region is never used by both sides at once: read windows
//! reach into it only when the data region wraps, write windows only when
//! the free region wraps, and the two cannot wrap simultaneously.

use std::cmp::min;

pub(crate) struct ChannelRing {
    buf: Vec<u8>,
    capacity: usize,
    mirror: usize,
}

impl ChannelRing {
    pub fn new(capacity: usize, mirror: usize) -> ChannelRing {
        ChannelRing {
            buf: vec![0; capacity + mirror],
            capacity,
            mirror,
        }
    }

    /// Contiguous writable window of `thresh` bytes starting at `tail`.
    /// Requires `thresh <= mirror` (or an unwrapped fit) and
    /// `thresh <=` current freespace, both enforced by the caller.
    pub fn write_window(&mut self, tail: usize, thresh: usize) -> &mut [u8] {
        debug_assert!(tail < self.capacity || (tail == 0 && self.capacity == 0));
        debug_assert!(tail + thresh <= self.capacity + self.mirror);

        &mut self.buf[tail..tail + thresh]
    }

    /// Commit `n` bytes previously written at `tail`, folding any spill in
    /// the mirror region back onto the buffer front.
    pub fn commit_write(&mut self, tail: usize, n: usize) {
        if tail + n > self.capacity {
            let spill = tail + n - self.capacity;
            let (front, back) = self.buf.split_at_mut(self.capacity);
            front[..spill].copy_from_slice(&back[..spill]);
        }
    }

    /// Contiguous readable window of `thresh` bytes starting at `pos`,
    /// mirroring the wrapped prefix on demand. Requires `thresh` bytes of
    /// data to be present from `pos`.
    pub fn read_window(&mut self, pos: usize, thresh: usize) -> &[u8] {
        debug_assert!(pos < self.capacity || (pos == 0 && self.capacity == 0));
        debug_assert!(pos + thresh <= self.capacity + self.mirror);

        if pos + thresh > self.capacity {
            let spill = pos + thresh - self.capacity;
            let (front, back) = self.buf.split_at_mut(self.capacity);
            back[..spill].copy_from_slice(&front[..spill]);
        }

        &self.buf[pos..pos + thresh]
    }

    /// Copy `data` in at `tail` and commit it in one step.
    pub fn write_at(&mut self, tail: usize, data: &[u8]) {
        self.write_window(tail, data.len()).copy_from_slice(data);
        self.commit_write(tail, data.len());
    }

    /// Reallocate to the new geometry, linearizing `count` bytes of data
    /// starting at `head` to offset zero.
    pub fn resize(&mut self, head: usize, count: usize, new_capacity: usize, new_mirror: usize) {
        let mut buf = vec![0; new_capacity + new_mirror];

        if count > 0 {
            let first = min(count, self.capacity - head);
            buf[..first].copy_from_slice(&self.buf[head..head + first]);
            if count > first {
                buf[first..count].copy_from_slice(&self.buf[..count - first]);
            }
        }

        self.buf = buf;
        self.capacity = new_capacity;
        self.mirror = new_mirror;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_write_read() {
        let mut ring = ChannelRing::new(16, 4);

        ring.write_window(0, 4).copy_from_slice(b"abcd");
        ring.commit_write(0, 4);

        assert_eq!(ring.read_window(0, 4), b"abcd");
    }

    #[test]
    fn test_wrapped_write_folds_spill() {
        let mut ring = ChannelRing::new(8, 4);

        // Tail at 6, 4 byte window spills 2 bytes past capacity.
        ring.write_window(6, 4).copy_from_slice(b"wxyz");
        ring.commit_write(6, 4);

        // Bytes y, z must land at the buffer front.
        assert_eq!(ring.read_window(0, 2), b"yz");
        assert_eq!(ring.read_window(6, 2), b"wx");
    }

    #[test]
    fn test_wrapped_read_uses_mirror() {
        let mut ring = ChannelRing::new(8, 4);

        ring.write_at(6, b"wx");
        ring.write_at(0, b"yz");

        // Reading 4 bytes from position 6 crosses the wrap and must still be
        // contiguous.
        assert_eq!(ring.read_window(6, 4), b"wxyz");
    }

    #[test]
    fn test_resize_linearizes_wrapped_data() {
        let mut ring = ChannelRing::new(8, 4);

        ring.write_at(6, b"wx");
        ring.write_at(0, b"yz");

        ring.resize(6, 4, 16, 8);

        assert_eq!(ring.read_window(0, 4), b"wxyz");
    }

    #[test]
    fn test_resize_empty() {
        let mut ring = ChannelRing::new(8, 4);
        ring.resize(3, 0, 32, 8);
        ring.write_at(0, b"a");
        assert_eq!(ring.read_window(0, 1), b"a");
    }
}
