//! Stream I/O buffer backed by a `SliceDeque`, which keeps the contents
//! contiguous across wrap-around via mirrored pages. Data is appended at the
//! tail and drained from the head.

use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Sizes are rounded up to whole mirror pages.
const BUF_SIZE_INCREMENT: usize = 65536;

pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    /// Allocate a buffer holding at least `size` bytes.
    pub fn new(size: usize) -> Buffer {
        let size = match size % BUF_SIZE_INCREMENT {
            0 => size,
            rem => size + (BUF_SIZE_INCREMENT - rem),
        };

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free capacity remaining for appends.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Drop `count` bytes off the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// The buffered bytes.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Append a byte run; panics if it does not fit. Callers check
    /// `free_capacity` first.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.free_capacity(),
            "Buffer overrun: {} bytes into {} free",
            bytes.len(),
            self.free_capacity()
        );

        unsafe {
            self.data.tail_head_slice()[..bytes.len()].copy_from_slice(bytes);
            self.data.move_tail(bytes.len() as isize);
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Read from `reader` until it would block, the buffer fills, or the
    /// stream ends. Returns the byte count taken in; `Ok(0)` on a clean EOF
    /// with nothing read is indistinguishable from an idle socket, so callers
    /// track EOF via the error path of their transport.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.data.len() < self.size {
            unsafe {
                match reader.read(self.data.tail_head_slice()) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(count) => {
                        self.data.move_tail(count as isize);
                        total += count;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(total)
    }

    /// Write buffered data to `writer` until it would block or the buffer
    /// drains. Returns the byte count written out.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct ChunkedPipe {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl io::Read for ChunkedPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let take = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..take].copy_from_slice(&self.data[self.cursor..self.cursor + take]);
            self.cursor += take;
            Ok(take)
        }
    }

    #[test]
    fn test_size_rounds_up() {
        let buffer = Buffer::new(100_000);
        assert_eq!(buffer.free_capacity(), 2 * BUF_SIZE_INCREMENT);
    }

    #[test]
    fn test_ingress_stops_on_would_block() {
        let data: Vec<u8> = (0..1000u32).map(|value| value as u8).collect();
        let mut pipe = ChunkedPipe {
            data: data.clone(),
            cursor: 0,
            chunk: 97,
        };

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let taken = buffer.ingress(&mut pipe).unwrap();

        assert_eq!(taken, data.len());
        assert_eq!(buffer.read_slice(), &data[..]);
    }

    #[test]
    fn test_ingress_eof_is_error() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let result = buffer.ingress(Cursor::new(Vec::<u8>::new()));

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_roundtrip() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.push_bytes(b"frame data");

        let mut out = Vec::new();
        let written = buffer.egress(&mut out).unwrap();

        assert_eq!(written, 10);
        assert_eq!(out, b"frame data");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_consume_partial() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.push_bytes(b"abcdef");
        buffer.consume(2);

        assert_eq!(buffer.read_slice(), b"cdef");
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_push_beyond_capacity_panics() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let big = vec![0u8; BUF_SIZE_INCREMENT + 1];
        buffer.push_bytes(&big);
    }
}
