//! Bounded FIFO byte queues with channels and threshold window semantics.
//! `QueueWriter`/`QueueReader` are the two single-owner endpoint handles; a
//! node cannot tell from them whether the peer endpoint lives in the same
//! kernel or behind a stream.

pub(crate) mod local;
pub(crate) mod remote;
pub(crate) mod ring;

pub use self::local::QueueCore;
pub(crate) use self::local::Role;
pub use self::remote::RemoteQueueSpec;

use crate::attr::QueueAttr;
use crate::error::{QueueResult, RuntimeResult};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weir::logging::Logger;

/// Writer endpoint handle. Single owner: the thread that requests a window
/// must be the thread that commits it.
pub struct QueueWriter {
    core: Arc<QueueCore>,
}

impl QueueWriter {
    pub(crate) fn new(core: Arc<QueueCore>) -> QueueWriter {
        QueueWriter { core }
    }

    #[inline]
    pub fn freespace(&self) -> usize {
        self.core.freespace()
    }

    #[inline]
    pub fn full(&self) -> bool {
        self.core.freespace() == 0
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.core.num_channels()
    }

    #[inline]
    pub fn channel_stride(&self) -> usize {
        self.core.channel_stride()
    }

    #[inline]
    pub fn max_threshold(&self) -> usize {
        self.core.max_threshold()
    }

    /// Blocking request for a contiguous writable window of at least `thresh`
    /// bytes in `chan`. The returned slice is valid until the next `enqueue`;
    /// repeated calls may return different windows.
    pub fn enqueue_window(&mut self, thresh: usize, chan: usize) -> QueueResult<&mut [u8]> {
        let (ptr, len) = self.core.enqueue_window_raw(thresh, chan)?;
        // The open-window flag pins the storage until the matching enqueue,
        // and the reader never touches the free region the window covers.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
    }

    /// Commit `count` bytes across all channels.
    pub fn enqueue(&mut self, count: usize) -> QueueResult<()> {
        self.core.enqueue(count)
    }

    /// Copy `data` into the queue, blocking until everything is written.
    pub fn enqueue_bytes(&mut self, data: &[u8]) -> QueueResult<()> {
        let mut offset = 0;

        while offset < data.len() {
            let chunk = (data.len() - offset).min(self.core.max_threshold());
            let window = self.enqueue_window(chunk, 0)?;
            window[..chunk].copy_from_slice(&data[offset..offset + chunk]);
            self.core.enqueue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    /// Multi-channel copy-in: channel `c` reads from `data[c * stride..]`.
    pub fn enqueue_channels(&mut self, data: &[u8], count: usize, stride: usize) -> QueueResult<()> {
        let channels = self.core.num_channels();
        assert!(
            data.len() >= (channels - 1) * stride + count,
            "source buffer too small for {} channels of {} bytes",
            channels,
            count
        );

        let mut offset = 0;
        while offset < count {
            let chunk = (count - offset).min(self.core.max_threshold());

            for chan in 0..channels {
                let window = self.enqueue_window(chunk, chan)?;
                let src = &data[chan * stride + offset..chan * stride + offset + chunk];
                window[..chunk].copy_from_slice(src);
            }
            self.core.enqueue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    /// Signal end-of-data. The reader drains what is buffered and then sees
    /// `Closed`.
    pub fn shutdown(&mut self) {
        self.core.writer_shutdown();
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        self.core.writer_shutdown();
    }
}

/// Reader endpoint handle; mirror image of `QueueWriter`.
pub struct QueueReader {
    core: Arc<QueueCore>,
}

impl QueueReader {
    pub(crate) fn new(core: Arc<QueueCore>) -> QueueReader {
        QueueReader { core }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.core.count()
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.core.count() == 0
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.core.num_channels()
    }

    #[inline]
    pub fn channel_stride(&self) -> usize {
        self.core.channel_stride()
    }

    #[inline]
    pub fn max_threshold(&self) -> usize {
        self.core.max_threshold()
    }

    /// Blocking request for a contiguous readable window of at least `thresh`
    /// bytes in `chan`.
    pub fn dequeue_window(&mut self, thresh: usize, chan: usize) -> QueueResult<&[u8]> {
        let (ptr, len) = self.core.dequeue_window_raw(thresh, chan)?;
        Ok(unsafe { slice::from_raw_parts(ptr, len) })
    }

    /// Release `count` bytes from all channels.
    pub fn dequeue(&mut self, count: usize) -> QueueResult<()> {
        self.core.dequeue(count)
    }

    /// Fill `out` from the queue, blocking until complete.
    pub fn dequeue_bytes(&mut self, out: &mut [u8]) -> QueueResult<()> {
        let mut offset = 0;

        while offset < out.len() {
            let chunk = (out.len() - offset).min(self.core.max_threshold());
            let window = self.dequeue_window(chunk, 0)?;
            out[offset..offset + chunk].copy_from_slice(&window[..chunk]);
            self.core.dequeue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    /// Multi-channel copy-out: channel `c` lands in `out[c * stride..]`.
    pub fn dequeue_channels(&mut self, out: &mut [u8], count: usize, stride: usize) -> QueueResult<()> {
        let channels = self.core.num_channels();
        assert!(
            out.len() >= (channels - 1) * stride + count,
            "destination buffer too small for {} channels of {} bytes",
            channels,
            count
        );

        let mut offset = 0;
        while offset < count {
            let chunk = (count - offset).min(self.core.max_threshold());

            for chan in 0..channels {
                let window = self.dequeue_window(chunk, chan)?;
                out[chan * stride + offset..chan * stride + offset + chunk]
                    .copy_from_slice(&window[..chunk]);
            }
            self.core.dequeue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    /// Abandon the stream; unread and in-flight data is discarded.
    pub fn shutdown(&mut self) {
        self.core.reader_shutdown();
    }
}

impl Drop for QueueReader {
    fn drop(&mut self) {
        self.core.reader_shutdown();
    }
}

static STANDALONE_KEYS: AtomicU64 = AtomicU64::new(1 << 48);

/// Build a standalone local queue outside any kernel. Used by tests, the
/// benchmarks and embedders that only need the FIFO.
pub fn local_pair<'a, L: Into<Option<&'a Logger>>>(
    attr: &QueueAttr,
    log: L,
) -> RuntimeResult<(QueueWriter, QueueReader)> {
    attr.validate()?;

    let key = STANDALONE_KEYS.fetch_add(1, Ordering::Relaxed);
    let core = QueueCore::build(attr, Role::Local, key, false, log);

    Ok((QueueWriter::new(core.clone()), QueueReader::new(core)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::attr::PortRef;

    pub(crate) fn standalone_core(capacity: usize) -> Arc<QueueCore> {
        let attr = QueueAttr::new(
            "standalone",
            PortRef::new("w", "out"),
            PortRef::new("r", "in"),
            capacity,
        );
        let key = STANDALONE_KEYS.fetch_add(1, Ordering::Relaxed);
        QueueCore::build(&attr, Role::Local, key, false, None)
    }
}
