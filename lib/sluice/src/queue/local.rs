//! The queue engine: a mutex/condvar protected multi-channel ring with
//! threshold window semantics. One `QueueCore` backs a purely local queue
//! (both endpoints in this kernel) or one half of a distributed queue, in
//! which case the hub pump plays the role of the missing endpoint and the
//! core additionally tracks what must be said to the peer half.

use crate::attr::QueueAttr;
use crate::d4r::{self, D4rNode, Site, Tag};
use crate::error::{QueueError, QueueResult};
use crate::net::hub::HubKick;
use crate::queue::ring::ChannelRing;
use std::cmp::max;
use std::sync::{Arc, Condvar, Mutex, Weak};
use weir::logging::{self, Logger};

/// Which endpoint of the queue this core serves locally.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Role {
    /// Both endpoints are in this kernel.
    Local,
    /// The writer endpoint is local; data leaves through the stream hub.
    RemoteWriter,
    /// The reader endpoint is local; data arrives through the stream hub.
    RemoteReader,
}

pub(crate) struct CoreState {
    pub channels: Vec<ChannelRing>,
    pub capacity: usize,
    pub max_threshold: usize,
    pub head: usize,
    pub count: usize,

    /// Open window thresholds; a `Some` blocks buffer resizes.
    pub write_window: Option<usize>,
    pub read_window: Option<usize>,

    pub write_shut: bool,
    pub read_shut: bool,
    pub terminated: bool,
    pub broken: bool,

    pub grow_enabled: bool,
    pub alpha: f64,
    /// Resize deferred until no window is open.
    pub pending_resize: Option<(usize, usize)>,
    /// Sizes requested from the peer half, awaiting the GROW echo.
    pub grow_requested: Option<(usize, usize)>,
    /// GROW frame to emit.
    pub grow_to_send: Option<(usize, usize)>,

    pub writer_waiting: Option<usize>,
    pub reader_waiting: Option<usize>,
    /// Last READ_BLOCK/WRITE_BLOCK request received from the peer half.
    pub peer_hint: Option<usize>,

    pub writer_tag: Tag,
    pub reader_tag: Tag,

    /// Writer half: bytes shipped to the peer but not yet acknowledged,
    /// measured from `head`.
    pub sent: usize,
    /// Reader half: dequeued bytes not yet acknowledged to the peer.
    pub pending_ack: usize,
    /// WRITE_BLOCK/READ_BLOCK frame to emit.
    pub block_to_send: Option<usize>,
    /// END_OF_WRITE/END_OF_READ to emit.
    pub eos_to_send: bool,
    pub eos_sent: bool,
}

pub struct QueueCore {
    name: String,
    pub(crate) role: Role,
    /// Queue identity in detector tags: the writer endpoint key.
    key: u64,
    channels: usize,
    stride: usize,
    datatype: String,
    swallow_broken: bool,
    pub(crate) state: Mutex<CoreState>,
    pub(crate) readable: Condvar,
    pub(crate) writable: Condvar,
    notify: Mutex<Option<HubKick>>,
    d4r_writer: Mutex<Option<Arc<D4rNode>>>,
    d4r_reader: Mutex<Option<Arc<D4rNode>>>,
    weak_self: Mutex<Weak<QueueCore>>,
    pub(crate) log: Logger,
}

impl QueueCore {
    pub(crate) fn build<'a, L: Into<Option<&'a Logger>>>(
        attr: &QueueAttr,
        role: Role,
        key: u64,
        swallow_broken: bool,
        log: L,
    ) -> Arc<QueueCore> {
        let capacity = attr.capacity;
        let max_threshold = attr.effective_max_threshold();

        let core = Arc::new(QueueCore {
            name: attr.name.clone(),
            role,
            key,
            channels: attr.channels,
            stride: attr.stride,
            datatype: attr.datatype.clone(),
            swallow_broken,
            state: Mutex::new(CoreState {
                channels: (0..attr.channels)
                    .map(|_| ChannelRing::new(capacity, max_threshold))
                    .collect(),
                capacity,
                max_threshold,
                head: 0,
                count: 0,
                write_window: None,
                read_window: None,
                write_shut: false,
                read_shut: false,
                terminated: false,
                broken: false,
                grow_enabled: attr.grow_on_max_threshold,
                alpha: attr.alpha,
                pending_resize: None,
                grow_requested: None,
                grow_to_send: None,
                writer_waiting: None,
                reader_waiting: None,
                peer_hint: None,
                writer_tag: Tag::NONE,
                reader_tag: Tag::NONE,
                sent: 0,
                pending_ack: 0,
                block_to_send: None,
                eos_to_send: false,
                eos_sent: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            notify: Mutex::new(None),
            d4r_writer: Mutex::new(None),
            d4r_reader: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
            log: logging::component(log),
        });

        *core.weak_self.lock().unwrap() = Arc::downgrade(&core);
        core
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    #[inline]
    pub(crate) fn queue_key(&self) -> u64 {
        self.key
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels
    }

    /// Per-channel stride as declared on the attr; defaults to the capacity
    /// for callers that never set one.
    #[inline]
    pub fn channel_stride(&self) -> usize {
        match self.stride {
            0 => self.state.lock().unwrap().capacity,
            stride => stride,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    #[inline]
    pub fn max_threshold(&self) -> usize {
        self.state.lock().unwrap().max_threshold
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    #[inline]
    pub fn freespace(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.capacity - state.count
    }

    pub(crate) fn attach_hub(&self, kick: HubKick) {
        *self.notify.lock().unwrap() = Some(kick);
    }

    pub(crate) fn attach_d4r(&self, writer_side: bool, node: Arc<D4rNode>) {
        if writer_side {
            *self.d4r_writer.lock().unwrap() = Some(node);
        } else {
            *self.d4r_reader.lock().unwrap() = Some(node);
        }
    }

    fn site(&self, writer: bool) -> Option<Site> {
        self.weak_self
            .lock()
            .unwrap()
            .upgrade()
            .map(|core| Site { core, writer })
    }

    pub(crate) fn kick(&self) {
        if let Some(kick) = self.notify.lock().unwrap().as_ref() {
            kick.kick();
        }
    }

    fn side_d4r(&self, writer: bool) -> Option<Arc<D4rNode>> {
        if writer {
            self.d4r_writer.lock().unwrap().clone()
        } else {
            self.d4r_reader.lock().unwrap().clone()
        }
    }

    fn broken_error(&self) -> QueueError {
        weir::choose!(self.swallow_broken => QueueError::Closed, QueueError::Broken)
    }
}

// Sizing and growth.
impl QueueCore {
    fn apply_resize(state: &mut CoreState, capacity: usize, max_threshold: usize) {
        for ring in &mut state.channels {
            ring.resize(state.head, state.count, capacity, max_threshold);
        }
        state.head = 0;
        state.capacity = capacity;
        state.max_threshold = max_threshold;
    }

    pub(crate) fn schedule_resize(&self, state: &mut CoreState, capacity: usize, max_threshold: usize) {
        let capacity = max(capacity, state.capacity);
        let max_threshold = max(max_threshold, state.max_threshold);

        if capacity == state.capacity && max_threshold == state.max_threshold {
            return;
        }

        logging::debug!(self.log, "queue resize";
                        "queue" => &self.name,
                        "capacity" => capacity,
                        "max_threshold" => max_threshold);

        match state.pending_resize {
            Some((cap, mt)) => {
                state.pending_resize = Some((max(cap, capacity), max(mt, max_threshold)))
            }
            None => {
                if state.write_window.is_none() && state.read_window.is_none() {
                    Self::apply_resize(state, capacity, max_threshold);
                } else {
                    state.pending_resize = Some((capacity, max_threshold));
                }
            }
        }
    }

    pub(crate) fn maybe_apply_pending(state: &mut CoreState) {
        if state.write_window.is_none() && state.read_window.is_none() {
            if let Some((capacity, max_threshold)) = state.pending_resize.take() {
                Self::apply_resize(state, capacity, max_threshold);
            }
        }
    }

    /// Enlarge the queue so a window of `thresh` bytes can be satisfied with
    /// `count` bytes resident. Local queues resize in place; the reader half
    /// of a distributed queue resizes and announces, the writer half asks the
    /// peer first and resizes on the echo. Returns true when the hub must be
    /// kicked.
    fn grow_locked(&self, state: &mut CoreState, thresh: usize) -> bool {
        let new_mt = max(state.max_threshold, thresh);
        let needed = ((state.count + thresh) as f64 / state.alpha).ceil() as usize;
        let new_cap = max(state.capacity, needed);

        match self.role {
            Role::Local => {
                self.schedule_resize(state, new_cap, new_mt);
                false
            }
            Role::RemoteReader => {
                self.schedule_resize(state, new_cap, new_mt);
                state.grow_to_send = Some((new_cap, new_mt));
                true
            }
            Role::RemoteWriter => {
                state.grow_requested = Some((new_cap, new_mt));
                state.grow_to_send = Some((new_cap, new_mt));
                true
            }
        }
    }

    /// Deadlock relief entry: grow for whatever threshold the blocked side is
    /// waiting on.
    pub(crate) fn relieve(&self, writer: bool) {
        let kick = {
            let mut state = self.state.lock().unwrap();

            let thresh = if writer {
                state.writer_waiting
            } else {
                state.reader_waiting
            };

            let thresh = match thresh {
                Some(thresh) => thresh,
                // The blocked operation already completed; nothing to do.
                None => return,
            };

            logging::debug!(self.log, "growing queue for deadlock relief";
                            "queue" => &self.name,
                            "thresh" => thresh,
                            "writer_side" => writer);

            self.grow_locked(&mut state, thresh)
        };

        self.readable.notify_all();
        self.writable.notify_all();

        if kick {
            self.kick();
        }
    }

    /// Store a propagated detector tag on one side and return the in-process
    /// peer node to continue the chain, if there is one. Distributed halves
    /// re-announce their block frame so the updated tag crosses the wire.
    pub(crate) fn stamp_tag(&self, writer: bool, tag: Tag) -> Option<Arc<D4rNode>> {
        let kick = {
            let mut state = self.state.lock().unwrap();

            if writer {
                state.writer_tag = tag;
                if self.role == Role::RemoteWriter {
                    state.block_to_send = state.writer_waiting;
                }
            } else {
                state.reader_tag = tag;
                if self.role == Role::RemoteReader {
                    state.block_to_send = state.reader_waiting;
                }
            }

            self.role != Role::Local && state.block_to_send.is_some()
        };

        if kick {
            self.kick();
        }

        match self.role {
            Role::Local => self.side_d4r(!writer),
            _ => None,
        }
    }
}

// Writer-facing operations.
impl QueueCore {
    fn writer_should_wait(state: &CoreState, thresh: usize) -> bool {
        !state.terminated
            && !state.broken
            && !state.read_shut
            && !state.write_shut
            && (thresh > state.max_threshold || state.capacity - state.count < thresh)
    }

    /// Blocking request for a contiguous writable window of `thresh` bytes in
    /// `chan`. Returns a raw pointer valid until the matching `enqueue`; the
    /// open-window flag keeps the storage pinned until then.
    pub(crate) fn enqueue_window_raw(&self, thresh: usize, chan: usize) -> QueueResult<(*mut u8, usize)> {
        assert!(chan < self.channels, "channel {} out of range on queue {}", chan, self.name);

        enum Outcome {
            Ready(*mut u8),
            Fail(QueueError),
            FirstBlock(u64),
            Wait,
        }

        let mut stamped = false;

        loop {
            let mut kick = false;

            let outcome = {
                let mut state = self.state.lock().unwrap();

                if state.terminated {
                    Outcome::Fail(QueueError::KernelShutdown)
                } else if state.broken {
                    Outcome::Fail(self.broken_error())
                } else if state.read_shut || state.write_shut {
                    Outcome::Fail(QueueError::Closed)
                } else if thresh > state.max_threshold || thresh > state.capacity {
                    if !state.grow_enabled {
                        panic!(
                            "Threshold {} exceeds max threshold {} on queue {} without grow",
                            thresh, state.max_threshold, self.name
                        );
                    }

                    let wants_grow = state.grow_requested.is_none()
                        && state
                            .pending_resize
                            .map_or(true, |(_, mt)| mt < thresh);
                    if wants_grow {
                        kick = self.grow_locked(&mut state, thresh);
                    }
                    Outcome::Wait
                } else if state.capacity - state.count >= thresh {
                    let tail = (state.head + state.count) % state.capacity;
                    let ptr = state.channels[chan].write_window(tail, thresh).as_mut_ptr();
                    state.write_window = Some(thresh);
                    state.writer_waiting = None;
                    Outcome::Ready(ptr)
                } else {
                    state.writer_waiting = Some(thresh);
                    if !stamped {
                        if self.role == Role::RemoteWriter {
                            state.block_to_send = Some(thresh);
                            kick = true;
                        }
                        Outcome::FirstBlock(state.capacity as u64)
                    } else {
                        Outcome::Wait
                    }
                }
            };

            if kick {
                self.kick();
            }

            match outcome {
                Outcome::Ready(ptr) => {
                    if stamped {
                        self.writer_unblocked();
                    }
                    return Ok((ptr, thresh));
                }
                Outcome::Fail(err) => {
                    if stamped {
                        self.writer_unblocked();
                    }
                    let mut state = self.state.lock().unwrap();
                    state.writer_waiting = None;
                    drop(state);
                    return Err(err);
                }
                Outcome::FirstBlock(queue_size) => {
                    stamped = true;
                    self.writer_block_event(queue_size);
                }
                Outcome::Wait => {
                    let state = self.state.lock().unwrap();
                    if Self::writer_should_wait(&state, thresh) {
                        let _unused = self.writable.wait(state).unwrap();
                    }
                }
            }
        }
    }

    /// First block of an episode: mint a tag and propagate it to the queue's
    /// reader node (directly in-process, via the block frame otherwise).
    fn writer_block_event(&self, queue_size: u64) {
        let d4r = match self.side_d4r(true) {
            Some(d4r) if d4r.enabled() => d4r,
            _ => return,
        };

        let site = match self.site(true) {
            Some(site) => site,
            None => return,
        };

        if let Some(tag) = d4r.on_block(site, self.key, queue_size) {
            if let Some(peer) = self.stamp_tag(true, tag) {
                d4r::deliver(&peer, tag);
            }
        }
    }

    fn writer_unblocked(&self) {
        if let Some(d4r) = self.side_d4r(true) {
            d4r.on_unblock();
        }
    }

    /// Commit `count` bytes into every channel; the logical write head
    /// advances once.
    pub(crate) fn enqueue(&self, count: usize) -> QueueResult<()> {
        let kick = {
            let mut state = self.state.lock().unwrap();

            let thresh = state
                .write_window
                .take()
                .unwrap_or_else(|| panic!("Enqueue without an open window on queue {}", self.name));

            if count > thresh {
                panic!(
                    "Enqueue of {} bytes exceeds window threshold {} on queue {}",
                    count, thresh, self.name
                );
            }

            if state.terminated {
                return Err(QueueError::KernelShutdown);
            }
            if state.broken {
                return Err(self.broken_error());
            }
            if state.read_shut {
                return Err(QueueError::Closed);
            }

            let tail = (state.head + state.count) % state.capacity;
            for ring in &mut state.channels {
                ring.commit_write(tail, count);
            }
            state.count += count;
            state.writer_waiting = None;

            Self::maybe_apply_pending(&mut state);

            self.role == Role::RemoteWriter && count > 0
        };

        self.readable.notify_all();

        if kick {
            self.kick();
        }

        Ok(())
    }

    /// End of data. For distributed queues the frame goes out only after all
    /// committed bytes have been transmitted.
    pub(crate) fn writer_shutdown(&self) {
        let kick = {
            let mut state = self.state.lock().unwrap();

            if state.write_shut {
                return;
            }
            state.write_shut = true;
            state.write_window = None;
            Self::maybe_apply_pending(&mut state);

            if self.role == Role::RemoteWriter {
                state.eos_to_send = true;
                true
            } else {
                false
            }
        };

        logging::trace!(self.log, "writer shutdown"; "queue" => &self.name);
        self.readable.notify_all();
        self.writable.notify_all();

        if kick {
            self.kick();
        }
    }
}

// Reader-facing operations.
impl QueueCore {
    fn reader_should_wait(state: &CoreState, thresh: usize) -> bool {
        !state.terminated
            && !state.broken
            && !state.read_shut
            && !(state.write_shut && state.count < thresh)
            && (thresh > state.max_threshold || state.count < thresh)
    }

    pub(crate) fn dequeue_window_raw(&self, thresh: usize, chan: usize) -> QueueResult<(*const u8, usize)> {
        assert!(chan < self.channels, "channel {} out of range on queue {}", chan, self.name);

        enum Outcome {
            Ready(*const u8),
            Fail(QueueError),
            FirstBlock(u64),
            Wait,
        }

        let mut stamped = false;

        loop {
            let mut kick = false;

            let outcome = {
                let mut state = self.state.lock().unwrap();

                if state.terminated {
                    Outcome::Fail(QueueError::KernelShutdown)
                } else if state.broken {
                    Outcome::Fail(self.broken_error())
                } else if state.read_shut {
                    Outcome::Fail(QueueError::Closed)
                } else if thresh > state.max_threshold || thresh > state.capacity {
                    if state.write_shut && state.count < thresh {
                        Outcome::Fail(QueueError::Closed)
                    } else if !state.grow_enabled {
                        panic!(
                            "Threshold {} exceeds max threshold {} on queue {} without grow",
                            thresh, state.max_threshold, self.name
                        );
                    } else {
                        let wants_grow = state.grow_requested.is_none()
                            && state
                                .pending_resize
                                .map_or(true, |(_, mt)| mt < thresh);
                        if wants_grow {
                            kick = self.grow_locked(&mut state, thresh);
                        }
                        Outcome::Wait
                    }
                } else if state.count >= thresh {
                    let ptr = {
                        let head = state.head;
                        state.channels[chan].read_window(head, thresh).as_ptr()
                    };
                    state.read_window = Some(thresh);
                    state.reader_waiting = None;
                    Outcome::Ready(ptr)
                } else if state.write_shut {
                    // Drained below the threshold with no more data coming.
                    Outcome::Fail(QueueError::Closed)
                } else {
                    state.reader_waiting = Some(thresh);
                    if !stamped {
                        if self.role == Role::RemoteReader {
                            state.block_to_send = Some(thresh);
                            kick = true;
                        }
                        Outcome::FirstBlock(state.capacity as u64)
                    } else {
                        Outcome::Wait
                    }
                }
            };

            if kick {
                self.kick();
            }

            match outcome {
                Outcome::Ready(ptr) => {
                    if stamped {
                        self.reader_unblocked();
                    }
                    return Ok((ptr, thresh));
                }
                Outcome::Fail(err) => {
                    if stamped {
                        self.reader_unblocked();
                    }
                    let mut state = self.state.lock().unwrap();
                    state.reader_waiting = None;
                    drop(state);
                    return Err(err);
                }
                Outcome::FirstBlock(queue_size) => {
                    stamped = true;
                    self.reader_block_event(queue_size);
                }
                Outcome::Wait => {
                    let state = self.state.lock().unwrap();
                    if Self::reader_should_wait(&state, thresh) {
                        let _unused = self.readable.wait(state).unwrap();
                    }
                }
            }
        }
    }

    fn reader_block_event(&self, queue_size: u64) {
        let d4r = match self.side_d4r(false) {
            Some(d4r) if d4r.enabled() => d4r,
            _ => return,
        };

        let site = match self.site(false) {
            Some(site) => site,
            None => return,
        };

        if let Some(tag) = d4r.on_block(site, self.key, queue_size) {
            if let Some(peer) = self.stamp_tag(false, tag) {
                d4r::deliver(&peer, tag);
            }
        }
    }

    fn reader_unblocked(&self) {
        if let Some(d4r) = self.side_d4r(false) {
            d4r.on_unblock();
        }
    }

    pub(crate) fn dequeue(&self, count: usize) -> QueueResult<()> {
        let kick = {
            let mut state = self.state.lock().unwrap();

            let thresh = state
                .read_window
                .take()
                .unwrap_or_else(|| panic!("Dequeue without an open window on queue {}", self.name));

            if count > thresh {
                panic!(
                    "Dequeue of {} bytes exceeds window threshold {} on queue {}",
                    count, thresh, self.name
                );
            }

            if state.terminated {
                return Err(QueueError::KernelShutdown);
            }

            state.head = (state.head + count) % state.capacity;
            state.count -= count;
            state.reader_waiting = None;

            Self::maybe_apply_pending(&mut state);

            if self.role == Role::RemoteReader && count > 0 {
                state.pending_ack += count;
                true
            } else {
                false
            }
        };

        self.writable.notify_all();

        if kick {
            self.kick();
        }

        Ok(())
    }

    /// Abandon the stream; unread data is discarded immediately.
    pub(crate) fn reader_shutdown(&self) {
        let kick = {
            let mut state = self.state.lock().unwrap();

            if state.read_shut {
                return;
            }
            state.read_shut = true;
            state.read_window = None;
            state.head = 0;
            state.count = 0;
            state.sent = 0;
            Self::maybe_apply_pending(&mut state);

            if self.role == Role::RemoteReader {
                state.eos_to_send = true;
                true
            } else {
                false
            }
        };

        logging::trace!(self.log, "reader shutdown"; "queue" => &self.name);
        self.readable.notify_all();
        self.writable.notify_all();

        if kick {
            self.kick();
        }
    }
}

// Lifecycle shared by both sides.
impl QueueCore {
    /// Kernel shutdown: every blocked and subsequent call fails with
    /// `KernelShutdown`.
    pub(crate) fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.terminated = true;
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Transport under this queue failed.
    pub(crate) fn mark_broken(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.broken {
                return;
            }
            state.broken = true;
        }

        logging::debug!(self.log, "queue transport broken"; "queue" => &self.name);
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{PortRef, QueueAttr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn attr(capacity: usize, max_threshold: usize) -> QueueAttr {
        QueueAttr::new(
            "test",
            PortRef::new("w", "out"),
            PortRef::new("r", "in"),
            capacity,
        )
        .with_max_threshold(max_threshold)
    }

    fn core(capacity: usize, max_threshold: usize) -> Arc<QueueCore> {
        QueueCore::build(&attr(capacity, max_threshold), Role::Local, 1, false, None)
    }

    fn write(core: &Arc<QueueCore>, data: &[u8]) {
        let (ptr, len) = core.enqueue_window_raw(data.len(), 0).unwrap();
        let window = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        window[..data.len()].copy_from_slice(data);
        core.enqueue(data.len()).unwrap();
    }

    fn read(core: &Arc<QueueCore>, count: usize) -> Vec<u8> {
        let (ptr, _) = core.dequeue_window_raw(count, 0).unwrap();
        let window = unsafe { std::slice::from_raw_parts(ptr, count) };
        let data = window.to_vec();
        core.dequeue(count).unwrap();
        data
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let core = core(8, 4);
        let mut produced = Vec::new();
        let mut consumed = Vec::new();

        // Interleave writes and reads so the ring wraps repeatedly.
        for round in 0..32u8 {
            let chunk = [round, round.wrapping_add(1), round.wrapping_add(2)];
            write(&core, &chunk);
            produced.extend_from_slice(&chunk);
            consumed.extend_from_slice(&read(&core, 3));
        }

        assert_eq!(produced, consumed);
    }

    #[test]
    fn test_counts() {
        let core = core(16, 8);

        assert_eq!(core.freespace(), 16);
        write(&core, b"abcdef");
        assert_eq!(core.count(), 6);
        assert_eq!(core.freespace(), 10);

        let data = read(&core, 2);
        assert_eq!(&data, b"ab");
        assert_eq!(core.count(), 4);
    }

    #[test]
    fn test_blocking_writer_unblocked_by_reader() {
        let core = core(4, 4);
        write(&core, b"xxxx");

        let writer_core = core.clone();
        let entered = Arc::new(AtomicUsize::new(0));
        let entered_clone = entered.clone();

        let writer = thread::spawn(move || {
            entered_clone.store(1, Ordering::SeqCst);
            write(&writer_core, b"yy");
        });

        while entered.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));

        assert_eq!(read(&core, 3), b"xxx");
        writer.join().unwrap();

        assert_eq!(read(&core, 3), b"xyy");
    }

    #[test]
    fn test_blocking_reader_unblocked_by_writer() {
        let core = core(16, 8);

        let reader_core = core.clone();
        let reader = thread::spawn(move || read(&reader_core, 4));

        thread::sleep(Duration::from_millis(20));
        write(&core, b"abcd");

        assert_eq!(reader.join().unwrap(), b"abcd");
    }

    #[test]
    fn test_writer_shutdown_drains_then_closes() {
        let core = core(16, 8);

        write(&core, b"abc");
        core.writer_shutdown();

        assert_eq!(read(&core, 3), b"abc");
        assert_eq!(core.dequeue_window_raw(1, 0).unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn test_reader_shutdown_discards_and_closes_writer() {
        let core = core(16, 8);

        write(&core, b"abc");
        core.reader_shutdown();

        assert_eq!(core.count(), 0);
        assert_eq!(core.enqueue_window_raw(1, 0).unwrap_err(), QueueError::Closed);
    }

    #[test]
    fn test_terminate_unblocks_both_sides() {
        let core = core(4, 4);
        write(&core, b"xxxx");

        let writer_core = core.clone();
        let writer = thread::spawn(move || writer_core.enqueue_window_raw(1, 0).map(|_| ()));

        let empty = QueueCore::build(&attr(4, 4), Role::Local, 2, false, None);
        let reader_core = empty.clone();
        let reader = thread::spawn(move || reader_core.dequeue_window_raw(1, 0).map(|_| ()));

        thread::sleep(Duration::from_millis(20));
        core.terminate();
        empty.terminate();

        assert_eq!(writer.join().unwrap().unwrap_err(), QueueError::KernelShutdown);
        assert_eq!(reader.join().unwrap().unwrap_err(), QueueError::KernelShutdown);
    }

    #[test]
    fn test_broken_surfaces_or_swallows() {
        let core = core(4, 4);
        core.mark_broken();
        assert_eq!(core.enqueue_window_raw(1, 0).unwrap_err(), QueueError::Broken);

        let swallow = QueueCore::build(&attr(4, 4), Role::Local, 3, true, None);
        swallow.mark_broken();
        assert_eq!(swallow.enqueue_window_raw(1, 0).unwrap_err(), QueueError::Closed);
    }

    #[test]
    #[should_panic(expected = "without grow")]
    fn test_threshold_overflow_panics_without_grow() {
        let core = core(8, 4);
        let _ = core.enqueue_window_raw(6, 0);
    }

    #[test]
    fn test_grow_on_threshold_local() {
        let attr = attr(8, 4).with_grow(0.5);
        let core = QueueCore::build(&attr, Role::Local, 4, false, None);

        write(&core, b"ab");

        // Request beyond max threshold; the queue must grow to hold it.
        let (ptr, len) = core.enqueue_window_raw(16, 0).unwrap();
        assert_eq!(len, 16);
        let window = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        for (i, byte) in window.iter_mut().enumerate() {
            *byte = i as u8;
        }
        core.enqueue(16).unwrap();

        assert!(core.capacity() >= 18);
        assert!(core.max_threshold() >= 16);

        assert_eq!(read(&core, 2), b"ab");
        let grown = read(&core, 16);
        assert_eq!(grown[0], 0);
        assert_eq!(grown[15], 15);
    }

    #[test]
    fn test_resize_deferred_while_window_open() {
        let attr = attr(8, 4).with_grow(0.5);
        let core = QueueCore::build(&attr, Role::Local, 5, false, None);

        // A reader window is open; growth must not reallocate yet.
        {
            let mut state = core.state.lock().unwrap();
            state.read_window = Some(1);
            core.grow_locked(&mut state, 32);
            assert!(state.pending_resize.is_some());
            assert_eq!(state.capacity, 8);
            state.read_window = None;
        }

        // The next committed operation applies the deferred resize.
        write(&core, b"a");
        assert!(core.capacity() >= 32);
    }

    #[test]
    fn test_multi_channel_lockstep() {
        let attr = attr(16, 8).with_channels(2, 16);
        let core = QueueCore::build(&attr, Role::Local, 6, false, None);

        for chan in 0..2 {
            let (ptr, _) = core.enqueue_window_raw(4, chan).unwrap();
            let window = unsafe { std::slice::from_raw_parts_mut(ptr, 4) };
            window.copy_from_slice(if chan == 0 { b"aaaa" } else { b"bbbb" });
        }
        core.enqueue(4).unwrap();

        // One commit advanced every channel.
        assert_eq!(core.count(), 4);

        let (ptr0, _) = core.dequeue_window_raw(4, 0).unwrap();
        let (ptr1, _) = core.dequeue_window_raw(4, 1).unwrap();
        let chan0 = unsafe { std::slice::from_raw_parts(ptr0, 4) };
        let chan1 = unsafe { std::slice::from_raw_parts(ptr1, 4) };

        assert_eq!(chan0, b"aaaa");
        assert_eq!(chan1, b"bbbb");

        core.dequeue(4).unwrap();
        assert_eq!(core.count(), 0);
    }
}
