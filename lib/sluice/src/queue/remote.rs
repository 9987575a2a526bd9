//! The distributed half of a queue. Each half owns a full `QueueCore`; the
//! stream hub plays the missing endpoint by pulling outbound frames from the
//! core (`next_outbound`) and applying inbound ones (`apply_*`). The two
//! halves replicate each other: the writer half keeps committed bytes until
//! the reader half acknowledges them with `DEQUEUE`, so the reader can always
//! accept what is in flight.

use crate::attr::QueueAttr;
use crate::d4r::Tag;
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{EndpointKey, HostKey};
use crate::net::frame::FrameKind;
use crate::queue::local::{QueueCore, Role};
use serde_derive::{Deserialize, Serialize};
use weir::logging;

/// Largest per-channel data chunk shipped in one ENQUEUE frame.
pub(crate) const MAX_CHUNK: usize = 64 * 1024;

/// Everything a kernel needs to materialize its half of a distributed queue.
/// Travels as a kernel-to-kernel message through the context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteQueueSpec {
    pub attr: QueueAttr,
    pub writer_key: EndpointKey,
    pub reader_key: EndpointKey,
    pub writer_host: HostKey,
    pub reader_host: HostKey,
    pub writer_address: String,
    pub reader_address: String,
}

/// One frame worth of outbound state pulled off a core by the hub.
pub(crate) struct OutFrame {
    pub kind: FrameKind,
    pub count: u32,
    pub channels: u32,
    pub tag: Tag,
    pub payload: Vec<u8>,
    /// The endpoint is finished after this frame; the hub unregisters it.
    pub last: bool,
}

impl QueueCore {
    /// Pull the next frame this half needs to send, with payload bounded by
    /// `max_payload`. Returns `None` when there is nothing to say or nothing
    /// that fits.
    pub(crate) fn next_outbound(&self, max_payload: usize) -> Option<OutFrame> {
        let mut state = self.state.lock().unwrap();

        match self.role {
            Role::Local => None,
            Role::RemoteWriter => {
                if let Some((capacity, max_threshold)) = state.grow_to_send.take() {
                    return Some(OutFrame {
                        kind: FrameKind::Grow,
                        count: capacity as u32,
                        channels: max_threshold as u32,
                        tag: state.writer_tag,
                        payload: Vec::new(),
                        last: false,
                    });
                }

                let channels = self.num_channels();
                let sendable = state.count - state.sent;
                if sendable > 0 {
                    let chunk = sendable
                        .min(state.max_threshold)
                        .min(MAX_CHUNK)
                        .min(max_payload / channels);

                    if chunk > 0 {
                        let pos = (state.head + state.sent) % state.capacity;
                        let mut payload = Vec::with_capacity(chunk * channels);
                        for chan in 0..channels {
                            let window = state.channels[chan].read_window(pos, chunk);
                            payload.extend_from_slice(window);
                        }
                        state.sent += chunk;

                        return Some(OutFrame {
                            kind: FrameKind::Enqueue,
                            count: chunk as u32,
                            channels: channels as u32,
                            tag: state.writer_tag,
                            payload,
                            last: false,
                        });
                    }
                    // Data pending but no room in this pass; control frames
                    // must not overtake it.
                    return None;
                }

                if let Some(requested) = state.block_to_send.take() {
                    return Some(OutFrame {
                        kind: FrameKind::WriteBlock,
                        count: requested as u32,
                        channels: 0,
                        tag: state.writer_tag,
                        payload: Vec::new(),
                        last: false,
                    });
                }

                if state.eos_to_send && !state.eos_sent && state.sent == state.count {
                    state.eos_sent = true;
                    return Some(OutFrame {
                        kind: FrameKind::EndOfWrite,
                        count: 0,
                        channels: 0,
                        tag: state.writer_tag,
                        payload: Vec::new(),
                        last: true,
                    });
                }

                None
            }
            Role::RemoteReader => {
                if let Some((capacity, max_threshold)) = state.grow_to_send.take() {
                    return Some(OutFrame {
                        kind: FrameKind::Grow,
                        count: capacity as u32,
                        channels: max_threshold as u32,
                        tag: state.reader_tag,
                        payload: Vec::new(),
                        last: false,
                    });
                }

                if state.pending_ack > 0 {
                    let released = state.pending_ack;
                    state.pending_ack = 0;
                    return Some(OutFrame {
                        kind: FrameKind::Dequeue,
                        count: released as u32,
                        channels: 0,
                        tag: state.reader_tag,
                        payload: Vec::new(),
                        last: false,
                    });
                }

                if let Some(requested) = state.block_to_send.take() {
                    return Some(OutFrame {
                        kind: FrameKind::ReadBlock,
                        count: requested as u32,
                        channels: 0,
                        tag: state.reader_tag,
                        payload: Vec::new(),
                        last: false,
                    });
                }

                if state.eos_to_send && !state.eos_sent {
                    state.eos_sent = true;
                    return Some(OutFrame {
                        kind: FrameKind::EndOfRead,
                        count: 0,
                        channels: 0,
                        tag: state.reader_tag,
                        payload: Vec::new(),
                        last: true,
                    });
                }

                None
            }
        }
    }

    /// Data arriving at the reader half. Late frames after a local
    /// `shutdown_reader` are discarded; the abort already went out.
    pub(crate) fn apply_enqueue(&self, count: usize, channels: usize, payload: &[u8]) -> RuntimeResult<()> {
        {
            let mut state = self.state.lock().unwrap();

            if state.read_shut || state.terminated {
                return Ok(());
            }

            if channels != self.num_channels() {
                return Err(RuntimeError::Protocol(format!(
                    "enqueue with {} channels on {}-channel queue {}",
                    channels,
                    self.num_channels(),
                    self.name()
                )));
            }

            if count > state.capacity - state.count || count > state.max_threshold {
                return Err(RuntimeError::Protocol(format!(
                    "peer overran queue {}: {} bytes into {} free",
                    self.name(),
                    count,
                    state.capacity - state.count
                )));
            }

            let tail = (state.head + state.count) % state.capacity;
            for chan in 0..channels {
                state.channels[chan].write_at(tail, &payload[chan * count..(chan + 1) * count]);
            }
            state.count += count;
        }

        self.readable.notify_all();
        Ok(())
    }

    /// Reader acknowledgment arriving at the writer half; frees local space.
    pub(crate) fn apply_dequeue(&self, count: usize) -> RuntimeResult<()> {
        {
            let mut state = self.state.lock().unwrap();

            if state.read_shut || state.terminated {
                return Ok(());
            }

            if count > state.sent {
                return Err(RuntimeError::Protocol(format!(
                    "peer released {} bytes but only {} are in flight on queue {}",
                    count,
                    state.sent,
                    self.name()
                )));
            }

            state.sent -= count;
            state.head = (state.head + count) % state.capacity;
            state.count -= count;
            Self::maybe_apply_pending(&mut state);
        }

        self.writable.notify_all();
        Ok(())
    }

    /// READ_BLOCK/WRITE_BLOCK hint from the peer.
    pub(crate) fn apply_peer_hint(&self, requested: usize) {
        let mut state = self.state.lock().unwrap();
        state.peer_hint = Some(requested);
    }

    /// END_OF_WRITE at the reader half: drain, then close.
    pub(crate) fn apply_end_of_write(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.write_shut = true;
        }

        logging::trace!(self.log, "peer end of write"; "queue" => self.name());
        self.readable.notify_all();
    }

    /// END_OF_READ at the writer half: the peer abandoned the stream. Local
    /// data is discarded and the writer sees `Closed`.
    pub(crate) fn apply_end_of_read(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.read_shut = true;
            state.head = 0;
            state.count = 0;
            state.sent = 0;
        }

        logging::trace!(self.log, "peer end of read"; "queue" => self.name());
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// GROW negotiation. A frame satisfying our own outstanding request is
    /// its acknowledgment; anything that enlarges us is news and gets echoed
    /// back with the final sizes. Returns true when the hub must kick this
    /// endpoint to flush the echo.
    pub(crate) fn apply_grow(&self, capacity: usize, max_threshold: usize) -> bool {
        let kick = {
            let mut state = self.state.lock().unwrap();

            if let Some((req_cap, req_mt)) = state.grow_requested {
                if capacity >= req_cap && max_threshold >= req_mt {
                    state.grow_requested = None;
                    self.schedule_resize(&mut state, capacity, max_threshold);
                    false
                } else {
                    // A smaller concurrent grow from the peer; apply and keep
                    // waiting for our own acknowledgment.
                    self.schedule_resize(&mut state, capacity, max_threshold);
                    false
                }
            } else if capacity > state.capacity || max_threshold > state.max_threshold {
                self.schedule_resize(&mut state, capacity, max_threshold);
                let cap = state.capacity.max(capacity);
                let mt = state.max_threshold.max(max_threshold);
                state.grow_to_send = Some((cap, mt));
                true
            } else {
                // Stale echo; nothing to do.
                false
            }
        };

        self.readable.notify_all();
        self.writable.notify_all();

        kick
    }
}
