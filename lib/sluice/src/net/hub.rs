//! The stream hub: one reactor thread per kernel multiplexing every
//! distributed queue that kernel hosts. Node threads never touch sockets;
//! they mutate their queue half and kick the hub, which copies frames in and
//! out of per-connection buffers under the queue lock and performs all
//! socket I/O lock-free.

use crate::d4r::{self, D4rNode};
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{EndpointKey, HostKey};
use crate::net::buffer::Buffer;
use crate::net::frame::{FrameHeader, FrameKind, HEADER_SIZE};
use crate::queue::QueueCore;
use hashbrown::{HashMap, HashSet};
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weir::logging::{self, Logger};

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const READ_BUF_SIZE: usize = 16 * 65536;
const WRITE_BUF_SIZE: usize = 16 * 65536;
const MAX_FRAME_PAYLOAD: usize = 4 * 65536;
const TICK: Duration = Duration::from_millis(1);

/// One distributed queue half registered with the hub.
#[derive(Clone)]
pub(crate) struct EndpointEntry {
    pub key: EndpointKey,
    pub peer: EndpointKey,
    pub peer_host: HostKey,
    pub writer: bool,
    pub core: Arc<QueueCore>,
    pub d4r: Option<Arc<D4rNode>>,
}

pub(crate) enum HubCmd {
    EnsureConn {
        host: HostKey,
        address: String,
        reply: Sender<RuntimeResult<()>>,
    },
    Register {
        entry: EndpointEntry,
        announce: bool,
    },
    Kick(EndpointKey),
    Tombstone(EndpointKey),
    Shutdown,
}

/// Cheap handle a queue core uses to wake the hub when it has frames to send.
#[derive(Clone)]
pub(crate) struct HubKick {
    sender: Sender<HubCmd>,
    key: EndpointKey,
}

impl HubKick {
    pub(crate) fn new(sender: Sender<HubCmd>, key: EndpointKey) -> HubKick {
        HubKick { sender, key }
    }

    #[inline]
    pub(crate) fn kick(&self) {
        // A dead hub means the kernel is going away; nothing to report.
        let _ = self.sender.send(HubCmd::Kick(self.key));
    }
}

/// Owner-side handle: command channel plus the reactor thread.
pub(crate) struct Hub {
    cmd: Sender<HubCmd>,
    local_addr: SocketAddr,
    join: Option<thread::JoinHandle<()>>,
}

impl Hub {
    /// Bind the peer listener and start the reactor thread. `None` binds an
    /// ephemeral loopback port.
    pub(crate) fn start<'a, L: Into<Option<&'a Logger>>>(address: Option<&str>, log: L) -> RuntimeResult<Hub> {
        let log = logging::component(log);

        let addr: SocketAddr = address
            .unwrap_or("127.0.0.1:0")
            .parse()
            .map_err(|_| RuntimeError::InvalidConfig(format!("bad listen address {:?}", address)))?;

        let listener = TcpListener::bind(&addr)?;
        let local_addr = listener.local_addr()?;

        let poll = mio::Poll::new()?;
        poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let (cmd_tx, cmd_rx) = mpsc::channel();

        logging::debug!(log, "stream hub listening"; "address" => %local_addr);

        let reactor = Reactor {
            poll,
            events: mio::Events::with_capacity(1024),
            listener,
            conns: Vec::new(),
            free: Vec::new(),
            endpoints: HashMap::new(),
            conn_of_endpoint: HashMap::new(),
            conns_by_host: HashMap::new(),
            pending: HashMap::new(),
            tombstones: HashSet::new(),
            cmd_rx,
            log,
        };

        let join = thread::Builder::new()
            .name("sluice-hub".to_string())
            .spawn(move || reactor.run())
            .map_err(RuntimeError::from)?;

        Ok(Hub {
            cmd: cmd_tx,
            local_addr,
            join: Some(join),
        })
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub(crate) fn sender(&self) -> Sender<HubCmd> {
        self.cmd.clone()
    }

    pub(crate) fn kick_handle(&self, key: EndpointKey) -> HubKick {
        HubKick::new(self.cmd.clone(), key)
    }

    /// Make sure a connection to `host` exists, dialing `address` if not.
    pub(crate) fn ensure_conn(&self, host: HostKey, address: &str) -> RuntimeResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.cmd
            .send(HubCmd::EnsureConn {
                host,
                address: address.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| RuntimeError::Context("stream hub is gone".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| RuntimeError::Context("stream hub dropped the request".to_string()))?
    }

    pub(crate) fn register(&self, entry: EndpointEntry, announce: bool) {
        let _ = self.cmd.send(HubCmd::Register { entry, announce });
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.cmd.send(HubCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnState {
    Connecting,
    Live,
}

struct Conn {
    stream: TcpStream,
    state: ConnState,
    read: Buffer,
    write: Buffer,
    peer_host: Option<HostKey>,
}

struct PendingFrame {
    header: FrameHeader,
    payload: Vec<u8>,
}

struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    listener: TcpListener,
    conns: Vec<Option<Conn>>,
    free: Vec<usize>,
    endpoints: HashMap<u64, EndpointEntry>,
    conn_of_endpoint: HashMap<u64, usize>,
    conns_by_host: HashMap<u64, usize>,
    /// Frames for endpoints that have not registered yet (creation races).
    pending: HashMap<u64, Vec<PendingFrame>>,
    /// Endpoint keys that finished or aborted; late frames are dropped.
    tombstones: HashSet<u64>,
    cmd_rx: Receiver<HubCmd>,
    log: Logger,
}

impl Reactor {
    fn run(mut self) {
        loop {
            if let Err(err) = self.poll.poll(&mut self.events, Some(TICK)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "hub poll failed"; "error" => %err);
                return;
            }

            let actions: Vec<(mio::Token, mio::Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.readiness()))
                .collect();

            for (token, ready) in actions {
                if token == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    let idx = token.0 - 1;
                    if ready.is_writable() {
                        self.conn_writable(idx);
                    }
                    if ready.is_readable() {
                        self.conn_readable(idx);
                    }
                }
            }

            if !self.drain_cmds() {
                logging::debug!(self.log, "stream hub shutting down");
                return;
            }

            self.pump_all();
            self.flush_all();
        }
    }

    /// Returns false when a shutdown was requested.
    fn drain_cmds(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(HubCmd::EnsureConn { host, address, reply }) => {
                    let result = self.ensure_conn(host, &address);
                    let _ = reply.send(result);
                }
                Ok(HubCmd::Register { entry, announce }) => self.register(entry, announce),
                Ok(HubCmd::Kick(key)) => self.pump_one(key.raw()),
                Ok(HubCmd::Tombstone(key)) => self.retire(key.raw()),
                Ok(HubCmd::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                // All senders gone: the kernel is being dismantled.
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn alloc_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        }
    }

    fn install_conn(&mut self, stream: TcpStream, state: ConnState) -> io::Result<usize> {
        stream.set_nodelay(true)?;

        let idx = self.alloc_slot();
        self.poll.register(
            &stream,
            mio::Token(idx + 1),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        self.conns[idx] = Some(Conn {
            stream,
            state,
            read: Buffer::new(READ_BUF_SIZE),
            write: Buffer::new(WRITE_BUF_SIZE),
            peer_host: None,
        });

        Ok(idx)
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    logging::debug!(self.log, "peer connected"; "peer" => %addr);
                    if let Err(err) = self.install_conn(stream, ConnState::Live) {
                        logging::error!(self.log, "failed to install peer connection";
                                        "peer" => %addr,
                                        "error" => %err);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn ensure_conn(&mut self, host: HostKey, address: &str) -> RuntimeResult<()> {
        if let Some(&idx) = self.conns_by_host.get(&host.raw()) {
            if self.conns[idx].is_some() {
                return Ok(());
            }
        }

        let addr: SocketAddr = address
            .parse()
            .map_err(|_| RuntimeError::InvalidConfig(format!("bad peer address {}", address)))?;

        let stream = TcpStream::connect(&addr)?;
        let idx = self.install_conn(stream, ConnState::Connecting)?;

        if let Some(conn) = &mut self.conns[idx] {
            conn.peer_host = Some(host);
        }
        self.conns_by_host.insert(host.raw(), idx);

        logging::debug!(self.log, "dialing peer kernel"; "host" => %host, "address" => address);
        Ok(())
    }

    fn register(&mut self, entry: EndpointEntry, announce: bool) {
        let key = entry.key.raw();

        logging::debug!(self.log, "endpoint registered";
                        "endpoint" => %entry.key,
                        "peer" => %entry.peer,
                        "writer" => entry.writer);

        self.endpoints.insert(key, entry.clone());

        let idx = match self.conns_by_host.get(&entry.peer_host.raw()) {
            Some(&idx) => {
                self.conn_of_endpoint.insert(key, idx);
                Some(idx)
            }
            None => None,
        };

        if announce {
            if let Some(idx) = idx {
                let kind = if entry.writer {
                    FrameKind::IdWriter
                } else {
                    FrameKind::IdReader
                };
                let header = FrameHeader::new(
                    kind,
                    entry.peer.raw(),
                    entry.key.raw(),
                    0,
                    0,
                    crate::d4r::Tag::NONE,
                );
                if let Some(conn) = &mut self.conns[idx] {
                    if conn.write.free_capacity() >= HEADER_SIZE {
                        conn.write.push_bytes(&header.encode());
                    }
                }
            } else {
                logging::error!(self.log, "no connection for announced endpoint";
                                "endpoint" => %entry.key,
                                "peer_host" => %entry.peer_host);
            }
        }

        // Replay anything that arrived before the endpoint existed.
        if let Some(frames) = self.pending.remove(&key) {
            logging::debug!(self.log, "replaying parked frames";
                            "endpoint" => %entry.key,
                            "frames" => frames.len());
            for frame in frames {
                if let Err(err) = self.apply(idx.unwrap_or(usize::MAX), &entry, frame.header, &frame.payload) {
                    logging::error!(self.log, "parked frame failed";
                                    "endpoint" => %entry.key,
                                    "error" => %err);
                    entry.core.mark_broken();
                    break;
                }
            }
        }

        self.pump_one(key);
    }

    fn retire(&mut self, key: u64) {
        if self.endpoints.remove(&key).is_some() {
            logging::debug!(self.log, "endpoint retired"; "endpoint" => key);
        }
        self.conn_of_endpoint.remove(&key);
        self.pending.remove(&key);
        self.tombstones.insert(key);
    }

    fn conn_readable(&mut self, idx: usize) {
        let result = match self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
            Some(conn) => conn.read.ingress(&conn.stream),
            None => return,
        };

        match result {
            Ok(_) => {
                if let Err(err) = self.parse_conn(idx) {
                    logging::error!(self.log, "protocol error on stream"; "error" => %err);
                    self.break_conn(idx);
                }
            }
            Err(err) => {
                logging::debug!(self.log, "stream read failed"; "error" => %err);
                self.break_conn(idx);
            }
        }
    }

    fn conn_writable(&mut self, idx: usize) {
        let became_live = {
            let conn = match self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
                Some(conn) => conn,
                None => return,
            };

            if conn.state == ConnState::Connecting {
                match conn.stream.take_error() {
                    Ok(None) => {
                        conn.state = ConnState::Live;
                        true
                    }
                    Ok(Some(err)) => {
                        logging::error!(self.log, "peer connect failed"; "error" => %err);
                        false
                    }
                    Err(err) => {
                        logging::error!(self.log, "peer connect failed"; "error" => %err);
                        false
                    }
                }
            } else {
                true
            }
        };

        if became_live {
            self.flush_conn(idx);
        } else {
            self.break_conn(idx);
        }
    }

    fn parse_conn(&mut self, idx: usize) -> RuntimeResult<()> {
        loop {
            let (header, payload) = {
                let conn = match self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
                    Some(conn) => conn,
                    None => return Ok(()),
                };

                let buf = conn.read.read_slice();
                if buf.len() < HEADER_SIZE {
                    return Ok(());
                }

                let header = FrameHeader::decode(buf)?;
                let payload_len = header.payload_len();

                if payload_len > MAX_FRAME_PAYLOAD {
                    return Err(RuntimeError::Protocol(format!(
                        "oversized frame payload: {} bytes",
                        payload_len
                    )));
                }

                if buf.len() < HEADER_SIZE + payload_len {
                    return Ok(());
                }

                let payload = buf[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
                conn.read.consume(HEADER_SIZE + payload_len);
                (header, payload)
            };

            self.dispatch(idx, header, payload)?;
        }
    }

    fn dispatch(&mut self, idx: usize, header: FrameHeader, payload: Vec<u8>) -> RuntimeResult<()> {
        let key = header.dst;

        if self.tombstones.contains(&key) {
            logging::trace!(self.log, "frame for closed endpoint dropped";
                            "endpoint" => key,
                            "kind" => ?header.kind);
            return Ok(());
        }

        let entry = match self.endpoints.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                // Creation race: the CREATE message for this half has not
                // landed yet. Park the frame for replay.
                self.pending.entry(key).or_insert_with(Vec::new).push(PendingFrame {
                    header,
                    payload,
                });
                return Ok(());
            }
        };

        self.apply(idx, &entry, header, &payload)
    }

    fn apply(
        &mut self,
        idx: usize,
        entry: &EndpointEntry,
        header: FrameHeader,
        payload: &[u8],
    ) -> RuntimeResult<()> {
        let key = entry.key.raw();

        match header.kind {
            FrameKind::Enqueue => {
                entry
                    .core
                    .apply_enqueue(header.count as usize, header.channels as usize, payload)?;
            }
            FrameKind::Dequeue => entry.core.apply_dequeue(header.count as usize)?,
            FrameKind::ReadBlock | FrameKind::WriteBlock => {
                entry.core.apply_peer_hint(header.count as usize)
            }
            FrameKind::EndOfWrite => {
                entry.core.apply_end_of_write();
                self.retire(key);
            }
            FrameKind::EndOfRead => {
                entry.core.apply_end_of_read();
                self.retire(key);
            }
            FrameKind::Grow => {
                if entry.core.apply_grow(header.count as usize, header.channels as usize) {
                    self.pump_one(key);
                }
            }
            FrameKind::IdReader | FrameKind::IdWriter => {
                if idx != usize::MAX {
                    self.conns_by_host.insert(entry.peer_host.raw(), idx);
                    self.conn_of_endpoint.entry(key).or_insert(idx);
                    if let Some(conn) = self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
                        conn.peer_host = Some(entry.peer_host);
                    }
                }
            }
        }

        // Detector tags ride every control frame.
        if !header.tag.is_none() {
            if let Some(d4r) = &entry.d4r {
                d4r::deliver(d4r, header.tag);
            }
        }

        Ok(())
    }

    fn pump_all(&mut self) {
        let keys: Vec<u64> = self.endpoints.keys().cloned().collect();
        for key in keys {
            self.pump_one(key);
        }
    }

    fn pump_one(&mut self, key: u64) {
        let entry = match self.endpoints.get(&key) {
            Some(entry) => entry.clone(),
            None => return,
        };

        let idx = match self.conn_of_endpoint.get(&key) {
            Some(&idx) => idx,
            None => match self.conns_by_host.get(&entry.peer_host.raw()) {
                Some(&idx) => {
                    self.conn_of_endpoint.insert(key, idx);
                    idx
                }
                None => return,
            },
        };

        let retire_after = {
            let conn = match self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
                Some(conn) if conn.state == ConnState::Live => conn,
                _ => return,
            };

            let mut retire_after = false;
            loop {
                let free = conn.write.free_capacity();
                if free <= HEADER_SIZE {
                    break;
                }

                let max_payload = (free - HEADER_SIZE).min(MAX_FRAME_PAYLOAD);
                match entry.core.next_outbound(max_payload) {
                    Some(out) => {
                        let header = FrameHeader::new(
                            out.kind,
                            entry.peer.raw(),
                            entry.key.raw(),
                            out.count,
                            out.channels,
                            out.tag,
                        );
                        conn.write.push_bytes(&header.encode());
                        if !out.payload.is_empty() {
                            conn.write.push_bytes(&out.payload);
                        }
                        if out.last {
                            retire_after = true;
                            break;
                        }
                    }
                    None => break,
                }
            }
            retire_after
        };

        self.flush_conn(idx);

        if retire_after {
            self.retire(key);
        }
    }

    fn flush_all(&mut self) {
        for idx in 0..self.conns.len() {
            self.flush_conn(idx);
        }
    }

    fn flush_conn(&mut self, idx: usize) {
        let result = match self.conns.get_mut(idx).and_then(|conn| conn.as_mut()) {
            Some(conn) if conn.state == ConnState::Live && !conn.write.is_empty() => {
                conn.write.egress(&conn.stream)
            }
            _ => return,
        };

        if let Err(err) = result {
            logging::debug!(self.log, "stream write failed"; "error" => %err);
            self.break_conn(idx);
        }
    }

    /// Tear a connection down and mark every queue routed over it broken.
    fn break_conn(&mut self, idx: usize) {
        let conn = match self.conns.get_mut(idx).and_then(|conn| conn.take()) {
            Some(conn) => conn,
            None => return,
        };

        let _ = self.poll.deregister(&conn.stream);

        let affected: Vec<u64> = self
            .conn_of_endpoint
            .iter()
            .filter(|(_, &conn_idx)| conn_idx == idx)
            .map(|(&key, _)| key)
            .collect();

        logging::error!(self.log, "peer stream broken";
                        "endpoints" => affected.len(),
                        "peer_host" => ?conn.peer_host);

        for key in affected {
            if let Some(entry) = self.endpoints.get(&key) {
                entry.core.mark_broken();
            }
            self.conn_of_endpoint.remove(&key);
        }

        self.conns_by_host.retain(|_, &mut conn_idx| conn_idx != idx);
        self.free.push(idx);
    }
}
