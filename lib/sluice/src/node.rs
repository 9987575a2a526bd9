//! The node runtime. A node is a user-supplied sequential process running on
//! one thread, talking to the world through named ports. Ports are created
//! lazily and block until the kernel attaches a queue endpoint, so a node
//! body can start before its graph is fully wired.

use crate::context::Direction;
use crate::error::{QueueError, QueueResult};
use crate::kernel::{Kernel, KernelCore};
use crate::queue::QueueCore;
use hashbrown::HashMap;
use std::slice;
use std::sync::{Arc, Condvar, Mutex, Weak};
use weir::logging::Logger;

pub type NodeResult = Result<(), QueueError>;

/// A node body. Implementations are driven by exactly one thread; `run`
/// returning (or failing with `KernelShutdown`) means the node is done.
pub trait Node: Send {
    fn run(&mut self, node: &NodeHandle) -> NodeResult;
}

/// Closure-style node for graphs wired up in code.
pub struct FnNode<F> {
    body: F,
}

impl<F> FnNode<F>
where
    F: FnMut(&NodeHandle) -> NodeResult + Send,
{
    pub fn new(body: F) -> FnNode<F> {
        FnNode { body }
    }
}

impl<F> Node for FnNode<F>
where
    F: FnMut(&NodeHandle) -> NodeResult + Send,
{
    fn run(&mut self, node: &NodeHandle) -> NodeResult {
        (self.body)(node)
    }
}

/// Where a port waits for its queue endpoint. A port is bound to at most one
/// queue over its lifetime.
pub(crate) struct PortSlot {
    state: Mutex<PortBinding>,
    ready: Condvar,
}

pub(crate) enum PortBinding {
    Unbound,
    Bound(Arc<QueueCore>),
    Terminated,
}

impl PortSlot {
    pub(crate) fn new() -> Arc<PortSlot> {
        Arc::new(PortSlot {
            state: Mutex::new(PortBinding::Unbound),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn bind(&self, core: Arc<QueueCore>) {
        let mut state = self.state.lock().unwrap();

        match *state {
            PortBinding::Unbound => *state = PortBinding::Bound(core),
            PortBinding::Bound(_) => panic!("Port is already bound to a queue"),
            PortBinding::Terminated => return,
        }

        self.ready.notify_all();
    }

    pub(crate) fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        if let PortBinding::Unbound = *state {
            *state = PortBinding::Terminated;
        }
        self.ready.notify_all();
    }

    pub(crate) fn current(&self) -> Option<Arc<QueueCore>> {
        match &*self.state.lock().unwrap() {
            PortBinding::Bound(core) => Some(core.clone()),
            _ => None,
        }
    }

    /// Block until the kernel attaches a queue.
    fn wait_core(&self) -> QueueResult<Arc<QueueCore>> {
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                PortBinding::Bound(core) => return Ok(core.clone()),
                PortBinding::Terminated => return Err(QueueError::KernelShutdown),
                PortBinding::Unbound => state = self.ready.wait(state).unwrap(),
            }
        }
    }
}

/// Writer port handle. Blocks on first use until the kernel binds a queue,
/// then behaves exactly like a queue writer endpoint. The kernel closes the
/// endpoint when the node ends; ports themselves never shut queues down on
/// drop so that repeated `writer()` lookups stay harmless.
pub struct WriterPort {
    slot: Arc<PortSlot>,
    cached: Option<Arc<QueueCore>>,
}

impl WriterPort {
    pub(crate) fn new(slot: Arc<PortSlot>) -> WriterPort {
        WriterPort { slot, cached: None }
    }

    fn core(&mut self) -> QueueResult<Arc<QueueCore>> {
        if let Some(core) = &self.cached {
            return Ok(core.clone());
        }

        let core = self.slot.wait_core()?;
        self.cached = Some(core.clone());
        Ok(core)
    }

    pub fn freespace(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.freespace())
    }

    pub fn full(&mut self) -> QueueResult<bool> {
        Ok(self.core()?.freespace() == 0)
    }

    pub fn num_channels(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.num_channels())
    }

    pub fn channel_stride(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.channel_stride())
    }

    pub fn max_threshold(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.max_threshold())
    }

    /// Blocking request for a writable window; see the queue contract.
    pub fn enqueue_window(&mut self, thresh: usize, chan: usize) -> QueueResult<&mut [u8]> {
        let core = self.core()?;
        let (ptr, len) = core.enqueue_window_raw(thresh, chan)?;
        Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
    }

    pub fn enqueue(&mut self, count: usize) -> QueueResult<()> {
        self.core()?.enqueue(count)
    }

    /// Copy `data` in, blocking until everything is written.
    pub fn enqueue_bytes(&mut self, data: &[u8]) -> QueueResult<()> {
        let core = self.core()?;
        let mut offset = 0;

        while offset < data.len() {
            let chunk = (data.len() - offset).min(core.max_threshold());
            let (ptr, _) = core.enqueue_window_raw(chunk, 0)?;
            unsafe { slice::from_raw_parts_mut(ptr, chunk) }
                .copy_from_slice(&data[offset..offset + chunk]);
            core.enqueue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    pub fn shutdown(&mut self) -> QueueResult<()> {
        self.core()?.writer_shutdown();
        Ok(())
    }
}

/// Reader port handle; mirror of `WriterPort`.
pub struct ReaderPort {
    slot: Arc<PortSlot>,
    cached: Option<Arc<QueueCore>>,
}

impl ReaderPort {
    pub(crate) fn new(slot: Arc<PortSlot>) -> ReaderPort {
        ReaderPort { slot, cached: None }
    }

    fn core(&mut self) -> QueueResult<Arc<QueueCore>> {
        if let Some(core) = &self.cached {
            return Ok(core.clone());
        }

        let core = self.slot.wait_core()?;
        self.cached = Some(core.clone());
        Ok(core)
    }

    pub fn count(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.count())
    }

    pub fn empty(&mut self) -> QueueResult<bool> {
        Ok(self.core()?.count() == 0)
    }

    pub fn num_channels(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.num_channels())
    }

    pub fn channel_stride(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.channel_stride())
    }

    pub fn max_threshold(&mut self) -> QueueResult<usize> {
        Ok(self.core()?.max_threshold())
    }

    pub fn dequeue_window(&mut self, thresh: usize, chan: usize) -> QueueResult<&[u8]> {
        let core = self.core()?;
        let (ptr, len) = core.dequeue_window_raw(thresh, chan)?;
        Ok(unsafe { slice::from_raw_parts(ptr, len) })
    }

    pub fn dequeue(&mut self, count: usize) -> QueueResult<()> {
        self.core()?.dequeue(count)
    }

    /// Fill `out`, blocking until complete.
    pub fn dequeue_bytes(&mut self, out: &mut [u8]) -> QueueResult<()> {
        let core = self.core()?;
        let mut offset = 0;

        while offset < out.len() {
            let chunk = (out.len() - offset).min(core.max_threshold());
            let (ptr, _) = core.dequeue_window_raw(chunk, 0)?;
            out[offset..offset + chunk]
                .copy_from_slice(unsafe { slice::from_raw_parts(ptr, chunk) });
            core.dequeue(chunk)?;
            offset += chunk;
        }

        Ok(())
    }

    pub fn shutdown(&mut self) -> QueueResult<()> {
        self.core()?.reader_shutdown();
        Ok(())
    }
}

/// Per-node state owned by the kernel.
pub(crate) struct NodeCtx {
    pub attr: crate::attr::NodeAttr,
    pub key: crate::identity::NodeKey,
    pub kernel: Weak<KernelCore>,
    pub d4r: Arc<crate::d4r::D4rNode>,
    pub ports: Mutex<HashMap<(String, Direction), Arc<PortSlot>>>,
    pub log: Logger,
}

impl NodeCtx {
    /// Get or lazily create the slot for a (port, direction) pair.
    pub(crate) fn port(&self, name: &str, direction: Direction) -> Arc<PortSlot> {
        let mut ports = self.ports.lock().unwrap();
        ports
            .entry((name.to_string(), direction))
            .or_insert_with(PortSlot::new)
            .clone()
    }

    /// Kernel terminate: wake everything blocked on an unbound port.
    pub(crate) fn terminate_ports(&self) {
        for slot in self.ports.lock().unwrap().values() {
            slot.terminate();
            if let Some(core) = slot.current() {
                core.terminate();
            }
        }
    }

    /// Node end: close every endpoint the node opened.
    pub(crate) fn close_ports(&self) {
        for ((_, direction), slot) in self.ports.lock().unwrap().iter() {
            slot.terminate();
            if let Some(core) = slot.current() {
                match direction {
                    Direction::Writer => core.writer_shutdown(),
                    Direction::Reader => core.reader_shutdown(),
                }
            }
        }
    }
}

/// The face a node body sees.
pub struct NodeHandle {
    pub(crate) ctx: Arc<NodeCtx>,
}

impl NodeHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.ctx.attr.name
    }

    /// Opaque parameter string, typically JSON.
    #[inline]
    pub fn param(&self) -> &str {
        &self.ctx.attr.param
    }

    /// Opaque binary argument blob.
    #[inline]
    pub fn arg(&self) -> &[u8] {
        &self.ctx.attr.arg
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.ctx.log
    }

    /// Reader endpoint for `port`; idempotent per (node, port).
    pub fn reader(&self, port: &str) -> ReaderPort {
        ReaderPort::new(self.ctx.port(port, Direction::Reader))
    }

    /// Writer endpoint for `port`; idempotent per (node, port).
    pub fn writer(&self, port: &str) -> WriterPort {
        WriterPort::new(self.ctx.port(port, Direction::Writer))
    }

    /// The kernel hosting this node, for meta-operations.
    pub fn kernel(&self) -> Kernel {
        Kernel {
            core: self
                .ctx
                .kernel
                .upgrade()
                .expect("Kernel is gone while node still running"),
        }
    }
}
