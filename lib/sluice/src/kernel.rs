//! The kernel: per-process supervisor owning the local node registry, the
//! queue endpoints either end of which lives here, the stream hub, and the
//! node threads. Cross-process operations are routed through the context as
//! kernel messages.

use crate::attr::{KernelConfig, NodeAttr, QueueAttr};
use crate::context::{Context, Direction, KernelMsg, NodeRecord};
use crate::d4r::D4rNode;
use crate::error::{QueueError, RuntimeError, RuntimeResult};
use crate::factory;
use crate::identity::HostKey;
use crate::net::hub::{EndpointEntry, Hub};
use crate::node::{FnNode, Node, NodeCtx, NodeHandle, NodeResult};
use crate::queue::{QueueCore, RemoteQueueSpec, Role};
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use weir::logging::{self, o, Logger};

pub struct Kernel {
    pub(crate) core: Arc<KernelCore>,
}

impl Clone for Kernel {
    fn clone(&self) -> Kernel {
        Kernel {
            core: self.core.clone(),
        }
    }
}

pub(crate) struct KernelCore {
    config: KernelConfig,
    host_key: HostKey,
    address: String,
    context: Arc<dyn Context>,
    hub: Mutex<Option<Hub>>,
    msg_tx: Mutex<Sender<KernelMsg>>,
    state: Mutex<KernelState>,
    terminated: AtomicBool,
    log: Logger,
}

struct KernelState {
    nodes: IndexMap<String, Arc<NodeCtx>>,
    node_threads: Vec<thread::JoinHandle<()>>,
    msg_thread: Option<thread::JoinHandle<()>>,
}

impl Kernel {
    /// Bring a kernel up: bind the stream hub, register the host with the
    /// context and start the message thread.
    pub fn start<'a, L: Into<Option<&'a Logger>>>(
        config: KernelConfig,
        context: Arc<dyn Context>,
        log: L,
    ) -> RuntimeResult<Kernel> {
        let log = logging::component(log).new(o!("kernel" => config.name.clone()));

        let hub = Hub::start(config.address.as_deref(), &log)?;
        let address = hub.local_addr().to_string();

        let host_key = context.setup_host(&config.name, &address)?;

        let (msg_tx, msg_rx) = mpsc::channel();
        context.register_kernel(host_key, msg_tx.clone())?;

        let name = config.name.clone();
        let core = Arc::new(KernelCore {
            config,
            host_key,
            address,
            context,
            hub: Mutex::new(Some(hub)),
            msg_tx: Mutex::new(msg_tx),
            state: Mutex::new(KernelState {
                nodes: IndexMap::new(),
                node_threads: Vec::new(),
                msg_thread: None,
            }),
            terminated: AtomicBool::new(false),
            log,
        });

        let weak = Arc::downgrade(&core);
        let msg_log = core.log.clone();
        let msg_thread = thread::Builder::new()
            .name(format!("kmsg-{}", name))
            .spawn(move || {
                for msg in msg_rx {
                    if let KernelMsg::Shutdown = msg {
                        return;
                    }

                    let kernel = match weak.upgrade() {
                        Some(core) => Kernel { core },
                        None => return,
                    };

                    if let Err(err) = kernel.handle_msg(msg) {
                        logging::error!(msg_log, "kernel message failed"; "error" => %err);
                    }
                }
            })
            .map_err(RuntimeError::from)?;

        core.state.lock().unwrap().msg_thread = Some(msg_thread);

        logging::info!(core.log, "kernel started";
                       "host_key" => %core.host_key,
                       "address" => &core.address);

        Ok(Kernel { core })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    #[inline]
    pub fn host_key(&self) -> HostKey {
        self.core.host_key
    }

    /// Address at which this kernel accepts peer streams.
    #[inline]
    pub fn address(&self) -> &str {
        &self.core.address
    }

    #[inline]
    pub fn context(&self) -> Arc<dyn Context> {
        self.core.context.clone()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.core.log
    }

    fn check_running(&self) -> RuntimeResult<()> {
        if self.core.terminated.load(Ordering::SeqCst) {
            Err(RuntimeError::Context("kernel is terminating".to_string()))
        } else {
            Ok(())
        }
    }

    /// Create a node. Runs here when `attr.host` names this kernel;
    /// otherwise the attr is forwarded to the owning kernel.
    pub fn create_node(&self, attr: NodeAttr) -> RuntimeResult<()> {
        self.check_running()?;

        let host = self.core.context.host_info(&attr.host)?.ok_or_else(|| {
            RuntimeError::InvalidConfig(format!("node {} names unknown host {}", attr.name, attr.host))
        })?;

        if host.key != self.core.host_key {
            logging::debug!(self.core.log, "forwarding node creation";
                            "node" => &attr.name,
                            "host" => &attr.host);
            return self.core.context.send_kernel_msg(host.key, KernelMsg::CreateNode(attr));
        }

        let factory = factory::node_factory(&attr.node_type)
            .ok_or_else(|| RuntimeError::UnknownNodeType(attr.node_type.clone()))?;
        let node = factory.create(&attr);

        self.spawn_node(attr, node)
    }

    /// Create a closure node on this kernel without going through the
    /// factory registry. Convenience for graphs wired up in code; closures
    /// cannot cross processes.
    pub fn create_fn_node<F>(&self, name: &str, body: F) -> RuntimeResult<()>
    where
        F: FnMut(&NodeHandle) -> NodeResult + Send + 'static,
    {
        self.check_running()?;

        let attr = NodeAttr::new(name, "fn", self.core.config.name.clone());
        self.spawn_node(attr, Box::new(FnNode::new(body)))
    }

    fn spawn_node(&self, attr: NodeAttr, mut node: Box<dyn Node>) -> RuntimeResult<()> {
        let key = self.core.context.create_node_key(self.core.host_key, &attr)?;
        let node_log = self.core.log.new(o!("node" => attr.name.clone()));

        let ctx = Arc::new(NodeCtx {
            attr,
            key,
            kernel: Arc::downgrade(&self.core),
            d4r: D4rNode::new(key, self.core.config.use_d4r, &node_log),
            ports: Mutex::new(HashMap::new()),
            log: node_log,
        });

        {
            let mut state = self.core.state.lock().unwrap();
            state.nodes.insert(ctx.attr.name.clone(), ctx.clone());
        }

        let context = self.core.context.clone();
        let thread_ctx = ctx.clone();
        let join = thread::Builder::new()
            .name(format!("node-{}", ctx.attr.name))
            .spawn(move || {
                if let Err(err) = context.signal_node_start(thread_ctx.key) {
                    logging::error!(thread_ctx.log, "failed to signal node start"; "error" => %err);
                }

                let handle = NodeHandle {
                    ctx: thread_ctx.clone(),
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| node.run(&handle)));

                match &outcome {
                    Ok(Ok(())) => {
                        logging::debug!(thread_ctx.log, "node finished");
                    }
                    Ok(Err(QueueError::KernelShutdown)) => {
                        logging::debug!(thread_ctx.log, "node stopped by kernel shutdown");
                    }
                    Ok(Err(err)) => {
                        logging::info!(thread_ctx.log, "node ended"; "error" => %err);
                    }
                    Err(_) => {
                        logging::error!(thread_ctx.log, "node body panicked");
                    }
                }

                thread_ctx.close_ports();

                if let Err(err) = context.signal_node_end(thread_ctx.key) {
                    logging::error!(thread_ctx.log, "failed to signal node end"; "error" => %err);
                }
            })
            .map_err(RuntimeError::from)?;

        self.core.state.lock().unwrap().node_threads.push(join);

        Ok(())
    }

    fn local_node(&self, name: &str) -> RuntimeResult<Arc<NodeCtx>> {
        self.core
            .state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::InvalidConfig(format!("node {} is not hosted here", name)))
    }

    /// Create a queue between two endpoints. The call lands on the writer's
    /// kernel (forwarded if needed); if the reader lives elsewhere the two
    /// kernels each build their half of a distributed queue.
    pub fn create_queue(&self, attr: QueueAttr) -> RuntimeResult<()> {
        self.check_running()?;
        attr.validate()?;

        let writer_node = self.core.context.node_info(&attr.writer.node)?.ok_or_else(|| {
            RuntimeError::InvalidConfig(format!(
                "queue {} references missing node {}",
                attr.name, attr.writer.node
            ))
        })?;
        let reader_node = self.core.context.node_info(&attr.reader.node)?.ok_or_else(|| {
            RuntimeError::InvalidConfig(format!(
                "queue {} references missing node {}",
                attr.name, attr.reader.node
            ))
        })?;

        let me = self.core.host_key;

        if writer_node.host == me && reader_node.host == me {
            return self.build_local_queue(&attr, &writer_node, &reader_node);
        }

        if writer_node.host == me {
            let spec = self.allocate_spec(&attr, &writer_node, &reader_node)?;
            self.build_writer_half(&spec)?;
            return self
                .core
                .context
                .send_kernel_msg(spec.reader_host, KernelMsg::CreateReader(spec));
        }

        if reader_node.host == me {
            let spec = self.allocate_spec(&attr, &writer_node, &reader_node)?;
            self.build_reader_half(&spec)?;
            return self
                .core
                .context
                .send_kernel_msg(spec.writer_host, KernelMsg::CreateWriter(spec));
        }

        logging::debug!(self.core.log, "forwarding queue creation";
                        "queue" => &attr.name,
                        "writer_host" => %writer_node.host);
        self.core
            .context
            .send_kernel_msg(writer_node.host, KernelMsg::CreateQueue(attr))
    }

    fn allocate_spec(
        &self,
        attr: &QueueAttr,
        writer_node: &NodeRecord,
        reader_node: &NodeRecord,
    ) -> RuntimeResult<RemoteQueueSpec> {
        let context = &self.core.context;

        let writer_key = context.writer_key(writer_node.key, &attr.writer.port)?;
        let reader_key = context.reader_key(reader_node.key, &attr.reader.port)?;
        context.connect_endpoints(writer_key, reader_key)?;

        let writer_host = context.host_info_by_key(writer_node.host)?.ok_or_else(|| {
            RuntimeError::Context(format!("host record for {} vanished", writer_node.host))
        })?;
        let reader_host = context.host_info_by_key(reader_node.host)?.ok_or_else(|| {
            RuntimeError::Context(format!("host record for {} vanished", reader_node.host))
        })?;

        Ok(RemoteQueueSpec {
            attr: attr.clone(),
            writer_key,
            reader_key,
            writer_host: writer_node.host,
            reader_host: reader_node.host,
            writer_address: writer_host.address,
            reader_address: reader_host.address,
        })
    }

    fn build_local_queue(
        &self,
        attr: &QueueAttr,
        writer_node: &NodeRecord,
        reader_node: &NodeRecord,
    ) -> RuntimeResult<()> {
        let context = &self.core.context;

        let writer_key = context.writer_key(writer_node.key, &attr.writer.port)?;
        let reader_key = context.reader_key(reader_node.key, &attr.reader.port)?;
        context.connect_endpoints(writer_key, reader_key)?;

        let writer_ctx = self.local_node(&attr.writer.node)?;
        let reader_ctx = self.local_node(&attr.reader.node)?;

        let core = QueueCore::build(
            attr,
            Role::Local,
            writer_key.raw(),
            self.core.config.swallow_broken_queue_exceptions,
            &self.core.log,
        );
        core.attach_d4r(true, writer_ctx.d4r.clone());
        core.attach_d4r(false, reader_ctx.d4r.clone());

        writer_ctx
            .port(&attr.writer.port, Direction::Writer)
            .bind(core.clone());
        reader_ctx.port(&attr.reader.port, Direction::Reader).bind(core);

        logging::debug!(self.core.log, "local queue created";
                        "queue" => &attr.name,
                        "capacity" => attr.capacity);
        Ok(())
    }

    pub(crate) fn build_writer_half(&self, spec: &RemoteQueueSpec) -> RuntimeResult<()> {
        let writer_ctx = self.local_node(&spec.attr.writer.node)?;

        let core = QueueCore::build(
            &spec.attr,
            Role::RemoteWriter,
            spec.writer_key.raw(),
            self.core.config.swallow_broken_queue_exceptions,
            &self.core.log,
        );
        core.attach_d4r(true, writer_ctx.d4r.clone());

        {
            let hub = self.core.hub.lock().unwrap();
            let hub = hub
                .as_ref()
                .ok_or_else(|| RuntimeError::Context("stream hub is gone".to_string()))?;

            core.attach_hub(hub.kick_handle(spec.writer_key));
            hub.ensure_conn(spec.reader_host, &spec.reader_address)?;
            hub.register(
                EndpointEntry {
                    key: spec.writer_key,
                    peer: spec.reader_key,
                    peer_host: spec.reader_host,
                    writer: true,
                    core: core.clone(),
                    d4r: Some(writer_ctx.d4r.clone()),
                },
                true,
            );
        }

        writer_ctx
            .port(&spec.attr.writer.port, Direction::Writer)
            .bind(core);

        logging::debug!(self.core.log, "writer half created";
                        "queue" => &spec.attr.name,
                        "endpoint" => %spec.writer_key,
                        "peer_host" => %spec.reader_host);
        Ok(())
    }

    pub(crate) fn build_reader_half(&self, spec: &RemoteQueueSpec) -> RuntimeResult<()> {
        let reader_ctx = self.local_node(&spec.attr.reader.node)?;

        let core = QueueCore::build(
            &spec.attr,
            Role::RemoteReader,
            spec.writer_key.raw(),
            self.core.config.swallow_broken_queue_exceptions,
            &self.core.log,
        );
        core.attach_d4r(false, reader_ctx.d4r.clone());

        {
            let hub = self.core.hub.lock().unwrap();
            let hub = hub
                .as_ref()
                .ok_or_else(|| RuntimeError::Context("stream hub is gone".to_string()))?;

            core.attach_hub(hub.kick_handle(spec.reader_key));
            hub.ensure_conn(spec.writer_host, &spec.writer_address)?;
            hub.register(
                EndpointEntry {
                    key: spec.reader_key,
                    peer: spec.writer_key,
                    peer_host: spec.writer_host,
                    writer: false,
                    core: core.clone(),
                    d4r: Some(reader_ctx.d4r.clone()),
                },
                true,
            );
        }

        reader_ctx
            .port(&spec.attr.reader.port, Direction::Reader)
            .bind(core);

        logging::debug!(self.core.log, "reader half created";
                        "queue" => &spec.attr.name,
                        "endpoint" => %spec.reader_key,
                        "peer_host" => %spec.writer_host);
        Ok(())
    }

    fn handle_msg(&self, msg: KernelMsg) -> RuntimeResult<()> {
        match msg {
            KernelMsg::CreateNode(attr) => self.create_node(attr),
            KernelMsg::CreateQueue(attr) => self.create_queue(attr),
            KernelMsg::CreateWriter(spec) => {
                spec.attr.validate()?;
                self.build_writer_half(&spec)
            }
            KernelMsg::CreateReader(spec) => {
                spec.attr.validate()?;
                self.build_reader_half(&spec)
            }
            KernelMsg::Shutdown => Ok(()),
        }
    }

    /// Block until the named node has started.
    pub fn wait_node_start(&self, name: &str) -> RuntimeResult<()> {
        self.core.context.wait_node_start(name).map(|_| ())
    }

    /// Block until the named node has terminated.
    pub fn wait_node_terminate(&self, name: &str) -> RuntimeResult<()> {
        self.core.context.wait_node_end(name)
    }

    /// Block until the cluster-wide live node count reaches zero.
    pub fn wait_for_all_node_end(&self) -> RuntimeResult<()> {
        self.core.context.wait_all_nodes_end()
    }

    /// Cooperative cancellation: every blocked or subsequent queue call in
    /// local nodes fails with `KernelShutdown`; node bodies observe it and
    /// return.
    pub fn terminate(&self) {
        if self.core.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::info!(self.core.log, "kernel terminating");

        let nodes: Vec<Arc<NodeCtx>> = {
            let state = self.core.state.lock().unwrap();
            state.nodes.values().cloned().collect()
        };

        for ctx in nodes {
            ctx.terminate_ports();
        }
    }
}

impl Drop for KernelCore {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);

        // Unblock and join whatever nodes are still running.
        let (nodes, threads) = {
            let mut state = self.state.lock().unwrap();
            (
                state.nodes.values().cloned().collect::<Vec<_>>(),
                state.node_threads.drain(..).collect::<Vec<_>>(),
            )
        };

        for ctx in nodes {
            ctx.terminate_ports();
        }

        // A node body may itself hold the last kernel handle; never join the
        // thread running this destructor.
        let current = thread::current().id();
        for join in threads {
            if join.thread().id() != current {
                let _ = join.join();
            }
        }

        let _ = self.msg_tx.lock().unwrap().send(KernelMsg::Shutdown);
        if let Some(join) = self.state.lock().unwrap().msg_thread.take() {
            let _ = join.join();
        }

        if let Some(mut hub) = self.hub.lock().unwrap().take() {
            hub.shutdown();
        }

        let _ = self.context.signal_host_end(self.host_key);
        logging::debug!(self.log, "kernel dismantled");
    }
}
