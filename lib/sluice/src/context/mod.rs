//! The context: cluster-wide directory and event bus. It names hosts, nodes
//! and queue endpoints with integer keys, wires endpoints together, counts
//! live nodes, relays kernel-to-kernel messages, and broadcasts lifecycle
//! events. Two interchangeable implementations exist: `LocalContext` for a
//! single process and `RemoteContext`, a client for the directory server.

pub(crate) mod directory;
pub mod local;
pub mod protocol;
pub mod remote;
pub mod server;

pub use self::local::LocalContext;
pub use self::remote::RemoteContext;

use crate::attr::{NodeAttr, QueueAttr};
use crate::error::RuntimeResult;
use crate::identity::{EndpointKey, HostKey, NodeKey};
use crate::queue::RemoteQueueSpec;
use serde_derive::{Deserialize, Serialize};
use std::sync::mpsc::Sender;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostRecord {
    pub key: HostKey,
    pub name: String,
    /// Address at which the host's kernel accepts peer streams.
    pub address: String,
    pub live: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub name: String,
    pub node_type: String,
    pub host: HostKey,
    pub started: bool,
    pub dead: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Reader,
    Writer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub key: EndpointKey,
    pub node: NodeKey,
    pub host: HostKey,
    pub port: String,
    pub direction: Direction,
    pub live: bool,
    pub peer: Option<EndpointKey>,
}

/// Lifecycle broadcasts delivered to every subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ContextEvent {
    HostStart(HostRecord),
    HostEnd(HostKey),
    NodeStart(NodeRecord),
    NodeEnd(NodeRecord),
    EndpointCreated(EndpointRecord),
}

/// Kernel-to-kernel messages relayed through the context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KernelMsg {
    CreateNode(NodeAttr),
    CreateQueue(QueueAttr),
    CreateWriter(RemoteQueueSpec),
    CreateReader(RemoteQueueSpec),
    /// Local control: dismantle the message thread.
    Shutdown,
}

/// The directory interface kernels program against. All operations are
/// synchronous; the wait primitives block on the broadcast stream.
pub trait Context: Send + Sync {
    /// Register a kernel process; returns its fresh host key.
    fn setup_host(&self, name: &str, address: &str) -> RuntimeResult<HostKey>;

    fn signal_host_end(&self, host: HostKey) -> RuntimeResult<()>;

    fn host_info(&self, name: &str) -> RuntimeResult<Option<HostRecord>>;

    fn host_info_by_key(&self, key: HostKey) -> RuntimeResult<Option<HostRecord>>;

    /// Allocate a node key under a host; node names are unique cluster-wide.
    fn create_node_key(&self, host: HostKey, attr: &NodeAttr) -> RuntimeResult<NodeKey>;

    fn signal_node_start(&self, node: NodeKey) -> RuntimeResult<()>;

    fn signal_node_end(&self, node: NodeKey) -> RuntimeResult<()>;

    fn node_info(&self, name: &str) -> RuntimeResult<Option<NodeRecord>>;

    fn live_node_count(&self) -> RuntimeResult<u64>;

    /// Get-or-create the writer endpoint key for (node, port).
    fn writer_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey>;

    /// Get-or-create the reader endpoint key for (node, port).
    fn reader_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey>;

    fn endpoint_info(&self, key: EndpointKey) -> RuntimeResult<Option<EndpointRecord>>;

    /// Bind a writer endpoint to a reader endpoint.
    fn connect_endpoints(&self, writer: EndpointKey, reader: EndpointKey) -> RuntimeResult<()>;

    /// Relay a kernel message to the kernel owning `host`.
    fn send_kernel_msg(&self, host: HostKey, msg: KernelMsg) -> RuntimeResult<()>;

    /// Register the inbox on which this process's kernel receives relayed
    /// messages.
    fn register_kernel(&self, host: HostKey, inbox: Sender<KernelMsg>) -> RuntimeResult<()>;

    /// Subscribe to the broadcast stream. Dead subscribers are pruned on
    /// delivery failure.
    fn subscribe(&self, listener: Sender<ContextEvent>);

    /// Block until the named node has signalled start.
    fn wait_node_start(&self, name: &str) -> RuntimeResult<NodeRecord>;

    /// Block until the named node has signalled end.
    fn wait_node_end(&self, name: &str) -> RuntimeResult<()>;

    /// Block until the cluster-wide live node count reaches zero.
    fn wait_all_nodes_end(&self) -> RuntimeResult<()>;
}
