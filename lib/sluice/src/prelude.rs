//! Commonly used types for building and hosting process networks.

pub use crate::attr::{KernelConfig, NodeAttr, PortRef, QueueAttr};
pub use crate::context::{Context, ContextEvent, Direction, LocalContext, RemoteContext};
pub use crate::error::{ErrorUtils, QueueError, QueueResult, RuntimeError, RuntimeResult};
pub use crate::factory::{register_node_factory, FnFactory, NodeFactory};
pub use crate::identity::{EndpointKey, HostKey, NodeKey};
pub use crate::kernel::Kernel;
pub use crate::loader;
pub use crate::node::{FnNode, Node, NodeHandle, NodeResult, ReaderPort, WriterPort};
pub use crate::queue::{local_pair, QueueReader, QueueWriter};
