//! Attribute records handed to `create_node`/`create_queue` and the kernel
//! configuration. Attrs are plain serde structs so they can ride the context
//! protocol between kernels unchanged.

use crate::error::{RuntimeError, RuntimeResult};
use serde_derive::{Deserialize, Serialize};

/// A directional (node, port) reference naming one end of a queue.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    #[inline]
    pub fn new<N: Into<String>, P: Into<String>>(node: N, port: P) -> PortRef {
        PortRef {
            node: node.into(),
            port: port.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Globally unique node name.
    pub name: String,
    /// Factory type identifier.
    pub node_type: String,
    /// Name of the host that should run the node.
    pub host: String,
    /// Opaque parameter string, typically JSON; parsed by the node itself.
    #[serde(default)]
    pub param: String,
    /// Opaque binary argument blob.
    #[serde(default)]
    pub arg: Vec<u8>,
}

impl NodeAttr {
    pub fn new<N, T, H>(name: N, node_type: T, host: H) -> NodeAttr
    where
        N: Into<String>,
        T: Into<String>,
        H: Into<String>,
    {
        NodeAttr {
            name: name.into(),
            node_type: node_type.into(),
            host: host.into(),
            param: String::new(),
            arg: Vec::new(),
        }
    }

    pub fn with_param<P: Into<String>>(mut self, param: P) -> NodeAttr {
        self.param = param.into();
        self
    }

    pub fn with_arg(mut self, arg: Vec<u8>) -> NodeAttr {
        self.arg = arg;
        self
    }
}

fn default_channels() -> usize {
    1
}

fn default_alpha() -> f64 {
    0.5
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueAttr {
    pub name: String,
    pub writer: PortRef,
    pub reader: PortRef,
    /// Capacity in bytes per channel.
    pub capacity: usize,
    /// Largest contiguous window a single get-pointer call may request.
    /// Zero means "same as capacity".
    #[serde(default)]
    pub max_threshold: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Per-channel stride, reported to nodes for multi-channel layouts.
    #[serde(default)]
    pub stride: usize,
    /// Free-form data type tag, for introspection only.
    #[serde(default)]
    pub datatype: String,
    /// Allow threshold requests beyond `max_threshold` to enlarge the queue.
    #[serde(default)]
    pub grow_on_max_threshold: bool,
    /// Growth hysteresis in (0, 1]; new capacity satisfies
    /// `count + thresh <= alpha * new_capacity`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl QueueAttr {
    pub fn new<N: Into<String>>(name: N, writer: PortRef, reader: PortRef, capacity: usize) -> QueueAttr {
        QueueAttr {
            name: name.into(),
            writer,
            reader,
            capacity,
            max_threshold: 0,
            channels: 1,
            stride: 0,
            datatype: String::new(),
            grow_on_max_threshold: false,
            alpha: default_alpha(),
        }
    }

    pub fn with_max_threshold(mut self, max_threshold: usize) -> QueueAttr {
        self.max_threshold = max_threshold;
        self
    }

    pub fn with_channels(mut self, channels: usize, stride: usize) -> QueueAttr {
        self.channels = channels;
        self.stride = stride;
        self
    }

    pub fn with_grow(mut self, alpha: f64) -> QueueAttr {
        self.grow_on_max_threshold = true;
        self.alpha = alpha;
        self
    }

    pub fn with_datatype<D: Into<String>>(mut self, datatype: D) -> QueueAttr {
        self.datatype = datatype.into();
        self
    }

    /// Effective maximum threshold after defaulting.
    #[inline]
    pub fn effective_max_threshold(&self) -> usize {
        match self.max_threshold {
            0 => self.capacity,
            thresh => thresh,
        }
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.capacity == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "queue {} has zero capacity",
                self.name
            )));
        }

        if self.channels == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "queue {} has zero channels",
                self.name
            )));
        }

        if self.effective_max_threshold() > self.capacity && !self.grow_on_max_threshold {
            return Err(RuntimeError::InvalidConfig(format!(
                "queue {} max threshold {} exceeds capacity {} without grow",
                self.name, self.max_threshold, self.capacity
            )));
        }

        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(RuntimeError::InvalidConfig(format!(
                "queue {} alpha {} outside (0, 1]",
                self.name, self.alpha
            )));
        }

        if self.writer.node == self.reader.node && self.writer.port == self.reader.port {
            return Err(RuntimeError::InvalidConfig(format!(
                "queue {} connects a port to itself",
                self.name
            )));
        }

        Ok(())
    }
}

fn default_use_d4r() -> bool {
    true
}

/// Per-process kernel configuration, loadable from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Host name registered with the context.
    pub name: String,
    /// Listen address for peer kernel streams. `None` binds an ephemeral
    /// loopback port.
    #[serde(default)]
    pub address: Option<String>,
    /// Run the distributed deadlock detector.
    #[serde(default = "default_use_d4r")]
    pub use_d4r: bool,
    /// Convert broken-transport errors into plain `Closed` results.
    #[serde(default)]
    pub swallow_broken_queue_exceptions: bool,
}

impl KernelConfig {
    pub fn new<N: Into<String>>(name: N) -> KernelConfig {
        KernelConfig {
            name: name.into(),
            address: None,
            use_d4r: true,
            swallow_broken_queue_exceptions: false,
        }
    }

    pub fn without_d4r(mut self) -> KernelConfig {
        self.use_d4r = false;
        self
    }

    pub fn swallow_broken(mut self) -> KernelConfig {
        self.swallow_broken_queue_exceptions = true;
        self
    }
}
