//! Graph loader: build a whole node/queue graph from a `Variant` document
//! (JSON or XML). The document shape:
//!
//! ```json
//! {
//!   "nodes": [
//!     {"name": "producer", "type": "sieve-producer", "host": "k1",
//!      "param": "{\"limit\": 100}"}
//!   ],
//!   "queues": [
//!     {"name": "feed", "writer": {"node": "producer", "port": "out"},
//!      "reader": {"node": "collector", "port": "in"},
//!      "capacity": 4096, "max_threshold": 512,
//!      "channels": 1, "grow": false, "alpha": 0.5}
//!   ]
//! }
//! ```
//!
//! Nodes are created before queues, in document order. Fields not present
//! fall back to the attr defaults; `host` defaults to the kernel the loader
//! runs on.

use crate::attr::{NodeAttr, PortRef, QueueAttr};
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::Kernel;
use weir::variant::Variant;

fn invalid(message: String) -> RuntimeError {
    RuntimeError::InvalidConfig(message)
}

/// Parse a document by extension hint: `.xml` documents use the variant XML
/// scheme, everything else is treated as JSON.
pub fn parse_document(text: &str, xml: bool) -> RuntimeResult<Variant> {
    let parsed = if xml {
        Variant::from_xml(text)
    } else {
        Variant::from_json(text)
    };

    parsed.map_err(|err| invalid(format!("graph document: {}", err)))
}

/// Instantiate every node and queue the document describes on `kernel`.
pub fn load_graph(kernel: &Kernel, document: &Variant) -> RuntimeResult<()> {
    let nodes = match document.get("nodes") {
        Some(nodes) => nodes
            .as_array()
            .map_err(|err| invalid(format!("nodes: {}", err)))?,
        None => &[],
    };

    for node in nodes {
        kernel.create_node(node_attr(kernel, node)?)?;
    }

    let queues = match document.get("queues") {
        Some(queues) => queues
            .as_array()
            .map_err(|err| invalid(format!("queues: {}", err)))?,
        None => &[],
    };

    for queue in queues {
        kernel.create_queue(queue_attr(queue)?)?;
    }

    Ok(())
}

fn get_str(value: &Variant, key: &str, what: &str) -> RuntimeResult<String> {
    value
        .require(key)
        .and_then(|field| field.as_str())
        .map(str::to_string)
        .map_err(|err| invalid(format!("{}: {}", what, err)))
}

fn get_usize(value: &Variant, key: &str, what: &str) -> RuntimeResult<usize> {
    value
        .require(key)
        .and_then(|field| field.as_int())
        .map(|number| number as usize)
        .map_err(|err| invalid(format!("{}: {}", what, err)))
}

fn node_attr(kernel: &Kernel, node: &Variant) -> RuntimeResult<NodeAttr> {
    let name = get_str(node, "name", "node")?;
    let node_type = get_str(node, "type", &name)?;

    let host = match node.get("host") {
        Some(host) => host
            .as_str()
            .map_err(|err| invalid(format!("node {}: host: {}", name, err)))?
            .to_string(),
        None => kernel.name().to_string(),
    };

    let mut attr = NodeAttr::new(name.clone(), node_type, host);

    if let Some(param) = node.get("param") {
        attr.param = param
            .as_str()
            .map_err(|err| invalid(format!("node {}: param: {}", name, err)))?
            .to_string();
    }

    Ok(attr)
}

fn port_ref(queue: &Variant, key: &str, queue_name: &str) -> RuntimeResult<PortRef> {
    let end = queue
        .require(key)
        .map_err(|err| invalid(format!("queue {}: {}", queue_name, err)))?;

    Ok(PortRef::new(
        get_str(end, "node", &format!("queue {} {}", queue_name, key))?,
        get_str(end, "port", &format!("queue {} {}", queue_name, key))?,
    ))
}

fn queue_attr(queue: &Variant) -> RuntimeResult<QueueAttr> {
    let name = get_str(queue, "name", "queue")?;

    let mut attr = QueueAttr::new(
        name.clone(),
        port_ref(queue, "writer", &name)?,
        port_ref(queue, "reader", &name)?,
        get_usize(queue, "capacity", &format!("queue {}", name))?,
    );

    if queue.get("max_threshold").is_some() {
        attr.max_threshold = get_usize(queue, "max_threshold", &name)?;
    }
    if queue.get("channels").is_some() {
        attr.channels = get_usize(queue, "channels", &name)?;
    }
    if queue.get("stride").is_some() {
        attr.stride = get_usize(queue, "stride", &name)?;
    }
    if let Some(datatype) = queue.get("datatype") {
        attr.datatype = datatype
            .as_str()
            .map_err(|err| invalid(format!("queue {}: datatype: {}", name, err)))?
            .to_string();
    }
    if let Some(grow) = queue.get("grow") {
        attr.grow_on_max_threshold = grow
            .as_bool()
            .map_err(|err| invalid(format!("queue {}: grow: {}", name, err)))?;
    }
    if let Some(alpha) = queue.get("alpha") {
        attr.alpha = alpha
            .as_float()
            .map_err(|err| invalid(format!("queue {}: alpha: {}", name, err)))?;
    }

    Ok(attr)
}
