//! The directory state machine shared by the in-process context and the
//! directory server: key allocation, record maps and lifecycle transitions.
//! Callers hold the surrounding lock and broadcast the returned events after
//! releasing it.

use crate::context::{ContextEvent, Direction, EndpointRecord, HostRecord, NodeRecord};
use crate::identity::{EndpointKey, HostKey, NodeKey};
use hashbrown::HashMap;

pub(crate) struct Directory {
    counter: u64,
    hosts: HashMap<u64, HostRecord>,
    host_names: HashMap<String, u64>,
    nodes: HashMap<u64, NodeRecord>,
    node_names: HashMap<String, u64>,
    endpoints: HashMap<u64, EndpointRecord>,
    endpoint_index: HashMap<(u64, String, Direction), u64>,
    live_nodes: u64,
}

impl Directory {
    pub fn new() -> Directory {
        Directory {
            counter: 0,
            hosts: HashMap::new(),
            host_names: HashMap::new(),
            nodes: HashMap::new(),
            node_names: HashMap::new(),
            endpoints: HashMap::new(),
            endpoint_index: HashMap::new(),
            live_nodes: 0,
        }
    }

    fn next_key(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn setup_host(&mut self, name: &str, address: &str) -> Result<(HostKey, ContextEvent), String> {
        if self.host_names.contains_key(name) {
            return Err(format!("host {} is already registered", name));
        }

        let key = HostKey(self.next_key());
        let record = HostRecord {
            key,
            name: name.to_string(),
            address: address.to_string(),
            live: true,
        };

        self.hosts.insert(key.raw(), record.clone());
        self.host_names.insert(name.to_string(), key.raw());

        Ok((key, ContextEvent::HostStart(record)))
    }

    pub fn signal_host_end(&mut self, key: HostKey) -> Result<ContextEvent, String> {
        match self.hosts.get_mut(&key.raw()) {
            Some(record) => {
                record.live = false;
                Ok(ContextEvent::HostEnd(key))
            }
            None => Err(format!("unknown host {}", key)),
        }
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostRecord> {
        self.host_names
            .get(name)
            .and_then(|key| self.hosts.get(key))
            .cloned()
    }

    pub fn host_by_key(&self, key: HostKey) -> Option<HostRecord> {
        self.hosts.get(&key.raw()).cloned()
    }

    pub fn create_node_key(
        &mut self,
        host: HostKey,
        name: &str,
        node_type: &str,
    ) -> Result<NodeKey, String> {
        if !self.hosts.contains_key(&host.raw()) {
            return Err(format!("unknown host {}", host));
        }
        if self.node_names.contains_key(name) {
            return Err(format!("node {} already exists", name));
        }

        let key = NodeKey(self.next_key());
        self.nodes.insert(
            key.raw(),
            NodeRecord {
                key,
                name: name.to_string(),
                node_type: node_type.to_string(),
                host,
                started: false,
                dead: false,
            },
        );
        self.node_names.insert(name.to_string(), key.raw());

        Ok(key)
    }

    pub fn signal_node_start(&mut self, key: NodeKey) -> Result<ContextEvent, String> {
        let record = self
            .nodes
            .get_mut(&key.raw())
            .ok_or_else(|| format!("unknown node {}", key))?;

        if !record.started {
            record.started = true;
            self.live_nodes += 1;
        }

        Ok(ContextEvent::NodeStart(record.clone()))
    }

    pub fn signal_node_end(&mut self, key: NodeKey) -> Result<ContextEvent, String> {
        let record = self
            .nodes
            .get_mut(&key.raw())
            .ok_or_else(|| format!("unknown node {}", key))?;

        if !record.dead {
            record.dead = true;
            if record.started {
                self.live_nodes -= 1;
            }
        }

        Ok(ContextEvent::NodeEnd(record.clone()))
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeRecord> {
        self.node_names
            .get(name)
            .and_then(|key| self.nodes.get(key))
            .cloned()
    }

    pub fn live_nodes(&self) -> u64 {
        self.live_nodes
    }

    /// Get-or-create an endpoint key. Endpoints are created lazily the first
    /// time anything asks for the (node, port, direction) triple.
    pub fn endpoint_key(
        &mut self,
        node: NodeKey,
        port: &str,
        direction: Direction,
    ) -> Result<(EndpointKey, Option<ContextEvent>), String> {
        let node_record = self
            .nodes
            .get(&node.raw())
            .ok_or_else(|| format!("unknown node {}", node))?
            .clone();

        let index_key = (node.raw(), port.to_string(), direction);
        if let Some(&existing) = self.endpoint_index.get(&index_key) {
            return Ok((EndpointKey(existing), None));
        }

        let key = EndpointKey(self.next_key());
        let record = EndpointRecord {
            key,
            node,
            host: node_record.host,
            port: port.to_string(),
            direction,
            live: true,
            peer: None,
        };

        self.endpoints.insert(key.raw(), record.clone());
        self.endpoint_index.insert(index_key, key.raw());

        Ok((key, Some(ContextEvent::EndpointCreated(record))))
    }

    pub fn endpoint(&self, key: EndpointKey) -> Option<EndpointRecord> {
        self.endpoints.get(&key.raw()).cloned()
    }

    pub fn connect(&mut self, writer: EndpointKey, reader: EndpointKey) -> Result<(), String> {
        {
            let writer_rec = self
                .endpoints
                .get(&writer.raw())
                .ok_or_else(|| format!("unknown endpoint {}", writer))?;
            let reader_rec = self
                .endpoints
                .get(&reader.raw())
                .ok_or_else(|| format!("unknown endpoint {}", reader))?;

            if writer_rec.direction != Direction::Writer {
                return Err(format!("endpoint {} is not a writer", writer));
            }
            if reader_rec.direction != Direction::Reader {
                return Err(format!("endpoint {} is not a reader", reader));
            }

            // An endpoint is bound to at most one queue over its lifetime.
            if writer_rec.peer.map_or(false, |peer| peer != reader) {
                return Err(format!("writer {} is already connected", writer));
            }
            if reader_rec.peer.map_or(false, |peer| peer != writer) {
                return Err(format!("reader {} is already connected", reader));
            }
        }

        self.endpoints.get_mut(&writer.raw()).unwrap().peer = Some(reader);
        self.endpoints.get_mut(&reader.raw()).unwrap().peer = Some(writer);

        Ok(())
    }
}
