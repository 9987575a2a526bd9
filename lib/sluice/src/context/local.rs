//! In-process context: the directory behind a mutex, a condition variable
//! for the wait primitives, and direct dispatch of kernel messages to
//! registered kernel inboxes.

use crate::attr::NodeAttr;
use crate::context::directory::Directory;
use crate::context::{Context, ContextEvent, Direction, EndpointRecord, HostRecord, KernelMsg, NodeRecord};
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{EndpointKey, HostKey, NodeKey};
use hashbrown::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use weir::logging::{self, Logger};

struct Inner {
    dir: Directory,
    subscribers: Vec<(u64, Sender<ContextEvent>)>,
    subscriber_counter: u64,
    kernels: HashMap<u64, Sender<KernelMsg>>,
}

pub struct LocalContext {
    inner: Mutex<Inner>,
    changed: Condvar,
    log: Logger,
}

impl LocalContext {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Arc<LocalContext> {
        Arc::new(LocalContext {
            inner: Mutex::new(Inner {
                dir: Directory::new(),
                subscribers: Vec::new(),
                subscriber_counter: 0,
                kernels: HashMap::new(),
            }),
            changed: Condvar::new(),
            log: logging::component(log),
        })
    }

    /// Deliver an event to every subscriber. Delivery happens outside the
    /// directory lock; dead subscribers are pruned afterwards.
    fn broadcast(&self, event: ContextEvent) {
        let subscribers = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.clone()
        };

        let mut dead = Vec::new();
        for (id, sender) in &subscribers {
            if sender.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.retain(|(id, _)| !dead.contains(id));
        }

        self.changed.notify_all();
    }

    fn context_err(message: String) -> RuntimeError {
        RuntimeError::Context(message)
    }
}

impl Context for LocalContext {
    fn setup_host(&self, name: &str, address: &str) -> RuntimeResult<HostKey> {
        let (key, event) = {
            let mut inner = self.inner.lock().unwrap();
            inner.dir.setup_host(name, address).map_err(Self::context_err)?
        };

        logging::debug!(self.log, "host registered"; "host" => name, "key" => %key);
        self.broadcast(event);
        Ok(key)
    }

    fn signal_host_end(&self, host: HostKey) -> RuntimeResult<()> {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.dir.signal_host_end(host).map_err(Self::context_err)?
        };

        self.broadcast(event);
        Ok(())
    }

    fn host_info(&self, name: &str) -> RuntimeResult<Option<HostRecord>> {
        Ok(self.inner.lock().unwrap().dir.host_by_name(name))
    }

    fn host_info_by_key(&self, key: HostKey) -> RuntimeResult<Option<HostRecord>> {
        Ok(self.inner.lock().unwrap().dir.host_by_key(key))
    }

    fn create_node_key(&self, host: HostKey, attr: &NodeAttr) -> RuntimeResult<NodeKey> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .dir
            .create_node_key(host, &attr.name, &attr.node_type)
            .map_err(Self::context_err)
    }

    fn signal_node_start(&self, node: NodeKey) -> RuntimeResult<()> {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.dir.signal_node_start(node).map_err(Self::context_err)?
        };

        self.broadcast(event);
        Ok(())
    }

    fn signal_node_end(&self, node: NodeKey) -> RuntimeResult<()> {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.dir.signal_node_end(node).map_err(Self::context_err)?
        };

        self.broadcast(event);
        Ok(())
    }

    fn node_info(&self, name: &str) -> RuntimeResult<Option<NodeRecord>> {
        Ok(self.inner.lock().unwrap().dir.node_by_name(name))
    }

    fn live_node_count(&self) -> RuntimeResult<u64> {
        Ok(self.inner.lock().unwrap().dir.live_nodes())
    }

    fn writer_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey> {
        let (key, event) = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .dir
                .endpoint_key(node, port, Direction::Writer)
                .map_err(Self::context_err)?
        };

        if let Some(event) = event {
            self.broadcast(event);
        }
        Ok(key)
    }

    fn reader_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey> {
        let (key, event) = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .dir
                .endpoint_key(node, port, Direction::Reader)
                .map_err(Self::context_err)?
        };

        if let Some(event) = event {
            self.broadcast(event);
        }
        Ok(key)
    }

    fn endpoint_info(&self, key: EndpointKey) -> RuntimeResult<Option<EndpointRecord>> {
        Ok(self.inner.lock().unwrap().dir.endpoint(key))
    }

    fn connect_endpoints(&self, writer: EndpointKey, reader: EndpointKey) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dir.connect(writer, reader).map_err(Self::context_err)
    }

    fn send_kernel_msg(&self, host: HostKey, msg: KernelMsg) -> RuntimeResult<()> {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.kernels.get(&host.raw()).cloned()
        };

        match sender {
            Some(sender) => sender
                .send(msg)
                .map_err(|_| Self::context_err(format!("kernel on host {} is gone", host))),
            None => Err(Self::context_err(format!("no kernel registered for host {}", host))),
        }
    }

    fn register_kernel(&self, host: HostKey, inbox: Sender<KernelMsg>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kernels.insert(host.raw(), inbox);
        Ok(())
    }

    fn subscribe(&self, listener: Sender<ContextEvent>) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscriber_counter += 1;
        let id = inner.subscriber_counter;
        inner.subscribers.push((id, listener));
    }

    fn wait_node_start(&self, name: &str) -> RuntimeResult<NodeRecord> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(record) = inner.dir.node_by_name(name) {
                if record.started {
                    return Ok(record);
                }
            }
            inner = self.changed.wait(inner).unwrap();
        }
    }

    fn wait_node_end(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(record) = inner.dir.node_by_name(name) {
                if record.dead {
                    return Ok(());
                }
            }
            inner = self.changed.wait(inner).unwrap();
        }
    }

    fn wait_all_nodes_end(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();

        while inner.dir.live_nodes() > 0 {
            inner = self.changed.wait(inner).unwrap();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn node_attr(name: &str) -> NodeAttr {
        NodeAttr::new(name, "test", "h")
    }

    #[test]
    fn test_setup_and_lookup() {
        let ctx = LocalContext::new(None);

        let key = ctx.setup_host("h", "127.0.0.1:9").unwrap();
        let record = ctx.host_info("h").unwrap().unwrap();

        assert_eq!(record.key, key);
        assert_eq!(record.address, "127.0.0.1:9");
        assert!(record.live);
        assert!(ctx.host_info("missing").unwrap().is_none());
    }

    #[test]
    fn test_broadcasts_reach_subscribers() {
        let ctx = LocalContext::new(None);

        let (tx, rx) = mpsc::channel();
        ctx.subscribe(tx);

        ctx.setup_host("h", "a").unwrap();

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            ContextEvent::HostStart(record) => assert_eq!(record.name, "h"),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_dead_subscribers_are_pruned() {
        let ctx = LocalContext::new(None);

        let (tx, rx) = mpsc::channel();
        ctx.subscribe(tx);
        drop(rx);

        ctx.setup_host("h", "a").unwrap();
        ctx.setup_host("h2", "a").unwrap();

        assert!(ctx.inner.lock().unwrap().subscribers.is_empty());
    }

    #[test]
    fn test_wait_node_start() {
        let ctx = LocalContext::new(None);
        let host = ctx.setup_host("h", "a").unwrap();

        let waiter = ctx.clone();
        let join = thread::spawn(move || waiter.wait_node_start("n").map(|record| record.key));

        thread::sleep(Duration::from_millis(20));
        let node = ctx.create_node_key(host, &node_attr("n")).unwrap();
        ctx.signal_node_start(node).unwrap();

        assert_eq!(join.join().unwrap().unwrap(), node);
    }

    #[test]
    fn test_wait_all_nodes_end() {
        let ctx = LocalContext::new(None);
        let host = ctx.setup_host("h", "a").unwrap();
        let node = ctx.create_node_key(host, &node_attr("n")).unwrap();
        ctx.signal_node_start(node).unwrap();

        let waiter = ctx.clone();
        let join = thread::spawn(move || waiter.wait_all_nodes_end());

        thread::sleep(Duration::from_millis(20));
        ctx.signal_node_end(node).unwrap();

        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_kernel_message_dispatch() {
        let ctx = LocalContext::new(None);
        let host = ctx.setup_host("h", "a").unwrap();

        let (tx, rx) = mpsc::channel();
        ctx.register_kernel(host, tx).unwrap();

        ctx.send_kernel_msg(host, KernelMsg::CreateNode(node_attr("n"))).unwrap();

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            KernelMsg::CreateNode(attr) => assert_eq!(attr.name, "n"),
            other => panic!("Unexpected message {:?}", other),
        }

        let missing = ctx.send_kernel_msg(HostKey(999), KernelMsg::Shutdown);
        assert!(missing.is_err());
    }
}
