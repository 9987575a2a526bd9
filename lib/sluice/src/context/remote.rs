//! Context client for the directory server. One background thread reads the
//! socket, routing replies to waiting commands by `msgid`, fanning
//! broadcasts out to subscribers, and handing relayed kernel commands to the
//! local kernel's inbox. Wait primitives subscribe, query once, then consume
//! broadcasts until their predicate holds.

use crate::attr::{NodeAttr, QueueAttr};
use crate::context::protocol::{self, Envelope};
use crate::context::{Context, ContextEvent, EndpointRecord, HostRecord, KernelMsg, NodeRecord};
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{EndpointKey, HostKey, NodeKey};
use crate::queue::RemoteQueueSpec;
use hashbrown::HashMap;
use serde_json::{json, Value};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use weir::logging::{self, Logger};

struct ClientInner {
    writer: Mutex<TcpStream>,
    control: TcpStream,
    msgid: AtomicU32,
    replies: Mutex<HashMap<u32, Sender<Envelope>>>,
    subscribers: Mutex<Vec<(u64, Sender<ContextEvent>)>>,
    subscriber_counter: AtomicU64,
    kernel_inbox: Mutex<Option<Sender<KernelMsg>>>,
    dead: AtomicBool,
    log: Logger,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

pub struct RemoteContext {
    inner: Arc<ClientInner>,
}

impl RemoteContext {
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(address: &str, log: L) -> RuntimeResult<Arc<RemoteContext>> {
        let log = logging::component(log);

        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;
        let control = stream.try_clone()?;

        let inner = Arc::new(ClientInner {
            writer: Mutex::new(stream),
            control,
            msgid: AtomicU32::new(0),
            replies: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            subscriber_counter: AtomicU64::new(0),
            kernel_inbox: Mutex::new(None),
            dead: AtomicBool::new(false),
            log,
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("context-client".to_string())
            .spawn(move || reader_loop(read_stream, weak))
            .map_err(RuntimeError::from)?;

        logging::debug!(inner.log, "connected to directory"; "address" => address);

        Ok(Arc::new(RemoteContext { inner }))
    }

    fn lost() -> RuntimeError {
        RuntimeError::Context("directory connection lost".to_string())
    }

    /// Issue one command and block for its correlated reply.
    fn command(&self, kind: u32, body: Value) -> RuntimeResult<Envelope> {
        if self.inner.dead.load(Ordering::SeqCst) {
            return Err(Self::lost());
        }

        let msgid = self.inner.msgid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel();
        self.inner.replies.lock().unwrap().insert(msgid, tx);

        let envelope = Envelope::command(kind, msgid, body);
        let result = {
            let mut writer = self.inner.writer.lock().unwrap();
            protocol::write_message(&mut *writer, &envelope)
        };

        if let Err(err) = result {
            self.inner.replies.lock().unwrap().remove(&msgid);
            return Err(err.into());
        }

        match rx.recv() {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.inner.replies.lock().unwrap().remove(&msgid);
                Err(Self::lost())
            }
        }
    }

    fn status_command(&self, kind: u32, body: Value) -> RuntimeResult<()> {
        let reply: protocol::StatusReply = self.command(kind, body)?.parse()?;
        if reply.success {
            Ok(())
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn key_command(&self, kind: u32, body: Value) -> RuntimeResult<u64> {
        let reply: protocol::KeyReply = self.command(kind, body)?.parse()?;
        if reply.success {
            Ok(reply.key)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn add_subscriber(&self, sender: Sender<ContextEvent>) -> u64 {
        let id = self.inner.subscriber_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.subscribers.lock().unwrap().push((id, sender));
        id
    }

    fn remove_subscriber(&self, id: u64) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

fn reader_loop(mut stream: TcpStream, weak: Weak<ClientInner>) {
    loop {
        let envelope = match protocol::read_message(&mut stream) {
            Ok(envelope) => envelope,
            Err(_) => {
                if let Some(inner) = weak.upgrade() {
                    inner.dead.store(true, Ordering::SeqCst);
                    // Dropping the reply slots unblocks every waiting command.
                    inner.replies.lock().unwrap().clear();
                    inner.subscribers.lock().unwrap().clear();
                    logging::debug!(inner.log, "directory connection closed");
                }
                return;
            }
        };

        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        match envelope.msgtype.as_str() {
            "reply" => {
                let slot = inner.replies.lock().unwrap().remove(&envelope.msgid);
                if let Some(slot) = slot {
                    let _ = slot.send(envelope);
                }
            }
            "broadcast" => match envelope.parse::<protocol::EventBroadcast>() {
                Ok(broadcast) => {
                    let subscribers = inner.subscribers.lock().unwrap().clone();
                    let mut dead = Vec::new();
                    for (id, sender) in &subscribers {
                        if sender.send(broadcast.event.clone()).is_err() {
                            dead.push(*id);
                        }
                    }
                    if !dead.is_empty() {
                        inner
                            .subscribers
                            .lock()
                            .unwrap()
                            .retain(|(id, _)| !dead.contains(id));
                    }
                }
                Err(err) => {
                    logging::error!(inner.log, "bad broadcast"; "error" => %err);
                }
            },
            "command" => {
                if let Err(err) = deliver_kernel_command(&inner, &envelope) {
                    logging::error!(inner.log, "bad kernel relay"; "error" => %err);
                }
            }
            other => {
                logging::debug!(inner.log, "unknown msgtype"; "msgtype" => other);
            }
        }
    }
}

fn deliver_kernel_command(inner: &Arc<ClientInner>, envelope: &Envelope) -> std::io::Result<()> {
    let msg = match envelope.kind {
        protocol::CREATE_NODE => {
            let relay: protocol::KernelRelay<NodeAttr> = envelope.parse()?;
            KernelMsg::CreateNode(relay.payload)
        }
        protocol::CREATE_QUEUE => {
            let relay: protocol::KernelRelay<QueueAttr> = envelope.parse()?;
            KernelMsg::CreateQueue(relay.payload)
        }
        protocol::CREATE_WRITER => {
            let relay: protocol::KernelRelay<RemoteQueueSpec> = envelope.parse()?;
            KernelMsg::CreateWriter(relay.payload)
        }
        protocol::CREATE_READER => {
            let relay: protocol::KernelRelay<RemoteQueueSpec> = envelope.parse()?;
            KernelMsg::CreateReader(relay.payload)
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected relayed command type {}", other),
            ))
        }
    };

    let inbox = inner.kernel_inbox.lock().unwrap().clone();
    match inbox {
        Some(inbox) => {
            let _ = inbox.send(msg);
            Ok(())
        }
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no kernel inbox registered",
        )),
    }
}

impl Context for RemoteContext {
    fn setup_host(&self, name: &str, address: &str) -> RuntimeResult<HostKey> {
        let key = self.key_command(
            protocol::SETUP_HOST,
            json!({ "name": name, "address": address }),
        )?;
        Ok(HostKey(key))
    }

    fn signal_host_end(&self, host: HostKey) -> RuntimeResult<()> {
        self.status_command(protocol::SIGNAL_HOST_END, json!({ "key": host.raw() }))
    }

    fn host_info(&self, name: &str) -> RuntimeResult<Option<HostRecord>> {
        let reply: protocol::HostReply = self
            .command(protocol::GET_HOST_INFO, json!({ "name": name }))?
            .parse()?;
        if reply.success {
            Ok(reply.host)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn host_info_by_key(&self, key: HostKey) -> RuntimeResult<Option<HostRecord>> {
        let reply: protocol::HostReply = self
            .command(protocol::GET_HOST_INFO, json!({ "key": key.raw() }))?
            .parse()?;
        if reply.success {
            Ok(reply.host)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn create_node_key(&self, host: HostKey, attr: &NodeAttr) -> RuntimeResult<NodeKey> {
        let key = self.key_command(
            protocol::CREATE_NODE_KEY,
            json!({
                "host": host.raw(),
                "name": attr.name,
                "node_type": attr.node_type,
            }),
        )?;
        Ok(NodeKey(key))
    }

    fn signal_node_start(&self, node: NodeKey) -> RuntimeResult<()> {
        self.status_command(protocol::SIGNAL_NODE_START, json!({ "key": node.raw() }))
    }

    fn signal_node_end(&self, node: NodeKey) -> RuntimeResult<()> {
        self.status_command(protocol::SIGNAL_NODE_END, json!({ "key": node.raw() }))
    }

    fn node_info(&self, name: &str) -> RuntimeResult<Option<NodeRecord>> {
        let reply: protocol::NodeReply = self
            .command(protocol::GET_NODE_INFO, json!({ "name": name }))?
            .parse()?;
        if reply.success {
            Ok(reply.node)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn live_node_count(&self) -> RuntimeResult<u64> {
        let reply: protocol::CountReply = self
            .command(protocol::GET_NUM_NODE_LIVE, json!({}))?
            .parse()?;
        if reply.success {
            Ok(reply.count)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn writer_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey> {
        let key = self.key_command(
            protocol::GET_CREATE_WRITER_KEY,
            json!({ "node": node.raw(), "port": port }),
        )?;
        Ok(EndpointKey(key))
    }

    fn reader_key(&self, node: NodeKey, port: &str) -> RuntimeResult<EndpointKey> {
        let key = self.key_command(
            protocol::GET_CREATE_READER_KEY,
            json!({ "node": node.raw(), "port": port }),
        )?;
        Ok(EndpointKey(key))
    }

    fn endpoint_info(&self, key: EndpointKey) -> RuntimeResult<Option<EndpointRecord>> {
        let reply: protocol::EndpointReply = self
            .command(protocol::GET_ENDPOINT_INFO, json!({ "key": key.raw() }))?
            .parse()?;
        if reply.success {
            Ok(reply.endpoint)
        } else {
            Err(RuntimeError::Context(reply.error))
        }
    }

    fn connect_endpoints(&self, writer: EndpointKey, reader: EndpointKey) -> RuntimeResult<()> {
        self.status_command(
            protocol::CONNECT_ENDPOINTS,
            json!({ "writer": writer.raw(), "reader": reader.raw() }),
        )
    }

    fn send_kernel_msg(&self, host: HostKey, msg: KernelMsg) -> RuntimeResult<()> {
        let (kind, payload) = match msg {
            KernelMsg::CreateNode(attr) => (protocol::CREATE_NODE, serde_json::to_value(attr)),
            KernelMsg::CreateQueue(attr) => (protocol::CREATE_QUEUE, serde_json::to_value(attr)),
            KernelMsg::CreateWriter(spec) => (protocol::CREATE_WRITER, serde_json::to_value(spec)),
            KernelMsg::CreateReader(spec) => (protocol::CREATE_READER, serde_json::to_value(spec)),
            KernelMsg::Shutdown => {
                return Err(RuntimeError::Context(
                    "shutdown is not relayable".to_string(),
                ))
            }
        };

        let payload = payload.map_err(|err| RuntimeError::Context(err.to_string()))?;
        self.status_command(kind, json!({ "host": host.raw(), "payload": payload }))
    }

    fn register_kernel(&self, _host: HostKey, inbox: Sender<KernelMsg>) -> RuntimeResult<()> {
        *self.inner.kernel_inbox.lock().unwrap() = Some(inbox);
        Ok(())
    }

    fn subscribe(&self, listener: Sender<ContextEvent>) {
        self.add_subscriber(listener);
    }

    fn wait_node_start(&self, name: &str) -> RuntimeResult<NodeRecord> {
        let (tx, rx) = mpsc::channel();
        let id = self.add_subscriber(tx);

        let result = (|| {
            if let Some(record) = self.node_info(name)? {
                if record.started {
                    return Ok(record);
                }
            }

            loop {
                match rx.recv() {
                    Ok(ContextEvent::NodeStart(record)) if record.name == name => {
                        return Ok(record)
                    }
                    Ok(_) => continue,
                    Err(_) => return Err(Self::lost()),
                }
            }
        })();

        self.remove_subscriber(id);
        result
    }

    fn wait_node_end(&self, name: &str) -> RuntimeResult<()> {
        let (tx, rx) = mpsc::channel();
        let id = self.add_subscriber(tx);

        let result = (|| {
            if let Some(record) = self.node_info(name)? {
                if record.dead {
                    return Ok(());
                }
            }

            loop {
                match rx.recv() {
                    Ok(ContextEvent::NodeEnd(record)) if record.name == name => return Ok(()),
                    Ok(_) => continue,
                    Err(_) => return Err(Self::lost()),
                }
            }
        })();

        self.remove_subscriber(id);
        result
    }

    fn wait_all_nodes_end(&self) -> RuntimeResult<()> {
        let (tx, rx) = mpsc::channel();
        let id = self.add_subscriber(tx);

        let result = (|| loop {
            if self.live_node_count()? == 0 {
                return Ok(());
            }

            // Re-query on the next lifecycle change.
            match rx.recv() {
                Ok(ContextEvent::NodeEnd(_)) | Ok(ContextEvent::HostEnd(_)) => continue,
                Ok(_) => continue,
                Err(_) => return Err(Self::lost()),
            }
        })();

        self.remove_subscriber(id);
        result
    }
}
