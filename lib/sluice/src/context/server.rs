//! The directory server: hosts the context protocol over TCP for a cluster
//! of kernels. One reader and one writer thread per client; the directory
//! itself sits behind a single mutex. Broadcast listeners are weak in the
//! sense that a client that stops draining its socket is dropped rather than
//! stalling the rest of the cluster.

use crate::context::directory::Directory;
use crate::context::protocol::{self, Envelope};
use crate::context::{ContextEvent, Direction};
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{EndpointKey, HostKey, NodeKey};
use hashbrown::HashMap;
use serde_json::{json, Value};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use weir::logging::{self, Logger};

struct ClientHandle {
    host: Option<HostKey>,
    sender: Sender<Envelope>,
    stream: TcpStream,
}

struct Shared {
    dir: Mutex<Directory>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    client_counter: AtomicU64,
    stop: AtomicBool,
    log: Logger,
}

impl Shared {
    /// Fan an event out to every connected client, pruning the dead.
    fn broadcast(&self, event: &ContextEvent) {
        let envelope = Envelope::broadcast(event);

        let senders: Vec<(u64, Sender<Envelope>)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .map(|(&id, client)| (id, client.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in senders {
            if sender.send(envelope.clone()).is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.lock().unwrap();
            for id in dead {
                clients.remove(&id);
            }
        }
    }

    fn broadcast_all(&self, events: Vec<ContextEvent>) {
        for event in &events {
            self.broadcast(event);
        }
    }
}

/// Running server handle; shutting it down closes the listener and all
/// client connections.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        // Poke the accept loop awake.
        let _ = TcpStream::connect(self.local_addr);

        {
            let clients = self.shared.clients.lock().unwrap();
            for client in clients.values() {
                let _ = client.stream.shutdown(Shutdown::Both);
            }
        }

        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind and serve the directory. `127.0.0.1:0` gives an ephemeral port for
/// tests; the bound address is on the returned handle.
pub fn serve<'a, L: Into<Option<&'a Logger>>>(address: &str, log: L) -> RuntimeResult<ServerHandle> {
    let log = logging::component(log);

    let listener = TcpListener::bind(address)?;
    let local_addr = listener.local_addr()?;

    let shared = Arc::new(Shared {
        dir: Mutex::new(Directory::new()),
        clients: Mutex::new(HashMap::new()),
        client_counter: AtomicU64::new(0),
        stop: AtomicBool::new(false),
        log,
    });

    logging::info!(shared.log, "directory server listening"; "address" => %local_addr);

    let accept_shared = shared.clone();
    let join = thread::Builder::new()
        .name("director-accept".to_string())
        .spawn(move || accept_loop(listener, accept_shared))
        .map_err(RuntimeError::from)?;

    Ok(ServerHandle {
        local_addr,
        shared,
        join: Some(join),
    })
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }

        match stream {
            Ok(stream) => {
                if let Err(err) = install_client(stream, &shared) {
                    logging::error!(shared.log, "failed to install client"; "error" => %err);
                }
            }
            Err(err) => {
                logging::error!(shared.log, "accept failed"; "error" => %err);
                return;
            }
        }
    }
}

fn install_client(stream: TcpStream, shared: &Arc<Shared>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let id = shared.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let peer = stream.peer_addr()?;

    let (tx, rx) = mpsc::channel::<Envelope>();
    let mut write_stream = stream.try_clone()?;
    let read_stream = stream.try_clone()?;

    shared.clients.lock().unwrap().insert(
        id,
        ClientHandle {
            host: None,
            sender: tx,
            stream,
        },
    );

    logging::debug!(shared.log, "client connected"; "client" => id, "peer" => %peer);

    let writer_log = shared.log.clone();
    thread::Builder::new()
        .name(format!("director-out-{}", id))
        .spawn(move || {
            for envelope in rx {
                if protocol::write_message(&mut write_stream, &envelope).is_err() {
                    logging::debug!(writer_log, "client write failed, dropping listener");
                    return;
                }
            }
        })?;

    let reader_shared = shared.clone();
    thread::Builder::new()
        .name(format!("director-in-{}", id))
        .spawn(move || client_loop(id, read_stream, reader_shared))?;

    Ok(())
}

fn client_loop(id: u64, mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let envelope = match protocol::read_message(&mut stream) {
            Ok(envelope) => envelope,
            Err(err) => {
                logging::debug!(shared.log, "client disconnected"; "client" => id, "error" => %err);
                shared.clients.lock().unwrap().remove(&id);
                return;
            }
        };

        if envelope.msgtype != "command" {
            logging::debug!(shared.log, "ignoring non-command message";
                            "client" => id,
                            "msgtype" => &envelope.msgtype);
            continue;
        }

        let (reply, events) = handle_command(id, &envelope, &shared);

        if let Some(reply) = reply {
            let sender = shared
                .clients
                .lock()
                .unwrap()
                .get(&id)
                .map(|client| client.sender.clone());
            if let Some(sender) = sender {
                let _ = sender.send(reply);
            }
        }

        shared.broadcast_all(events);
    }
}

fn reply_to(envelope: &Envelope, body: Value) -> Option<Envelope> {
    Some(Envelope::reply(envelope.kind, envelope.msgid, body))
}

fn handle_command(
    client_id: u64,
    envelope: &Envelope,
    shared: &Arc<Shared>,
) -> (Option<Envelope>, Vec<ContextEvent>) {
    let mut events = Vec::new();

    let reply = match envelope.kind {
        protocol::SETUP_HOST => match envelope.parse::<protocol::SetupHost>() {
            Ok(payload) => {
                let result = shared.dir.lock().unwrap().setup_host(&payload.name, &payload.address);
                match result {
                    Ok((key, event)) => {
                        events.push(event);
                        if let Some(client) = shared.clients.lock().unwrap().get_mut(&client_id) {
                            client.host = Some(key);
                        }
                        reply_to(envelope, json!({"success": true, "key": key.raw()}))
                    }
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::SIGNAL_HOST_END => match envelope.parse::<protocol::KeySignal>() {
            Ok(payload) => {
                let result = shared.dir.lock().unwrap().signal_host_end(HostKey(payload.key));
                match result {
                    Ok(event) => {
                        events.push(event);
                        reply_to(envelope, protocol::StatusReply::ok())
                    }
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::GET_HOST_INFO => match envelope.parse::<protocol::HostQuery>() {
            Ok(payload) => {
                let dir = shared.dir.lock().unwrap();
                let host = match (&payload.name, payload.key) {
                    (Some(name), _) => dir.host_by_name(name),
                    (None, Some(key)) => dir.host_by_key(HostKey(key)),
                    (None, None) => None,
                };
                reply_to(envelope, json!({"success": true, "host": host}))
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::CREATE_NODE_KEY => match envelope.parse::<protocol::CreateNodeKey>() {
            Ok(payload) => {
                let result = shared.dir.lock().unwrap().create_node_key(
                    HostKey(payload.host),
                    &payload.name,
                    &payload.node_type,
                );
                match result {
                    Ok(key) => reply_to(envelope, json!({"success": true, "key": key.raw()})),
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::SIGNAL_NODE_START => match envelope.parse::<protocol::KeySignal>() {
            Ok(payload) => {
                let result = shared.dir.lock().unwrap().signal_node_start(NodeKey(payload.key));
                match result {
                    Ok(event) => {
                        events.push(event);
                        reply_to(envelope, protocol::StatusReply::ok())
                    }
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::SIGNAL_NODE_END => match envelope.parse::<protocol::KeySignal>() {
            Ok(payload) => {
                let result = shared.dir.lock().unwrap().signal_node_end(NodeKey(payload.key));
                match result {
                    Ok(event) => {
                        events.push(event);
                        reply_to(envelope, protocol::StatusReply::ok())
                    }
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::GET_NODE_INFO => match envelope.parse::<protocol::NodeQuery>() {
            Ok(payload) => {
                let node = shared.dir.lock().unwrap().node_by_name(&payload.name);
                reply_to(envelope, json!({"success": true, "node": node}))
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::GET_NUM_NODE_LIVE => {
            let count = shared.dir.lock().unwrap().live_nodes();
            reply_to(envelope, json!({"success": true, "count": count}))
        }
        protocol::GET_CREATE_WRITER_KEY | protocol::GET_CREATE_READER_KEY => {
            match envelope.parse::<protocol::EndpointKeyRequest>() {
                Ok(payload) => {
                    let direction = if envelope.kind == protocol::GET_CREATE_WRITER_KEY {
                        Direction::Writer
                    } else {
                        Direction::Reader
                    };
                    let result = shared.dir.lock().unwrap().endpoint_key(
                        NodeKey(payload.node),
                        &payload.port,
                        direction,
                    );
                    match result {
                        Ok((key, event)) => {
                            events.extend(event);
                            reply_to(envelope, json!({"success": true, "key": key.raw()}))
                        }
                        Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                    }
                }
                Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
            }
        }
        protocol::CONNECT_ENDPOINTS => match envelope.parse::<protocol::ConnectRequest>() {
            Ok(payload) => {
                let result = shared
                    .dir
                    .lock()
                    .unwrap()
                    .connect(EndpointKey(payload.writer), EndpointKey(payload.reader));
                match result {
                    Ok(()) => reply_to(envelope, protocol::StatusReply::ok()),
                    Err(error) => reply_to(envelope, protocol::StatusReply::fail(&error)),
                }
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::GET_ENDPOINT_INFO => match envelope.parse::<protocol::KeySignal>() {
            Ok(payload) => {
                let endpoint = shared.dir.lock().unwrap().endpoint(EndpointKey(payload.key));
                reply_to(envelope, json!({"success": true, "endpoint": endpoint}))
            }
            Err(err) => reply_to(envelope, protocol::StatusReply::fail(&err.to_string())),
        },
        protocol::CREATE_NODE | protocol::CREATE_QUEUE | protocol::CREATE_WRITER
        | protocol::CREATE_READER => relay_kernel_command(envelope, shared),
        other => {
            logging::debug!(shared.log, "unknown command"; "type" => other, "client" => client_id);
            reply_to(
                envelope,
                protocol::StatusReply::fail(&format!("unknown command type {}", other)),
            )
        }
    };

    (reply, events)
}

/// Forward a kernel-to-kernel command to the client registered for the
/// target host.
fn relay_kernel_command(envelope: &Envelope, shared: &Arc<Shared>) -> Option<Envelope> {
    let target = match envelope.body.get("host").and_then(Value::as_u64) {
        Some(host) => host,
        None => return reply_to(envelope, protocol::StatusReply::fail("relay without host")),
    };

    let sender = {
        let clients = shared.clients.lock().unwrap();
        clients
            .values()
            .find(|client| client.host.map_or(false, |key| key.raw() == target))
            .map(|client| client.sender.clone())
    };

    match sender {
        Some(sender) => {
            let mut forwarded = envelope.clone();
            forwarded.msgid = 0;
            if sender.send(forwarded).is_ok() {
                reply_to(envelope, protocol::StatusReply::ok())
            } else {
                reply_to(
                    envelope,
                    protocol::StatusReply::fail("target kernel is disconnecting"),
                )
            }
        }
        None => reply_to(
            envelope,
            protocol::StatusReply::fail(&format!("no kernel registered for host {}", target)),
        ),
    }
}
