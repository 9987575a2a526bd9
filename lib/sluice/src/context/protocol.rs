//! The context wire protocol: JSON envelopes with a 4-byte big-endian length
//! prefix, one per message. `msgtype` distinguishes commands, replies and
//! broadcasts; `type` is the numeric operation tag and `msgid` correlates
//! command/reply pairs.

use crate::context::{ContextEvent, EndpointRecord, HostRecord, NodeRecord};
use byteorder::{BigEndian, ByteOrder};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};

pub const SETUP_HOST: u32 = 1;
pub const GET_HOST_INFO: u32 = 2;
pub const CREATE_NODE_KEY: u32 = 3;
pub const SIGNAL_NODE_START: u32 = 4;
pub const SIGNAL_NODE_END: u32 = 5;
pub const GET_NODE_INFO: u32 = 6;
pub const GET_NUM_NODE_LIVE: u32 = 7;
pub const GET_CREATE_READER_KEY: u32 = 8;
pub const GET_CREATE_WRITER_KEY: u32 = 9;
pub const CONNECT_ENDPOINTS: u32 = 10;
pub const GET_ENDPOINT_INFO: u32 = 11;
pub const SIGNAL_HOST_END: u32 = 12;
pub const CREATE_NODE: u32 = 13;
pub const CREATE_QUEUE: u32 = 14;
pub const CREATE_WRITER: u32 = 15;
pub const CREATE_READER: u32 = 16;
pub const EVENT: u32 = 20;

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub msgtype: String,
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub msgid: u32,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    fn with_body(msgtype: &str, kind: u32, msgid: u32, body: Value) -> Envelope {
        let body = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => panic!("Envelope bodies must be objects, got {}", other),
        };

        Envelope {
            msgtype: msgtype.to_string(),
            kind,
            msgid,
            body,
        }
    }

    pub fn command(kind: u32, msgid: u32, body: Value) -> Envelope {
        Envelope::with_body("command", kind, msgid, body)
    }

    pub fn reply(kind: u32, msgid: u32, body: Value) -> Envelope {
        Envelope::with_body("reply", kind, msgid, body)
    }

    pub fn broadcast(event: &ContextEvent) -> Envelope {
        let body = serde_json::to_value(EventBroadcast {
            event: event.clone(),
        })
        .expect("events always serialize");
        Envelope::with_body("broadcast", EVENT, 0, body)
    }

    /// Decode the body into a typed payload.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> io::Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Write one length-prefixed message.
pub fn write_message<W: Write>(stream: &mut W, envelope: &Envelope) -> io::Result<()> {
    let body = serde_json::to_vec(envelope)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let mut prefix = [0u8; 4];
    BigEndian::write_u32(&mut prefix, body.len() as u32);

    stream.write_all(&prefix)?;
    stream.write_all(&body)?;
    stream.flush()
}

/// Read one length-prefixed message; blocks until complete.
pub fn read_message<R: Read>(stream: &mut R) -> io::Result<Envelope> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;

    let len = BigEndian::read_u32(&prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("context message of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;

    serde_json::from_slice(&body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

// Command payloads.

#[derive(Serialize, Deserialize)]
pub struct SetupHost {
    pub name: String,
    pub address: String,
}

#[derive(Serialize, Deserialize)]
pub struct HostQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub key: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateNodeKey {
    pub host: u64,
    pub name: String,
    pub node_type: String,
}

#[derive(Serialize, Deserialize)]
pub struct KeySignal {
    pub key: u64,
}

#[derive(Serialize, Deserialize)]
pub struct NodeQuery {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct EndpointKeyRequest {
    pub node: u64,
    pub port: String,
}

#[derive(Serialize, Deserialize)]
pub struct ConnectRequest {
    pub writer: u64,
    pub reader: u64,
}

/// Kernel-to-kernel relay wrapper; `payload` is the attr or spec the target
/// kernel needs.
#[derive(Serialize, Deserialize)]
pub struct KernelRelay<T> {
    pub host: u64,
    pub payload: T,
}

// Reply payloads. `success: false` carries `error`.

#[derive(Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

impl StatusReply {
    pub fn ok() -> Value {
        serde_json::json!({ "success": true })
    }

    pub fn fail(error: &str) -> Value {
        serde_json::json!({ "success": false, "error": error })
    }
}

#[derive(Serialize, Deserialize)]
pub struct KeyReply {
    pub success: bool,
    #[serde(default)]
    pub key: u64,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct HostReply {
    pub success: bool,
    #[serde(default)]
    pub host: Option<HostRecord>,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct NodeReply {
    pub success: bool,
    #[serde(default)]
    pub node: Option<NodeRecord>,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct EndpointReply {
    pub success: bool,
    #[serde(default)]
    pub endpoint: Option<EndpointRecord>,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct CountReply {
    pub success: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct EventBroadcast {
    pub event: ContextEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HostKey;
    use std::io::Cursor;

    #[test]
    fn test_message_roundtrip() {
        let command = Envelope::command(
            SETUP_HOST,
            7,
            serde_json::to_value(SetupHost {
                name: "k1".to_string(),
                address: "127.0.0.1:4000".to_string(),
            })
            .unwrap(),
        );

        let mut wire = Vec::new();
        write_message(&mut wire, &command).unwrap();

        let parsed = read_message(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(parsed.msgtype, "command");
        assert_eq!(parsed.kind, SETUP_HOST);
        assert_eq!(parsed.msgid, 7);

        let payload: SetupHost = parsed.parse().unwrap();
        assert_eq!(payload.name, "k1");
        assert_eq!(payload.address, "127.0.0.1:4000");
    }

    #[test]
    fn test_flattened_body_shape() {
        let command = Envelope::command(GET_NODE_INFO, 1, serde_json::json!({"name": "n"}));
        let text = serde_json::to_string(&command).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();

        // Payload fields sit at the top level beside the protocol fields.
        assert_eq!(raw["msgtype"], "command");
        assert_eq!(raw["type"], GET_NODE_INFO);
        assert_eq!(raw["name"], "n");
    }

    #[test]
    fn test_broadcast_roundtrip() {
        let event = ContextEvent::HostEnd(HostKey(5));
        let envelope = Envelope::broadcast(&event);

        let mut wire = Vec::new();
        write_message(&mut wire, &envelope).unwrap();
        let parsed = read_message(&mut Cursor::new(&wire)).unwrap();

        assert_eq!(parsed.msgtype, "broadcast");
        let broadcast: EventBroadcast = parsed.parse().unwrap();
        match broadcast.event {
            ContextEvent::HostEnd(key) => assert_eq!(key, HostKey(5)),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut wire = Vec::new();
        let mut prefix = [0u8; 4];
        BigEndian::write_u32(&mut prefix, (MAX_MESSAGE_SIZE + 1) as u32);
        wire.extend_from_slice(&prefix);

        assert!(read_message(&mut Cursor::new(&wire)).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let mut wire = Vec::new();
        let mut prefix = [0u8; 4];
        BigEndian::write_u32(&mut prefix, 5);
        wire.extend_from_slice(&prefix);
        wire.extend_from_slice(b"{not}");

        assert!(read_message(&mut Cursor::new(&wire)).is_err());
    }
}
