//! Wire envelope shared by the rendezvous server and peer clients.
//!
//! Every datagram carries one JSON encoded [`Message`]:
//!
//! ```text
//! {"sign":{"pub_key":"..."},"type":"peer_assignment","timestamp":"...","data":{...}}
//! ```
//!
//! The shape of `data` is fully determined by `type`. Payloads are decoded
//! lazily by the typed accessors, which refuse to touch a payload whose type
//! tag does not match.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;

/// Malformed datagram.
pub const PARSE_ERROR: &str = "PARSE_ERROR";
/// Well formed message the server does not handle.
pub const UNKNOWN_MESSAGE: &str = "UNKNOWN_MESSAGE";
/// Known message type with a payload that does not decode.
pub const INVALID_DATA: &str = "INVALID_DATA";

/// Probe sent during hole punching. Receivers drop it.
pub const PUNCH_PAYLOAD: &[u8] = b"RNDZ_PUNCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // client -> server
    ClientRegister,
    ClientPing,

    // server -> client
    PeerAssignment,
    ServerError,
    WaitingForPeer,

    // peer -> peer
    PeerPing,
    PeerPong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ClientRegister => "client_register",
            MessageType::ClientPing => "client_ping",
            MessageType::PeerAssignment => "peer_assignment",
            MessageType::ServerError => "server_error",
            MessageType::WaitingForPeer => "waiting_for_peer",
            MessageType::PeerPing => "peer_ping",
            MessageType::PeerPong => "peer_pong",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender's self-asserted identifier.
///
/// Nothing verifies it. It must not be treated as proof of identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub pub_key: String,
}

impl Signature {
    pub fn new<A: Into<String>>(pub_key: A) -> Self {
        Self {
            pub_key: pub_key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub sign: Signature,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of `ClientRegister` and `ClientPing`. The client id is derived
/// from the source address, so there is nothing to carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegisterData {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAssignmentData {
    pub peer_address: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorData {
    pub error_message: String,
    pub error_code: String,
}

/// Payload of `PeerPing` and `PeerPong`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPingData {
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(kind: MessageType, sign: Signature, data: Option<Value>) -> Self {
        Self {
            sign,
            kind,
            timestamp: Utc::now(),
            data,
        }
    }

    fn with_payload<T: Serialize>(kind: MessageType, sign: Signature, data: T) -> Self {
        // plain structs of strings and timestamps always convert
        let data = serde_json::to_value(data).ok();
        Self::new(kind, sign, data)
    }

    pub fn new_client_register() -> Self {
        Self::new(MessageType::ClientRegister, Signature::default(), None)
    }

    pub fn new_client_ping(sign: Signature) -> Self {
        Self::new(MessageType::ClientPing, sign, None)
    }

    pub fn new_peer_assignment<A: Into<String>>(peer_addr: SocketAddr, peer_id: A) -> Self {
        Self::with_payload(
            MessageType::PeerAssignment,
            Signature::default(),
            PeerAssignmentData {
                peer_address: peer_addr.to_string(),
                peer_id: peer_id.into(),
            },
        )
    }

    pub fn new_server_error<M: Into<String>, C: Into<String>>(message: M, code: C) -> Self {
        Self::with_payload(
            MessageType::ServerError,
            Signature::default(),
            ServerErrorData {
                error_message: message.into(),
                error_code: code.into(),
            },
        )
    }

    pub fn new_waiting_for_peer() -> Self {
        Self::new(MessageType::WaitingForPeer, Signature::default(), None)
    }

    pub fn new_peer_ping(sign: Signature) -> Self {
        Self::with_payload(
            MessageType::PeerPing,
            sign,
            PeerPingData {
                timestamp: Utc::now(),
            },
        )
    }

    pub fn new_peer_pong(sign: Signature) -> Self {
        Self::with_payload(
            MessageType::PeerPong,
            sign,
            PeerPingData {
                timestamp: Utc::now(),
            },
        )
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    fn expect_kind(&self, expected: MessageType, also: Option<MessageType>) -> Result<()> {
        if self.kind == expected || Some(self.kind) == also {
            Ok(())
        } else {
            Err(Error::InvalidMessageType {
                expected,
                actual: self.kind,
            })
        }
    }

    fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn client_register_data(&self) -> Result<ClientRegisterData> {
        self.expect_kind(MessageType::ClientRegister, Some(MessageType::ClientPing))?;
        match self.data {
            None | Some(Value::Null) => Ok(ClientRegisterData::default()),
            Some(_) => self.decode_data(),
        }
    }

    pub fn peer_assignment_data(&self) -> Result<PeerAssignmentData> {
        self.expect_kind(MessageType::PeerAssignment, None)?;
        self.decode_data()
    }

    pub fn server_error_data(&self) -> Result<ServerErrorData> {
        self.expect_kind(MessageType::ServerError, None)?;
        self.decode_data()
    }

    pub fn peer_ping_data(&self) -> Result<PeerPingData> {
        self.expect_kind(MessageType::PeerPing, Some(MessageType::PeerPong))?;
        self.decode_data()
    }

    pub fn peer_pong_data(&self) -> Result<PeerPingData> {
        self.expect_kind(MessageType::PeerPong, Some(MessageType::PeerPing))?;
        self.decode_data()
    }
}
