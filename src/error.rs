use crate::message::MessageType;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the codec, the rendezvous server and the peer client.
#[derive(Debug, Error)]
pub enum Error {
    /// Datagram is not a well formed message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Payload accessor called on a message of another type.
    #[error("invalid message type: expected {expected}, got {actual}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("client already connected or connecting")]
    AlreadyConnected,

    #[error("no peer assigned")]
    NoPeerAssigned,

    #[error("not connected to server")]
    NotConnectedToServer,

    #[error("no peer information available")]
    NoPeerInfo,

    #[error("not connected to peer")]
    NotConnectedToPeer,

    #[error("client disconnected")]
    ClientDisconnected,

    /// `ServerError` message received from the rendezvous server.
    #[error("server error [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("unexpected message type: {0}")]
    UnexpectedMessage(MessageType),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("peer {0} timed out")]
    PeerTimeout(String),

    #[error("timed out waiting for a peer")]
    ConnectTimeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}
