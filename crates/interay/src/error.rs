use std::io;

use thiserror::Error;

use crate::codec::TypeTag;
use crate::entity::{MethodId, NetworkId};
use crate::transport::{PeerId, TransportState};

/// Crate-wide result type.
pub type Result<T, E = NetError> = std::result::Result<T, E>;

/// Cursor violations on a [`PacketBuffer`](crate::PacketBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet access out of range: {requested} bytes at offset {position} of {capacity}")]
    OutOfRange {
        position: usize,
        requested: usize,
        capacity: usize,
    },
    #[error("packet buffer has already been released")]
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no transport configured")]
    MissingTransport,
    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),
    #[error("unknown host type '{0}', expected server, client or host")]
    InvalidHostType(String),
    #[error("another network session is already active in this process")]
    SessionActive,
    #[error("method '{name}' hashes to {id}, which is already taken by '{existing}'")]
    MethodCollision {
        name: String,
        existing: String,
        id: MethodId,
    },
    #[error("cannot change the {0} while the network is running")]
    Running(&'static str),
    #[error("settings change rejected: {0}")]
    SettingsRejected(String),
    #[error("transport is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: TransportState,
        found: TransportState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no entity registered under id {0}")]
    UnknownEntity(NetworkId),
    #[error("no remote method registered under id {0}")]
    UnknownMethod(MethodId),
    #[error("method '{method}' may not be invoked by a {caller}")]
    AccessDenied {
        method: String,
        caller: &'static str,
    },
    #[error("method '{method}' takes {expected} but the message carries {found}")]
    ShapeMismatch {
        method: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("entity {0} does not implement the receiving method")]
    WrongEntityType(NetworkId),
    #[error("network id {0} is outside the accepted range")]
    InvalidNetworkId(u32),
    #[error("network id {0} is already in use")]
    SlotOccupied(NetworkId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("entity table is full ({max} entities)")]
    EntityTable { max: u32 },
    #[error("peer table is full ({max} connections)")]
    PeerTable { max: u32 },
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("too many unacknowledged messages in flight ({max})")]
    InFlight { max: usize },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not running")]
    NotRunning,
    #[error("not connected to a server")]
    NotConnected,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("could not resolve address '{0}'")]
    Unresolved(String),
    #[error("unicast is only available to servers")]
    UnicastFromClient,
    #[error("recipient {0} is not a valid peer id")]
    InvalidRecipient(u64),
    #[error("frame encoding failed: {0}")]
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("unsupported type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("{0:?} values cannot be packed into arrays")]
    UnsizedElement(TypeTag),
    #[error("array declared as {expected:?} contains a different element type")]
    MixedArray { expected: TypeTag },
    #[error("array body of {len} bytes is not a multiple of the {element} byte element size")]
    ArrayLength { len: usize, element: usize },
    #[error("body of {0} bytes does not fit a u16 length prefix")]
    TooLong(usize),
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
    #[error("extension tag {tag:#04x} expects {expected} bytes, got {found}")]
    ExtensionSize {
        tag: u8,
        expected: usize,
        found: usize,
    },
    #[error("extension tag {0:#04x} is outside 0x40..=0x7f")]
    ExtensionRange(u8),
}

/// Umbrella error for everything the network layer reports.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Entity(String),
}

impl NetError {
    /// Failure raised by entity code (hooks and remote methods).
    pub fn entity(message: impl Into<String>) -> Self {
        Self::Entity(message.into())
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}
