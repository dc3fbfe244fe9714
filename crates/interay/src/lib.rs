//! Peer-addressed RPC networking for real-time multiplayer sessions.
//!
//! A [`NetworkManager`] multiplexes [`NetworkEntity`] objects over one
//! [`Transport`]. Entities exchange remote calls addressed by entity id and
//! method hash, with payloads packed by a [`Serializer`].

pub mod codec;
pub mod entity;
pub mod error;
pub mod host;
pub mod manager;
pub mod packet;
pub mod settings;
pub mod transport;

pub use codec::{GenericSerializer, Serializer, TypeTag, Value};
pub use entity::{
    Access, Invocation, MethodHandler, MethodId, NetContext, NetworkEntity, NetworkId, Recipient,
    method_id,
};
pub use error::{
    CapacityError, CodecError, ConfigError, NetError, PacketError, ProtocolError, Result,
    TransportError,
};
pub use host::{DEFAULT_HOSTNAME, DEFAULT_PORT, HostAddress, HostType};
pub use manager::NetworkManager;
pub use packet::{PacketBuffer, PacketPool};
pub use settings::NetworkSettings;
pub use transport::{
    DisconnectReason, NetworkStats, PeerId, ReliableUdpTransport, SettingsChange, Transport,
    TransportHandler, TransportState, UdpTimings,
};
