//! Transport contract and the reliable-UDP implementation.
//!
//! A transport owns the sockets and the per-peer state. The manager drives it
//! through [`Transport::tick`] and receives connection events and payloads
//! through a [`TransportHandler`] for the length of that call.

mod frame;
mod peer;
mod stats;
mod tracking;
mod udp;

pub use frame::{
    FRAME_OVERHEAD, Frame, FrameBody, FrameHeader, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, sequence_greater_than,
};
pub use peer::{MAX_PEERS, Peer, PeerTable};
pub use stats::NetworkStats;
pub use tracking::{AckTracker, ReceiveOutcome, ReceiveTracker};
pub use udp::{ReliableUdpTransport, UdpTimings};

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::host::HostType;
use crate::packet::PacketBuffer;
use crate::settings::NetworkSettings;

/// Transport-level identity of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The single implicit peer a client talks to.
    pub const SERVER: PeerId = PeerId(0);

    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Initialized,
    Running,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Denied,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Denied => "denied",
            DisconnectReason::Kicked => "kicked",
        }
    }
}

/// Answer to [`Transport::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsChange {
    /// The transport took the settings, possibly after clamping them.
    Accepted(NetworkSettings),
    Rejected { reason: String },
}

/// Callbacks a transport fires from inside [`Transport::tick`].
///
/// Errors are logged by the transport and never stop the pump.
pub trait TransportHandler {
    fn on_connected(&mut self, peer: PeerId) -> Result<()>;

    fn on_disconnected(&mut self, peer: PeerId, reason: DisconnectReason) -> Result<()>;

    /// `packet` borrows receive memory and is released once this returns.
    fn on_received(&mut self, peer: PeerId, packet: &mut PacketBuffer<'_>) -> Result<()>;
}

pub trait Transport {
    fn name(&self) -> &'static str;

    fn state(&self) -> TransportState;

    fn settings(&self) -> &NetworkSettings;

    /// Offers new settings. While running a transport may refuse changes it
    /// cannot apply live.
    fn configure(&mut self, settings: NetworkSettings) -> SettingsChange;

    fn initialize(&mut self) -> Result<()>;

    /// Servers and hosts listen on `address:port`, clients connect to it.
    fn start(&mut self, host_type: HostType, address: &str, port: u16) -> Result<()>;

    fn stop(&mut self);

    fn tick(&mut self, delta: Duration, handler: &mut dyn TransportHandler);

    /// Broadcasts on a server, goes to the server on a client.
    fn send(&mut self, packet: &PacketBuffer<'_>) -> Result<()>;

    fn send_to(&mut self, peer: PeerId, packet: &PacketBuffer<'_>) -> Result<()>;

    fn disconnect(&mut self, peer: PeerId) -> Result<()>;

    fn create_packet(&mut self, size: usize) -> PacketBuffer<'static>;

    fn peers(&self) -> Vec<PeerId>;

    /// Whether outbound traffic has somewhere to go.
    fn is_connected(&self) -> bool;

    fn dispose(&mut self);

    fn stats(&self) -> NetworkStats;

    fn local_addr(&self) -> Option<SocketAddr>;
}
