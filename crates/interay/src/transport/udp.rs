use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use super::frame::{Frame, FrameBody, FrameHeader, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE};
use super::peer::{MAX_PEERS, Peer, PeerTable, rand_u64};
use super::stats::NetworkStats;
use super::tracking::ReceiveOutcome;
use super::{
    DisconnectReason, PeerId, SettingsChange, Transport, TransportHandler, TransportState,
};
use crate::error::{CapacityError, ConfigError, Result, TransportError};
use crate::host::{self, HostType};
use crate::packet::{PacketBuffer, PacketPool};
use crate::settings::NetworkSettings;

const SERVER_FULL: &str = "server full";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpTimings {
    /// Interval between two `Connect` attempts.
    pub connect_retry: Duration,
    pub connect_timeout: Duration,
    /// Send inactivity after which a keep-alive goes out.
    pub keepalive: Duration,
    pub peer_timeout: Duration,
}

impl Default for UdpTimings {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting { started: Instant },
    Connected,
    Closed,
}

/// A client's single connection to its server.
#[derive(Debug)]
struct ServerLink {
    peer: Peer,
    state: LinkState,
}

#[derive(Debug)]
enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId, DisconnectReason),
    Received(PeerId, Vec<u8>),
}

/// Reliable, ordered, single-channel transport over a non-blocking UDP socket.
pub struct ReliableUdpTransport {
    state: TransportState,
    settings: NetworkSettings,
    timings: UdpTimings,
    socket: Option<UdpSocket>,
    /// Present only when running as a client.
    link: Option<ServerLink>,
    peers: PeerTable,
    pool: PacketPool,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
    events: VecDeque<TransportEvent>,
}

impl Default for ReliableUdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableUdpTransport {
    pub fn new() -> Self {
        Self::with_timings(UdpTimings::default())
    }

    pub fn with_timings(timings: UdpTimings) -> Self {
        let settings = clamp_settings(NetworkSettings::default());
        Self {
            state: TransportState::Uninitialized,
            peers: PeerTable::new(settings.max_connections()),
            settings,
            timings,
            socket: None,
            link: None,
            pool: PacketPool::default(),
            stats: NetworkStats::default(),
            recv_buffer: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn timings(&self) -> UdpTimings {
        self.timings
    }

    pub fn is_client(&self) -> bool {
        self.link.is_some()
    }

    fn require_state(&self, expected: TransportState) -> Result<()> {
        if self.state != expected {
            return Err(ConfigError::InvalidState {
                expected,
                found: self.state,
            }
            .into());
        }
        Ok(())
    }

    fn check_size(&self, packet: &PacketBuffer<'_>) -> Result<()> {
        let size = packet.written().len();
        let max = self.settings.message_max_size() as usize;
        if size > max {
            return Err(CapacityError::MessageTooLarge { size, max }.into());
        }
        Ok(())
    }

    fn open_server(address: &str, port: u16) -> Result<UdpSocket> {
        let bind = host::bind_address(address, port)?;
        let socket = UdpSocket::bind(bind).map_err(TransportError::Io)?;
        socket.set_nonblocking(true).map_err(TransportError::Io)?;
        Ok(socket)
    }

    fn open_client(address: &str, port: u16) -> Result<(UdpSocket, SocketAddr)> {
        let server = host::resolve(address, port)?;
        let any = match server.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, 0)).map_err(TransportError::Io)?;
        socket.set_nonblocking(true).map_err(TransportError::Io)?;
        Ok((socket, server))
    }

    fn pump_socket(&mut self, now: Instant) -> io::Result<()> {
        let mut frames = Vec::new();
        let drained = self.drain_socket(&mut frames);
        for (frame, addr) in frames {
            self.handle_frame(frame, addr, now);
        }
        drained
    }

    fn drain_socket(&mut self, frames: &mut Vec<(Frame, SocketAddr)>) -> io::Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };

        loop {
            match socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.record_received(size);
                    match Frame::decode(&self.recv_buffer[..size]) {
                        Ok(frame) => frames.push((frame, addr)),
                        Err(e) => {
                            self.stats.packets_dropped += 1;
                            log::debug!("Dropping datagram from {}: {}", addr, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // ICMP port unreachable from a vanished peer
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, addr: SocketAddr, now: Instant) {
        if self.link.is_some() {
            self.handle_server_frame(frame, addr, now);
        } else {
            self.handle_client_frame(frame, addr, now);
        }
    }

    /// Client side: frames coming from the server.
    fn handle_server_frame(&mut self, frame: Frame, addr: SocketAddr, now: Instant) {
        let (Some(socket), Some(link)) = (self.socket.as_ref(), self.link.as_mut()) else {
            return;
        };
        if link.peer.addr != addr {
            log::debug!("Ignoring {} frame from stranger {}", frame.body.kind(), addr);
            return;
        }

        link.peer.touch(now);
        link.peer
            .acks
            .process_ack(frame.header.ack, frame.header.ack_bitfield, now);
        self.stats.rtt_ms = link.peer.acks.srtt();
        self.stats.rtt_variance = link.peer.acks.rtt_var();

        match frame.body {
            FrameBody::Accept {
                peer_id,
                client_salt,
            } => {
                if matches!(link.state, LinkState::Connecting { .. })
                    && client_salt == link.peer.client_salt
                {
                    link.state = LinkState::Connected;
                    log::info!("Connected to {} as peer {}", addr, peer_id);
                    self.events.push_back(TransportEvent::Connected(PeerId::SERVER));
                }
            }
            FrameBody::Deny { reason } => {
                if matches!(link.state, LinkState::Connecting { .. }) {
                    log::warn!("Connection denied: {}", reason);
                    link.state = LinkState::Closed;
                    self.events.push_back(TransportEvent::Disconnected(
                        PeerId::SERVER,
                        DisconnectReason::Denied,
                    ));
                }
            }
            FrameBody::Disconnect => {
                if link.state == LinkState::Connected {
                    log::info!("Disconnected by server");
                    self.events.push_back(TransportEvent::Disconnected(
                        PeerId::SERVER,
                        DisconnectReason::Graceful,
                    ));
                }
                link.state = LinkState::Closed;
            }
            FrameBody::Payload { sequence, data } => {
                if link.state == LinkState::Connected {
                    receive_payload(
                        socket,
                        &mut self.stats,
                        &mut link.peer,
                        sequence,
                        data,
                        PeerId::SERVER,
                        &mut self.events,
                        now,
                    );
                }
            }
            FrameBody::Ack | FrameBody::KeepAlive | FrameBody::Connect { .. } => {}
        }
    }

    /// Server side: frames coming from clients.
    fn handle_client_frame(&mut self, frame: Frame, addr: SocketAddr, now: Instant) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        if let FrameBody::Connect { client_salt } = frame.body {
            if let Some(peer) = self.peers.get_by_addr_mut(&addr) {
                if peer.client_salt == client_salt {
                    // Our accept got lost, say it again.
                    let accept = FrameBody::Accept {
                        peer_id: peer.id.0,
                        client_salt,
                    };
                    send_control(socket, &mut self.stats, peer, accept, now);
                    return;
                }
                // Same address, new session: the old one is gone.
                let stale = peer.id;
                self.peers.remove(stale);
                self.events.push_back(TransportEvent::Disconnected(
                    stale,
                    DisconnectReason::Graceful,
                ));
            }

            match self.peers.insert(addr, client_salt, now) {
                Some(peer) => {
                    log::info!("Peer {} connected from {}", peer.id, addr);
                    let accept = FrameBody::Accept {
                        peer_id: peer.id.0,
                        client_salt,
                    };
                    send_control(socket, &mut self.stats, peer, accept, now);
                    self.events.push_back(TransportEvent::Connected(peer.id));
                }
                None => {
                    log::info!("Denying {}: {}", addr, SERVER_FULL);
                    let deny = Frame::new(
                        FrameHeader::new(0, 0),
                        FrameBody::Deny {
                            reason: SERVER_FULL.to_string(),
                        },
                    );
                    if let Err(e) = transmit(socket, &mut self.stats, addr, &deny) {
                        log::warn!("Failed to deny {}: {}", addr, e);
                    }
                }
            }
            return;
        }

        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            log::debug!("Ignoring {} frame from unknown {}", frame.body.kind(), addr);
            return;
        };

        peer.touch(now);
        peer.acks
            .process_ack(frame.header.ack, frame.header.ack_bitfield, now);
        self.stats.rtt_ms = peer.acks.srtt();
        self.stats.rtt_variance = peer.acks.rtt_var();

        match frame.body {
            FrameBody::Disconnect => {
                let id = peer.id;
                self.peers.remove(id);
                log::info!("Peer {} disconnected", id);
                self.events
                    .push_back(TransportEvent::Disconnected(id, DisconnectReason::Graceful));
            }
            FrameBody::Payload { sequence, data } => {
                let id = peer.id;
                receive_payload(
                    socket,
                    &mut self.stats,
                    peer,
                    sequence,
                    data,
                    id,
                    &mut self.events,
                    now,
                );
            }
            FrameBody::Ack
            | FrameBody::KeepAlive
            | FrameBody::Connect { .. }
            | FrameBody::Accept { .. }
            | FrameBody::Deny { .. } => {}
        }
    }

    fn service_timers(&mut self, now: Instant) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let timings = self.timings;

        if let Some(link) = self.link.as_mut() {
            match link.state {
                LinkState::Connecting { started } => {
                    if now.duration_since(started) >= timings.connect_timeout {
                        log::warn!("Connection timeout");
                        link.state = LinkState::Closed;
                        self.events.push_back(TransportEvent::Disconnected(
                            PeerId::SERVER,
                            DisconnectReason::Timeout,
                        ));
                    } else if link.peer.needs_keepalive(now, timings.connect_retry) {
                        let connect = FrameBody::Connect {
                            client_salt: link.peer.client_salt,
                        };
                        send_control(socket, &mut self.stats, &mut link.peer, connect, now);
                    }
                }
                LinkState::Connected => {
                    if link.peer.is_timed_out(now, timings.peer_timeout) {
                        log::warn!("Server connection lost");
                        link.state = LinkState::Closed;
                        self.events.push_back(TransportEvent::Disconnected(
                            PeerId::SERVER,
                            DisconnectReason::Timeout,
                        ));
                    } else {
                        service_peer(socket, &mut self.stats, &mut link.peer, timings, now);
                    }
                }
                LinkState::Closed => {}
            }
            return;
        }

        for id in self.peers.timed_out(now, timings.peer_timeout) {
            self.peers.remove(id);
            log::info!("Peer {} timed out", id);
            self.events
                .push_back(TransportEvent::Disconnected(id, DisconnectReason::Timeout));
        }
        for peer in self.peers.iter_mut() {
            service_peer(socket, &mut self.stats, peer, timings, now);
        }
    }

    fn dispatch_events(&mut self, handler: &mut dyn TransportHandler) {
        while let Some(event) = self.events.pop_front() {
            let outcome = match event {
                TransportEvent::Connected(peer) => handler.on_connected(peer),
                TransportEvent::Disconnected(peer, reason) => {
                    handler.on_disconnected(peer, reason)
                }
                TransportEvent::Received(peer, mut data) => {
                    let mut packet = PacketBuffer::borrowed(&mut data);
                    let outcome = handler.on_received(peer, &mut packet);
                    packet.release();
                    outcome
                }
            };
            if let Err(e) = outcome {
                log::warn!("Transport handler failed: {}", e);
            }
        }
    }

    fn send_payload(&mut self, peer: PeerId, data: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotRunning)?;
        let now = Instant::now();

        let target = match self.link.as_mut() {
            Some(link) if peer.is_server() => {
                if link.state != LinkState::Connected {
                    return Err(TransportError::NotConnected.into());
                }
                &mut link.peer
            }
            Some(_) => return Err(TransportError::UnicastFromClient.into()),
            None => match self.peers.get_mut(peer) {
                Some(target) => target,
                None => {
                    log::warn!("Cannot send to unknown peer {}", peer);
                    return Err(TransportError::UnknownPeer(peer).into());
                }
            },
        };
        send_reliable(socket, &mut self.stats, target, data, now)
    }
}

impl Transport for ReliableUdpTransport {
    fn name(&self) -> &'static str {
        "reliable-udp"
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    fn configure(&mut self, settings: NetworkSettings) -> SettingsChange {
        let settings = clamp_settings(settings);
        if self.state == TransportState::Running {
            if settings.max_connections() != self.settings.max_connections() {
                return SettingsChange::Rejected {
                    reason: "max_connections cannot change while running".to_string(),
                };
            }
            if settings.message_max_size() != self.settings.message_max_size() {
                return SettingsChange::Rejected {
                    reason: "message_max_size cannot change while running".to_string(),
                };
            }
        }

        self.peers.set_max_peers(settings.max_connections());
        self.settings = settings.clone();
        SettingsChange::Accepted(settings)
    }

    fn initialize(&mut self) -> Result<()> {
        match self.state {
            TransportState::Uninitialized => {
                self.state = TransportState::Initialized;
                log::debug!("Transport {} initialized", self.name());
                Ok(())
            }
            TransportState::Initialized | TransportState::Running => {
                log::debug!("Transport {} already initialized", self.name());
                Ok(())
            }
            TransportState::Disposed => self.require_state(TransportState::Uninitialized),
        }
    }

    fn start(&mut self, host_type: HostType, address: &str, port: u16) -> Result<()> {
        self.require_state(TransportState::Initialized)?;
        let now = Instant::now();

        match host_type {
            HostType::Server | HostType::Host => {
                let socket = Self::open_server(address, port)?;
                log::info!("Listening on {}", socket.local_addr()?);
                self.socket = Some(socket);
                self.link = None;
            }
            HostType::Client => {
                let (socket, server) = Self::open_client(address, port)?;
                log::info!("Connecting to {}", server);
                let mut peer = Peer::new(PeerId::SERVER, server, rand_u64(), now);
                let connect = FrameBody::Connect {
                    client_salt: peer.client_salt,
                };
                send_control(&socket, &mut self.stats, &mut peer, connect, now);
                self.link = Some(ServerLink {
                    peer,
                    state: LinkState::Connecting { started: now },
                });
                self.socket = Some(socket);
            }
        }

        self.peers.clear();
        self.peers.set_max_peers(self.settings.max_connections());
        self.recv_buffer = vec![0; MAX_DATAGRAM_SIZE];
        self.events.clear();
        self.state = TransportState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        if self.state != TransportState::Running {
            return;
        }
        let now = Instant::now();

        if let Some(socket) = self.socket.as_ref() {
            match self.link.as_mut() {
                Some(link) => {
                    if link.state != LinkState::Closed {
                        let disconnect = FrameBody::Disconnect;
                        send_control(socket, &mut self.stats, &mut link.peer, disconnect, now);
                    }
                }
                None => {
                    for peer in self.peers.iter_mut() {
                        send_control(socket, &mut self.stats, peer, FrameBody::Disconnect, now);
                    }
                }
            }
        }

        self.socket = None;
        self.link = None;
        self.peers.clear();
        self.events.clear();
        self.state = TransportState::Initialized;
        log::info!("Transport {} stopped", self.name());
    }

    fn tick(&mut self, _delta: Duration, handler: &mut dyn TransportHandler) {
        if self.state != TransportState::Running {
            return;
        }
        let now = Instant::now();

        if let Err(e) = self.pump_socket(now) {
            log::error!("Socket receive failed: {}", e);
            return;
        }
        self.service_timers(now);
        self.dispatch_events(handler);
    }

    fn send(&mut self, packet: &PacketBuffer<'_>) -> Result<()> {
        if self.state != TransportState::Running {
            return Err(TransportError::NotRunning.into());
        }
        self.check_size(packet)?;

        if self.link.is_some() {
            return self.send_payload(PeerId::SERVER, packet.written());
        }

        let now = Instant::now();
        let Some(socket) = self.socket.as_ref() else {
            return Err(TransportError::NotRunning.into());
        };
        for peer in self.peers.iter_mut() {
            if let Err(e) = send_reliable(socket, &mut self.stats, peer, packet.written(), now) {
                log::warn!("Broadcast to peer {} failed: {}", peer.id, e);
            }
        }
        Ok(())
    }

    fn send_to(&mut self, peer: PeerId, packet: &PacketBuffer<'_>) -> Result<()> {
        if self.state != TransportState::Running {
            return Err(TransportError::NotRunning.into());
        }
        self.check_size(packet)?;
        self.send_payload(peer, packet.written())
    }

    fn disconnect(&mut self, peer: PeerId) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotRunning)?;
        let now = Instant::now();

        if let Some(link) = self.link.as_mut() {
            if !peer.is_server() {
                return Err(TransportError::UnknownPeer(peer).into());
            }
            if link.state != LinkState::Closed {
                let disconnect = FrameBody::Disconnect;
                send_control(socket, &mut self.stats, &mut link.peer, disconnect, now);
                link.state = LinkState::Closed;
                self.events.push_back(TransportEvent::Disconnected(
                    PeerId::SERVER,
                    DisconnectReason::Graceful,
                ));
            }
            return Ok(());
        }

        let Some(mut removed) = self.peers.remove(peer) else {
            return Err(TransportError::UnknownPeer(peer).into());
        };
        send_control(socket, &mut self.stats, &mut removed, FrameBody::Disconnect, now);
        log::info!("Peer {} kicked", peer);
        self.events
            .push_back(TransportEvent::Disconnected(peer, DisconnectReason::Kicked));
        Ok(())
    }

    fn create_packet(&mut self, size: usize) -> PacketBuffer<'static> {
        self.pool.acquire(size)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.ids()
    }

    fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.state == LinkState::Connected,
            None => self.state == TransportState::Running,
        }
    }

    fn dispose(&mut self) {
        self.stop();
        self.state = TransportState::Disposed;
    }

    fn stats(&self) -> NetworkStats {
        self.stats.clone()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }
}

impl Drop for ReliableUdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clamp_settings(mut settings: NetworkSettings) -> NetworkSettings {
    settings.set_max_connections(settings.max_connections().min(MAX_PEERS));
    let ceiling = MAX_PAYLOAD_SIZE as u32;
    settings.set_message_max_size(settings.message_max_size().min(ceiling));
    settings
}

fn transmit(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    addr: SocketAddr,
    frame: &Frame,
) -> std::result::Result<(), TransportError> {
    let bytes = frame.encode()?;
    let sent = socket.send_to(&bytes, addr)?;
    stats.record_sent(sent);
    Ok(())
}

fn ack_header(peer: &Peer) -> FrameHeader {
    let (ack, ack_bitfield) = peer.receive.ack_data();
    FrameHeader::new(ack, ack_bitfield)
}

/// Unreliable control frame carrying the peer's current acks.
fn send_control(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    body: FrameBody,
    now: Instant,
) {
    let kind = body.kind();
    let frame = Frame::new(ack_header(peer), body);
    match transmit(socket, stats, peer.addr, &frame) {
        Ok(()) => peer.last_send = now,
        Err(e) => log::warn!("Failed to send {} to {}: {}", kind, peer.addr, e),
    }
}

fn send_reliable(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    data: &[u8],
    now: Instant,
) -> Result<()> {
    if peer.acks.is_full() {
        return Err(CapacityError::InFlight {
            max: peer.acks.max_pending(),
        }
        .into());
    }
    let sequence = peer.take_sequence();
    peer.acks.track(sequence, data.to_vec(), now);

    let frame = Frame::new(
        ack_header(peer),
        FrameBody::Payload {
            sequence,
            data: data.to_vec(),
        },
    );
    // A failed first send is recovered by the retransmission timer.
    match transmit(socket, stats, peer.addr, &frame) {
        Ok(()) => peer.last_send = now,
        Err(e) => log::debug!("Payload {} to {} deferred: {}", sequence, peer.addr, e),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn receive_payload(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    sequence: u32,
    data: Vec<u8>,
    id: PeerId,
    events: &mut VecDeque<TransportEvent>,
    now: Instant,
) {
    match peer.receive.receive(sequence, data) {
        ReceiveOutcome::Accepted => {
            send_control(socket, stats, peer, FrameBody::Ack, now);
            while let Some(data) = peer.receive.pop_ready() {
                events.push_back(TransportEvent::Received(id, data));
            }
        }
        ReceiveOutcome::Duplicate => {
            // Ack exactly this sequence; it may be too old for the bitfield.
            let ack = Frame::new(FrameHeader::new(sequence, 0), FrameBody::Ack);
            match transmit(socket, stats, peer.addr, &ack) {
                Ok(()) => peer.last_send = now,
                Err(e) => log::debug!("Failed to re-ack {}: {}", sequence, e),
            }
        }
        ReceiveOutcome::OutOfWindow => {
            log::debug!("Payload {} from {} outside receive window", sequence, id);
        }
    }
}

fn service_peer(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    timings: UdpTimings,
    now: Instant,
) {
    let header = ack_header(peer);
    for (sequence, data) in peer.acks.due_for_resend(now) {
        let frame = Frame::new(header, FrameBody::Payload { sequence, data });
        match transmit(socket, stats, peer.addr, &frame) {
            Ok(()) => {
                stats.retransmissions += 1;
                peer.last_send = now;
            }
            Err(e) => log::debug!("Resend of {} to {} failed: {}", sequence, peer.addr, e),
        }
    }

    if peer.needs_keepalive(now, timings.keepalive) {
        send_control(socket, stats, peer, FrameBody::KeepAlive, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states() {
        let mut transport = ReliableUdpTransport::new();
        assert_eq!(transport.state(), TransportState::Uninitialized);
        assert!(transport.start(HostType::Server, "127.0.0.1", 0).is_err());

        transport.initialize().unwrap();
        transport.initialize().unwrap();
        assert_eq!(transport.state(), TransportState::Initialized);

        transport.start(HostType::Server, "127.0.0.1", 0).unwrap();
        assert_eq!(transport.state(), TransportState::Running);
        assert!(transport.local_addr().is_some());
        assert!(!transport.is_client());

        transport.stop();
        transport.stop();
        assert_eq!(transport.state(), TransportState::Initialized);
        assert!(transport.local_addr().is_none());

        transport.dispose();
        assert_eq!(transport.state(), TransportState::Disposed);
        assert!(transport.initialize().is_err());
    }

    #[test]
    fn settings_are_clamped_on_assignment() {
        let mut transport = ReliableUdpTransport::new();
        let wanted = NetworkSettings::default()
            .with_max_connections(100_000)
            .with_message_max_size(u32::MAX);
        let SettingsChange::Accepted(applied) = transport.configure(wanted) else {
            panic!("configure rejected while idle");
        };
        assert_eq!(applied.max_connections(), MAX_PEERS);
        assert_eq!(applied.message_max_size(), MAX_PAYLOAD_SIZE as u32);
        assert_eq!(transport.settings(), &applied);
    }

    #[test]
    fn live_settings_changes_are_limited() {
        let mut transport = ReliableUdpTransport::new();
        transport.initialize().unwrap();
        transport.start(HostType::Server, "127.0.0.1", 0).unwrap();

        let current = transport.settings().clone();
        let bigger = current.clone().with_max_connections(current.max_connections() + 1);
        assert!(matches!(
            transport.configure(bigger),
            SettingsChange::Rejected { .. }
        ));
        assert_eq!(transport.settings(), &current);

        let faster = current.clone().with_tick_rate(current.tick_rate() + 10);
        assert!(matches!(
            transport.configure(faster),
            SettingsChange::Accepted(_)
        ));
    }

    #[test]
    fn oversized_messages_are_refused() {
        let mut transport = ReliableUdpTransport::new();
        transport.configure(NetworkSettings::default().with_message_max_size(64));
        transport.initialize().unwrap();
        transport.start(HostType::Server, "127.0.0.1", 0).unwrap();

        let mut packet = transport.create_packet(65);
        packet.write_bytes(&[0; 65]).unwrap();
        assert!(matches!(
            transport.send(&packet),
            Err(crate::NetError::Capacity(CapacityError::MessageTooLarge {
                size: 65,
                max: 64
            }))
        ));
    }

    #[test]
    fn unknown_peer_is_reported() {
        let mut transport = ReliableUdpTransport::new();
        transport.initialize().unwrap();
        transport.start(HostType::Server, "127.0.0.1", 0).unwrap();

        let mut packet = transport.create_packet(4);
        packet.write_u32(1).unwrap();
        assert!(matches!(
            transport.send_to(PeerId(7), &packet),
            Err(crate::NetError::Transport(TransportError::UnknownPeer(PeerId(7))))
        ));
    }
}
