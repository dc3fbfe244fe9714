//! The network session: owns the transport, the entity registry and the
//! method table, and drives them from the host's frame loop.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::codec::{GenericSerializer, Serializer, Value};
use crate::entity::{
    Access, Command, EntityRegistry, Envelope, Invocation, MethodHandler, MethodId, MethodTable,
    NetContext, NetworkEntity, NetworkId, OutboundCall, Outbox, Recipient, method_id,
};
use crate::error::{ConfigError, NetError, ProtocolError, Result, TransportError};
use crate::host::{DEFAULT_HOSTNAME, HostAddress, HostType};
use crate::packet::PacketBuffer;
use crate::settings::NetworkSettings;
use crate::transport::{
    DisconnectReason, NetworkStats, PeerId, SettingsChange, Transport, TransportHandler,
};

/// Outbox drains per pass. Entities that keep answering looped-back calls
/// are cut off here.
pub const MAX_FLUSH_ROUNDS: usize = 16;

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds the process-wide session slot for as long as a manager lives.
struct SessionGuard;

impl SessionGuard {
    fn acquire() -> std::result::Result<Self, ConfigError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SessionGuard)
            .map_err(|_| ConfigError::SessionActive)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Tick(Duration),
    ClientConnect(PeerId),
    ClientDisconnect(PeerId),
    StartHost,
    StopHost,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::Tick(_) => "on_tick",
            Hook::ClientConnect(_) => "on_client_connect",
            Hook::ClientDisconnect(_) => "on_client_disconnect",
            Hook::StartHost => "on_start_host",
            Hook::StopHost => "on_stop_host",
        }
    }
}

fn required_access(role: HostType) -> Access {
    if role.is_server() {
        Access::ALLOW_CLIENT
    } else {
        Access::ALLOW_SERVER
    }
}

/// Runs entity code, turning a panic into an error so it cannot unwind
/// through the pump.
fn contain(what: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(NetError::entity(format!("{} panicked: {}", what, message)))
    })
}

fn caller_name(required: Access) -> &'static str {
    if required == Access::ALLOW_CLIENT {
        "client"
    } else {
        "server"
    }
}

/// Everything the transport handler needs, split from the transport so the
/// two can be borrowed side by side during a pump.
struct Session {
    host_type: Option<HostType>,
    role: Option<HostType>,
    registry: EntityRegistry,
    methods: MethodTable,
    serializer: Box<dyn Serializer>,
    outbox: Outbox,
    peers: Vec<PeerId>,
    settings: NetworkSettings,
}

impl Session {
    fn new(settings: NetworkSettings) -> Self {
        Self {
            host_type: None,
            role: None,
            registry: EntityRegistry::new(settings.max_network_entities()),
            methods: MethodTable::new(),
            serializer: Box::new(GenericSerializer::new()),
            outbox: Outbox::default(),
            peers: Vec::new(),
            settings,
        }
    }

    fn dispatch(&mut self, sender: PeerId, packet: &mut PacketBuffer<'_>) -> Result<()> {
        let role = self.role.ok_or(TransportError::NotRunning)?;
        let envelope = Envelope::decode(packet)?;
        let required = required_access(role);
        self.resolve(envelope.instance, envelope.method, required)?;

        let payload = if envelope.has_payload() {
            Some(self.serializer.deserialize(packet)?)
        } else {
            None
        };
        let invocation = Invocation::new(payload, envelope.recipient.id());
        self.invoke(envelope.instance, envelope.method, Some(sender), invocation)
    }

    fn resolve(&self, instance: NetworkId, method: MethodId, required: Access) -> Result<()> {
        if !self.registry.contains(instance) {
            return Err(ProtocolError::UnknownEntity(instance).into());
        }
        let entry = self
            .methods
            .get(method)
            .ok_or(ProtocolError::UnknownMethod(method))?;
        if !entry.access.contains(required) {
            return Err(ProtocolError::AccessDenied {
                method: entry.name.clone(),
                caller: caller_name(required),
            }
            .into());
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        instance: NetworkId,
        method: MethodId,
        sender: Option<PeerId>,
        invocation: Invocation,
    ) -> Result<()> {
        let entity = self
            .registry
            .get_mut(instance)
            .ok_or(ProtocolError::UnknownEntity(instance))?;
        let entry = self
            .methods
            .get(method)
            .ok_or(ProtocolError::UnknownMethod(method))?;
        let mut ctx = NetContext::new(
            instance,
            self.role,
            sender,
            &self.peers,
            &self.settings,
            &mut self.outbox,
        );
        contain(&entry.name, || {
            entry.handler.invoke(&entry.name, entity, &mut ctx, invocation)
        })
    }

    fn fan_out(&mut self, hook: Hook) {
        let max_id = self.registry.max_id().0;
        for index in 0..=max_id {
            let id = NetworkId(index);
            let Some(entity) = self.registry.get_mut(id) else {
                continue;
            };
            let mut ctx = NetContext::new(
                id,
                self.role,
                None,
                &self.peers,
                &self.settings,
                &mut self.outbox,
            );
            let result = contain(hook.name(), || match hook {
                Hook::Tick(delta) => entity.on_tick(&mut ctx, delta),
                Hook::ClientConnect(peer) => entity.on_client_connect(&mut ctx, peer),
                Hook::ClientDisconnect(peer) => entity.on_client_disconnect(&mut ctx, peer),
                Hook::StartHost => entity.on_start_host(&mut ctx),
                Hook::StopHost => entity.on_stop_host(&mut ctx),
            });
            if let Err(e) = result {
                log::error!("Entity {} failed in {}: {}", id, hook.name(), e);
            }
        }
    }
}

impl TransportHandler for Session {
    fn on_connected(&mut self, peer: PeerId) -> Result<()> {
        if self.role.is_some_and(HostType::is_server) {
            if let Err(index) = self.peers.binary_search(&peer) {
                self.peers.insert(index, peer);
            }
            log::info!("Peer {} connected", peer);
        } else {
            log::info!("Connected to server");
        }
        self.fan_out(Hook::ClientConnect(peer));
        Ok(())
    }

    fn on_disconnected(&mut self, peer: PeerId, reason: DisconnectReason) -> Result<()> {
        if let Ok(index) = self.peers.binary_search(&peer) {
            self.peers.remove(index);
        }
        log::info!("Peer {} {}", peer, reason.as_str());
        self.fan_out(Hook::ClientDisconnect(peer));
        Ok(())
    }

    fn on_received(&mut self, peer: PeerId, packet: &mut PacketBuffer<'_>) -> Result<()> {
        if let Err(e) = self.dispatch(peer, packet) {
            log::warn!("Dropped message from peer {}: {}", peer, e);
        }
        Ok(())
    }
}

fn encode_call(
    serializer: &dyn Serializer,
    transport: &mut dyn Transport,
    call: &OutboundCall,
) -> Result<PacketBuffer<'static>> {
    let envelope = Envelope::new(call.instance, call.method, call.recipient, call.payload.is_some());
    let payload_len = match &call.payload {
        Some(value) => serializer.encoded_len(value)?,
        None => 0,
    };

    let mut packet = transport.create_packet(envelope.encoded_len() + payload_len);
    envelope.encode(&mut packet)?;
    if let Some(value) = &call.payload {
        serializer.serialize(&mut packet, value)?;
    }
    Ok(packet)
}

/// Entry point of the networking layer.
///
/// Only one manager may exist per process at a time. The host calls
/// [`tick`](Self::tick) once per frame; transport events, remote calls and
/// entity hooks all run inside that call.
pub struct NetworkManager {
    hostname: String,
    transport: Option<Box<dyn Transport>>,
    session: Session,
    accumulator: Duration,
    _guard: SessionGuard,
}

impl NetworkManager {
    pub fn new() -> Result<Self> {
        let guard = SessionGuard::acquire()?;
        Ok(Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            transport: None,
            session: Session::new(NetworkSettings::default()),
            accumulator: Duration::ZERO,
            _guard: guard,
        })
    }

    pub fn with_transport(transport: impl Transport + 'static) -> Result<Self> {
        let mut manager = Self::new()?;
        manager.transport = Some(Box::new(transport));
        Ok(manager)
    }

    pub fn is_running(&self) -> bool {
        self.session.role.is_some()
    }

    /// Effective role. A host with `only_server` set reports `Server`.
    pub fn role(&self) -> Option<HostType> {
        self.session.role
    }

    /// Role the transport was started with.
    pub fn host_type(&self) -> Option<HostType> {
        self.session.host_type
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        if self.is_running() {
            return Err(ConfigError::Running("hostname").into());
        }
        HostAddress::parse(hostname)?;
        self.hostname = hostname.trim().to_string();
        Ok(())
    }

    /// The transport's view of the settings while running, the manager's
    /// otherwise.
    pub fn settings(&self) -> &NetworkSettings {
        match self.transport.as_deref() {
            Some(transport) if self.is_running() => transport.settings(),
            _ => &self.session.settings,
        }
    }

    /// Replaces the settings. While running the transport may refuse; the
    /// previous settings then stay in effect.
    pub fn set_settings(&mut self, settings: NetworkSettings) -> Result<()> {
        let mut settings = settings.validated();
        if self.is_running() {
            let transport = self
                .transport
                .as_deref_mut()
                .ok_or(ConfigError::MissingTransport)?;
            match transport.configure(settings) {
                SettingsChange::Accepted(applied) => settings = applied,
                SettingsChange::Rejected { reason } => {
                    log::warn!("Settings change rejected: {}", reason);
                    return Err(ConfigError::SettingsRejected(reason).into());
                }
            }
        }

        self.session
            .registry
            .set_max_entities(settings.max_network_entities());
        self.session.settings = settings;
        Ok(())
    }

    pub fn set_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.is_running() {
            return Err(ConfigError::Running("transport").into());
        }
        if let Some(mut previous) = self.transport.replace(transport) {
            previous.dispose();
        }
        Ok(())
    }

    pub fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }

    pub fn set_serializer(&mut self, serializer: Box<dyn Serializer>) -> Result<()> {
        if self.is_running() {
            return Err(ConfigError::Running("serializer").into());
        }
        self.session.serializer = serializer;
        Ok(())
    }

    pub fn register_method(
        &mut self,
        name: &str,
        access: Access,
        handler: MethodHandler,
    ) -> Result<MethodId> {
        Ok(self.session.methods.register(name, access, handler)?)
    }

    /// Installs the entity that answers messages without an instance id.
    pub fn set_host_entity(
        &mut self,
        entity: Box<dyn NetworkEntity>,
    ) -> Option<Box<dyn NetworkEntity>> {
        self.session.registry.set_host(entity)
    }

    pub fn spawn(&mut self, entity: Box<dyn NetworkEntity>) -> Result<NetworkId> {
        self.session.registry.register(entity, None)
    }

    /// Registers a client-side mirror under the id its server issued.
    pub fn accept_remote(
        &mut self,
        entity: Box<dyn NetworkEntity>,
        id: NetworkId,
    ) -> Result<NetworkId> {
        self.session.registry.register(entity, Some(id))
    }

    pub fn despawn(&mut self, id: NetworkId) -> Option<Box<dyn NetworkEntity>> {
        self.session.registry.unregister(id)
    }

    pub fn entity<E: NetworkEntity>(&self, id: NetworkId) -> Option<&E> {
        self.session.registry.get(id)?.as_any().downcast_ref::<E>()
    }

    pub fn entity_mut<E: NetworkEntity>(&mut self, id: NetworkId) -> Option<&mut E> {
        self.session
            .registry
            .get_mut(id)?
            .as_any_mut()
            .downcast_mut::<E>()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.session.registry
    }

    /// Connected peers, sorted. Empty on a client.
    pub fn peers(&self) -> &[PeerId] {
        &self.session.peers
    }

    pub fn is_connected(&self) -> bool {
        self.is_running()
            && self
                .transport
                .as_deref()
                .is_some_and(|transport| transport.is_connected())
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.transport.as_deref().map(|transport| transport.stats())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_deref()?.local_addr()
    }

    /// Starts on the configured hostname.
    pub fn start(&mut self, host_type: HostType) -> Result<()> {
        if self.is_running() {
            return Err(ConfigError::Running("host type").into());
        }
        let address = HostAddress::parse(&self.hostname)?;
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(ConfigError::MissingTransport)?;

        transport.initialize()?;
        let settings = match transport.configure(self.session.settings.clone()) {
            SettingsChange::Accepted(settings) => settings,
            SettingsChange::Rejected { reason } => {
                return Err(ConfigError::SettingsRejected(reason).into());
            }
        };
        transport.start(host_type, &address.host, address.port)?;

        let role = if host_type == HostType::Host && settings.only_server() {
            HostType::Server
        } else {
            host_type
        };
        log::info!("Started as {} on {} ({})", role, address, transport.name());

        let session = &mut self.session;
        session.host_type = Some(host_type);
        session.role = Some(role);
        session.registry.set_role(host_type);
        session
            .registry
            .set_max_entities(settings.max_network_entities());
        session.settings = settings;
        session.methods.freeze();
        session.peers.clear();
        self.accumulator = Duration::ZERO;

        if role.is_server() {
            self.session.fan_out(Hook::StartHost);
            self.flush();
        }
        Ok(())
    }

    pub fn start_hostname(&mut self, host_type: HostType, hostname: &str) -> Result<()> {
        self.set_hostname(hostname)?;
        self.start(host_type)
    }

    /// No-op when not running. A pure client forgets every mirrored entity.
    pub fn stop(&mut self) {
        let Some(role) = self.session.role else {
            return;
        };

        if role.is_server() {
            self.session.fan_out(Hook::StopHost);
            self.flush();
        }
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.stop();
        }

        let session = &mut self.session;
        session.host_type = None;
        session.role = None;
        session.methods.unfreeze();
        session.peers.clear();
        session.outbox.clear();
        if !role.is_server() {
            session.registry.reset();
        }
        session.registry.set_role(HostType::Server);
        log::info!("Network stopped");
    }

    /// Pumps the transport, then runs `on_tick` once per elapsed tick
    /// interval. Does nothing while stopped.
    pub fn tick(&mut self, delta: Duration) {
        if !self.is_running() {
            return;
        }
        let Some(transport) = self.transport.as_deref_mut() else {
            return;
        };

        transport.tick(delta, &mut self.session);
        self.flush();

        self.accumulator += delta;
        let interval = self.session.settings.tick_interval();
        while self.accumulator >= interval {
            self.accumulator -= interval;
            self.session.fan_out(Hook::Tick(interval));
            self.flush();
        }
    }

    /// Sends a call from outside any entity hook.
    pub fn send(
        &mut self,
        instance: NetworkId,
        method: &str,
        payload: Option<Value>,
        recipient: Recipient,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(TransportError::NotRunning.into());
        }
        let result = self.deliver(OutboundCall {
            instance,
            method: method_id(method),
            payload,
            recipient,
        });
        self.flush();
        result
    }

    pub fn disconnect(&mut self, peer: PeerId) -> Result<()> {
        self.transport
            .as_deref_mut()
            .ok_or(ConfigError::MissingTransport)?
            .disconnect(peer)
    }

    fn deliver(&mut self, call: OutboundCall) -> Result<()> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(ConfigError::MissingTransport)?;
        let packet = encode_call(&*self.session.serializer, transport, &call)?;

        let sent = match (call.recipient, self.session.role) {
            (Recipient::Peer(id), Some(role)) if role.is_server() => {
                let peer = u32::try_from(id)
                    .map(PeerId)
                    .map_err(|_| TransportError::InvalidRecipient(id))?;
                transport.send_to(peer, &packet)
            }
            _ => transport.send(&packet),
        };
        drop(packet);

        // A host is its own client: broadcasts also land locally.
        if self.session.role == Some(HostType::Host) && call.recipient == Recipient::Broadcast {
            let OutboundCall {
                instance,
                method,
                payload,
                recipient,
            } = call;
            let local = self
                .session
                .resolve(instance, method, Access::ALLOW_SERVER)
                .and_then(|()| {
                    let invocation = Invocation::new(payload, recipient.id());
                    self.session.invoke(instance, method, None, invocation)
                });
            if let Err(e) = local {
                log::warn!("Local delivery of {} to entity {} failed: {}", method, instance, e);
            }
        }
        sent
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Spawn(entity) => {
                if let Err(e) = self.session.registry.register(entity, None) {
                    log::warn!("Spawn failed: {}", e);
                }
            }
            Command::AcceptRemote(entity, id) => {
                if let Err(e) = self.session.registry.register(entity, Some(id)) {
                    log::warn!("Could not accept remote entity {}: {}", id, e);
                }
            }
            Command::Despawn(id) => {
                if self.session.registry.unregister(id).is_none() {
                    log::debug!("Entity {} was already gone", id);
                }
            }
            Command::Disconnect(peer) => {
                if let Err(e) = self.disconnect(peer) {
                    log::warn!("Disconnect of peer {} failed: {}", peer, e);
                }
            }
        }
    }

    fn flush(&mut self) {
        for _ in 0..MAX_FLUSH_ROUNDS {
            if self.session.outbox.is_empty() {
                return;
            }
            let (calls, commands) = self.session.outbox.take();
            for command in commands {
                self.apply(command);
            }
            for call in calls {
                let (instance, method) = (call.instance, call.method);
                if let Err(e) = self.deliver(call) {
                    log::warn!("Failed to send {} from entity {}: {}", method, instance, e);
                }
            }
        }

        if !self.session.outbox.is_empty() {
            log::warn!(
                "Outbox still busy after {} rounds, dropping the rest",
                MAX_FLUSH_ROUNDS
            );
            self.session.outbox.clear();
        }
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.stop();
        if let Some(transport) = self.transport.as_deref_mut() {
            transport.dispose();
        }
    }
}
