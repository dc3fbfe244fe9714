use std::fmt;

use super::message::Recipient;
use super::method::{MethodId, method_id};
use super::{NetworkEntity, NetworkId};
use crate::codec::Value;
use crate::host::HostType;
use crate::settings::NetworkSettings;
use crate::transport::PeerId;

/// A remote call waiting to be encoded and handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub instance: NetworkId,
    pub method: MethodId,
    pub payload: Option<Value>,
    pub recipient: Recipient,
}

/// Table or connection changes requested from inside a hook or method.
pub enum Command {
    Spawn(Box<dyn NetworkEntity>),
    /// Client-side registration under the id the server assigned.
    AcceptRemote(Box<dyn NetworkEntity>, NetworkId),
    Despawn(NetworkId),
    Disconnect(PeerId),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(_) => f.write_str("Spawn"),
            Self::AcceptRemote(_, id) => write!(f, "AcceptRemote({id})"),
            Self::Despawn(id) => write!(f, "Despawn({id})"),
            Self::Disconnect(peer) => write!(f, "Disconnect({peer})"),
        }
    }
}

/// Everything entities queued during one dispatch or fan-out pass.
#[derive(Debug, Default)]
pub struct Outbox {
    calls: Vec<OutboundCall>,
    commands: Vec<Command>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.commands.is_empty()
    }

    pub fn take(&mut self) -> (Vec<OutboundCall>, Vec<Command>) {
        (
            std::mem::take(&mut self.calls),
            std::mem::take(&mut self.commands),
        )
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.commands.clear();
    }
}

/// Handle given to entity hooks and remote methods.
///
/// Nothing here touches the transport directly. Calls and commands are
/// queued and the manager flushes them once the current pass is over.
pub struct NetContext<'a> {
    entity: NetworkId,
    role: Option<HostType>,
    sender: Option<PeerId>,
    peers: &'a [PeerId],
    settings: &'a NetworkSettings,
    outbox: &'a mut Outbox,
}

impl<'a> NetContext<'a> {
    pub fn new(
        entity: NetworkId,
        role: Option<HostType>,
        sender: Option<PeerId>,
        peers: &'a [PeerId],
        settings: &'a NetworkSettings,
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            entity,
            role,
            sender,
            peers,
            settings,
            outbox,
        }
    }

    /// The entity this context was handed to.
    pub fn entity_id(&self) -> NetworkId {
        self.entity
    }

    /// `None` while the session is not running.
    pub fn role(&self) -> Option<HostType> {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role.is_some_and(HostType::is_server)
    }

    pub fn is_client(&self) -> bool {
        self.role.is_some_and(HostType::is_client)
    }

    /// Peer whose message is being dispatched, if any.
    pub fn sender(&self) -> Option<PeerId> {
        self.sender
    }

    pub fn peers(&self) -> &[PeerId] {
        self.peers
    }

    pub fn settings(&self) -> &NetworkSettings {
        self.settings
    }

    /// Calls `method` on the same entity on the remote side.
    pub fn send(&mut self, method: &str, payload: Option<Value>, recipient: Recipient) {
        self.send_to_entity(self.entity, method_id(method), payload, recipient);
    }

    pub fn send_to_entity(
        &mut self,
        instance: NetworkId,
        method: MethodId,
        payload: Option<Value>,
        recipient: Recipient,
    ) {
        self.outbox.calls.push(OutboundCall {
            instance,
            method,
            payload,
            recipient,
        });
    }

    pub fn spawn(&mut self, entity: Box<dyn NetworkEntity>) {
        self.outbox.commands.push(Command::Spawn(entity));
    }

    pub fn accept_remote(&mut self, entity: Box<dyn NetworkEntity>, id: NetworkId) {
        self.outbox.commands.push(Command::AcceptRemote(entity, id));
    }

    pub fn despawn(&mut self, id: NetworkId) {
        self.outbox.commands.push(Command::Despawn(id));
    }

    pub fn disconnect(&mut self, peer: PeerId) {
        self.outbox.commands.push(Command::Disconnect(peer));
    }
}
