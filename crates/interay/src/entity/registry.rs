use super::{NetworkEntity, NetworkId};
use crate::error::{CapacityError, ProtocolError, Result};
use crate::host::HostType;

/// Number of slots the table grows by.
pub const GROWTH_STEP: usize = 16;

/// Dense slot table of live entities, indexed by [`NetworkId`].
///
/// Slot 0 belongs to the host entity and is never issued. A server-side
/// registry issues ids itself, reusing freed ones first; a client-side
/// registry only accepts the ids its server handed out.
pub struct EntityRegistry {
    slots: Vec<Option<Box<dyn NetworkEntity>>>,
    free: Vec<NetworkId>,
    next_id: u32,
    max_id: u32,
    max_entities: u32,
    role: HostType,
}

impl EntityRegistry {
    pub fn new(max_entities: u32) -> Self {
        let mut slots = Vec::with_capacity(GROWTH_STEP);
        slots.resize_with(GROWTH_STEP.min(max_entities as usize + 1), || None);
        Self {
            slots,
            free: Vec::new(),
            next_id: 1,
            max_id: 0,
            max_entities,
            role: HostType::Server,
        }
    }

    pub fn role(&self) -> HostType {
        self.role
    }

    pub fn set_role(&mut self, role: HostType) {
        self.role = role;
    }

    /// Ids above the new limit stay registered; only later registrations see
    /// it. Freed ids above the limit are never issued again.
    pub fn set_max_entities(&mut self, max_entities: u32) {
        self.max_entities = max_entities;
        self.free.retain(|id| id.0 <= max_entities);
    }

    pub fn max_entities(&self) -> u32 {
        self.max_entities
    }

    /// Installs the host entity, returning the previous one.
    pub fn set_host(&mut self, entity: Box<dyn NetworkEntity>) -> Option<Box<dyn NetworkEntity>> {
        self.slots[0].replace(entity)
    }

    pub fn take_host(&mut self) -> Option<Box<dyn NetworkEntity>> {
        self.slots[0].take()
    }

    pub fn get(&self, id: NetworkId) -> Option<&(dyn NetworkEntity + 'static)> {
        self.slots.get(id.index())?.as_deref()
    }

    pub fn get_mut(&mut self, id: NetworkId) -> Option<&mut (dyn NetworkEntity + 'static)> {
        self.slots.get_mut(id.index())?.as_deref_mut()
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.get(id).is_some()
    }

    /// Highest occupied id; fan-out walks `0..=max_id`.
    pub fn max_id(&self) -> NetworkId {
        NetworkId(self.max_id)
    }

    /// Occupied slots, host included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| NetworkId(index as u32))
    }

    /// Adds an entity. Servers pick the id and ignore `requested`; clients
    /// must pass the id the server assigned.
    pub fn register(
        &mut self,
        entity: Box<dyn NetworkEntity>,
        requested: Option<NetworkId>,
    ) -> Result<NetworkId> {
        let id = if self.role.is_server() {
            self.issue_id()?
        } else {
            self.accept_id(requested)?
        };

        self.ensure_slot(id);
        self.slots[id.index()] = Some(entity);
        self.max_id = self.max_id.max(id.0);
        log::debug!("Registered entity {}", id);
        Ok(id)
    }

    /// Removes an entity and returns it. On a server the id goes back on the
    /// free list.
    pub fn unregister(&mut self, id: NetworkId) -> Option<Box<dyn NetworkEntity>> {
        if !self.role.is_server() {
            return self.release(id);
        }
        let entity = self.remove(id)?;
        self.free.push(id);
        Some(entity)
    }

    /// Client-side removal. The id is never reissued locally.
    pub fn release(&mut self, id: NetworkId) -> Option<Box<dyn NetworkEntity>> {
        self.remove(id)
    }

    /// Drops every entity except the host and restarts id issuing.
    pub fn reset(&mut self) {
        let host = self.slots[0].take();
        self.slots.clear();
        self.slots
            .resize_with(GROWTH_STEP.min(self.max_entities as usize + 1), || None);
        self.slots[0] = host;
        self.free.clear();
        self.next_id = 1;
        self.max_id = 0;
    }

    fn issue_id(&mut self) -> Result<NetworkId> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        if self.next_id > self.max_entities {
            return Err(CapacityError::EntityTable {
                max: self.max_entities,
            }
            .into());
        }
        let id = NetworkId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    fn accept_id(&self, requested: Option<NetworkId>) -> Result<NetworkId> {
        let id = requested.unwrap_or(NetworkId::HOST);
        if id.is_host() || id.0 > self.max_entities {
            return Err(ProtocolError::InvalidNetworkId(id.0).into());
        }
        if self.contains(id) {
            return Err(ProtocolError::SlotOccupied(id).into());
        }
        Ok(id)
    }

    fn ensure_slot(&mut self, id: NetworkId) {
        if id.index() < self.slots.len() {
            return;
        }
        let steps = id.index() / GROWTH_STEP + 1;
        let len = (steps * GROWTH_STEP).min(self.max_entities as usize + 1);
        self.slots.resize_with(len.max(id.index() + 1), || None);
    }

    fn remove(&mut self, id: NetworkId) -> Option<Box<dyn NetworkEntity>> {
        if id.is_host() {
            return None;
        }
        let entity = self.slots.get_mut(id.index())?.take()?;
        if id.0 == self.max_id {
            self.max_id = self
                .slots
                .iter()
                .rposition(Option::is_some)
                .map_or(0, |index| index as u32);
        }
        log::debug!("Unregistered entity {}", id);
        Some(entity)
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_MAX_NETWORK_ENTITIES)
    }
}
