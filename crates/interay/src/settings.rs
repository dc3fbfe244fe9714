use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_RATE: u32 = 14;
pub const DEFAULT_MESSAGE_MAX_SIZE: u32 = 4096;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_MAX_NETWORK_ENTITIES: u32 = 1024;

/// Smallest message the layer accepts: envelope plus a little payload room.
pub const MIN_MESSAGE_SIZE: u32 = 64;
/// Payload sizes travel in u16 length prefixes.
pub const MAX_MESSAGE_SIZE: u32 = u16::MAX as u32;
/// Hard cap on the entity table.
pub const MAX_NETWORK_ENTITIES: u32 = u16::MAX as u32;

/// Validated configuration snapshot.
///
/// Every setter clamps into the valid range, so a `NetworkSettings` value is
/// always usable. It is a plain value: clones never observe later mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    tick_rate: u32,
    only_server: bool,
    message_max_size: u32,
    max_connections: u32,
    max_network_entities: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            only_server: false,
            message_max_size: DEFAULT_MESSAGE_MAX_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_network_entities: DEFAULT_MAX_NETWORK_ENTITIES,
        }
    }
}

impl NetworkSettings {
    pub fn new(
        tick_rate: u32,
        message_max_size: u32,
        max_connections: u32,
        max_network_entities: u32,
    ) -> Self {
        let mut settings = Self::default();
        settings.set_tick_rate(tick_rate);
        settings.set_message_max_size(message_max_size);
        settings.set_max_connections(max_connections);
        settings.set_max_network_entities(max_network_entities);
        settings
    }

    /// Re-applies every clamp. Used on values that bypassed the setters,
    /// e.g. ones deserialized from a config file.
    pub fn validated(self) -> Self {
        let only_server = self.only_server;
        let mut settings = Self::new(
            self.tick_rate,
            self.message_max_size,
            self.max_connections,
            self.max_network_entities,
        );
        settings.only_server = only_server;
        settings
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn set_tick_rate(&mut self, tick_rate: u32) {
        self.tick_rate = tick_rate.max(1);
    }

    /// When set, a host only relays and never acts as a local client.
    pub fn only_server(&self) -> bool {
        self.only_server
    }

    pub fn set_only_server(&mut self, only_server: bool) {
        self.only_server = only_server;
    }

    pub fn message_max_size(&self) -> u32 {
        self.message_max_size
    }

    pub fn set_message_max_size(&mut self, size: u32) {
        self.message_max_size = size.clamp(MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE);
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn set_max_connections(&mut self, max: u32) {
        self.max_connections = max.max(1);
    }

    pub fn max_network_entities(&self) -> u32 {
        self.max_network_entities
    }

    pub fn set_max_network_entities(&mut self, max: u32) {
        self.max_network_entities = max.clamp(1, MAX_NETWORK_ENTITIES);
    }

    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        self.set_tick_rate(tick_rate);
        self
    }

    pub fn with_only_server(mut self, only_server: bool) -> Self {
        self.set_only_server(only_server);
        self
    }

    pub fn with_message_max_size(mut self, size: u32) -> Self {
        self.set_message_max_size(size);
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.set_max_connections(max);
        self
    }

    pub fn with_max_network_entities(mut self, max: u32) -> Self {
        self.set_max_network_entities(max);
        self
    }

    /// Time between two ticks at the configured rate.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }
}
