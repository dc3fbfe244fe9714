//! Networked entities, their registry and the RPC envelope they talk through.

mod context;
mod message;
mod method;
mod registry;

pub use context::{Command, NetContext, OutboundCall, Outbox};
pub use message::{ENVELOPE_HEADER_SIZE, Envelope, MessageKind, RECIPIENT_SIZE, Recipient};
pub use method::{Access, Invocation, MethodEntry, MethodHandler, MethodId, MethodTable, method_id};
pub use registry::{EntityRegistry, GROWTH_STEP};

use std::any::Any;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::transport::PeerId;

/// Wire identity of an entity. Id 0 is the host entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NetworkId(pub u32);

impl NetworkId {
    pub const HOST: NetworkId = NetworkId(0);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upcast helper so method handlers can recover the concrete entity type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A networked object. Every hook defaults to doing nothing.
///
/// Hooks run on the tick thread with a [`NetContext`] for queuing outbound
/// calls. A failing hook is logged against the entity and the fan-out moves
/// on to the next one.
pub trait NetworkEntity: AsAny {
    fn on_tick(&mut self, _ctx: &mut NetContext<'_>, _delta: Duration) -> Result<()> {
        Ok(())
    }

    fn on_client_connect(&mut self, _ctx: &mut NetContext<'_>, _peer: PeerId) -> Result<()> {
        Ok(())
    }

    fn on_client_disconnect(&mut self, _ctx: &mut NetContext<'_>, _peer: PeerId) -> Result<()> {
        Ok(())
    }

    fn on_start_host(&mut self, _ctx: &mut NetContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_stop_host(&mut self, _ctx: &mut NetContext<'_>) -> Result<()> {
        Ok(())
    }
}
