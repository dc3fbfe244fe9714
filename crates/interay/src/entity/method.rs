use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;

use super::context::NetContext;
use super::NetworkEntity;
use crate::codec::Value;
use crate::error::{ConfigError, ProtocolError, Result};

/// Stable id of a remote method, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Base-31 polynomial over the UTF-16 code units of `name`, wrapping at 32 bits.
pub fn method_id(name: &str) -> MethodId {
    MethodId(
        name.encode_utf16()
            .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(u32::from(unit))),
    )
}

bitflags! {
    /// Which side may invoke a method remotely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const ALLOW_CLIENT = 0b01;
        const ALLOW_SERVER = 0b10;
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::all()
    }
}

/// Arguments decoded from one message, one variant per method shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    None,
    Recipient(u64),
    Data(Value),
    DataRecipient(Value, u64),
}

impl Invocation {
    pub fn new(payload: Option<Value>, recipient: Option<u64>) -> Self {
        match (payload, recipient) {
            (None, None) => Self::None,
            (None, Some(recipient)) => Self::Recipient(recipient),
            (Some(data), None) => Self::Data(data),
            (Some(data), Some(recipient)) => Self::DataRecipient(data, recipient),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::None => "no arguments",
            Self::Recipient(_) => "a recipient",
            Self::Data(_) => "data",
            Self::DataRecipient(..) => "data and a recipient",
        }
    }
}

type UnitFn = dyn Fn(&mut dyn NetworkEntity, &mut NetContext<'_>) -> Result<()>;
type RecipientFn = dyn Fn(&mut dyn NetworkEntity, &mut NetContext<'_>, u64) -> Result<()>;
type DataFn = dyn Fn(&mut dyn NetworkEntity, &mut NetContext<'_>, Value) -> Result<()>;
type DataRecipientFn = dyn Fn(&mut dyn NetworkEntity, &mut NetContext<'_>, Value, u64) -> Result<()>;

/// Callable bound to a remote method name.
///
/// The typed constructors take a function over the concrete entity type and
/// downcast on invocation; calling one on an entity of another type fails
/// with [`ProtocolError::WrongEntityType`].
pub enum MethodHandler {
    Unit(Box<UnitFn>),
    Recipient(Box<RecipientFn>),
    Data(Box<DataFn>),
    DataRecipient(Box<DataRecipientFn>),
}

fn downcast<'e, E: NetworkEntity>(
    entity: &'e mut dyn NetworkEntity,
    ctx: &NetContext<'_>,
) -> Result<&'e mut E> {
    entity
        .as_any_mut()
        .downcast_mut::<E>()
        .ok_or_else(|| ProtocolError::WrongEntityType(ctx.entity_id()).into())
}

impl MethodHandler {
    pub fn unit<E, F>(f: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&mut E, &mut NetContext<'_>) -> Result<()> + 'static,
    {
        Self::Unit(Box::new(move |entity: &mut dyn NetworkEntity, ctx: &mut NetContext<'_>| {
            let entity = downcast::<E>(entity, ctx)?;
            f(entity, ctx)
        }))
    }

    pub fn recipient<E, F>(f: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&mut E, &mut NetContext<'_>, u64) -> Result<()> + 'static,
    {
        Self::Recipient(Box::new(
            move |entity: &mut dyn NetworkEntity, ctx: &mut NetContext<'_>, recipient: u64| {
                let entity = downcast::<E>(entity, ctx)?;
                f(entity, ctx, recipient)
            },
        ))
    }

    pub fn data<E, F>(f: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&mut E, &mut NetContext<'_>, Value) -> Result<()> + 'static,
    {
        Self::Data(Box::new(
            move |entity: &mut dyn NetworkEntity, ctx: &mut NetContext<'_>, data: Value| {
                let entity = downcast::<E>(entity, ctx)?;
                f(entity, ctx, data)
            },
        ))
    }

    pub fn data_recipient<E, F>(f: F) -> Self
    where
        E: NetworkEntity,
        F: Fn(&mut E, &mut NetContext<'_>, Value, u64) -> Result<()> + 'static,
    {
        Self::DataRecipient(Box::new(
            move |entity: &mut dyn NetworkEntity,
                  ctx: &mut NetContext<'_>,
                  data: Value,
                  recipient: u64| {
                let entity = downcast::<E>(entity, ctx)?;
                f(entity, ctx, data, recipient)
            },
        ))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Unit(_) => "no arguments",
            Self::Recipient(_) => "a recipient",
            Self::Data(_) => "data",
            Self::DataRecipient(_) => "data and a recipient",
        }
    }

    /// Runs the handler if `invocation` has its shape.
    pub fn invoke(
        &self,
        name: &str,
        entity: &mut dyn NetworkEntity,
        ctx: &mut NetContext<'_>,
        invocation: Invocation,
    ) -> Result<()> {
        match (self, invocation) {
            (Self::Unit(f), Invocation::None) => f(entity, ctx),
            (Self::Recipient(f), Invocation::Recipient(recipient)) => f(entity, ctx, recipient),
            (Self::Data(f), Invocation::Data(data)) => f(entity, ctx, data),
            (Self::DataRecipient(f), Invocation::DataRecipient(data, recipient)) => {
                f(entity, ctx, data, recipient)
            }
            (handler, invocation) => Err(ProtocolError::ShapeMismatch {
                method: name.to_string(),
                expected: handler.shape(),
                found: invocation.shape(),
            }
            .into()),
        }
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandler({})", self.shape())
    }
}

#[derive(Debug)]
pub struct MethodEntry {
    pub name: String,
    pub access: Access,
    pub handler: MethodHandler,
}

/// Remote methods by id. Frozen for the lifetime of a running session.
#[derive(Debug, Default)]
pub struct MethodTable {
    entries: HashMap<MethodId, MethodEntry>,
    frozen: bool,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        access: Access,
        handler: MethodHandler,
    ) -> std::result::Result<MethodId, ConfigError> {
        if self.frozen {
            return Err(ConfigError::Running("method table"));
        }

        let id = method_id(name);
        if let Some(existing) = self.entries.get(&id) {
            return Err(ConfigError::MethodCollision {
                name: name.to_string(),
                existing: existing.name.clone(),
                id,
            });
        }

        log::debug!("Registered remote method '{}' as {}", name, id);
        self.entries.insert(
            id,
            MethodEntry {
                name: name.to_string(),
                access,
                handler,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodEntry> {
        self.entries.get(&id)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
