mod pool;

pub use pool::{MessagePool, PoolError};

use std::any::Any;

/// Opaque application state handed to every message encode and decode.
/// Both ends of a connection must install an equivalent context.
pub type Context = dyn Any + Send + Sync;

/// An application message carried over a connection.
///
/// Messages are created empty by [`Message::create`] and filled either by the
/// application or by [`Message::deserialize`] on the receiving side. The wire
/// encoding of the payload is entirely up to the implementor.
pub trait Message: Sized + Send + 'static {
    /// A fresh message of the given type, or `None` if the type is unknown.
    fn create(message_type: u16) -> Option<Self>;

    fn message_type(&self) -> u16;

    fn serialize(&self, out: &mut Vec<u8>, context: Option<&Context>);

    fn deserialize(&mut self, data: &[u8], context: Option<&Context>) -> Result<(), MessageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

/// Reference to a message living in a [`MessagePool`].
///
/// Handles are only meaningful for the pool that issued them. Once the
/// message is reclaimed the handle goes stale and the pool ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    index: u32,
    generation: u32,
}
