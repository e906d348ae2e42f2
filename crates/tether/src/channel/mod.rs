mod fragment;
mod reliable;
mod unreliable;

pub use reliable::ReliableChannel;
pub use unreliable::UnreliableChannel;

use crate::config::ChannelConfig;
use crate::message::{Context, Message, MessageHandle, MessagePool, PoolError};
use crate::net::packet::ChannelEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("peer sent unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("message of type {0} failed to decode")]
    Decode(u16),
    #[error("message pool exhausted for type {0}")]
    PoolExhausted(u16),
    #[error("arena exhausted")]
    ArenaExhausted,
    #[error("receive queue full")]
    ReceiveQueueFull,
    #[error("message id {0} outside the receive window")]
    OutsideWindow(u16),
    #[error("invalid fragment: {0}")]
    InvalidFragment(&'static str),
    #[error("message body of {size} bytes exceeds the {max} byte limit")]
    BlockTooLarge { size: usize, max: usize },
}

impl ChannelError {
    /// Errors that mean the peer is not speaking the protocol; the connection
    /// cannot recover from them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidFragment(_) | Self::BlockTooLarge { .. })
    }
}

/// A message queued for sending with its payload already encoded.
#[derive(Debug)]
struct Outgoing {
    id: u16,
    handle: MessageHandle,
    message_type: u16,
    payload: Vec<u8>,
    body_len: usize,
}

impl Outgoing {
    fn encode<M: Message>(
        pool: &mut MessagePool<M>,
        config: &ChannelConfig,
        id: u16,
        handle: MessageHandle,
        context: Option<&Context>,
    ) -> Self {
        let Some(message) = pool.get(handle) else {
            panic!("sending a released message");
        };
        let message_type = message.message_type();
        let mut payload = Vec::new();
        message.serialize(&mut payload, context);

        let body_len = payload.len() + pool.block(handle).map_or(0, <[u8]>::len);
        assert!(
            body_len <= config.max_block_size,
            "message of {body_len} bytes exceeds max_block_size {}",
            config.max_block_size
        );

        pool.acquire(handle);
        Self {
            id,
            handle,
            message_type,
            payload,
            body_len,
        }
    }

    fn is_fragmented(&self, config: &ChannelConfig) -> bool {
        self.body_len > config.fragment_above
    }
}

/// Builds a pooled message from received bytes, releasing it again if any
/// step fails.
fn materialize<M: Message>(
    pool: &mut MessagePool<M>,
    config: &ChannelConfig,
    message_type: u16,
    payload: &[u8],
    block: Option<&[u8]>,
    context: Option<&Context>,
) -> Result<MessageHandle, ChannelError> {
    let size = payload.len() + block.map_or(0, <[u8]>::len);
    if size > config.max_block_size {
        return Err(ChannelError::BlockTooLarge {
            size,
            max: config.max_block_size,
        });
    }

    let handle = pool.create(message_type).map_err(|err| match err {
        PoolError::UnknownType(message_type) => ChannelError::UnknownMessageType(message_type),
        PoolError::Exhausted { message_type, .. } => ChannelError::PoolExhausted(message_type),
        PoolError::OutOfMemory => ChannelError::ArenaExhausted,
    })?;

    let decoded = pool
        .get_mut(handle)
        .map(|message| message.deserialize(payload, context));
    if !matches!(decoded, Some(Ok(()))) {
        pool.release(handle);
        return Err(ChannelError::Decode(message_type));
    }

    if let Some(bytes) = block {
        let Some(block) = pool.arena().block_from_slice(bytes) else {
            pool.release(handle);
            return Err(ChannelError::ArenaExhausted);
        };
        pool.attach_block(handle, block);
    }
    Ok(handle)
}

/// One logical stream of a connection.
#[derive(Debug)]
pub enum Channel {
    Reliable(ReliableChannel),
    Unreliable(UnreliableChannel),
}

impl Channel {
    pub fn new(index: u8, config: ChannelConfig) -> Self {
        if config.kind.is_reliable() {
            Self::Reliable(ReliableChannel::new(index, config))
        } else {
            Self::Unreliable(UnreliableChannel::new(index, config))
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        match self {
            Self::Reliable(channel) => channel.config(),
            Self::Unreliable(channel) => channel.config(),
        }
    }

    pub fn can_send(&self) -> bool {
        match self {
            Self::Reliable(channel) => channel.can_send(),
            Self::Unreliable(channel) => channel.can_send(),
        }
    }

    pub fn send<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        handle: MessageHandle,
        context: Option<&Context>,
    ) {
        match self {
            Self::Reliable(channel) => channel.send(pool, handle, context),
            Self::Unreliable(channel) => channel.send(pool, handle, context),
        }
    }

    pub fn receive(&mut self) -> Option<MessageHandle> {
        match self {
            Self::Reliable(channel) => channel.receive(),
            Self::Unreliable(channel) => channel.receive(),
        }
    }

    /// Fills at most `budget` bytes of the packet numbered `sequence`.
    pub fn write_entry<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        sequence: u16,
        time: f64,
        budget: usize,
    ) -> Option<ChannelEntry> {
        match self {
            Self::Reliable(channel) => channel.write_entry(pool, sequence, time, budget),
            Self::Unreliable(channel) => channel.write_entry(pool, budget),
        }
    }

    pub fn read_entry<M: Message>(
        &mut self,
        pool: &mut MessagePool<M>,
        entry: ChannelEntry,
        time: f64,
        context: Option<&Context>,
    ) -> Result<(), ChannelError> {
        match self {
            Self::Reliable(channel) => channel.read_entry(pool, entry, context),
            Self::Unreliable(channel) => channel.read_entry(pool, entry, time, context),
        }
    }

    pub fn process_ack<M: Message>(&mut self, pool: &mut MessagePool<M>, sequence: u16) {
        if let Self::Reliable(channel) = self {
            channel.process_ack(pool, sequence);
        }
    }

    pub fn advance_time(&mut self, time: f64) {
        if let Self::Unreliable(channel) = self {
            channel.advance_time(time);
        }
    }

    /// Returns every message the channel holds to the pool.
    pub fn reset<M: Message>(&mut self, pool: &mut MessagePool<M>) {
        match self {
            Self::Reliable(channel) => channel.reset(pool),
            Self::Unreliable(channel) => channel.reset(pool),
        }
    }
}
