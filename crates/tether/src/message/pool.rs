use std::collections::BTreeMap;
use std::mem::size_of;

use log::{debug, warn};

use super::{Message, MessageHandle};
use crate::arena::{Arena, Block, Lease};
use crate::config::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("pool for message type {message_type} is full ({capacity} live)")]
    Exhausted { message_type: u16, capacity: usize },
    #[error("arena exhausted")]
    OutOfMemory,
}

struct Pooled<M> {
    message: M,
    message_type: u16,
    refs: u32,
    block: Option<Block>,
    _lease: Lease,
}

struct Entry<M> {
    generation: u32,
    value: Option<Pooled<M>>,
}

/// Reference-counted message storage for one connection.
///
/// Every live message is charged to the pool's arena, and each message type
/// is capped at the capacity the [`PoolConfig`] gives it. Exhaustion is an
/// error for the caller, never growth past those bounds.
pub struct MessagePool<M: Message> {
    arena: Arena,
    config: PoolConfig,
    entries: Vec<Entry<M>>,
    free: Vec<u32>,
    live: BTreeMap<u16, usize>,
}

impl<M: Message> MessagePool<M> {
    pub fn new(config: PoolConfig, arena: Arena) -> Self {
        Self {
            arena,
            config,
            entries: Vec::new(),
            free: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn create(&mut self, message_type: u16) -> Result<MessageHandle, PoolError> {
        let capacity = self.config.capacity_for(message_type);
        if self.live(message_type) >= capacity {
            debug!(
                "message pool '{}' exhausted for type {} ({} live)",
                self.arena.label(),
                message_type,
                capacity
            );
            return Err(PoolError::Exhausted {
                message_type,
                capacity,
            });
        }

        let message = M::create(message_type).ok_or(PoolError::UnknownType(message_type))?;
        debug_assert_eq!(message.message_type(), message_type);
        let lease = self
            .arena
            .reserve(size_of::<Pooled<M>>())
            .ok_or(PoolError::OutOfMemory)?;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    value: None,
                });
                (self.entries.len() - 1) as u32
            }
        };

        let entry = &mut self.entries[index as usize];
        entry.value = Some(Pooled {
            message,
            message_type,
            refs: 1,
            block: None,
            _lease: lease,
        });
        *self.live.entry(message_type).or_default() += 1;

        Ok(MessageHandle {
            index,
            generation: entry.generation,
        })
    }

    fn slot(&self, handle: MessageHandle) -> Option<&Pooled<M>> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    fn slot_mut(&mut self, handle: MessageHandle) -> Option<&mut Pooled<M>> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn contains(&self, handle: MessageHandle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&M> {
        self.slot(handle).map(|pooled| &pooled.message)
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut M> {
        self.slot_mut(handle).map(|pooled| &mut pooled.message)
    }

    pub fn block(&self, handle: MessageHandle) -> Option<&[u8]> {
        self.slot(handle).and_then(|pooled| pooled.block.as_deref())
    }

    pub fn ref_count(&self, handle: MessageHandle) -> Option<u32> {
        self.slot(handle).map(|pooled| pooled.refs)
    }

    pub fn allocate_block(&self, bytes: usize) -> Option<Block> {
        self.arena.allocate_block(bytes)
    }

    /// Moves `block` into the message. The message frees it when reclaimed.
    pub fn attach_block(&mut self, handle: MessageHandle, block: Block) {
        assert!(
            block.belongs_to(&self.arena),
            "block was allocated from another arena"
        );
        let Some(pooled) = self.slot_mut(handle) else {
            panic!("attaching a block to a released message");
        };
        assert!(pooled.block.is_none(), "message already has a block attached");
        pooled.block = Some(block);
    }

    /// Frees a block that was never attached.
    pub fn free_block(&self, block: Block) {
        assert!(
            block.belongs_to(&self.arena),
            "block was allocated from another arena"
        );
        drop(block);
    }

    pub fn acquire(&mut self, handle: MessageHandle) {
        let Some(pooled) = self.slot_mut(handle) else {
            panic!("acquiring a released message");
        };
        pooled.refs += 1;
    }

    /// Drops one reference, reclaiming the message when none remain.
    /// Returns true if the message was reclaimed.
    pub fn release(&mut self, handle: MessageHandle) -> bool {
        let Some(pooled) = self.slot_mut(handle) else {
            warn!("ignoring release of stale message handle {:?}", handle);
            return false;
        };
        pooled.refs -= 1;
        if pooled.refs > 0 {
            return false;
        }

        let entry = &mut self.entries[handle.index as usize];
        if let Some(pooled) = entry.value.take() {
            if let Some(live) = self.live.get_mut(&pooled.message_type) {
                *live -= 1;
            }
        }
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    pub fn live(&self, message_type: u16) -> usize {
        self.live.get(&message_type).copied().unwrap_or(0)
    }

    pub fn live_total(&self) -> usize {
        self.live.values().sum()
    }

    /// Reclaims every message regardless of outstanding references.
    pub fn reset(&mut self) {
        self.free.clear();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.value.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, MessageError};

    #[derive(Debug, Default)]
    struct Ping(u32);

    impl Message for Ping {
        fn create(message_type: u16) -> Option<Self> {
            (message_type < 2).then(Self::default)
        }

        fn message_type(&self) -> u16 {
            0
        }

        fn serialize(&self, out: &mut Vec<u8>, _: Option<&Context>) {
            out.extend_from_slice(&self.0.to_le_bytes());
        }

        fn deserialize(&mut self, data: &[u8], _: Option<&Context>) -> Result<(), MessageError> {
            let bytes = data.try_into().map_err(|_| MessageError::Invalid("ping"))?;
            self.0 = u32::from_le_bytes(bytes);
            Ok(())
        }
    }

    fn pool(capacity: usize) -> MessagePool<Ping> {
        let config = PoolConfig {
            default_capacity: capacity,
            ..Default::default()
        };
        MessagePool::new(config, Arena::new("test", 64 * 1024))
    }

    #[test]
    fn exhausts_at_type_capacity() {
        let mut pool = pool(2);
        let a = pool.create(0).unwrap();
        pool.create(0).unwrap();
        assert_eq!(
            pool.create(0),
            Err(PoolError::Exhausted {
                message_type: 0,
                capacity: 2
            })
        );

        pool.release(a);
        assert!(pool.create(0).is_ok());
        assert_eq!(pool.create(7), Err(PoolError::UnknownType(7)));
    }

    #[test]
    fn exhausts_at_arena_capacity() {
        let config = PoolConfig::default();
        let arena = Arena::new("tiny", size_of::<Pooled<Ping>>());
        let mut pool = MessagePool::<Ping>::new(config, arena);

        pool.create(0).unwrap();
        assert_eq!(pool.create(0), Err(PoolError::OutOfMemory));
    }

    #[test]
    fn reference_counting_reclaims_at_zero() {
        let mut pool = pool(4);
        let handle = pool.create(0).unwrap();
        pool.acquire(handle);
        assert_eq!(pool.ref_count(handle), Some(2));

        assert!(!pool.release(handle));
        assert!(pool.release(handle));
        assert!(!pool.contains(handle));

        // A stale handle is ignored, even once its slot is reused.
        let reused = pool.create(0).unwrap();
        assert!(!pool.release(handle));
        assert_eq!(pool.ref_count(reused), Some(1));
    }

    #[test]
    fn attached_block_freed_with_message() {
        let mut pool = pool(4);
        let handle = pool.create(0).unwrap();
        let before = pool.arena().usage().used;

        let mut block = pool.allocate_block(128).unwrap();
        block.fill(7);
        pool.attach_block(handle, block);
        assert_eq!(pool.block(handle).map(<[u8]>::len), Some(128));
        assert_eq!(pool.arena().usage().used, before + 128);

        pool.release(handle);
        assert_eq!(pool.arena().usage().used, 0);
    }

    #[test]
    #[should_panic(expected = "another arena")]
    fn foreign_block_is_rejected() {
        let mut pool = pool(4);
        let handle = pool.create(0).unwrap();
        let foreign = Arena::new("other", 64).allocate_block(8).unwrap();
        pool.attach_block(handle, foreign);
    }

    #[test]
    fn reset_invalidates_handles() {
        let mut pool = pool(4);
        let handle = pool.create(0).unwrap();
        pool.acquire(handle);

        pool.reset();
        assert!(pool.get(handle).is_none());
        assert_eq!(pool.live_total(), 0);
        assert!(pool.create(1).is_ok());
    }
}
