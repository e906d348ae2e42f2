use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaUsage {
    pub capacity: usize,
    pub used: usize,
    pub allocations: usize,
}

impl ArenaUsage {
    pub fn available(&self) -> usize {
        self.capacity - self.used
    }
}

#[derive(Debug)]
struct ArenaInner {
    label: String,
    capacity: usize,
    used: AtomicUsize,
    allocations: AtomicUsize,
    generation: AtomicU64,
    // Keeps the region charged to the parent arena for as long as this one lives.
    _backing: Option<Lease>,
}

/// A fixed-capacity memory budget.
///
/// Every allocation served from an arena is represented by a [`Lease`] that
/// gives its bytes back when dropped. [`Arena::reset`] reclaims everything at
/// once; leases issued before the reset become inert so nothing is returned
/// twice.
#[derive(Debug, Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        Self::with_backing(label.into(), capacity, None)
    }

    fn with_backing(label: String, capacity: usize, backing: Option<Lease>) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                label,
                capacity,
                used: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                _backing: backing,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn usage(&self) -> ArenaUsage {
        ArenaUsage {
            capacity: self.inner.capacity,
            used: self.inner.used.load(Ordering::Acquire),
            allocations: self.inner.allocations.load(Ordering::Acquire),
        }
    }

    /// Charges `bytes` against the arena, or returns `None` if it would
    /// overflow.
    pub fn reserve(&self, bytes: usize) -> Option<Lease> {
        let inner = &self.inner;
        let reserved = inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= inner.capacity)
            });

        if let Err(used) = reserved {
            debug!(
                "arena '{}' exhausted: requested {} bytes with {}/{} in use",
                inner.label, bytes, used, inner.capacity
            );
            return None;
        }

        inner.allocations.fetch_add(1, Ordering::AcqRel);
        Some(Lease {
            arena: Arc::clone(inner),
            bytes,
            generation: inner.generation.load(Ordering::Acquire),
        })
    }

    pub fn allocate_block(&self, bytes: usize) -> Option<Block> {
        let lease = self.reserve(bytes)?;
        Some(Block {
            data: vec![0; bytes].into_boxed_slice(),
            lease,
        })
    }

    pub fn block_from_slice(&self, bytes: &[u8]) -> Option<Block> {
        let mut block = self.allocate_block(bytes.len())?;
        block.copy_from_slice(bytes);
        Some(block)
    }

    /// Carves a child arena of `capacity` bytes out of this one. The region
    /// stays charged here until the child and all its clones are dropped.
    pub fn carve(&self, label: impl Into<String>, capacity: usize) -> Option<Arena> {
        let lease = self.reserve(capacity)?;
        Some(Self::with_backing(label.into(), capacity, Some(lease)))
    }

    /// Releases every outstanding allocation at once.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.used.store(0, Ordering::Release);
        self.inner.allocations.store(0, Ordering::Release);
    }
}

/// Bytes charged to an arena, returned on drop unless the arena was reset in
/// the meantime.
pub struct Lease {
    arena: Arc<ArenaInner>,
    bytes: usize,
    generation: u64,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("arena", &self.arena.label)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.arena.generation.load(Ordering::Acquire) == self.generation {
            self.arena.used.fetch_sub(self.bytes, Ordering::AcqRel);
            self.arena.allocations.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A byte buffer allocated from an arena.
pub struct Block {
    data: Box<[u8]>,
    lease: Lease,
}

impl Block {
    pub fn belongs_to(&self, arena: &Arena) -> bool {
        Arc::ptr_eq(&self.lease.arena, &arena.inner)
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("arena", &self.lease.arena.label)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fails_past_capacity() {
        let arena = Arena::new("test", 100);
        let a = arena.reserve(60).unwrap();
        assert!(arena.reserve(50).is_none());
        let b = arena.reserve(40).unwrap();

        assert_eq!(arena.usage().used, 100);
        assert_eq!(arena.usage().allocations, 2);
        assert_eq!(arena.usage().available(), 0);

        drop(a);
        drop(b);
        assert_eq!(arena.usage(), ArenaUsage {
            capacity: 100,
            used: 0,
            allocations: 0
        });
    }

    #[test]
    fn reset_reclaims_everything_once() {
        let arena = Arena::new("test", 100);
        let stale = arena.reserve(80).unwrap();
        let block = arena.allocate_block(10).unwrap();

        arena.reset();
        assert_eq!(arena.usage().used, 0);

        let fresh = arena.reserve(90).unwrap();
        drop(stale);
        drop(block);
        assert_eq!(arena.usage().used, 90);
        assert_eq!(arena.usage().allocations, 1);

        drop(fresh);
        assert_eq!(arena.usage().used, 0);
    }

    #[test]
    fn carved_arena_holds_parent_budget() {
        let root = Arena::new("root", 1000);
        let child = root.carve("child", 600).unwrap();
        assert!(root.carve("other", 600).is_none());
        assert_eq!(root.usage().used, 600);

        let block = child.allocate_block(600).unwrap();
        assert!(child.allocate_block(1).is_none());
        assert!(block.belongs_to(&child));
        assert!(!block.belongs_to(&root));

        drop(block);
        drop(child);
        assert_eq!(root.usage().used, 0);
    }

    #[test]
    fn block_copies_contents() {
        let arena = Arena::new("test", 16);
        let block = arena.block_from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(&*block, &[1, 2, 3]);
        assert!(arena.block_from_slice(&[0; 14]).is_none());
    }
}
