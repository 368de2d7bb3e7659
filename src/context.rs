//! Concurrent, type-keyed context store carried through a pipeline.
//!
//! Reads and writes to distinct keys never block each other; writes to
//! the same key are serialized by that key's shard lock. `fork` produces
//! an independent child whose subsequent mutations never affect the
//! parent; `merge` overlays a source context onto a receiver, overwriting
//! on key collision.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::command::CommandMetadata;

const SHARD_COUNT: usize = 16;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(0);

/// An identity-typed key into a [`CommandContext`].
///
/// Two keys are distinct even if they share the same value type `V` and
/// the same `name` — identity comes from a process-wide counter minted at
/// construction time, not from `V`'s `TypeId`, so middleware authors can
/// mint several independent keys of the same type without collisions.
pub struct ContextKey<V> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

// Manual impls: `V` only appears behind `PhantomData<fn() -> V>`, so the
// key is Clone/Copy/Send/Sync regardless of what `V` is.
impl<V> Clone for ContextKey<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for ContextKey<V> {}
unsafe impl<V> Send for ContextKey<V> {}
unsafe impl<V> Sync for ContextKey<V> {}

impl<V: 'static> ContextKey<V> {
    /// Mint a new, globally unique key. `name` is carried for diagnostics
    /// only and plays no role in equality.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    /// Diagnostic name this key was minted with.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn shard_of(id: u64) -> usize {
    (id as usize) % SHARD_COUNT
}

type Shard = RwLock<HashMap<u64, Arc<dyn Any + Send + Sync>>>;

/// The mutable, type-keyed store middleware use to pass data down (and,
/// via the command's own reply channel, back up) the chain.
pub struct CommandContext {
    metadata: CommandMetadata,
    shards: Arc<[Shard; SHARD_COUNT]>,
}

impl CommandContext {
    /// Build a fresh, empty context carrying `metadata`.
    #[must_use]
    pub fn new(metadata: CommandMetadata) -> Self {
        Self {
            metadata,
            shards: Arc::new(std::array::from_fn(|_| RwLock::new(HashMap::new()))),
        }
    }

    /// The immutable metadata this context was built with.
    #[must_use]
    pub fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }

    /// Read a value by key. Returns `None` if unset.
    #[must_use]
    pub fn get<V: Clone + Send + Sync + 'static>(&self, key: ContextKey<V>) -> Option<V> {
        let shard = self.shards[shard_of(key.id)].read();
        shard
            .get(&key.id)
            .and_then(|v| v.downcast_ref::<V>())
            .cloned()
    }

    /// Write a value by key, overwriting any previous value.
    pub fn set<V: Send + Sync + 'static>(&self, key: ContextKey<V>, value: V) {
        let mut shard = self.shards[shard_of(key.id)].write();
        shard.insert(key.id, Arc::new(value));
    }

    /// Remove a value by key, returning it if present.
    pub fn remove<V: Clone + Send + Sync + 'static>(&self, key: ContextKey<V>) -> Option<V> {
        let mut shard = self.shards[shard_of(key.id)].write();
        shard
            .remove(&key.id)
            .and_then(|v| v.downcast_ref::<V>().cloned())
    }

    /// Produce an independent child context seeded with a shallow copy of
    /// every key currently set. The child shares the stored values' `Arc`
    /// pointers with the parent until one side writes; writes always
    /// replace the entry in the writer's own shard map, so the parent and
    /// child never observe each other's subsequent mutations.
    #[must_use]
    pub fn fork(&self) -> Self {
        let shards: [Shard; SHARD_COUNT] = std::array::from_fn(|i| {
            let src = self.shards[i].read();
            RwLock::new(src.clone())
        });
        Self {
            metadata: self.metadata.clone(),
            shards: Arc::new(shards),
        }
    }

    /// Overlay every key from `source` onto `self`, overwriting on
    /// collision. Keys present only in `self` are left untouched.
    pub fn merge(&self, source: &CommandContext) {
        for i in 0..SHARD_COUNT {
            let src = source.shards[i].read();
            if src.is_empty() {
                continue;
            }
            let mut dst = self.shards[i].write();
            for (k, v) in src.iter() {
                dst.insert(*k, Arc::clone(v));
            }
        }
    }

    /// Capture an immutable, point-in-time view of every key currently
    /// set. Implemented the same way `fork` is — a shallow per-shard copy
    /// of the stored `Arc` pointers — but returns a read-only
    /// [`ContextSnapshot`] rather than a mutable sibling context, so later
    /// writes to `self` never show up in an already-taken snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        let shards: [Shard; SHARD_COUNT] = std::array::from_fn(|i| {
            let src = self.shards[i].read();
            RwLock::new(src.clone())
        });
        ContextSnapshot {
            shards: Arc::new(shards),
        }
    }
}

/// A read-only, point-in-time view of a [`CommandContext`]'s contents,
/// captured by [`CommandContext::snapshot`]. Unlike `fork`, a snapshot
/// can't be written to and never observes writes made to the context it
/// was taken from afterward.
pub struct ContextSnapshot {
    shards: Arc<[Shard; SHARD_COUNT]>,
}

impl ContextSnapshot {
    /// Read a value by key as of when this snapshot was taken.
    #[must_use]
    pub fn get<V: Clone + Send + Sync + 'static>(&self, key: ContextKey<V>) -> Option<V> {
        let shard = self.shards[shard_of(key.id)].read();
        shard
            .get(&key.id)
            .and_then(|v| v.downcast_ref::<V>())
            .cloned()
    }

    /// Number of keys set at snapshot time.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether no keys were set at snapshot time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
