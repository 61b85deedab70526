use rand::{
    Rng, rng,
    seq::{IndexedRandom, SliceRandom},
};
use tracing::debug;

use crate::error::BotError;

pub const DEFAULT_CACHE_LIMIT: usize = 5;
/// Upper bound accepted for a configured cache size.
pub const MAX_CACHE_LIMIT: usize = 1000;

/// A small pool of recently fetched items.
///
/// This is not an LRU: `get` hands out a random member so repeated requests
/// vary, and when the upstream is down any previously fetched item can stand
/// in for a fresh one. The pool appends until it holds more than `capacity`
/// items (so it tops out at `capacity + 1`), after which every new item
/// overwrites a random slot.
///
/// There is no internal locking; share it behind an
/// [`AsyncLock`](crate::lock::AsyncLock).
#[derive(Debug, Clone)]
pub struct BoundedRandomCache<T> {
    kind: &'static str,
    items: Vec<T>,
    capacity: usize,
}

impl<T: Clone> BoundedRandomCache<T> {
    pub fn new(kind: &'static str, capacity: usize) -> Self {
        Self {
            kind,
            items: Vec::new(),
            capacity: capacity.clamp(1, MAX_CACHE_LIMIT),
        }
    }

    /// Stores `item` in the pool and hands it back.
    pub fn cache(&mut self, item: T) -> T {
        debug!(kind = self.kind, size = self.items.len(), "storing item in cache");
        let mut rng = rng();

        if self.items.len() > self.capacity {
            let slot = rng.random_range(0..self.capacity);
            self.items[slot] = item.clone();
        } else {
            self.items.push(item.clone());
        }
        self.items.shuffle(&mut rng);

        item
    }

    /// Returns a uniformly random item from the pool.
    pub fn get(&self) -> Result<T, BotError> {
        debug!(kind = self.kind, size = self.items.len(), "retrieving item from cache");
        self.items
            .choose(&mut rng())
            .cloned()
            .ok_or(BotError::EmptyCache)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.items.contains(item)
    }
}
