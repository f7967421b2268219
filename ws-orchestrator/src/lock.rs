//! Striped per-key read/write locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub const DEFAULT_STRIPES: usize = 16;

/// Per-key locks backed by a fixed number of stripes.
///
/// Keys hashing to the same stripe share its lock, so two different
/// workspaces may occasionally serialize. Memory stays bounded by the stripe
/// count no matter how many keys are used.
#[derive(Debug)]
pub struct KeyedLockTable {
    stripes: Vec<Arc<RwLock<()>>>,
}

enum Guard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    All(#[allow(dead_code)] Vec<OwnedRwLockWriteGuard<()>>),
}

/// Held lock; released when dropped.
#[must_use = "the lock is released as soon as the Unlocker is dropped"]
pub struct Unlocker {
    _guard: Guard,
}

impl Unlocker {
    pub fn unlock(self) {}
}

impl Default for KeyedLockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl KeyedLockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1))
            .map(|_| Arc::new(RwLock::new(())))
            .collect();
        Self { stripes }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub(crate) fn stripe_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    fn stripe(&self, key: &str) -> Arc<RwLock<()>> {
        Arc::clone(&self.stripes[self.stripe_index(key)])
    }

    /// Shared lock on `key`'s stripe.
    pub async fn read_lock(&self, key: &str) -> Unlocker {
        Unlocker {
            _guard: Guard::Read(self.stripe(key).read_owned().await),
        }
    }

    /// Exclusive lock on `key`'s stripe.
    pub async fn write_lock(&self, key: &str) -> Unlocker {
        Unlocker {
            _guard: Guard::Write(self.stripe(key).write_owned().await),
        }
    }

    /// Exclusive lock on every stripe, taken in index order.
    pub async fn write_all_lock(&self) -> Unlocker {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(Arc::clone(stripe).write_owned().await);
        }
        Unlocker {
            _guard: Guard::All(guards),
        }
    }
}
