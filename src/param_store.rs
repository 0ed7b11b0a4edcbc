//! Typed shared parameter store.
//!
//! A sharded key→value map modules use to pass data across dependency
//! edges. Every entry remembers the `TypeId` it was written under; reading
//! with a different type fails with [`ParamError::TypeMismatch`] instead of
//! handing back garbage.
//!
//! Sharding is delegated to `DashMap` with an explicit power-of-two shard
//! count: each shard sits behind its own reader-writer lock, keys are
//! hash-routed to shards, readers on different shards proceed concurrently,
//! and writers are exclusive per shard. There is no cross-shard atomicity.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::error::ParamError;

/// Default shard count when none is requested.
const DEFAULT_SHARDS: usize = 16;

struct ParamEntry {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

/// Sharded, type-checked key→value store shared by all modules of a
/// workflow.
///
/// Values are held behind `Arc`, so [`get`](ParamStore::get) hands out a
/// shared handle that stays valid after the entry is replaced or erased.
pub struct ParamStore {
    entries: DashMap<String, ParamEntry, FxBuildHasher>,
}

impl ParamStore {
    /// Store with the default shard count (16).
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Store with the smallest power-of-two shard count that is at least
    /// `shard_count` (and at least 2, the minimum the sharded map supports).
    pub fn with_shards(shard_count: usize) -> Self {
        let shards = shard_count.next_power_of_two().max(2);
        Self {
            entries: DashMap::with_hasher_and_shard_amount(FxBuildHasher, shards),
        }
    }

    /// Insert or replace the value under `key`. A previous entry of any
    /// type is overwritten, type tag included.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.set_shared(key, Arc::new(value));
    }

    /// Attach an externally-owned value; the store and the caller share
    /// ownership. Same replace semantics as [`set`](ParamStore::set).
    pub fn set_shared<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.entries.insert(
            key.into(),
            ParamEntry {
                type_id: TypeId::of::<T>(),
                value,
            },
        );
    }

    /// Shared handle to the value under `key`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, ParamError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ParamError::NotFound(key.to_string()))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(ParamError::TypeMismatch(key.to_string()));
        }
        Arc::clone(&entry.value)
            .downcast::<T>()
            .map_err(|_| ParamError::TypeMismatch(key.to_string()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn erase(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Run `f` against the value while holding the shard read lock.
    pub fn with_read<T, R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Result<R, ParamError>
    where
        T: Any + Send + Sync,
    {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ParamError::NotFound(key.to_string()))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(ParamError::TypeMismatch(key.to_string()));
        }
        let value = entry
            .value
            .downcast_ref::<T>()
            .ok_or_else(|| ParamError::TypeMismatch(key.to_string()))?;
        Ok(f(value))
    }

    /// Run `f` against the value mutably while holding the shard write lock.
    ///
    /// Mutation goes through `Arc::make_mut`: if handles from earlier
    /// [`get`](ParamStore::get) calls are still alive the value is cloned
    /// first and those handles keep their old snapshot; otherwise it is
    /// mutated in place.
    pub fn with_write<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, ParamError>
    where
        T: Any + Send + Sync + Clone,
    {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| ParamError::NotFound(key.to_string()))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(ParamError::TypeMismatch(key.to_string()));
        }
        // Take the value out so the Arc is not kept alive by the entry
        // itself while make_mut decides whether to clone.
        let raw = std::mem::replace(&mut entry.value, Arc::new(()));
        let mut typed = match raw.downcast::<T>() {
            Ok(typed) => typed,
            Err(raw) => {
                entry.value = raw;
                return Err(ParamError::TypeMismatch(key.to_string()));
            }
        };
        let out = f(Arc::make_mut(&mut typed));
        entry.value = typed;
        Ok(out)
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}
