//! # Value Cache
//!
//! Latest decoded value per mapped group address. The address set is fixed
//! when the cache is built, so the outer map is never written after
//! construction and each address has its own lock: writers of one address
//! never block readers or writers of another.

use crate::dpt::DatapointValue;
use crate::knx::address::GroupAddress;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

/// The last value seen for one address.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: DatapointValue,
    pub updated_at: SystemTime,
    /// Set once the value is older than the address's `max_age`.
    pub stale: bool,
}

impl CachedValue {
    /// Time since the value was written; zero if the clock went backwards.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.updated_at).unwrap_or_default()
    }
}

/// Cache entry of a single address.
#[derive(Debug)]
pub struct ValueSlot {
    address: GroupAddress,
    max_age: Duration,
    value: RwLock<Option<CachedValue>>,
}

impl ValueSlot {
    pub fn new(address: GroupAddress, max_age: Duration) -> Self {
        ValueSlot {
            address,
            max_age,
            value: RwLock::new(None),
        }
    }

    pub fn address(&self) -> GroupAddress {
        self.address
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    // A panic while holding the lock cannot leave a half-written value behind,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Option<CachedValue>> {
        self.value.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<CachedValue>> {
        self.value.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current entry, `None` if no value was ever seen.
    pub fn get(&self) -> Option<CachedValue> {
        self.read().clone()
    }

    /// Replaces the value. The new timestamp is always later than the previous
    /// one, even if the clock did not advance in between.
    pub fn update(&self, value: DatapointValue) -> CachedValue {
        self.update_at(value, SystemTime::now())
    }

    pub(crate) fn update_at(&self, value: DatapointValue, now: SystemTime) -> CachedValue {
        let mut entry = self.write();
        let updated_at = match entry.as_ref() {
            Some(previous) if now <= previous.updated_at => {
                previous.updated_at + Duration::from_nanos(1)
            }
            _ => now,
        };
        let cached = CachedValue {
            value,
            updated_at,
            stale: false,
        };
        *entry = Some(cached.clone());
        cached
    }

    /// True if there is no value yet or it is at least `max_age` old.
    pub fn needs_refresh(&self, now: SystemTime) -> bool {
        match self.read().as_ref() {
            Some(cached) => cached.age(now) >= self.max_age,
            None => true,
        }
    }

    /// Whether the value is stale at `now`, `None` if no value was ever seen.
    /// Unlike the stored flag this does not wait for the next refresh.
    pub fn stale_at(&self, now: SystemTime) -> Option<bool> {
        self.read()
            .as_ref()
            .map(|cached| cached.stale || cached.age(now) >= self.max_age)
    }

    /// Updates the stale flag against `now`. Returns the new flag.
    pub fn refresh_staleness(&self, now: SystemTime) -> bool {
        let mut entry = self.write();
        match entry.as_mut() {
            Some(cached) => {
                cached.stale = cached.age(now) >= self.max_age;
                cached.stale
            }
            None => false,
        }
    }
}

/// Fixed set of [`ValueSlot`]s keyed by group address.
#[derive(Debug, Default)]
pub struct ValueCache {
    slots: HashMap<GroupAddress, Arc<ValueSlot>>,
}

impl ValueCache {
    /// Creates an empty slot for every `(address, max_age)` pair.
    pub fn new(addresses: impl IntoIterator<Item = (GroupAddress, Duration)>) -> Self {
        ValueCache {
            slots: addresses
                .into_iter()
                .map(|(address, max_age)| (address, Arc::new(ValueSlot::new(address, max_age))))
                .collect(),
        }
    }

    pub fn slot(&self, address: GroupAddress) -> Option<&Arc<ValueSlot>> {
        self.slots.get(&address)
    }

    pub fn get(&self, address: GroupAddress) -> Option<CachedValue> {
        self.slots.get(&address).and_then(|slot| slot.get())
    }

    /// Stores `value` for `address`. Unknown addresses are ignored and yield `None`.
    pub fn update(&self, address: GroupAddress, value: DatapointValue) -> Option<CachedValue> {
        self.slots.get(&address).map(|slot| slot.update(value))
    }

    /// Re-evaluates every stale flag. Returns the number of stale entries.
    pub fn refresh_staleness(&self, now: SystemTime) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.refresh_staleness(now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
