use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One decoded resource held by the memory tier.
#[derive(Debug)]
struct MemoryEntry<R> {
    resource: Arc<R>,
    /// The raw bytes, kept only until the write-through to disk completed.
    raw: Option<Bytes>,
    size_hint: usize,
    created: Instant,
    /// Logical access clock value of the last touch. Used for the LRU order.
    last_tick: AtomicU64,
    /// Nanoseconds since [`MemoryTier::epoch`] of the last touch. Used for idle expiry.
    last_access: AtomicU64,
}

#[derive(Debug)]
struct MemoryState<R> {
    entries: HashMap<Arc<str>, MemoryEntry<R>>,
    /// Keys with a pending write-through, and the id of the write that is allowed to land.
    pending: HashMap<Arc<str>, u64>,
}

/// The result of a memory tier lookup.
#[derive(Debug)]
pub(super) enum Lookup<R> {
    Hit(Arc<R>, Instant),
    Expired,
    Miss,
}

/// The bounded in-memory tier.
///
/// Reads only take a shared lock and record their touch atomically. Eviction removes the least
/// recently touched entry, but never one that still has a pending write to disk. In that case
/// the tier may temporarily hold more than `capacity` entries until the write completes.
#[derive(Debug)]
pub(super) struct MemoryTier<R> {
    capacity: usize,
    max_age: Option<Duration>,
    max_idle: Option<Duration>,
    epoch: Instant,
    clock: AtomicU64,
    state: RwLock<MemoryState<R>>,
}

impl<R> MemoryTier<R> {
    pub fn new(capacity: usize, max_age: Option<Duration>, max_idle: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            max_idle,
            epoch: Instant::now(),
            clock: AtomicU64::new(0),
            state: RwLock::new(MemoryState {
                entries: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState<R>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState<R>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether an entry created at `created` and last touched at `last_access` has expired.
    pub fn is_expired(&self, created: Instant, last_access: Instant) -> bool {
        let now = Instant::now();
        let too_old = self
            .max_age
            .is_some_and(|max_age| now.saturating_duration_since(created) > max_age);
        let unused = self
            .max_idle
            .is_some_and(|max_idle| now.saturating_duration_since(last_access) > max_idle);
        too_old || unused
    }

    fn entry_expired(&self, entry: &MemoryEntry<R>) -> bool {
        let last_access =
            self.epoch + Duration::from_nanos(entry.last_access.load(Ordering::Relaxed));
        self.is_expired(entry.created, last_access)
    }

    /// Looks up `key`, recording a touch on a hit.
    pub fn get(&self, key: &str) -> Lookup<R> {
        let state = self.read();
        let Some(entry) = state.entries.get(key) else {
            return Lookup::Miss;
        };
        if self.entry_expired(entry) {
            return Lookup::Expired;
        }
        entry.last_tick.store(self.tick(), Ordering::Relaxed);
        entry.last_access.store(self.now_nanos(), Ordering::Relaxed);
        Lookup::Hit(entry.resource.clone(), entry.created)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let state = self.read();
        state
            .entries
            .get(key)
            .is_some_and(|entry| !self.entry_expired(entry))
    }

    /// Inserts an entry, replacing any previous entry for the same key.
    ///
    /// With a `write_id`, the key is pinned until [`finish_write`](Self::finish_write) is called
    /// with the same id. A newer write supersedes an older one for the same key.
    pub fn insert(
        &self,
        key: Arc<str>,
        resource: Arc<R>,
        raw: Option<Bytes>,
        created: Instant,
        write_id: Option<u64>,
    ) {
        let mut state = self.write();
        let entry = self.new_entry(resource, raw, created);
        if let Some(write_id) = write_id {
            state.pending.insert(key.clone(), write_id);
        }
        state.entries.insert(key.clone(), entry);
        self.evict(&mut state, Some(&key));
    }

    /// Inserts an entry only when there is no live entry for the key yet.
    ///
    /// Returns the resource that is now cached under `key`.
    pub fn insert_if_absent(&self, key: Arc<str>, resource: Arc<R>, created: Instant) -> Arc<R> {
        let mut state = self.write();
        if let Some(existing) = state.entries.get(&key) {
            if !self.entry_expired(existing) {
                existing.last_tick.store(self.tick(), Ordering::Relaxed);
                return existing.resource.clone();
            }
        }
        let entry = self.new_entry(resource.clone(), None, created);
        state.entries.insert(key.clone(), entry);
        self.evict(&mut state, Some(&key));
        resource
    }

    fn new_entry(&self, resource: Arc<R>, raw: Option<Bytes>, created: Instant) -> MemoryEntry<R> {
        MemoryEntry {
            size_hint: raw.as_ref().map_or(0, Bytes::len),
            resource,
            raw,
            created,
            last_tick: AtomicU64::new(self.tick()),
            last_access: AtomicU64::new(self.now_nanos()),
        }
    }

    /// Evicts least recently touched entries until the tier is within its capacity.
    ///
    /// Stops early when the least recently touched entry is pinned by a pending write.
    fn evict(&self, state: &mut MemoryState<R>, keep: Option<&Arc<str>>) {
        while state.entries.len() > self.capacity {
            let lru = state
                .entries
                .iter()
                .filter(|(key, _)| keep != Some(*key))
                .min_by_key(|(_, entry)| entry.last_tick.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            let Some(lru) = lru else {
                break;
            };
            if state.pending.contains_key(&lru) {
                tracing::trace!("Deferring eviction of `{}` until its write completes", lru);
                break;
            }
            if let Some(entry) = state.entries.remove(&lru) {
                tracing::trace!("Evicting `{}` ({} bytes) from memory", lru, entry.size_hint);
                metric!(counter("caches.memory.evicted") += 1);
            }
        }
    }

    /// Whether the write `write_id` is still the one that should land for `key`.
    pub fn is_current_write(&self, key: &str, write_id: u64) -> bool {
        self.read().pending.get(key) == Some(&write_id)
    }

    /// Unpins `key` after the write `write_id` completed, or was abandoned.
    ///
    /// This drops the raw bytes of the entry and catches up with deferred evictions.
    pub fn finish_write(&self, key: &str, write_id: u64) {
        let mut state = self.write();
        if state.pending.get(key) != Some(&write_id) {
            return;
        }
        state.pending.remove(key);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.raw = None;
        }
        self.evict(&mut state, None);
    }

    /// The raw bytes of `key`, if they are still held.
    #[cfg(test)]
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.read().entries.get(key).and_then(|entry| entry.raw.clone())
    }

    /// Removes `key`, and cancels its pending write.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.write();
        state.pending.remove(key);
        state.entries.remove(key).is_some()
    }

    /// Removes every key starting with `prefix`, and cancels their pending writes.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut state = self.write();
        state.pending.retain(|key, _| !key.starts_with(prefix));
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        before - state.entries.len()
    }

    /// Removes every entry.
    ///
    /// Pending writes still land unless `cancel_writes` is set.
    pub fn clear(&self, cancel_writes: bool) {
        let mut state = self.write();
        if cancel_writes {
            state.pending.clear();
        }
        state.entries.clear();
    }

    /// Removes expired entries, and entries that are only expired by now.
    pub fn remove_expired(&self) -> usize {
        let mut state = self.write();
        let before = state.entries.len();
        let expired: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.entry_expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.entries.remove(&key);
        }
        before - state.entries.len()
    }

    /// Removes `key` if its entry is expired.
    pub fn remove_if_expired(&self, key: &str) {
        let mut state = self.write();
        if state
            .entries
            .get(key)
            .is_some_and(|entry| self.entry_expired(entry))
        {
            state.entries.remove(key);
        }
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        self.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    #[cfg(test)]
    pub fn has_pending_writes(&self) -> bool {
        !self.read().pending.is_empty()
    }
}
