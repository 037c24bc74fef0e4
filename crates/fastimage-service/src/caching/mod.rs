//! # The two-tier resource cache
//!
//! Fetched resources are cached in two layers:
//!
//! - A bounded in-memory layer holding decoded resources, evicting the least recently touched
//!   entry once it is full. Entries expire after a maximum age and, optionally, after a maximum
//!   time without being read.
//! - An optional disk layer that persists the raw bytes each resource was decoded from, one file
//!   per key, named by a non-reversible transform of the key (see [`file_name_for_key`]).
//!
//! A lookup goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it checks the recency ring, which keeps recently read resources alive after the
//!   memory layer evicted them, and re-admits them.
//! - On miss, it loads the record from disk, decodes it and admits it into memory. Records that
//!   fail to decode are deleted, so that the resource is fetched again.
//!
//! Writes decode the raw bytes right away and then persist them to disk in the background.
//! An entry with a pending write is never evicted from memory before the write completed.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by the in-memory layer, tagged with whether the entry
//!   came back from the recency ring.
//! - `caches.file.hit` / `caches.file.miss`: Lookups that reached the disk layer.
//! - `caches.file.corrupt`: Records that failed to decode and were removed.
//! - `caches.file.write`: Records written to disk.
//! - `caches.file.size`: A histogram of the size (in bytes) of records read or written.
//! - `caches.memory.evicted`: Entries evicted from memory due to capacity.
//!
//! ### Configuration
//!
//! The disk layer is gated by the [`Config::cache_dir`] option together with
//! [`CacheConfigs::persist_to_disk`]. Without it, the cache is purely in-memory and
//! invalidation and clearing skip the filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::{CacheConfigs, Config};
use crate::utils::defer::defer;

mod cache_error;
mod cache_key;
mod fs;
mod memory;
mod recency;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{file_name_for_key, file_name_prefix, safe_file_name};

use fs::DiskTier;
use memory::{Lookup, MemoryTier};
use recency::RecencyRing;

/// Turns the raw bytes of a resource into the resource itself.
///
/// The decoder is used both for freshly fetched bytes and for records read from disk.
pub trait Decoder: Send + Sync + 'static {
    /// The decoded resource type.
    type Resource: Send + Sync + 'static;

    /// Decodes `bytes`, failing with [`CacheError::DecodeError`] on undecodable input.
    fn decode(&self, bytes: &[u8]) -> CacheContents<Self::Resource>;
}

/// A resource kept alive by the recency ring.
#[derive(Debug)]
struct RingValue<R> {
    resource: Arc<R>,
    created: Instant,
}

impl<R> Clone for RingValue<R> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            created: self.created,
        }
    }
}

/// The cache, keyed by resource URL.
///
/// All methods except [`flush`](Self::flush) are synchronous. Lookups may read from disk, so
/// they should not be called from an async context that must not block, except when the
/// caller opted into that trade-off.
pub struct TwoTierCache<D: Decoder> {
    decoder: D,
    memory: Arc<MemoryTier<D::Resource>>,
    ring: Mutex<RecencyRing<RingValue<D::Resource>>>,
    disk: Option<Arc<DiskTier>>,
    /// The runtime that write-throughs are spawned on.
    ///
    /// Without a runtime, writes happen inline.
    runtime: Option<Handle>,
    next_write_id: AtomicU64,
    /// The number of write-throughs in progress.
    pending_writes: Arc<watch::Sender<usize>>,
}

impl<D: Decoder> std::fmt::Debug for TwoTierCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("capacity", &self.memory.capacity())
            .field("len", &self.memory.len())
            .field("recently_read", &self.ring().len())
            .field("cache_dir", &self.disk.as_ref().map(|disk| disk.dir()))
            .finish()
    }
}

impl<D: Decoder> TwoTierCache<D> {
    /// Creates a cache with the given configuration.
    ///
    /// A `cache_dir` enables the disk tier, the directory is created if it does not exist.
    pub fn new(decoder: D, config: &CacheConfigs, cache_dir: Option<&Path>) -> io::Result<Self> {
        let max_age = config.ttl();
        let disk = match cache_dir {
            Some(dir) => Some(Arc::new(DiskTier::new(dir, max_age)?)),
            None => None,
        };
        let (pending_writes, _) = watch::channel(0);

        Ok(Self {
            decoder,
            memory: Arc::new(MemoryTier::new(
                config.in_memory_capacity,
                max_age,
                config.max_unused_for,
            )),
            ring: Mutex::new(RecencyRing::new(config.recency_ring_size)),
            disk,
            runtime: Handle::try_current().ok(),
            next_write_id: AtomicU64::new(0),
            pending_writes: Arc::new(pending_writes),
        })
    }

    pub fn from_config(decoder: D, config: &Config) -> io::Result<Self> {
        Self::new(decoder, &config.caches, config.disk_cache_dir())
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    fn ring(&self) -> MutexGuard<'_, RecencyRing<RingValue<D::Resource>>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key` in memory first, and on disk afterwards.
    ///
    /// A resource found on disk is admitted into memory. Unreadable or undecodable records are
    /// removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<D::Resource>> {
        metric!(counter("caches.access") += 1);
        if let Some(resource) = self.get_from_memory(key) {
            return Some(resource);
        }
        let disk = self.disk.as_deref()?;
        self.get_from_disk(disk, key)
    }

    /// Looks up `key` without touching the disk.
    pub fn get_from_memory(&self, key: &str) -> Option<Arc<D::Resource>> {
        match self.memory.get(key) {
            Lookup::Hit(resource, created) => {
                tracing::trace!("Memory hit for `{}`", key);
                metric!(counter("caches.memory.hit") += 1, "ring" => "false");
                self.ring().touch(
                    key,
                    &RingValue {
                        resource: resource.clone(),
                        created,
                    },
                );
                return Some(resource);
            }
            Lookup::Expired => {
                tracing::trace!("Memory entry for `{}` expired", key);
                self.memory.remove_if_expired(key);
                self.ring().retain(|entry| &*entry.key != key);
                return None;
            }
            Lookup::Miss => {}
        }

        // The entry was evicted from memory while it was still being read.
        let (key, value) = {
            let mut ring = self.ring();
            let (ring_key, value, read_at) = ring
                .get(key)
                .map(|entry| (entry.key.clone(), entry.value.clone(), entry.read_at))?;
            if self.memory.is_expired(value.created, read_at) {
                ring.retain(|entry| &*entry.key != key);
                return None;
            }
            ring.touch(key, &value);
            (ring_key, value)
        };
        tracing::trace!("Re-admitting `{}` from the recency ring", key);
        metric!(counter("caches.memory.hit") += 1, "ring" => "true");
        Some(self.memory.insert_if_absent(key, value.resource, value.created))
    }

    fn get_from_disk(&self, disk: &DiskTier, key: &str) -> Option<Arc<D::Resource>> {
        // Held until the resource is admitted into memory, so that a concurrent invalidation
        // cannot be undone by this read.
        let _guard = disk.shared();
        let record = match disk.read(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::trace!("Disk miss for `{}`", key);
                metric!(counter("caches.file.miss") += 1);
                return None;
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %disk.path_for(key).display(),
                    "Failed to read record",
                );
                return None;
            }
        };

        match self.decoder.decode(&record.contents) {
            Ok(resource) => {
                tracing::trace!("Disk hit for `{}`", key);
                metric!(counter("caches.file.hit") += 1);
                metric!(time_raw("caches.file.size") = record.contents.len() as u64, "hit" => "true");
                let created = Instant::now()
                    .checked_sub(record.age)
                    .unwrap_or_else(Instant::now);
                let resource =
                    self.memory
                        .insert_if_absent(Arc::from(key), Arc::new(resource), created);
                self.ring().touch(
                    key,
                    &RingValue {
                        resource: resource.clone(),
                        created,
                    },
                );
                Some(resource)
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %disk.path_for(key).display(), "Removing corrupt record");
                metric!(counter("caches.file.corrupt") += 1);
                if let Err(e) = disk.remove(key) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Failed to remove corrupt record",
                    );
                }
                None
            }
        }
    }

    /// Decodes `raw` and caches the resulting resource under `key`.
    ///
    /// The raw bytes are persisted to disk in the background. Nothing is cached if decoding
    /// fails.
    pub fn put(&self, key: &str, raw: Bytes) -> CacheContents<Arc<D::Resource>> {
        if key.is_empty() {
            return Err(CacheError::InvalidRequest);
        }
        let resource = match self.decoder.decode(&raw) {
            Ok(resource) => Arc::new(resource),
            Err(err) => {
                tracing::debug!(error = %err, "Failed to decode `{}`", key);
                return Err(match err {
                    CacheError::DecodeError(_) => err,
                    other => CacheError::DecodeError(other.to_string()),
                });
            }
        };
        self.store(key, resource.clone(), Some(raw));
        Ok(resource)
    }

    /// Caches an already decoded resource under `key`.
    ///
    /// The resource is only persisted if its raw bytes are provided.
    pub fn put_decoded(&self, key: &str, resource: Arc<D::Resource>, raw: Option<Bytes>) {
        if key.is_empty() {
            return;
        }
        self.store(key, resource, raw);
    }

    fn store(&self, key: &str, resource: Arc<D::Resource>, raw: Option<Bytes>) {
        let key: Arc<str> = Arc::from(key);
        let created = Instant::now();
        // The ring must not hand out a resource older than the one cached now.
        self.ring().retain(|entry| entry.key != key);

        match (&self.disk, raw) {
            (Some(disk), Some(raw)) => {
                let write_id = self.next_write_id.fetch_add(1, Ordering::Relaxed);
                self.memory.insert(
                    key.clone(),
                    resource,
                    Some(raw.clone()),
                    created,
                    Some(write_id),
                );
                self.spawn_write(disk.clone(), key, raw, write_id);
            }
            _ => self.memory.insert(key, resource, None, created, None),
        }
    }

    fn spawn_write(&self, disk: Arc<DiskTier>, key: Arc<str>, raw: Bytes, write_id: u64) {
        let memory = self.memory.clone();
        let pending_writes = self.pending_writes.clone();
        pending_writes.send_modify(|n| *n += 1);

        let write = move || {
            let _done = defer(|| pending_writes.send_modify(|n| *n -= 1));
            write_through(&memory, &disk, &key, &raw, write_id);
        };
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(write);
            }
            None => write(),
        }
    }

    /// Waits for all write-throughs that are currently in progress.
    pub async fn flush(&self) {
        let mut pending_writes = self.pending_writes.subscribe();
        // The sender lives as long as `self`.
        let _ = pending_writes.wait_for(|n| *n == 0).await;
    }

    /// Removes `key` from both tiers.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let _guard = self.disk.as_deref().map(DiskTier::exclusive);
        let mut removed = self.memory.remove(key);
        self.ring().retain(|entry| &*entry.key != key);

        if let Some(disk) = &self.disk {
            match disk.remove(key) {
                Ok(on_disk) => removed |= on_disk,
                Err(e) => tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to remove record of `{}`",
                    key
                ),
            }
        }
        removed
    }

    /// Removes every key starting with `prefix` from memory, and every record whose file name
    /// starts with the derived file name of `prefix` from disk.
    ///
    /// Pending writes for affected keys are abandoned. Returns the number of removed memory
    /// entries.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let _guard = self.disk.as_deref().map(DiskTier::exclusive);
        let removed = self.memory.remove_prefix(prefix);
        self.ring().retain(|entry| !entry.key.starts_with(prefix));
        tracing::debug!("Invalidated {} entries with prefix `{}`", removed, prefix);

        if let Some(disk) = &self.disk {
            match disk.remove_prefix(prefix) {
                Ok(files) => tracing::debug!("Removed {} records with prefix `{}`", files, prefix),
                Err(e) => tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to invalidate records with prefix `{}`",
                    prefix
                ),
            }
        }
        removed
    }

    /// Drops all entries from memory, and all records from disk if `also_disk` is set.
    ///
    /// Without `also_disk`, pending writes still land on disk.
    pub fn clear(&self, also_disk: bool) {
        let disk = self.disk.as_deref().filter(|_| also_disk);
        let _guard = disk.map(DiskTier::exclusive);
        self.memory.clear(also_disk);
        self.ring().clear();

        if let Some(disk) = disk {
            match disk.clear() {
                Ok(files) => tracing::debug!("Removed {} records", files),
                Err(e) => tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to clear records",
                ),
            }
        }
    }

    /// Removes expired entries from memory and expired records from disk.
    ///
    /// Returns the number of removed records.
    pub fn cleanup(&self) -> io::Result<usize> {
        let entries = self.memory.remove_expired();
        tracing::debug!("Removed {} expired entries from memory", entries);
        self.ring()
            .retain(|entry| !self.memory.is_expired(entry.value.created, entry.read_at));

        match &self.disk {
            Some(disk) => disk.cleanup(),
            None => Ok(0),
        }
    }

    /// Whether `key` is cached in memory.
    pub fn contains_key_in_memory(&self, key: &str) -> bool {
        self.memory.contains_key(key)
    }

    /// Whether `key` is cached in memory or has a live record on disk.
    pub fn contains_key(&self, key: &str) -> bool {
        self.contains_key_in_memory(key)
            || self.disk.as_ref().is_some_and(|disk| disk.contains(key))
    }

    /// The keys currently held in memory, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.memory.keys().iter().map(|key| key.to_string()).collect()
    }

    /// The number of entries currently held in memory.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The path `key` is persisted to, if the disk tier is enabled.
    pub fn cache_file_path(&self, key: &str) -> Option<PathBuf> {
        self.disk.as_ref().map(|disk| disk.path_for(key))
    }

    /// The root directory of the disk tier, if enabled.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.disk.as_deref().map(DiskTier::dir)
    }

    /// Changes how many recently read entries are kept alive beyond the memory capacity.
    ///
    /// The ring forgets its history when the size actually changes.
    pub fn set_recency_capacity(&self, capacity: usize) {
        if self.ring().resize(capacity) {
            tracing::debug!("Resized recency ring to {}", capacity);
        }
    }

    pub fn recency_capacity(&self) -> usize {
        self.ring().capacity()
    }
}

/// Persists `raw` as the record of `key`, unless the write was superseded or invalidated.
fn write_through<R>(
    memory: &MemoryTier<R>,
    disk: &DiskTier,
    key: &str,
    raw: &[u8],
    write_id: u64,
) {
    let _unpin = defer(|| memory.finish_write(key, write_id));
    if !memory.is_current_write(key, write_id) {
        return;
    }

    let result = disk.write_tempfile(raw).and_then(|temp_file| {
        let _guard = disk.shared();
        if !memory.is_current_write(key, write_id) {
            tracing::trace!("Dropping superseded write of `{}`", key);
            return Ok(false);
        }
        disk.persist(key, temp_file).map(|()| true)
    });

    match result {
        Ok(true) => {
            metric!(counter("caches.file.write") += 1);
            metric!(time_raw("caches.file.size") = raw.len() as u64, "hit" => "false");
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %disk.path_for(key).display(),
                "Failed to write record",
            );
        }
    }
}
