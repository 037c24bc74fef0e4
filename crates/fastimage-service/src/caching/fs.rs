use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use super::cache_key::{file_name_for_key, file_name_prefix};

/// The contents of one record on disk.
#[derive(Debug)]
pub(super) struct DiskRecord {
    pub contents: Vec<u8>,
    /// Time since the record was written.
    pub age: Duration,
}

/// The disk tier of the cache.
///
/// Every key is stored as one flat file in [`dir`](Self::dir) that contains exactly the raw
/// bytes the resource was decoded from. The file's `mtime` is its creation time, which is used
/// for age based expiry because no other filesystem timestamp is reliable across platforms.
///
/// New records are written to a temporary file in a hidden sibling directory first and then
/// atomically moved into place.
#[derive(Debug)]
pub(super) struct DiskTier {
    dir: PathBuf,
    tmp_dir: PathBuf,
    max_age: Option<Duration>,
    /// Serializes moving new records into place against removals.
    ///
    /// Writers hold it shared, prefix invalidation and clearing hold it exclusively.
    lock: RwLock<()>,
}

impl DiskTier {
    pub fn new(dir: &Path, max_age: Option<Duration>) -> io::Result<Self> {
        let tmp_dir = dir.join(".tmp");
        // Temporary files can only be left over from a crash, nobody is going to persist them.
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            dir: dir.to_owned(),
            tmp_dir,
            max_age,
            lock: RwLock::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for_key(key))
    }

    fn is_expired(&self, mtime: SystemTime) -> bool {
        let age = mtime.elapsed().unwrap_or_default();
        self.max_age.is_some_and(|max_age| age > max_age)
    }

    /// Reads the record of `key`.
    ///
    /// Missing and expired records are a miss. Expired records are removed.
    pub fn read(&self, key: &str) -> io::Result<Option<DiskRecord>> {
        let path = self.path_for(key);
        // A record can vanish at any point in between, due to a concurrent removal.
        let record = catch_not_found(|| {
            let metadata = path.metadata()?;
            tracing::trace!("File `{}` length: {}", path.display(), metadata.len());
            let mtime = metadata.modified()?;
            if self.is_expired(mtime) {
                return Ok(None);
            }
            let contents = fs::read(&path)?;
            Ok(Some(DiskRecord {
                contents,
                age: mtime.elapsed().unwrap_or_default(),
            }))
        })?;

        match record {
            Some(Some(record)) => Ok(Some(record)),
            Some(None) => {
                tracing::trace!("Removing expired record `{}`", path.display());
                remove_file(&path)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Whether a live record for `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        let path = self.path_for(key);
        match path.metadata().and_then(|m| m.modified()) {
            Ok(mtime) => !self.is_expired(mtime),
            Err(_) => false,
        }
    }

    /// Writes `contents` into a new temporary file.
    ///
    /// The returned file still has to be [`persist`](Self::persist)ed.
    pub fn write_tempfile(&self, contents: &[u8]) -> io::Result<NamedTempFile> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(contents)?;
        temp_file.flush()?;
        Ok(temp_file)
    }

    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A concurrent `clear` can remove the directories we are operating in, so retry the fs
        // operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    path = %self.tmp_dir.display(),
                    "Failed to create cache directory: {:?}",
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        path = %self.tmp_dir.display(),
                        "Failed to create cache file: {:?}",
                        e
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Atomically moves `temp_file` into place as the record of `key`.
    ///
    /// The caller has to hold the [`shared`](Self::shared) lock.
    pub fn persist(&self, key: &str, mut temp_file: NamedTempFile) -> io::Result<()> {
        let cache_path = self.path_for(key);
        tracing::trace!("Creating record at path {:?}", cache_path.display());

        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.dir) {
                tracing::error!(
                    path = %self.dir.display(),
                    "Failed to create cache directory: {:?}",
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match temp_file.persist(&cache_path) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    temp_file = e.file;
                    let err = e.error;
                    tracing::error!(
                        path = %cache_path.display(),
                        "Failed to persist cache file: {:?}",
                        err
                    );
                    if retries > MAX_RETRIES {
                        return Err(err);
                    }
                    continue;
                }
            }
        }
    }

    /// Removes the record of `key`.
    pub fn remove(&self, key: &str) -> io::Result<bool> {
        remove_file(&self.path_for(key))
    }

    /// Removes every record whose file name starts with the derived name of `prefix`.
    ///
    /// The caller has to hold the [`exclusive`](Self::exclusive) lock.
    pub fn remove_prefix(&self, prefix: &str) -> io::Result<usize> {
        let name_prefix = file_name_prefix(prefix);
        self.remove_records(|path, _| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&name_prefix))
        })
    }

    /// Removes every record.
    ///
    /// The caller has to hold the [`exclusive`](Self::exclusive) lock.
    pub fn clear(&self) -> io::Result<usize> {
        self.remove_records(|_, _| true)
    }

    /// Removes every expired record.
    pub fn cleanup(&self) -> io::Result<usize> {
        tracing::info!("Cleaning up `{}`", self.dir.display());
        let removed = self.remove_records(|_, metadata| {
            metadata
                .modified()
                .is_ok_and(|mtime| self.is_expired(mtime))
        })?;
        tracing::info!("Removed {} expired records", removed);
        metric!(counter("caches.size.files_removed") += removed as i64);
        Ok(removed)
    }

    fn remove_records(
        &self,
        mut matches: impl FnMut(&Path, &fs::Metadata) -> bool,
    ) -> io::Result<usize> {
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.dir))? else {
            tracing::warn!("Directory not found: `{}`", self.dir.display());
            return Ok(0);
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(metadata) = catch_not_found(|| entry.metadata())? else {
                continue;
            };
            // The only directory is the one holding temporary files.
            if metadata.is_dir() || !matches(&path, &metadata) {
                continue;
            }
            match remove_file(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        "Failed to remove cache file: {:?}",
                        e
                    );
                }
            }
        }
        Ok(removed)
    }
}

/// Removes a file, returning whether it existed.
fn remove_file(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(|| fs::remove_file(path))?.is_some())
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
