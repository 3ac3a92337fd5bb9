use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use dashmap::DashMap;
use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

use crate::CacheKey;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file {path} is not a JSON object: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Decoded outputs keyed by `(tool, target)`.
///
/// Entries are only ever upserted; nothing is evicted.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<String>;

    fn put(&self, key: CacheKey, output: String) -> Result<(), CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<CacheKey, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: CacheKey, output: String) -> Result<(), CacheError> {
        self.entries.insert(key, output);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// JSON-file backed cache that survives restarts.
///
/// The file holds one object mapping `"<tool>-<target>"` to output text.
/// Each `put` takes an exclusive lock on `<file>.lock`, re-reads the file,
/// upserts and atomically replaces it, so processes sharing it end up
/// last-writer-wins per key without losing each other's entries.
///
/// `get` re-reads the file whenever its modification time or length has
/// changed since this instance last looked, so writes from other processes
/// become visible without reopening.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    lock_path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

#[derive(Debug, Default)]
struct Snapshot {
    stamp: Option<Stamp>,
    entries: BTreeMap<String, String>,
}

type Stamp = (SystemTime, u64);

impl FileCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        let cache = Self {
            path,
            lock_path: lock_path.into(),
            snapshot: Mutex::new(Snapshot::default()),
        };
        let snapshot = cache.load()?;
        *cache.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn stamp(&self) -> Result<Option<Stamp>, CacheError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some((meta.modified().map_err(|e| self.io_error(e))?, meta.len()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn load(&self) -> Result<Snapshot, CacheError> {
        let stamp = self.stamp()?;
        let entries = read_entries(&self.path)?;
        Ok(Snapshot { stamp, entries })
    }

    /// Brings the in-memory copy up to date if the file changed underneath it.
    fn refresh(&self, snapshot: &mut Snapshot) -> Result<(), CacheError> {
        if self.stamp()? != snapshot.stamp {
            *snapshot = self.load()?;
        }
        Ok(())
    }

    fn lock_file(&self) -> Result<File, CacheError> {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.io_error(e))?;
        lock.lock_exclusive().map_err(|e| self.io_error(e))?;
        Ok(lock)
    }

    fn write_atomically(&self, entries: &BTreeMap<String, String>) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(entries).map_err(|source| CacheError::Format {
            path: self.path.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(json.as_bytes()).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }
}

impl ResultCache for FileCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.refresh(&mut snapshot) {
            warn!("serving stale cache entries: {e}");
        }
        snapshot.entries.get(&key.to_string()).cloned()
    }

    fn put(&self, key: CacheKey, output: String) -> Result<(), CacheError> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let lock = self.lock_file()?;

        let mut on_disk = read_entries(&self.path)?;
        on_disk.insert(key.to_string(), output);
        self.write_atomically(&on_disk)?;

        *snapshot = Snapshot {
            stamp: self.stamp()?,
            entries: on_disk,
        };
        FileExt::unlock(&lock).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn len(&self) -> usize {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.refresh(&mut snapshot) {
            warn!("serving stale cache entries: {e}");
        }
        snapshot.entries.len()
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, String>, CacheError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw).map_err(|source| CacheError::Format {
        path: path.to_path_buf(),
        source,
    })
}
