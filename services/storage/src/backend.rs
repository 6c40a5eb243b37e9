//! Object-style storage backends
//!
//! Partitions are addressed by `/`-separated relative paths. Every backend
//! supports ranged reads so the reader can fetch a footer or a single block
//! without touching the rest of the file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;

// Distinguishes temp files of concurrent writes to the same target.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub trait StorageBackend: Send + Sync {
    /// Store `bytes` at `path`, replacing any existing object. A put is all-or-nothing.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Store `bytes` at `path` only if nothing is there yet. Fails with
    /// `AlreadyExists` otherwise; the check and the store are one atomic step.
    fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn size(&self, path: &str) -> Result<u64, StorageError>;

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError>;

    /// All object paths under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn exists(&self, path: &str) -> Result<bool, StorageError>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).put(path, bytes)
    }

    fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).put_new(path, bytes)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        (**self).size(path)
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        (**self).read_range(path, offset, len)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        (**self).list(prefix)
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        (**self).exists(path)
    }
}

// ── Filesystem ──────────────────────────────────────────────────────

/// Local filesystem backend rooted at a directory.
///
/// Writes go to a uniquely named temp file that is fsynced and then moved
/// into place, so a crash never leaves a half-written partition under its
/// final name and concurrent writes never share a temp file.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn not_found(path: &str, err: io::Error) -> StorageError {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Write `bytes` to a fresh temp file next to `target` and fsync it.
    fn write_temp(target: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let parent = target.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let name = target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(".{name}.{}.{seq}.tmp", std::process::id()));

        let mut file = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        let written = file.write_all(bytes).and_then(|()| file.sync_all());
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(tmp)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else if path.extension().map_or(true, |ext| ext != "tmp") {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let rel: Vec<_> = rel.iter().map(|c| c.to_string_lossy()).collect();
                    out.push(rel.join("/"));
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for FsBackend {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let tmp = Self::write_temp(&target, bytes)?;
        if let Err(err) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let tmp = Self::write_temp(&target, bytes)?;
        // hard_link refuses an existing target, unlike rename.
        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        fs::metadata(self.resolve(path))
            .map(|m| m.len())
            .map_err(|e| Self::not_found(path, e))
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(self.resolve(path)).map_err(|e| Self::not_found(path, e))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(prefix);
        let mut out = Vec::new();
        match self.walk(&dir, &mut out) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        out.sort();
        Ok(out)
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(path).exists())
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A poisoned map still holds consistent objects: puts replace whole values.
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Flip one byte of a stored object. Test helper for corruption handling.
    pub fn corrupt_byte(&self, path: &str, offset: usize) -> bool {
        match self.objects().get_mut(path) {
            Some(bytes) if offset < bytes.len() => {
                bytes[offset] ^= 0xFF;
                true
            }
            _ => false,
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut objects = self.objects();
        if objects.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.objects()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects();
        let bytes = objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.objects().contains_key(path))
    }
}

// ── Instrumented ────────────────────────────────────────────────────

/// Wraps a backend and counts ranged reads.
#[derive(Debug)]
pub struct CountingBackend<B> {
    inner: B,
    read_calls: AtomicU64,
    bytes_read: AtomicU64,
}

impl<B: StorageBackend> CountingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            read_calls: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.read_calls.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
    }
}

impl<B: StorageBackend> StorageBackend for CountingBackend<B> {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.inner.put(path, bytes)
    }

    fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.inner.put_new(path, bytes)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.inner.size(path)
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        let bytes = self.inner.read_range(path, offset, len)?;
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix)
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path)
    }
}
