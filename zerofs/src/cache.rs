//! Bounded LRU cache of file bodies on local disk.
//!
//! Bodies live at `dir/<object id>`. The index doubles as the touch
//! order: it is an unbounded [`LruCache`] and the byte quota is enforced
//! by hand so that pinned (dirty, upload pending) entries can be skipped
//! during eviction.

use lru::LruCache;
use parking_lot::Mutex;
use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("no cached file with id {id}")]
    NotFound { id: String },
    #[error("no such directory {path}")]
    MissingDir { path: PathBuf },
    #[error("cache size must be positive")]
    InvalidQuota,
    #[error("cache full: every entry is waiting on an upload")]
    NoSpace,
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug)]
struct Entry {
    len: u64,
    pinned: bool,
}

#[derive(Debug)]
struct Index {
    entries: LruCache<String, Entry>,
    used: u64,
}

#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    quota: u64,
    index: Mutex<Index>,
}

impl DiskCache {
    /// Open a cache rooted at `dir` with a byte quota. Fails if the
    /// directory does not exist or the quota is zero. Files left behind
    /// by a previous run are re-admitted, oldest access first, so the
    /// LRU end lines up with the least recently used body.
    pub fn new(dir: impl AsRef<Path>, quota: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(CacheError::MissingDir { path: dir });
        }
        if quota == 0 {
            return Err(CacheError::InvalidQuota);
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            // many filesystems ignore atime; fall back to mtime
            let atime = meta.accessed().or_else(|_| meta.modified())?;
            found.push((atime, name.to_string(), meta.len()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut index = Index {
            entries: LruCache::unbounded(),
            used: 0,
        };
        for (_, id, len) in found {
            index.used += len;
            index.entries.put(id, Entry { len, pinned: false });
        }

        let cache = Self {
            dir,
            quota,
            index: Mutex::new(index),
        };
        // a previous run may have left more behind than the quota allows
        cache.evict(&mut cache.index.lock())?;
        Ok(cache)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.lock().entries.peek(id).is_some()
    }

    /// Total bytes currently accounted against the quota.
    pub fn used(&self) -> u64 {
        self.index.lock().used
    }

    /// Write a body to disk and index it, then enforce the quota.
    pub fn add(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.insert(id, bytes, false)
    }

    /// Like [`add`](Self::add), but the entry is skipped by eviction
    /// until it is deleted or overwritten clean. Fails with
    /// [`CacheError::NoSpace`] when the quota cannot be met by evicting
    /// unpinned entries.
    pub fn add_pinned(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.insert(id, bytes, true)
    }

    /// Mark a pinned entry clean again, making it eligible for eviction.
    /// Idempotent; unknown ids are ignored. Does not touch the LRU order.
    pub fn unpin(&self, id: &str) {
        let mut guard = self.index.lock();
        if let Some(entry) = guard.entries.peek_mut(id) {
            entry.pinned = false;
        }
    }

    /// Overwrite part of an existing body starting at `offset`, returning
    /// the number of bytes written.
    pub fn update(&self, id: &str, data: &[u8], offset: u64) -> Result<usize> {
        let mut guard = self.index.lock();
        let index = &mut *guard;
        if index.entries.peek(id).is_none() {
            return Err(CacheError::NotFound { id: id.to_string() });
        }

        let mut file = fs::OpenOptions::new().write(true).open(self.body_path(id))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        let len = file.metadata()?.len();

        // get() bumps the entry to the most recently used end
        if let Some(entry) = index.entries.get_mut(id) {
            index.used = index.used - entry.len + len;
            entry.len = len;
        }
        self.evict(index)?;
        Ok(data.len())
    }

    /// Read `size` bytes of a body starting at `offset`; `None` reads to
    /// the end.
    pub fn get(&self, id: &str, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        let mut guard = self.index.lock();
        if guard.entries.get(id).is_none() {
            return Err(CacheError::NotFound { id: id.to_string() });
        }

        let mut file = fs::File::open(self.body_path(id))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        match size {
            Some(n) => {
                file.take(n).read_to_end(&mut buf)?;
            }
            None => {
                file.read_to_end(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Drop a body and its index entry. Does not touch the LRU order.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.index.lock();
        let entry = guard
            .entries
            .pop(id)
            .ok_or_else(|| CacheError::NotFound { id: id.to_string() })?;
        guard.used -= entry.len;
        fs::remove_file(self.body_path(id))?;
        Ok(())
    }

    /// Size of the persisted body, straight from the filesystem.
    pub fn file_size(&self, id: &str) -> Result<u64> {
        let guard = self.index.lock();
        if guard.entries.peek(id).is_none() {
            return Err(CacheError::NotFound { id: id.to_string() });
        }
        Ok(fs::metadata(self.body_path(id))?.len())
    }

    fn insert(&self, id: &str, bytes: &[u8], pinned: bool) -> Result<()> {
        let mut guard = self.index.lock();
        let index = &mut *guard;

        self.write_atomic(id, bytes)?;
        let len = bytes.len() as u64;
        if let Some(old) = index.entries.put(id.to_string(), Entry { len, pinned }) {
            index.used -= old.len;
        }
        index.used += len;

        if let Err(e) = self.evict(index) {
            // roll the insertion back so the quota invariant holds
            if let Some(entry) = index.entries.pop(id) {
                index.used -= entry.len;
                let _ = fs::remove_file(self.body_path(id));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Evict from the least recently used end until the quota holds,
    /// skipping pinned entries. A failed unlink leaves the entry indexed
    /// so the next insertion retries it.
    fn evict(&self, index: &mut Index) -> Result<()> {
        while index.used > self.quota {
            let victim = index
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| !entry.pinned)
                .map(|(id, _)| id.clone());
            let Some(id) = victim else {
                return Err(CacheError::NoSpace);
            };

            log::info!(
                "evicting {} to recover {} of {} used bytes",
                id,
                index.used - self.quota,
                index.used
            );
            fs::remove_file(self.body_path(&id))?;
            if let Some(entry) = index.entries.pop(&id) {
                index.used -= entry.len;
            }
        }
        Ok(())
    }

    /// Bodies land under a dot-prefixed temp name first; the startup scan
    /// skips dotfiles, so a crashed write is never indexed.
    fn write_atomic(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{id}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.body_path(id))?;
        Ok(())
    }

    fn body_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_cache(quota: u64) -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), quota).unwrap();
        (dir, cache)
    }

    #[test]
    fn invalid_cache_dir() {
        let err = DiskCache::new("/not/a/real/path", 100).unwrap_err();
        assert!(matches!(err, CacheError::MissingDir { .. }));
    }

    #[test]
    fn invalid_quota() {
        let dir = tempfile::tempdir().unwrap();
        let err = DiskCache::new(dir.path(), 0).unwrap_err();
        assert!(matches!(err, CacheError::InvalidQuota));
    }

    #[test]
    fn add_and_contains() {
        let (_dir, cache) = new_cache(5000);
        assert!(!cache.contains("file1"));
        cache.add("file1", b"contents1").unwrap();
        assert!(cache.contains("file1"));
        assert_eq!(cache.used(), 9);
        assert_eq!(cache.file_size("file1").unwrap(), 9);

        cache.add("file2", b"").unwrap();
        assert!(cache.contains("file2"));
        assert_eq!(cache.used(), 9);
    }

    #[test]
    fn lru_eviction() {
        let (_dir, cache) = new_cache(10);
        cache.add("a", b"aaaa").unwrap();
        cache.add("b", b"bbbb").unwrap();
        cache.add("c", b"cccc").unwrap();
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.used(), 8);
    }

    #[test]
    fn get_protects_from_eviction() {
        let (_dir, cache) = new_cache(10);
        cache.add("a", b"aaaa").unwrap();
        cache.add("b", b"bbbb").unwrap();
        cache.get("a", 0, None).unwrap();
        cache.add("c", b"cccc").unwrap();
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn eviction_removes_backing_file() {
        let (dir, cache) = new_cache(4);
        cache.add("a", b"aaaa").unwrap();
        cache.add("b", b"bb").unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let (_dir, cache) = new_cache(10);
        cache.add_pinned("dirty", b"dddd").unwrap();
        cache.add("a", b"aaaa").unwrap();
        cache.add("b", b"bbbb").unwrap();
        // "a" was the only clean candidate
        assert!(cache.contains("dirty"));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn unpin_makes_an_entry_evictable_again() {
        let (_dir, cache) = new_cache(10);
        cache.add_pinned("dirty", b"dddddd").unwrap();
        cache.unpin("dirty");
        cache.unpin("dirty");
        cache.unpin("never-seen");
        cache.add("a", b"aaaaaa").unwrap();
        assert!(!cache.contains("dirty"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn no_space_when_everything_is_pinned() {
        let (_dir, cache) = new_cache(10);
        cache.add_pinned("x", b"xxxxxx").unwrap();
        let err = cache.add_pinned("y", b"yyyyyy").unwrap_err();
        assert!(matches!(err, CacheError::NoSpace));
        // the failed insertion was rolled back
        assert!(!cache.contains("y"));
        assert_eq!(cache.used(), 6);
    }

    #[test]
    fn get_slices() {
        let (_dir, cache) = new_cache(100);
        cache.add("f", b"hello world").unwrap();
        assert_eq!(cache.get("f", 0, None).unwrap(), b"hello world");
        assert_eq!(cache.get("f", 6, None).unwrap(), b"world");
        assert_eq!(cache.get("f", 0, Some(5)).unwrap(), b"hello");
        assert_eq!(cache.get("f", 100, None).unwrap(), b"");
        assert!(matches!(
            cache.get("missing", 0, None),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn update_overwrites_at_offset() {
        let (_dir, cache) = new_cache(100);
        cache.add("f", b"hello world").unwrap();
        assert_eq!(cache.update("f", b"WORLD", 6).unwrap(), 5);
        assert_eq!(cache.get("f", 0, None).unwrap(), b"hello WORLD");
    }

    #[test]
    fn update_extends_and_reaccounts() {
        let (_dir, cache) = new_cache(100);
        cache.add("f", b"abc").unwrap();
        cache.update("f", b"defgh", 3).unwrap();
        assert_eq!(cache.used(), 8);
        assert_eq!(cache.file_size("f").unwrap(), 8);
    }

    #[test]
    fn update_missing_is_not_found() {
        let (_dir, cache) = new_cache(100);
        assert!(matches!(
            cache.update("nope", b"x", 0),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_removes_entry_and_file() {
        let (dir, cache) = new_cache(100);
        cache.add("f", b"data").unwrap();
        cache.delete("f").unwrap();
        assert!(!cache.contains("f"));
        assert_eq!(cache.used(), 0);
        assert!(!dir.path().join("f").exists());
        assert!(matches!(cache.delete("f"), Err(CacheError::NotFound { .. })));
    }

    #[test]
    fn rescans_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::new(dir.path(), 100).unwrap();
            cache.add("a", b"aaaa").unwrap();
            cache.add("b", b"bb").unwrap();
        }
        let cache = DiskCache::new(dir.path(), 100).unwrap();
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        assert_eq!(cache.used(), 6);
    }

    #[test]
    fn quota_enforced_after_every_op() {
        let (_dir, cache) = new_cache(10);
        for (id, body) in [("a", &b"aaaa"[..]), ("b", b"bbbbbb"), ("c", b"cc"), ("d", b"ddddddddd")] {
            cache.add(id, body).unwrap();
            assert!(cache.used() <= 10);
        }
    }
}
