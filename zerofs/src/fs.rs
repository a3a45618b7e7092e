//! The filesystem operations layer.
//!
//! Binds the directory tree, the disk cache and the task queue into the
//! POSIX-like operation set the FUSE adapter calls. Writes land in the
//! cache immediately and are uploaded in the background after a debounce
//! delay; a burst of writes to one file coalesces into a single upload.
//!
//! Lock discipline: the per-file lock is taken first and held across
//! anything that touches a file's body or object id, including the whole
//! upload. The cache and queue have their own internal locks and no RPC
//! runs under either. The tree lock nests inside the per-file lock.

use crate::{
    cache::{CacheError, DiskCache},
    store::{ObjectStore, StoreError},
    task_queue::{QueueError, TaskQueue},
    tree::{is_local_id, Attrs, Node, Tree, TreeError},
};
use parking_lot::{Mutex, RwLock};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("no such path: {path}")]
    NotFound { path: String },
    #[error("{path} is a directory")]
    IsADirectory { path: String },
    #[error("{path} is not a directory")]
    NotADirectory { path: String },
    #[error("directory {path} is not empty")]
    NotEmpty { path: String },
    #[error("{path} already exists")]
    Exists { path: String },
    #[error("operation not supported")]
    Unsupported,
    #[error("no such attribute: {name}")]
    NoAttr { name: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(target_os = "macos")]
const NO_XATTR: libc::c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const NO_XATTR: libc::c_int = libc::ENODATA;

impl FsError {
    /// The POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound { .. } => libc::ENOENT,
            FsError::IsADirectory { .. } => libc::EISDIR,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::NotEmpty { .. } => libc::ENOTEMPTY,
            FsError::Exists { .. } => libc::EEXIST,
            FsError::Unsupported => libc::EINVAL,
            FsError::NoAttr { .. } => NO_XATTR,
            FsError::Cache(CacheError::NoSpace) => libc::ENOSPC,
            FsError::Cache(_) | FsError::Store(_) | FsError::Queue(_) => libc::EIO,
        }
    }
}

impl From<TreeError> for FsError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound { path } => FsError::NotFound { path },
            TreeError::Exists { path } => FsError::Exists { path },
            TreeError::NotADirectory { path } => FsError::NotADirectory { path },
            TreeError::IsRoot => FsError::Unsupported,
        }
    }
}

/// Mount-time configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Name of the bucket to mount.
    pub bucket: String,
    /// Directory holding cached file bodies.
    pub cache_dir: PathBuf,
    /// Disk cache quota in megabytes.
    pub cache_size_mb: u64,
    /// Background upload workers.
    pub workers: usize,
    /// Debounce between the last write and its upload.
    pub upload_delay: Duration,
}

impl Options {
    pub fn new(bucket: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            cache_dir: cache_dir.into(),
            cache_size_mb: 5000,
            workers: 4,
            upload_delay: Duration::from_secs(5),
        }
    }
}

/// The object name a path maps to: the path without decoration.
fn object_name(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Splice `data` into `body` at `offset`, NUL-padding when the body is
/// shorter than the offset.
fn splice(body: &mut Vec<u8>, data: &[u8], offset: usize) {
    let end = offset + data.len();
    if body.len() < end {
        body.resize(end, 0);
    }
    body[offset..end].copy_from_slice(data);
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    cache: DiskCache,
    tree: RwLock<Tree>,
    /// One mutex per object id, serializing body and id mutations.
    locks: scc::HashMap<String, Arc<Mutex<()>>>,
    bucket_id: String,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("store", &"<dyn ObjectStore>")
            .field("cache", &self.cache)
            .field("tree", &self.tree)
            .field("locks", &self.locks)
            .field("bucket_id", &self.bucket_id)
            .finish()
    }
}

/// Virtual filesystem backed by the object store.
#[derive(Debug)]
pub struct ZeroFs {
    inner: Arc<Inner>,
    queue: TaskQueue,
    upload_delay: Duration,
    next_fd: AtomicU64,
}

impl ZeroFs {
    /// Connect to the bucket, build the directory tree from a full
    /// listing and start the upload workers. Fails fast on an unknown
    /// bucket, a missing cache directory, a zero quota or zero workers.
    pub fn new(store: Arc<dyn ObjectStore>, opts: Options) -> anyhow::Result<Self> {
        let cache = DiskCache::new(&opts.cache_dir, opts.cache_size_mb * 1024 * 1024)?;

        let bucket = store
            .list_buckets()?
            .into_iter()
            .find(|b| b.name == opts.bucket)
            .ok_or(StoreError::NoBucket {
                name: opts.bucket.clone(),
            })?;

        // full listing, one page at a time; startFileName is inclusive so
        // follow-up pages repeat the cursor entry
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut page = store.list_files(
                &bucket.id,
                cursor.as_deref(),
                None,
                crate::LIST_PAGE_SIZE,
                false,
            )?;
            let full_page = page.len() == crate::LIST_PAGE_SIZE;
            if let Some(ref cursor) = cursor {
                if page.first().map(|o| o.name.as_str()) == Some(cursor.as_str()) {
                    page.remove(0);
                }
            }
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|o| o.name.clone());
            objects.extend(page);
            if !full_page {
                break;
            }
        }
        log::info!(
            "mounting bucket {} with {} listed objects",
            opts.bucket,
            objects.len()
        );

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let tree = Tree::from_listing(objects, uid, gid);

        let queue = TaskQueue::new(opts.workers)?;
        queue.start()?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                cache,
                tree: RwLock::new(tree),
                locks: scc::HashMap::default(),
                bucket_id: bucket.id,
            }),
            queue,
            upload_delay: opts.upload_delay,
            next_fd: AtomicU64::new(0),
        })
    }

    /// Stop the background workers, finishing outstanding uploads.
    pub fn shutdown(&self) -> Result<()> {
        if self.queue.is_running() {
            self.queue.stop(true)?;
        }
        Ok(())
    }

    fn alloc_fd(&self) -> u64 {
        self.next_fd.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn schedule_upload(&self, id: &str, path: &str) -> Result<()> {
        let inner = self.inner.clone();
        let path = path.to_string();
        self.queue
            .submit_task(id, self.upload_delay, move || inner.upload_file(&path))?;
        Ok(())
    }

    pub fn getattr(&self, path: &str) -> Result<Attrs> {
        Ok(self.inner.tree.read().find(path)?.attrs())
    }

    /// The directory's entries with `.` and `..` prepended.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.inner.tree.read();
        let dir = tree.find_dir(path)?;
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(dir.children.keys().cloned());
        Ok(names)
    }

    /// Create an empty file and return a descriptor. The descriptor is
    /// advisory; no per-descriptor state is kept.
    pub fn create(&self, path: &str, mode: u32) -> Result<u64> {
        let id = {
            let mut tree = self.inner.tree.write();
            tree.touch(path, mode)?.object_id.clone()
        };
        self.inner.cache.add(&id, &[])?;
        log::debug!("created {path} as {id}");
        Ok(self.alloc_fd())
    }

    pub fn open(&self, path: &str, _flags: i32) -> Result<u64> {
        if !self.inner.tree.read().exists(path) {
            return Err(FsError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(self.alloc_fd())
    }

    /// Read `[offset, offset+size)` of the file, downloading the body on
    /// a cache miss. `size = None` reads to the end.
    pub fn read(&self, path: &str, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        if size == Some(0) {
            return Ok(Vec::new());
        }
        let inner = &self.inner;
        inner.with_file_lock(path, |id| {
            if inner.cache.contains(id) {
                return Ok(inner.cache.get(id, offset, size)?);
            }
            let body = inner.store.download(id)?;
            inner.cache.add(id, &body)?;
            let start = (offset as usize).min(body.len());
            let end = size.map_or(body.len(), |s| (start + s as usize).min(body.len()));
            Ok(body[start..end].to_vec())
        })
    }

    /// There are no symlinks; reading one reads the whole file.
    pub fn readlink(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path, 0, None)
    }

    /// Splice `data` into the file at `offset` and schedule a debounced
    /// upload. Returns the number of bytes written.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        let inner = &self.inner;
        let id = inner.with_file_lock(path, |id| {
            let mut body = inner.current_body(id)?;
            splice(&mut body, data, offset as usize);
            // dirty until the upload re-keys it
            inner.cache.add_pinned(id, &body)?;

            let mut tree = inner.tree.write();
            let file = tree.find_file_mut(path)?;
            file.size = body.len() as u64;
            let now = crate::unix_now();
            file.mtime = now;
            file.ctime = now;
            Ok(id.to_string())
        })?;
        self.schedule_upload(&id, path)?;
        Ok(data.len())
    }

    /// Rewrite the body to exactly `length` bytes, NUL-padded or cut.
    pub fn truncate(&self, path: &str, length: u64) -> Result<()> {
        let inner = &self.inner;
        let id = inner.with_file_lock(path, |id| {
            let mut body = inner.current_body(id)?;
            body.resize(length as usize, 0);
            inner.cache.add_pinned(id, &body)?;

            let mut tree = inner.tree.write();
            let file = tree.find_file_mut(path)?;
            file.size = length;
            let now = crate::unix_now();
            file.mtime = now;
            file.ctime = now;
            Ok(id.to_string())
        })?;
        self.schedule_upload(&id, path)?;
        Ok(())
    }

    /// Remove a file: drop the cached body, delete the remote object
    /// unless the file never left this machine, and detach it from the
    /// tree. Any pending upload is superseded.
    pub fn unlink(&self, path: &str) -> Result<()> {
        {
            let tree = self.inner.tree.read();
            if tree.find(path)?.is_dir() {
                return Err(FsError::IsADirectory {
                    path: path.to_string(),
                });
            }
        }
        let inner = &self.inner;
        let id = inner.with_file_lock(path, |id| {
            let (size, local) = {
                let tree = inner.tree.read();
                let file = tree.find_file(path)?;
                (file.size, file.is_local_only())
            };
            if inner.cache.contains(id) {
                inner.cache.delete(id)?;
            }
            if size > 0 && !local {
                inner.store.delete(id, &object_name(path))?;
            }
            inner.tree.write().rm(path)?;
            inner.locks.remove(id);
            Ok(id.to_string())
        })?;
        self.queue.cancel_task(&id);
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        Ok(self.inner.tree.write().mkdir(path, mode)?)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut tree = self.inner.tree.write();
        if !tree.find_dir(path)?.children.is_empty() {
            return Err(FsError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.rm(path)?;
        Ok(())
    }

    /// Move a file (body-preserving) or an empty directory. Only the
    /// permission bits survive the move.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (src_is_dir, mode) = {
            let tree = self.inner.tree.read();
            let node = tree.find(old)?;
            (node.is_dir(), node.mode())
        };
        let target = {
            let tree = self.inner.tree.read();
            tree.find(new).ok().map(Node::is_dir)
        };
        match target {
            Some(true) => {
                return Err(FsError::IsADirectory {
                    path: new.to_string(),
                })
            }
            // an existing file target is replaced
            Some(false) => self.unlink(new)?,
            None => {}
        }

        if src_is_dir {
            self.rmdir(old)?;
            self.mkdir(new, mode & 0o7777)?;
        } else {
            let body = self.read(old, 0, None)?;
            self.unlink(old)?;
            self.create(new, mode & 0o7777)?;
            self.write(new, &body, 0)?;
        }
        Ok(())
    }

    pub fn symlink(&self, _target: &str, _source: &str) -> Result<()> {
        Err(FsError::Unsupported)
    }

    /// Fixed `(block size, blocks, blocks available)` geometry,
    /// independent of cache state.
    pub fn statfs(&self) -> (u32, u64, u64) {
        (512, 4096, 2048)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.tree.write().find_mut(path)?.chmod(mode);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.inner.tree.write().find_mut(path)?.chown(uid, gid);
        Ok(())
    }

    pub fn utimens(&self, path: &str, atime: f64, mtime: f64) -> Result<()> {
        self.inner.tree.write().find_mut(path)?.set_times(atime, mtime);
        Ok(())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let tree = self.inner.tree.read();
        tree.find(path)?
            .xattrs()
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoAttr {
                name: name.to_string(),
            })
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        self.inner
            .tree
            .write()
            .find_mut(path)?
            .xattrs_mut()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.inner.tree.read();
        Ok(tree.find(path)?.xattrs().keys().cloned().collect())
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        self.inner
            .tree
            .write()
            .find_mut(path)?
            .xattrs_mut()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FsError::NoAttr {
                name: name.to_string(),
            })
    }
}

impl Inner {
    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read(id, |_, l| l.clone()) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        match self.locks.insert(id.to_string(), lock.clone()) {
            Ok(()) => lock,
            // lost the race; take whichever lock won
            Err(_) => self.locks.read(id, |_, l| l.clone()).unwrap_or(lock),
        }
    }

    fn file_id(&self, path: &str) -> Result<String> {
        Ok(self.tree.read().find_file(path)?.object_id.clone())
    }

    /// Run `f` holding the lock of the file at `path`. A concurrent
    /// upload can re-key the object id between the tree read and the
    /// lock acquisition, so acquisition re-validates the id and retries
    /// until it is stable.
    fn with_file_lock<R>(&self, path: &str, mut f: impl FnMut(&str) -> Result<R>) -> Result<R> {
        loop {
            let id = self.file_id(path)?;
            let lock = self.lock_for(&id);
            let _guard = lock.lock();
            if self.file_id(path)? == id {
                return f(&id);
            }
            // re-keyed while we waited; retry against the new id
        }
    }

    /// The file's present body: cached bytes, or a download for files
    /// that have been uploaded before. Local-only files with no cache
    /// entry are empty by definition.
    fn current_body(&self, id: &str) -> Result<Vec<u8>> {
        if self.cache.contains(id) {
            return Ok(self.cache.get(id, 0, None)?);
        }
        if is_local_id(id) {
            return Ok(Vec::new());
        }
        Ok(self.store.download(id)?)
    }

    /// Task body for the debounced upload. Resolves the file by path
    /// again: a rename or delete since submission means there is nothing
    /// to do.
    fn upload_file(&self, path: &str) -> anyhow::Result<()> {
        match self.with_file_lock(path, |id| self.push_object(path, id)) {
            Ok(()) => Ok(()),
            Err(FsError::NotFound { .. }) => {
                log::debug!("{path} vanished before its upload; skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn push_object(&self, path: &str, id: &str) -> Result<()> {
        let body = match self.cache.get(id, 0, None) {
            Ok(body) => body,
            Err(CacheError::NotFound { .. }) => {
                log::debug!("no cached body for {id}; nothing to upload");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let name = object_name(path);
        let remote = self.store.upload(&self.bucket_id, &name, &body)?;
        log::debug!("uploaded {name} ({} bytes) as {}", body.len(), remote.id);

        if !is_local_id(id) {
            // supersede the previous server-side version
            if let Err(e) = self.store.delete(id, &name) {
                log::warn!("could not delete old version {id} of {name}: {e}");
            }
        }

        // re-key the cache to the server-issued id; the entry is clean now
        self.cache.delete(id)?;
        self.cache.add(&remote.id, &body)?;
        {
            let mut tree = self.tree.write();
            if let Ok(file) = tree.find_file_mut(path) {
                file.update(remote.id.clone(), remote.size);
            }
        }
        // the old id is gone from both tree and cache
        self.locks.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::mem::{InMemoryStore, BUCKET_NAME};
    use std::time::Instant;

    const NO_UPLOAD: Duration = Duration::from_secs(600);

    fn mount(upload_delay: Duration) -> (tempfile::TempDir, Arc<InMemoryStore>, ZeroFs) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let mut opts = Options::new(BUCKET_NAME, dir.path());
        opts.upload_delay = upload_delay;
        opts.workers = 2;
        let fs = ZeroFs::new(store.clone(), opts).unwrap();
        (dir, store, fs)
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn unknown_bucket_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let err = ZeroFs::new(store, Options::new("nope", dir.path())).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn mounts_seeded_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.seed("docs/readme.md", b"hello");
        store.seed("docs/guide.md", b"world!");
        store.seed("top.txt", b"t");
        let fs = ZeroFs::new(store, Options::new(BUCKET_NAME, dir.path())).unwrap();

        assert_eq!(
            fs.readdir("").unwrap(),
            vec![".", "..", "docs", "top.txt"]
        );
        assert_eq!(
            fs.readdir("docs").unwrap(),
            vec![".", "..", "guide.md", "readme.md"]
        );
        assert_eq!(fs.getattr("docs/readme.md").unwrap().size, 5);
        assert!(matches!(
            fs.getattr("missing"),
            Err(FsError::NotFound { .. })
        ));
        fs.shutdown().unwrap();
    }

    #[test]
    fn read_downloads_on_miss_then_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let id = store.seed("f.txt", b"remote body");
        let fs = ZeroFs::new(store.clone(), Options::new(BUCKET_NAME, dir.path())).unwrap();

        assert_eq!(fs.read("f.txt", 0, None).unwrap(), b"remote body");
        assert_eq!(fs.read("f.txt", 7, Some(4)).unwrap(), b"body");
        assert_eq!(fs.read("f.txt", 0, Some(0)).unwrap(), b"");

        // second read is served from cache, not the store
        store.delete(&id, "f.txt").unwrap();
        assert_eq!(fs.read("f.txt", 0, None).unwrap(), b"remote body");
        fs.shutdown().unwrap();
    }

    #[test]
    fn write_then_read_is_coherent_before_any_upload() {
        let (_dir, store, fs) = mount(NO_UPLOAD);
        fs.create("f", 0o644).unwrap();
        assert_eq!(fs.write("f", b"hello", 0).unwrap(), 5);
        assert_eq!(fs.read("f", 0, Some(5)).unwrap(), b"hello");
        assert_eq!(fs.getattr("f").unwrap().size, 5);
        // nothing was uploaded
        assert!(store.names().is_empty());
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn writes_splice_and_pad() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.create("f", 0o644).unwrap();
        fs.write("f", b"AAAA", 0).unwrap();
        fs.write("f", b"BB", 4).unwrap();
        assert_eq!(fs.read("f", 0, None).unwrap(), b"AAAABB");

        fs.write("f", b"X", 2).unwrap();
        assert_eq!(fs.read("f", 0, None).unwrap(), b"AAXABB");

        // a write past the end NUL-pads the gap
        fs.write("f", b"Z", 8).unwrap();
        assert_eq!(fs.read("f", 0, None).unwrap(), b"AAXABB\0\0Z");
        assert_eq!(fs.getattr("f").unwrap().size, 9);
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn truncate_cuts_and_pads() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.create("f", 0o644).unwrap();
        fs.write("f", b"hello world", 0).unwrap();
        fs.truncate("f", 5).unwrap();
        assert_eq!(fs.read("f", 0, None).unwrap(), b"hello");
        fs.truncate("f", 8).unwrap();
        assert_eq!(fs.read("f", 0, None).unwrap(), b"hello\0\0\0");
        assert_eq!(fs.getattr("f").unwrap().size, 8);
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn debounced_upload_rekeys_to_server_id() {
        let (_dir, store, fs) = mount(Duration::from_millis(10));
        fs.mkdir("notes", 0o755).unwrap();
        fs.create("notes/today.txt", 0o644).unwrap();
        fs.write("notes/today.txt", b"v1", 0).unwrap();

        assert!(wait_for(Duration::from_secs(10), || {
            store.body_of("notes/today.txt").is_some()
        }));
        assert!(wait_for(Duration::from_secs(10), || {
            !fs.inner.tree.read().find_file("notes/today.txt").unwrap().is_local_only()
        }));
        assert_eq!(store.body_of("notes/today.txt").unwrap(), b"v1");

        let id = fs.inner.file_id("notes/today.txt").unwrap();
        assert!(fs.inner.cache.contains(&id));
        assert_eq!(fs.getattr("notes/today.txt").unwrap().size, 2);
        // the body is still readable through the new id
        assert_eq!(fs.read("notes/today.txt", 0, None).unwrap(), b"v1");
        fs.shutdown().unwrap();
    }

    #[test]
    fn rapid_writes_coalesce_into_one_upload() {
        let (_dir, store, fs) = mount(Duration::from_millis(300));
        fs.create("f", 0o644).unwrap();
        for i in 0..5u8 {
            fs.write("f", &[b'a' + i], i as u64).unwrap();
        }
        assert!(wait_for(Duration::from_secs(10), || {
            store.body_of("f").is_some()
        }));
        assert_eq!(store.body_of("f").unwrap(), b"abcde");
        // every superseded upload was skipped; only one object version exists
        assert_eq!(store.names(), vec!["f"]);
        fs.shutdown().unwrap();
    }

    #[test]
    fn unlink_local_only_never_calls_the_store() {
        let (_dir, store, fs) = mount(NO_UPLOAD);
        fs.create("f", 0o644).unwrap();
        fs.write("f", b"data", 0).unwrap();
        fs.unlink("f").unwrap();
        assert!(matches!(fs.getattr("f"), Err(FsError::NotFound { .. })));
        assert!(store.deleted().is_empty());
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn unlink_uploaded_file_deletes_remote() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let id = store.seed("f", b"body");
        let fs = ZeroFs::new(store.clone(), Options::new(BUCKET_NAME, dir.path())).unwrap();

        fs.unlink("f").unwrap();
        assert_eq!(store.deleted(), vec![(id.clone(), "f".to_string())]);
        assert!(!fs.inner.cache.contains(&id));
        fs.shutdown().unwrap();
    }

    #[test]
    fn unlink_refuses_directories() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.mkdir("d", 0o755).unwrap();
        assert!(matches!(fs.unlink("d"), Err(FsError::IsADirectory { .. })));
        fs.shutdown().unwrap();
    }

    #[test]
    fn rmdir_only_removes_empty_directories() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.mkdir("d", 0o755).unwrap();
        fs.create("d/f", 0o644).unwrap();
        assert!(matches!(fs.rmdir("d"), Err(FsError::NotEmpty { .. })));
        fs.unlink("d/f").unwrap();
        fs.rmdir("d").unwrap();
        assert!(!fs.inner.tree.read().exists("d"));
        fs.shutdown().unwrap();
    }

    #[test]
    fn rename_file_preserves_body() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.create("a", 0o600).unwrap();
        fs.write("a", b"data", 0).unwrap();
        fs.rename("a", "b").unwrap();

        assert!(matches!(fs.getattr("a"), Err(FsError::NotFound { .. })));
        assert_eq!(fs.read("b", 0, None).unwrap(), b"data");
        assert_eq!(fs.getattr("b").unwrap().mode & 0o7777, 0o600);
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn rename_replaces_existing_file_target() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.create("a", 0o644).unwrap();
        fs.write("a", b"new", 0).unwrap();
        fs.create("b", 0o644).unwrap();
        fs.write("b", b"old", 0).unwrap();
        fs.rename("a", "b").unwrap();
        assert_eq!(fs.read("b", 0, None).unwrap(), b"new");
        // workers are still parked on the debounce; dropping the fs detaches them
    }

    #[test]
    fn rename_directory_rules() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.mkdir("full", 0o755).unwrap();
        fs.create("full/f", 0o644).unwrap();
        assert!(matches!(
            fs.rename("full", "elsewhere"),
            Err(FsError::NotEmpty { .. })
        ));
        assert!(fs.inner.tree.read().exists("full/f"));

        fs.mkdir("empty", 0o700).unwrap();
        fs.rename("empty", "moved").unwrap();
        assert!(!fs.inner.tree.read().exists("empty"));
        assert_eq!(fs.getattr("moved").unwrap().mode & 0o7777, 0o700);
        fs.shutdown().unwrap();
    }

    #[test]
    fn symlinks_are_unsupported() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        let err = fs.symlink("target", "source").unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        fs.shutdown().unwrap();
    }

    #[test]
    fn xattrs_are_in_memory_only() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        fs.create("f", 0o644).unwrap();
        assert!(matches!(
            fs.getxattr("f", "user.tag"),
            Err(FsError::NoAttr { .. })
        ));
        fs.setxattr("f", "user.tag", b"blue").unwrap();
        assert_eq!(fs.getxattr("f", "user.tag").unwrap(), b"blue");
        assert_eq!(fs.listxattr("f").unwrap(), vec!["user.tag"]);
        fs.removexattr("f", "user.tag").unwrap();
        assert!(matches!(
            fs.removexattr("f", "user.tag"),
            Err(FsError::NoAttr { .. })
        ));
        fs.shutdown().unwrap();
    }

    #[test]
    fn descriptors_increase_monotonically() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        let a = fs.create("a", 0o644).unwrap();
        let b = fs.open("a", 0).unwrap();
        let c = fs.open("a", 0).unwrap();
        assert!(a < b && b < c);
        assert!(matches!(fs.open("nope", 0), Err(FsError::NotFound { .. })));
        fs.shutdown().unwrap();
    }

    #[test]
    fn statfs_is_fixed() {
        let (_dir, _store, fs) = mount(NO_UPLOAD);
        assert_eq!(fs.statfs(), (512, 4096, 2048));
        fs.shutdown().unwrap();
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(
            FsError::NotFound { path: "x".into() }.errno(),
            libc::ENOENT
        );
        assert_eq!(
            FsError::NotEmpty { path: "x".into() }.errno(),
            libc::ENOTEMPTY
        );
        assert_eq!(FsError::Unsupported.errno(), libc::EINVAL);
        assert_eq!(FsError::Cache(CacheError::NoSpace).errno(), libc::ENOSPC);
        assert_eq!(
            FsError::Cache(CacheError::NotFound { id: "x".into() }).errno(),
            libc::EIO
        );
    }

    #[test]
    fn splice_laws() {
        let mut body = Vec::new();
        splice(&mut body, b"AAAA", 0);
        splice(&mut body, b"BB", 4);
        assert_eq!(body, b"AAAABB");
        let mut body = b"ab".to_vec();
        splice(&mut body, b"Z", 5);
        assert_eq!(body, b"ab\0\0\0Z");
    }
}
