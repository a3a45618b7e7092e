//! Binds the path-based operations layer to the kernel through `fuser`.
//!
//! The kernel speaks inodes; the core speaks paths. This adapter owns
//! the translation table (root is inode 1) and turns every callback
//! into a [`ZeroFs`] call, replying with the error's POSIX code when it
//! fails.

use crate::fs::ZeroFs;
use crate::tree::Attrs;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next: ROOT_INO,
        };
        table.paths.insert(ROOT_INO, String::new());
        table.inos.insert(String::new(), ROOT_INO);
        table
    }

    fn get(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        self.next += 1;
        let ino = self.next;
        self.inos.insert(path.to_string(), ino);
        self.paths.insert(ino, path.to_string());
        ino
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn forget(&mut self, path: &str) {
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn rename(&mut self, old: &str, new: &str) {
        self.forget(new);
        if let Some(ino) = self.inos.remove(old) {
            self.inos.insert(new.to_string(), ino);
            self.paths.insert(ino, new.to_string());
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn kind_of(mode: u32) -> FileType {
    if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}

fn from_time_or_now(t: TimeOrNow) -> f64 {
    match t {
        TimeOrNow::SpecificTime(st) => st
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default(),
        TimeOrNow::Now => crate::unix_now(),
    }
}

fn to_file_attr(ino: u64, attrs: &Attrs) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        atime: to_system_time(attrs.atime),
        mtime: to_system_time(attrs.mtime),
        ctime: to_system_time(attrs.ctime),
        crtime: to_system_time(attrs.ctime),
        kind: kind_of(attrs.mode),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// `fuser` adapter around the operations layer.
pub struct ZeroFuse {
    fs: ZeroFs,
    inodes: InodeTable,
}

impl ZeroFuse {
    pub fn new(fs: ZeroFs) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.inodes.path(parent)?;
        Some(join(&parent, name.to_str()?))
    }
}

impl Filesystem for ZeroFuse {
    fn destroy(&mut self) {
        if let Err(e) = self.fs.shutdown() {
            log::warn!("shutdown failed: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.inodes.get(&path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                let current = self.fs.getattr(&path)?;
                self.fs.chown(
                    &path,
                    uid.unwrap_or(current.uid),
                    gid.unwrap_or(current.gid),
                )?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                let current = self.fs.getattr(&path)?;
                self.fs.utimens(
                    &path,
                    atime.map(from_time_or_now).unwrap_or(current.atime),
                    mtime.map(from_time_or_now).unwrap_or(current.mtime),
                )?;
            }
            self.fs.getattr(&path)
        })();

        match result {
            Ok(attrs) => reply.attr(&TTL, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.create(&path, mode).and_then(|_| self.fs.getattr(&path)) {
            Ok(attrs) => {
                let ino = self.inodes.get(&path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.mkdir(&path, mode).and_then(|_| self.fs.getattr(&path)) {
            Ok(attrs) => {
                let ino = self.inodes.get(&path);
                reply.entry(&TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EINVAL);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old), Some(new)) = (self.child(parent, name), self.child(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&old, &new) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path, flags) {
            Ok(fd) => reply.opened(fd, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.read(&path, offset.max(0) as u64, Some(size as u64)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.write(&path, data, offset.max(0) as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let names = match self.fs.readdir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, name) in names.iter().enumerate().skip(offset.max(0) as usize) {
            let (child_ino, kind) = match name.as_str() {
                "." | ".." => (ino, FileType::Directory),
                child => {
                    let child_path = join(&path, child);
                    match self.fs.getattr(&child_path) {
                        Ok(attrs) => (self.inodes.get(&child_path), kind_of(attrs.mode)),
                        Err(_) => continue,
                    }
                }
            };
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let (bsize, blocks, bavail) = self.fs.statfs();
        reply.statfs(blocks, bavail, bavail, 0, 0, bsize, 255, bsize);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(path), Some(name)) = (self.inodes.path(ino), name.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.setxattr(&path, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let (Some(path), Some(name)) = (self.inodes.path(ino), name.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getxattr(&path, name) {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if value.len() as u32 <= size => reply.data(&value),
            Ok(_) => reply.error(libc::ERANGE),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.listxattr(&path) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() as u32 <= size {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(path), Some(name)) = (self.inodes.path(ino), name.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .fs
            .create(&path, mode)
            .and_then(|fd| self.fs.getattr(&path).map(|attrs| (fd, attrs)))
        {
            Ok((fd, attrs)) => {
                let ino = self.inodes.get(&path);
                reply.created(&TTL, &to_file_attr(ino, &attrs), 0, fd, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
