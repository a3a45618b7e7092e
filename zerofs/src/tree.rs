//! In-memory mirror of the bucket namespace.
//!
//! The store keeps a flat list of slash-delimited object names; this
//! module folds it into a conventional hierarchy of [`Node`]s and owns
//! all POSIX metadata. Paths are slash-delimited with leading and
//! trailing slashes stripped; the empty string is the root.

use crate::store::{ObjectKind, RemoteObject};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    #[error("no such path: {path}")]
    NotFound { path: String },
    #[error("{path} already exists")]
    Exists { path: String },
    #[error("{path} is not a directory")]
    NotADirectory { path: String },
    #[error("cannot remove the filesystem root")]
    IsRoot,
}

pub type Result<T> = std::result::Result<T, TreeError>;

const DEFAULT_PERM: u32 = 0o755;

/// A file whose object id is a locally generated UUID has never been
/// uploaded; there is no server-side object behind it.
pub(crate) fn is_local_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// Flattened POSIX metadata for one node, the `st_*` view handed to the
/// FUSE layer.
#[derive(Debug, Clone, Copy)]
pub struct Attrs {
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
}

#[derive(Debug, Clone)]
pub struct File {
    /// Server-issued object id, or a local UUID before the first upload.
    pub object_id: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: f64,
    pub ctime: f64,
    pub atime: f64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl File {
    fn from_remote(obj: &RemoteObject, uid: u32, gid: u32) -> Self {
        Self {
            object_id: obj.id.clone(),
            size: obj.size,
            mode: libc::S_IFREG as u32 | DEFAULT_PERM,
            uid,
            gid,
            mtime: obj.uploaded_at,
            ctime: obj.uploaded_at,
            atime: obj.uploaded_at,
            xattrs: BTreeMap::new(),
        }
    }

    /// A freshly touched file: empty, local-only, with a UUID object id.
    fn local(mode: u32, uid: u32, gid: u32) -> Self {
        let now = crate::unix_now();
        Self {
            object_id: Uuid::new_v4().to_string(),
            size: 0,
            mode: libc::S_IFREG as u32 | (mode & 0o7777),
            uid,
            gid,
            mtime: now,
            ctime: now,
            atime: now,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn is_local_only(&self) -> bool {
        is_local_id(&self.object_id)
    }

    /// Adopt the server's view of the object after a successful upload.
    pub fn update(&mut self, object_id: String, size: u64) {
        self.object_id = object_id;
        self.size = size;
    }

    pub fn attrs(&self) -> Attrs {
        Attrs {
            mode: self.mode,
            size: self.size,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    pub name: String,
    pub children: BTreeMap<String, Node>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: f64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Directory {
    fn new(name: &str, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            name: name.to_string(),
            children: BTreeMap::new(),
            mode: libc::S_IFDIR as u32 | (mode & 0o7777),
            uid,
            gid,
            atime: crate::unix_now(),
            xattrs: BTreeMap::new(),
        }
    }

    /// Newest modification among the children, or the directory's own
    /// atime when it is empty.
    pub fn mtime(&self) -> f64 {
        if self.children.is_empty() {
            return self.atime;
        }
        self.children.values().map(Node::mtime).fold(f64::MIN, f64::max)
    }

    pub fn nlink(&self) -> u32 {
        2 + self.children.values().filter(|c| c.is_dir()).count() as u32
    }

    pub fn attrs(&self) -> Attrs {
        let mtime = self.mtime();
        Attrs {
            mode: self.mode,
            size: 0,
            nlink: self.nlink(),
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime,
            ctime: mtime,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    File(File),
    Directory(Directory),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn mode(&self) -> u32 {
        match self {
            Node::File(f) => f.mode,
            Node::Directory(d) => d.mode,
        }
    }

    fn mtime(&self) -> f64 {
        match self {
            Node::File(f) => f.mtime,
            Node::Directory(d) => d.mtime(),
        }
    }

    pub fn attrs(&self) -> Attrs {
        match self {
            Node::File(f) => f.attrs(),
            Node::Directory(d) => d.attrs(),
        }
    }

    pub fn xattrs(&self) -> &BTreeMap<String, Vec<u8>> {
        match self {
            Node::File(f) => &f.xattrs,
            Node::Directory(d) => &d.xattrs,
        }
    }

    pub fn xattrs_mut(&mut self) -> &mut BTreeMap<String, Vec<u8>> {
        match self {
            Node::File(f) => &mut f.xattrs,
            Node::Directory(d) => &mut d.xattrs,
        }
    }

    /// Replace the permission bits, preserving the file-type bits.
    pub fn chmod(&mut self, mode: u32) {
        let mask = libc::S_IFMT as u32;
        let new = (self.mode() & mask) | (mode & !mask);
        match self {
            Node::File(f) => f.mode = new,
            Node::Directory(d) => d.mode = new,
        }
    }

    pub fn chown(&mut self, uid: u32, gid: u32) {
        match self {
            Node::File(f) => {
                f.uid = uid;
                f.gid = gid;
            }
            Node::Directory(d) => {
                d.uid = uid;
                d.gid = gid;
            }
        }
    }

    /// Set access and modification times. A directory's mtime is derived
    /// from its children, so only its atime is stored.
    pub fn set_times(&mut self, atime: f64, mtime: f64) {
        match self {
            Node::File(f) => {
                f.atime = atime;
                f.mtime = mtime;
            }
            Node::Directory(d) => d.atime = atime,
        }
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty())
}

#[derive(Debug)]
pub struct Tree {
    root: Node,
    uid: u32,
    gid: u32,
}

impl Tree {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            root: Node::Directory(Directory::new("", DEFAULT_PERM, uid, gid)),
            uid,
            gid,
        }
    }

    /// Fold a flat object listing into a hierarchy: every name prefix
    /// becomes a directory, folder markers become empty directories, and
    /// the terminal segment becomes the file leaf.
    pub fn from_listing(objects: Vec<RemoteObject>, uid: u32, gid: u32) -> Self {
        let mut tree = Self::new(uid, gid);
        for obj in objects {
            let name = obj.name.trim_matches('/');
            if name.is_empty() {
                continue;
            }
            match obj.kind {
                ObjectKind::Folder => {
                    tree.ensure_dir(name);
                }
                ObjectKind::File => {
                    let (dir_path, leaf) = match name.rsplit_once('/') {
                        Some((dir, leaf)) => (dir, leaf),
                        None => ("", name),
                    };
                    let file = File::from_remote(&obj, uid, gid);
                    let parent = tree.ensure_dir(dir_path);
                    parent.children.insert(leaf.to_string(), Node::File(file));
                }
            }
        }
        tree
    }

    fn ensure_dir(&mut self, path: &str) -> &mut Directory {
        let (uid, gid) = (self.uid, self.gid);
        let mut dir = match &mut self.root {
            Node::Directory(d) => d,
            // the root is a directory by construction
            Node::File(_) => unreachable!("root is always a directory"),
        };
        for seg in split_path(path) {
            let child = dir
                .children
                .entry(seg.to_string())
                .and_modify(|node| {
                    // a flat namespace can list both "a" and "a/b";
                    // the directory wins
                    if !node.is_dir() {
                        *node = Node::Directory(Directory::new(seg, DEFAULT_PERM, uid, gid));
                    }
                })
                .or_insert_with(|| Node::Directory(Directory::new(seg, DEFAULT_PERM, uid, gid)));
            dir = match child {
                Node::Directory(d) => d,
                Node::File(_) => unreachable!("files were replaced above"),
            };
        }
        dir
    }

    /// Walk `path` from the root. Fails with `NotFound` on a missing
    /// segment and `NotADirectory` when a file shows up mid-path.
    pub fn find(&self, path: &str) -> Result<&Node> {
        let mut node = &self.root;
        for seg in split_path(path) {
            match node {
                Node::Directory(d) => {
                    node = d.children.get(seg).ok_or_else(|| TreeError::NotFound {
                        path: path.to_string(),
                    })?;
                }
                Node::File(_) => {
                    return Err(TreeError::NotADirectory {
                        path: path.to_string(),
                    })
                }
            }
        }
        Ok(node)
    }

    pub fn find_mut(&mut self, path: &str) -> Result<&mut Node> {
        let mut node = &mut self.root;
        for seg in split_path(path) {
            match node {
                Node::Directory(d) => {
                    node = d.children.get_mut(seg).ok_or_else(|| TreeError::NotFound {
                        path: path.to_string(),
                    })?;
                }
                Node::File(_) => {
                    return Err(TreeError::NotADirectory {
                        path: path.to_string(),
                    })
                }
            }
        }
        Ok(node)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.find(path).is_ok()
    }

    pub fn find_dir(&self, path: &str) -> Result<&Directory> {
        match self.find(path)? {
            Node::Directory(d) => Ok(d),
            Node::File(_) => Err(TreeError::NotADirectory {
                path: path.to_string(),
            }),
        }
    }

    pub fn find_file(&self, path: &str) -> Result<&File> {
        match self.find(path)? {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(TreeError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    pub fn find_file_mut(&mut self, path: &str) -> Result<&mut File> {
        match self.find_mut(path)? {
            Node::File(f) => Ok(f),
            Node::Directory(_) => Err(TreeError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    /// The parent directory and leaf name of `path`, for insertions and
    /// removals. The root has no parent.
    fn parent_of(&mut self, path: &str) -> Result<(&mut Directory, String)> {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((leaf, dir_segments)) = segments.split_last() else {
            return Err(TreeError::IsRoot);
        };
        let dir_path = dir_segments.join("/");
        let leaf = leaf.to_string();
        match self.find_mut(&dir_path)? {
            Node::Directory(d) => Ok((d, leaf)),
            Node::File(_) => Err(TreeError::NotADirectory { path: dir_path }),
        }
    }

    /// Create a directory. Fails if the parent is missing or the name is
    /// taken.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        let (uid, gid) = (self.uid, self.gid);
        let (parent, leaf) = self.parent_of(path)?;
        if parent.children.contains_key(&leaf) {
            return Err(TreeError::Exists {
                path: path.to_string(),
            });
        }
        let dir = Directory::new(&leaf, mode, uid, gid);
        parent.children.insert(leaf, Node::Directory(dir));
        Ok(())
    }

    /// Create an empty local-only file and return it.
    pub fn touch(&mut self, path: &str, mode: u32) -> Result<&mut File> {
        let (uid, gid) = (self.uid, self.gid);
        let (parent, leaf) = self.parent_of(path)?;
        if parent.children.contains_key(&leaf) {
            return Err(TreeError::Exists {
                path: path.to_string(),
            });
        }
        let node = parent
            .children
            .entry(leaf)
            .or_insert(Node::File(File::local(mode, uid, gid)));
        match node {
            Node::File(f) => Ok(f),
            Node::Directory(_) => unreachable!("entry was vacant"),
        }
    }

    /// Detach the node at `path` from its parent and return it. Refuses
    /// to remove the root.
    pub fn rm(&mut self, path: &str) -> Result<Node> {
        let (parent, leaf) = self.parent_of(path)?;
        parent.children.remove(&leaf).ok_or_else(|| TreeError::NotFound {
            path: path.to_string(),
        })
    }
}
