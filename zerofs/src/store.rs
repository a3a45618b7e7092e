//! Clients for the remote object store.
//!
//! The filesystem only ever talks to the store through the narrow
//! [`ObjectStore`] surface: list buckets, list objects by page, download,
//! upload, delete. The production implementation is the Backblaze B2
//! client in [`b2`]; tests run against [`mem::InMemoryStore`].

use std::io;

pub mod b2;
pub use b2::B2;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("no bucket named {name}")]
    NoBucket { name: String },
    #[error("no object with id {id}")]
    NoObject { id: String },
    #[error("B2_APPLICATION_KEY_ID and B2_APPLICATION_KEY must be set")]
    MissingCredentials,
    #[error("request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("unexpected server response: {reason}")]
    Protocol { reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A bucket as reported by the server.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Folder,
}

/// One entry of a bucket listing, or the server's echo of an upload.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub id: String,
    /// Full slash-delimited object name.
    pub name: String,
    pub size: u64,
    /// Fractional seconds since the epoch.
    pub uploaded_at: f64,
    pub kind: ObjectKind,
}

pub trait ObjectStore: Send + Sync {
    fn list_buckets(&self) -> Result<Vec<Bucket>>;

    /// One page of the bucket listing, ordered by name. `start_file_name`
    /// is inclusive; a page shorter than `limit` is the last one. With
    /// `list_directory` the server folds deeper names into folder entries.
    fn list_files(
        &self,
        bucket_id: &str,
        start_file_name: Option<&str>,
        prefix: Option<&str>,
        limit: usize,
        list_directory: bool,
    ) -> Result<Vec<RemoteObject>>;

    fn download(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Store `data` under `name`, returning the server's view of the new
    /// object (id, size, timestamp).
    fn upload(&self, bucket_id: &str, name: &str, data: &[u8]) -> Result<RemoteObject>;

    fn delete(&self, file_id: &str, name: &str) -> Result<()>;
}

#[cfg(any(test, feature = "test"))]
pub mod mem {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    pub const BUCKET_ID: &str = "bucket-0";
    pub const BUCKET_NAME: &str = "test-bucket";

    /// In-memory object store for the test suite. Ids are server-shaped
    /// (`srv-<n>`), never UUIDs, so local-only detection behaves like it
    /// does against the real service.
    #[derive(Default)]
    pub struct InMemoryStore {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        objects: BTreeMap<String, Stored>,
        next_id: u64,
        deletes: Vec<(String, String)>,
    }

    struct Stored {
        name: String,
        data: Vec<u8>,
        uploaded_at: f64,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed the bucket with an object, returning its id.
        pub fn seed(&self, name: &str, data: &[u8]) -> String {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = format!("srv-{:08}", inner.next_id);
            inner.objects.insert(
                id.clone(),
                Stored {
                    name: name.to_string(),
                    data: data.to_vec(),
                    uploaded_at: crate::unix_now(),
                },
            );
            id
        }

        /// `(file_id, file_name)` pairs passed to `delete`, oldest first.
        pub fn deleted(&self) -> Vec<(String, String)> {
            self.inner.lock().deletes.clone()
        }

        pub fn names(&self) -> Vec<String> {
            let inner = self.inner.lock();
            let mut names: Vec<_> = inner.objects.values().map(|o| o.name.clone()).collect();
            names.sort();
            names
        }

        pub fn body_of(&self, name: &str) -> Option<Vec<u8>> {
            let inner = self.inner.lock();
            inner
                .objects
                .values()
                .find(|o| o.name == name)
                .map(|o| o.data.clone())
        }
    }

    impl ObjectStore for InMemoryStore {
        fn list_buckets(&self) -> Result<Vec<Bucket>> {
            Ok(vec![Bucket {
                id: BUCKET_ID.to_string(),
                name: BUCKET_NAME.to_string(),
            }])
        }

        fn list_files(
            &self,
            _bucket_id: &str,
            start_file_name: Option<&str>,
            prefix: Option<&str>,
            limit: usize,
            _list_directory: bool,
        ) -> Result<Vec<RemoteObject>> {
            let inner = self.inner.lock();
            let mut files: Vec<RemoteObject> = inner
                .objects
                .iter()
                .filter(|(_, o)| prefix.is_none_or(|p| o.name.starts_with(p)))
                .filter(|(_, o)| start_file_name.is_none_or(|s| o.name.as_str() >= s))
                .map(|(id, o)| RemoteObject {
                    id: id.clone(),
                    name: o.name.clone(),
                    size: o.data.len() as u64,
                    uploaded_at: o.uploaded_at,
                    kind: ObjectKind::File,
                })
                .collect();
            files.sort_by(|a, b| a.name.cmp(&b.name));
            files.truncate(limit);
            Ok(files)
        }

        fn download(&self, file_id: &str) -> Result<Vec<u8>> {
            let inner = self.inner.lock();
            inner
                .objects
                .get(file_id)
                .map(|o| o.data.clone())
                .ok_or_else(|| StoreError::NoObject { id: file_id.to_string() })
        }

        fn upload(&self, _bucket_id: &str, name: &str, data: &[u8]) -> Result<RemoteObject> {
            let id = self.seed(name, data);
            Ok(RemoteObject {
                id,
                name: name.to_string(),
                size: data.len() as u64,
                uploaded_at: crate::unix_now(),
                kind: ObjectKind::File,
            })
        }

        fn delete(&self, file_id: &str, name: &str) -> Result<()> {
            let mut inner = self.inner.lock();
            inner
                .objects
                .remove(file_id)
                .ok_or_else(|| StoreError::NoObject { id: file_id.to_string() })?;
            inner.deletes.push((file_id.to_string(), name.to_string()));
            Ok(())
        }
    }
}
