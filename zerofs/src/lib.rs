#![deny(clippy::all)]

pub mod cache;
pub mod fs;
pub mod fuse;
pub mod store;
pub mod task_queue;
pub mod tree;

pub use cache::DiskCache;
pub use fs::{Options, ZeroFs};
pub use fuse::ZeroFuse;
pub use store::ObjectStore;
pub use task_queue::TaskQueue;

use std::time::{SystemTime, UNIX_EPOCH};

/// Objects requested per page when listing the bucket at mount time.
pub(crate) const LIST_PAGE_SIZE: usize = 1000;

/// Fractional seconds since the epoch, the time representation used
/// throughout the tree.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
