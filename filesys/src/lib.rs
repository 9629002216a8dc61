//! The storage core of a teaching file system: a fixed-capacity write-back
//! buffer cache over a sector-addressed block device, and an
//! indexed-allocation inode layer (direct, indirect, and doubly-indirect
//! pointers) with on-demand growth and deferred removal.
//!
//! Directory trees, path walking, and file descriptors belong to the layers
//! above and are not provided here.

mod bio;
mod dev;
mod freemap;
mod fs;
mod param;

pub use bio::{Cache, CacheStats};
pub use dev::{BlockDevice, MemDisk};
pub use freemap::FreeMap;
pub use fs::{Filesys, Inode};
pub use param::{MAXFILE, NBUF, SECTOR_SIZE};

use core::result;

pub type Result<T> = result::Result<T, &'static str>;
