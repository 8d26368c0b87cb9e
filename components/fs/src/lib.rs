//! Kestrel block file system.
//!
//! A block-structured file system over the simulated IDE disk, running as a
//! user environment: the block cache is a window of the environment's own
//! address space, residency and dirtiness are read off the page-table
//! entries through the self-map, and all I/O goes through the kernel's
//! page-mapping syscalls plus the raw sector primitives.
//!
//! # Layers
//!
//! - `layout`: the on-disk format and the formatter
//! - `cache`: per-block virtual slots, read/write-back, dirty tracking
//! - `bitmap`: the block allocator
//! - `file`: records, direct/indirect block maps, sizing, byte I/O
//! - `path`: directory scans and path resolution
//!
//! Errors share the kernel's [`KernelError`] kinds; the file-system kinds
//! (`NoDisk`, `NotFound`, `BadPath`, `Exists`) are part of the same ABI
//! code space.

pub mod bitmap;
pub mod cache;
pub mod file;
pub mod layout;
pub mod path;

use log::info;

use kestrel_kernel::error::KernelError;
use kestrel_kernel::Kernel;

use crate::cache::read_u32;
use crate::layout::{nbitblocks, FS_MAGIC, MAXBLOCKS};

pub use file::{FileHandle, RecordLoc};
pub use layout::{format, FileRec, FileType};
pub use path::PathResolution;

/// A mounted file system, bound to the environment that mounted it (all
/// cache state lives in that environment's address space).
pub struct FileSystem {
    pub(crate) nblocks: u32,
    pub(crate) bitmap_ready: bool,
}

impl FileSystem {
    /// Mount the file system on the current environment: read and validate
    /// the superblock, then load the bitmap.
    ///
    /// A bad magic number or an impossible block count is a corrupt disk
    /// and panics, the same class of failure as any other boot-time
    /// invariant violation.
    pub fn mount(k: &mut Kernel) -> Result<FileSystem, KernelError> {
        let mut fs = FileSystem {
            nblocks: 0,
            bitmap_ready: false,
        };

        let sb = fs.read_block(k, 1)?;
        let magic = read_u32(k, sb)?;
        if magic != FS_MAGIC {
            panic!("bad file system magic number {:#010x}", magic);
        }
        let nblocks = read_u32(k, sb.add(4))?;
        if nblocks > MAXBLOCKS {
            panic!("file system too large: {} blocks", nblocks);
        }
        fs.nblocks = nblocks;

        // Load every bitmap block, then sanity-check the reservations.
        for i in 0..nbitblocks(nblocks) {
            fs.read_block(k, 2 + i)?;
        }
        fs.bitmap_ready = true;
        for i in 0..nbitblocks(nblocks) {
            assert!(
                !fs.block_is_free(k, 2 + i)?,
                "bitmap block {} marked free",
                2 + i
            );
        }
        assert!(!fs.block_is_free(k, 0)?, "reserved block marked free");
        assert!(!fs.block_is_free(k, 1)?, "superblock marked free");

        info!("file system mounted: {} blocks", nblocks);
        Ok(fs)
    }

    /// Total blocks on this file system.
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Sync the entire file system: write back every dirty block.
    pub fn sync(&self, k: &mut Kernel) -> Result<(), KernelError> {
        self.flush_all(k)
    }
}
