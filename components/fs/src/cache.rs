//! Block cache.
//!
//! Every disk block has a fixed slot in a virtual window: block `b` is
//! pinned at `DISKMAP + b * BLKSIZE` whenever it is resident. Residency and
//! dirtiness are not tracked in a side table - they are read straight off
//! the page-table entry through the self-map: a block is cached iff its
//! slot is mapped, dirty iff the MMU set the dirty bit there since the last
//! write-back.

use kestrel_kernel::config::BLKSECTS;
use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::EnvId;
use kestrel_kernel::Kernel;
use kestrel_user::{syscall, vm};

use crate::layout::{BLKSIZE, DISKMAP, MAXBLOCKS};
use crate::FileSystem;

/// Read `len` bytes of a cached block through the user mapping.
pub(crate) fn read_bytes(k: &mut Kernel, va: VirtAddr, len: usize) -> Result<Vec<u8>, KernelError> {
    let mut buf = vec![0u8; len];
    k.user_read(va, &mut buf)
        .map_err(|_| KernelError::Unspecified)?;
    Ok(buf)
}

pub(crate) fn write_bytes(k: &mut Kernel, va: VirtAddr, buf: &[u8]) -> Result<(), KernelError> {
    k.user_write(va, buf).map_err(|_| KernelError::Unspecified)
}

pub(crate) fn read_u32(k: &mut Kernel, va: VirtAddr) -> Result<u32, KernelError> {
    k.user_read_u32(va).map_err(|_| KernelError::Unspecified)
}

pub(crate) fn write_u32(k: &mut Kernel, va: VirtAddr, value: u32) -> Result<(), KernelError> {
    k.user_write_u32(va, value)
        .map_err(|_| KernelError::Unspecified)
}

impl FileSystem {
    /// Virtual address of `blockno`'s cache slot.
    ///
    /// Panics on a block number beyond the file system - that is a caller
    /// bug, not an I/O condition.
    pub fn diskaddr(&self, blockno: u32) -> VirtAddr {
        if self.nblocks > 0 && blockno >= self.nblocks {
            panic!("bad block number {:#010x} in diskaddr", blockno);
        }
        assert!(blockno < MAXBLOCKS);
        VirtAddr::new(DISKMAP + blockno * BLKSIZE)
    }

    /// Is this block resident in the cache?
    pub fn block_is_mapped(&self, k: &mut Kernel, blockno: u32) -> Result<bool, KernelError> {
        vm::va_is_mapped(k, self.diskaddr(blockno))
    }

    /// Is this block resident and modified since its last write-back?
    pub fn block_is_dirty(&self, k: &mut Kernel, blockno: u32) -> Result<bool, KernelError> {
        let va = self.diskaddr(blockno);
        Ok(vm::va_is_mapped(k, va)? && vm::va_is_dirty(k, va)?)
    }

    /// Ensure the block has a frame in its cache slot (without loading it).
    pub(crate) fn map_block(&self, k: &mut Kernel, blockno: u32) -> Result<(), KernelError> {
        if self.block_is_mapped(k, blockno)? {
            return Ok(());
        }
        syscall::sys_page_alloc(
            k,
            EnvId::CURRENT,
            self.diskaddr(blockno),
            Pte::P | Pte::U | Pte::W,
        )
    }

    /// Make sure `blockno` is loaded in the cache and return its address.
    ///
    /// A resident block is returned as is; otherwise a frame is allocated
    /// and the block's sectors are read into it. Reading a block the bitmap
    /// says is free is a bug and panics (block 0 slips through for tests,
    /// since the bitmap marks it in use).
    pub fn read_block(&self, k: &mut Kernel, blockno: u32) -> Result<VirtAddr, KernelError> {
        if self.nblocks > 0 && blockno >= self.nblocks {
            panic!("reading non-existent block {:#010x}", blockno);
        }
        if self.bitmap_ready && self.block_is_free(k, blockno)? {
            panic!("reading free block {:#010x}", blockno);
        }
        let va = self.diskaddr(blockno);
        if self.block_is_mapped(k, blockno)? {
            return Ok(va);
        }
        self.map_block(k, blockno)?;
        k.ide_read(blockno * BLKSECTS as u32, va, BLKSECTS)?;
        Ok(va)
    }

    /// Write the cached block back to disk and clear its dirty bit by
    /// re-mapping the same frame with the dirty bit masked out.
    pub fn write_block(&self, k: &mut Kernel, blockno: u32) -> Result<(), KernelError> {
        if !self.block_is_mapped(k, blockno)? {
            panic!("write of unmapped block {:#010x}", blockno);
        }
        let va = self.diskaddr(blockno);
        k.ide_write(blockno * BLKSECTS as u32, va, BLKSECTS)?;
        syscall::sys_page_map(
            k,
            EnvId::CURRENT,
            va,
            EnvId::CURRENT,
            va,
            Pte::P | Pte::U | Pte::W,
        )
    }

    /// Drop a block from the cache. The block must be clean or free.
    pub fn unmap_block(&self, k: &mut Kernel, blockno: u32) -> Result<(), KernelError> {
        if !self.block_is_mapped(k, blockno)? {
            return Ok(());
        }
        assert!(
            self.block_is_free(k, blockno)? || !self.block_is_dirty(k, blockno)?,
            "unmapping dirty block {:#010x}",
            blockno
        );
        syscall::sys_page_unmap(k, EnvId::CURRENT, self.diskaddr(blockno))
    }

    /// Write back every dirty cached block.
    pub fn flush_all(&self, k: &mut Kernel) -> Result<(), KernelError> {
        for blockno in 0..self.nblocks {
            if self.block_is_dirty(k, blockno)? {
                self.write_block(k, blockno)?;
            }
        }
        Ok(())
    }
}
