//! Block bitmap allocator.
//!
//! One bit per disk block, 1 = free, starting at block 2 and mirrored in
//! the cache like any other block (the bitmap blocks are adjacent in the
//! window, so bit `b` lives at a fixed offset from the start of block 2).
//! Allocation scans 32-bit words for a nonzero word, then bits LSB to MSB,
//! clears the winner, and writes the containing bitmap block back so the
//! on-disk bitmap never claims an allocated block is free.

use kestrel_kernel::error::KernelError;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::Kernel;
use log::warn;

use crate::cache::{read_u32, write_u32};
use crate::layout::{BLKBITSIZE, BLKSIZE, DISKMAP};
use crate::FileSystem;

impl FileSystem {
    /// Cache address of the bitmap word holding `blockno`'s bit.
    fn bitmap_word_addr(&self, blockno: u32) -> VirtAddr {
        VirtAddr::new(DISKMAP + 2 * BLKSIZE + (blockno / 32) * 4)
    }

    /// Does the bitmap mark `blockno` free?
    pub fn block_is_free(&self, k: &mut Kernel, blockno: u32) -> Result<bool, KernelError> {
        if !self.bitmap_ready || blockno >= self.nblocks {
            return Ok(false);
        }
        let word = read_u32(k, self.bitmap_word_addr(blockno))?;
        Ok(word & (1 << (blockno % 32)) != 0)
    }

    /// Mark `blockno` free. Block 0 is the null block number and can never
    /// be freed.
    pub fn free_block(&self, k: &mut Kernel, blockno: u32) -> Result<(), KernelError> {
        assert!(blockno != 0, "attempt to free zero block");
        let addr = self.bitmap_word_addr(blockno);
        let word = read_u32(k, addr)?;
        write_u32(k, addr, word | (1 << (blockno % 32)))
    }

    /// Find a free block, claim its bit, and persist the bitmap block that
    /// holds it. Returns the block number, or `NoDisk` when nothing is
    /// free.
    pub fn alloc_block_num(&self, k: &mut Kernel) -> Result<u32, KernelError> {
        let mut base = 0u32;
        while base < self.nblocks {
            let addr = self.bitmap_word_addr(base);
            let word = read_u32(k, addr)?;
            if word != 0 {
                for bit in 0..32 {
                    if word & (1 << bit) != 0 {
                        let blockno = base + bit;
                        write_u32(k, addr, word & !(1 << bit))?;
                        self.write_block(k, 2 + blockno / BLKBITSIZE)?;
                        return Ok(blockno);
                    }
                }
            }
            base += 32;
        }
        Err(KernelError::NoDisk)
    }

    /// Allocate a block and make sure its cache slot is resident. If the
    /// slot cannot be mapped, the bit goes back.
    pub fn alloc_block(&self, k: &mut Kernel) -> Result<u32, KernelError> {
        let blockno = self.alloc_block_num(k)?;
        if let Err(e) = self.map_block(k, blockno) {
            warn!("alloc_block: mapping block {} failed, rolling back", blockno);
            self.free_block(k, blockno)?;
            return Err(e);
        }
        Ok(blockno)
    }
}
