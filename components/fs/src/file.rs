//! File layer: block mapping, sizing, reading and writing.
//!
//! A file record lives inside a cached block - the superblock for the root
//! directory, a directory data block for everything else - so a
//! [`FileHandle`] is a location, not a copy: mutations go through the cache
//! mapping and dirty the containing page like any other write. The
//! transient parent back-pointer carried by a handle is an in-memory
//! relation stamped during lookup; it is never persisted.

use log::warn;

use kestrel_kernel::error::KernelError;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::Kernel;

use crate::cache::{read_bytes, read_u32, write_bytes, write_u32};
use crate::layout::{
    FileRec, BLKSIZE, DISKMAP, MAXFILESIZE, NDIRECT, NINDIRECT, OFF_DIRECT, OFF_INDIRECT,
    OFF_SIZE, REC_SIZE, SUPER_ROOT_OFF,
};
use crate::FileSystem;

/// Where a file record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLoc {
    /// The root directory's record, embedded in the superblock.
    Root,
    /// Record `index` of directory data block `block`.
    Slot { block: u32, index: u32 },
}

/// An open file: its record location plus the in-memory parent-directory
/// back-pointer (if this handle came from a directory scan).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    pub loc: RecordLoc,
    pub parent: Option<RecordLoc>,
}

impl FileHandle {
    pub fn root() -> Self {
        Self {
            loc: RecordLoc::Root,
            parent: None,
        }
    }
}

impl FileSystem {
    /// Cache address of a record, with its containing block resident.
    pub(crate) fn rec_va(&self, k: &mut Kernel, loc: RecordLoc) -> Result<VirtAddr, KernelError> {
        match loc {
            RecordLoc::Root => Ok(self.read_block(k, 1)?.add(SUPER_ROOT_OFF)),
            RecordLoc::Slot { block, index } => {
                Ok(self.read_block(k, block)?.add(index * REC_SIZE as u32))
            }
        }
    }

    /// Load a record.
    pub fn load_rec(&self, k: &mut Kernel, f: &FileHandle) -> Result<FileRec, KernelError> {
        let va = self.rec_va(k, f.loc)?;
        Ok(FileRec::decode(&read_bytes(k, va, REC_SIZE)?))
    }

    /// Store a record in place, dirtying its containing block.
    pub fn store_rec(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        rec: &FileRec,
    ) -> Result<(), KernelError> {
        let va = self.rec_va(k, f.loc)?;
        write_bytes(k, va, &rec.encode())
    }

    /// Find the slot holding the disk block number of logical block
    /// `filebno`: one of the record's direct slots, or the matching slot of
    /// the indirect block (whose first NDIRECT entries are unused, so the
    /// logical number indexes it directly). With `alloc`, a missing
    /// indirect block is allocated and zeroed.
    pub fn block_walk(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        filebno: u32,
        alloc: bool,
    ) -> Result<VirtAddr, KernelError> {
        if filebno >= NINDIRECT as u32 {
            return Err(KernelError::Inval);
        }
        let rva = self.rec_va(k, f.loc)?;
        if filebno < NDIRECT as u32 {
            return Ok(rva.add(OFF_DIRECT as u32 + 4 * filebno));
        }

        let mut indirect = read_u32(k, rva.add(OFF_INDIRECT as u32))?;
        if indirect == 0 {
            if !alloc {
                return Err(KernelError::NotFound);
            }
            indirect = self.alloc_block(k)?;
            // A fresh indirect block starts with no pointers at all.
            write_bytes(k, self.diskaddr(indirect), &[0u8; BLKSIZE as usize])?;
            write_u32(k, rva.add(OFF_INDIRECT as u32), indirect)?;
        }
        self.read_block(k, indirect)?;
        Ok(self.diskaddr(indirect).add(4 * filebno))
    }

    /// Disk block number of logical block `filebno`, allocating a data
    /// block (and recording it in the walk slot) when `alloc` is set.
    /// The resulting block's cache slot is made resident.
    pub fn file_map_block(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        filebno: u32,
        alloc: bool,
    ) -> Result<u32, KernelError> {
        let slot = self.block_walk(k, f, filebno, alloc)?;
        let mut blockno = read_u32(k, slot)?;
        if blockno == 0 {
            if !alloc {
                return Err(KernelError::NotFound);
            }
            blockno = self.alloc_block(k)?;
            write_u32(k, slot, blockno)?;
            // A block fresh off the bitmap may carry stale disk contents;
            // a newly materialized file block reads as zeros.
            write_bytes(k, self.diskaddr(blockno), &[0u8; BLKSIZE as usize])?;
        } else {
            // An existing block must come in from the disk, not appear as
            // an empty frame that read_block would then mistake for loaded.
            self.read_block(k, blockno)?;
        }
        Ok(blockno)
    }

    /// Cache address of logical block `filebno`'s contents, allocating and
    /// loading as needed.
    pub fn file_get_block(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        filebno: u32,
    ) -> Result<VirtAddr, KernelError> {
        let blockno = self.file_map_block(k, f, filebno, true)?;
        self.read_block(k, blockno)
    }

    /// Drop logical block `filebno` from the file: free the disk block and
    /// zero the slot. Silently succeeds when nothing is there.
    pub fn file_clear_block(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        filebno: u32,
    ) -> Result<(), KernelError> {
        let slot = match self.block_walk(k, f, filebno, false) {
            Ok(slot) => slot,
            Err(KernelError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        let blockno = read_u32(k, slot)?;
        if blockno != 0 {
            self.free_block(k, blockno)?;
            write_u32(k, slot, 0)?;
        }
        Ok(())
    }

    /// Free every data block at logical index >= ceil(newsize / BLKSIZE);
    /// if the file now fits in its direct slots, free the indirect block
    /// too and zero its pointer.
    pub(crate) fn file_truncate_blocks(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        newsize: u32,
    ) -> Result<(), KernelError> {
        let rec = self.load_rec(k, f)?;
        let old_nblocks = rec.size.div_ceil(BLKSIZE);
        let new_nblocks = newsize.div_ceil(BLKSIZE);
        for bno in new_nblocks..old_nblocks {
            if let Err(e) = self.file_clear_block(k, f, bno) {
                warn!("file_clear_block {} of {:?}: {}", bno, f.loc, e);
            }
        }
        if new_nblocks <= NDIRECT as u32 {
            let rva = self.rec_va(k, f.loc)?;
            let indirect = read_u32(k, rva.add(OFF_INDIRECT as u32))?;
            if indirect != 0 {
                self.free_block(k, indirect)?;
                write_u32(k, rva.add(OFF_INDIRECT as u32), 0)?;
            }
        }
        Ok(())
    }

    /// Set the file's size, truncating its block map when it shrinks, and
    /// flush the parent directory so the new metadata reaches the disk.
    pub fn file_set_size(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        newsize: u32,
    ) -> Result<(), KernelError> {
        if newsize > MAXFILESIZE {
            return Err(KernelError::Inval);
        }
        let rec = self.load_rec(k, f)?;
        if rec.size > newsize {
            self.file_truncate_blocks(k, f, newsize)?;
        }
        let rva = self.rec_va(k, f.loc)?;
        write_u32(k, rva.add(OFF_SIZE as u32), newsize)?;
        if let Some(parent) = f.parent {
            self.file_flush(
                k,
                &FileHandle {
                    loc: parent,
                    parent: None,
                },
            )?;
        }
        Ok(())
    }

    /// Write back every dirty cached block of the file. Blocks that are
    /// not resident are left alone.
    pub fn file_flush(&self, k: &mut Kernel, f: &FileHandle) -> Result<(), KernelError> {
        let rec = self.load_rec(k, f)?;
        for bno in 0..rec.size.div_ceil(BLKSIZE) {
            let slot = match self.block_walk(k, f, bno, false) {
                Ok(slot) => slot,
                Err(_) => continue,
            };
            let blockno = read_u32(k, slot)?;
            if blockno != 0 && self.block_is_dirty(k, blockno)? {
                self.write_block(k, blockno)?;
            }
        }
        Ok(())
    }

    /// Close a file: flush it, then flush its parent directory.
    pub fn file_close(&self, k: &mut Kernel, f: &FileHandle) -> Result<(), KernelError> {
        self.file_flush(k, f)?;
        if let Some(parent) = f.parent {
            self.file_flush(
                k,
                &FileHandle {
                    loc: parent,
                    parent: None,
                },
            )?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the count read,
    /// bounded by the file size.
    pub fn file_read(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<usize, KernelError> {
        let size = self.load_rec(k, f)?.size;
        if offset >= size {
            return Ok(0);
        }
        let count = (buf.len() as u32).min(size - offset) as usize;
        let mut done = 0usize;
        while done < count {
            let pos = offset + done as u32;
            let in_block = (BLKSIZE - pos % BLKSIZE) as usize;
            let chunk = in_block.min(count - done);
            let va = self.file_get_block(k, f, pos / BLKSIZE)?;
            let bytes = read_bytes(k, va.add(pos % BLKSIZE), chunk)?;
            buf[done..done + chunk].copy_from_slice(&bytes);
            done += chunk;
        }
        Ok(count)
    }

    /// Write `buf` at `offset`, growing the file (and persisting the new
    /// size) if the write extends past the current end.
    pub fn file_write(
        &self,
        k: &mut Kernel,
        f: &FileHandle,
        buf: &[u8],
        offset: u32,
    ) -> Result<usize, KernelError> {
        let end = offset
            .checked_add(buf.len() as u32)
            .ok_or(KernelError::Inval)?;
        if end > self.load_rec(k, f)?.size {
            self.file_set_size(k, f, end)?;
        }
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u32;
            let in_block = (BLKSIZE - pos % BLKSIZE) as usize;
            let chunk = in_block.min(buf.len() - done);
            let va = self.file_get_block(k, f, pos / BLKSIZE)?;
            write_bytes(k, va.add(pos % BLKSIZE), &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(buf.len())
    }

    /// Touch the block holding `offset` so it is marked dirty.
    pub fn file_dirty(&self, k: &mut Kernel, f: &FileHandle, offset: u32) -> Result<(), KernelError> {
        let va = self.file_get_block(k, f, offset / BLKSIZE)?;
        let byte = read_bytes(k, va, 1)?;
        write_bytes(k, va, &byte)
    }

    /// Disk block number backing a cache address.
    pub(crate) fn va_to_blockno(va: VirtAddr) -> u32 {
        (va.as_u32() - DISKMAP) / BLKSIZE
    }
}
