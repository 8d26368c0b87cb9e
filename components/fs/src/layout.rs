//! On-disk layout: superblock, file records, and the formatter.
//!
//! Block 0 is reserved. Block 1 is the superblock: magic, total block
//! count, and the root directory's file record embedded at byte 8. Blocks
//! 2.. hold the allocation bitmap, one bit per block, 1 = free, the LSB of
//! each 32-bit word covering the lowest block of its group. Data and
//! directory blocks follow.
//!
//! File records are fixed at 256 bytes on disk: a bounded null-terminated
//! name, size, type, NDIRECT direct block pointers, and one indirect
//! pointer. Directory blocks are packed arrays of records; a zero first
//! name byte marks a free slot.

use kestrel_kernel::config::PGSIZE;
use static_assertions::const_assert_eq;

/// Base of the fixed virtual window the block cache pins blocks into.
pub const DISKMAP: u32 = 0x1000_0000;
/// Window capacity in blocks (256 MiB of disk).
pub const MAXBLOCKS: u32 = 0x1_0000;

/// Bytes per disk block; one block per page.
pub const BLKSIZE: u32 = PGSIZE;
/// Bits per bitmap block.
pub const BLKBITSIZE: u32 = BLKSIZE * 8;

/// On-disk magic, "KSF1".
pub const FS_MAGIC: u32 = 0x4b53_4631;

/// Maximum file name length, including the terminator.
pub const MAXNAMELEN: usize = 128;
/// Direct block pointers per file record.
pub const NDIRECT: usize = 10;
/// Logical block limit: one page of 32-bit block numbers, of which the
/// first NDIRECT slots are left unused so a logical block number indexes
/// the indirect block directly.
pub const NINDIRECT: usize = (BLKSIZE / 4) as usize;
/// Largest file in bytes.
pub const MAXFILESIZE: u32 = NINDIRECT as u32 * BLKSIZE;

/// Bytes per file record on disk.
pub const REC_SIZE: usize = 256;
/// Records per directory block.
pub const BLKFILES: usize = BLKSIZE as usize / REC_SIZE;
/// Byte offset of the root record inside the superblock.
pub const SUPER_ROOT_OFF: u32 = 8;

/// Record field offsets.
pub const OFF_SIZE: usize = MAXNAMELEN;
pub const OFF_TYPE: usize = OFF_SIZE + 4;
pub const OFF_DIRECT: usize = OFF_TYPE + 4;
pub const OFF_INDIRECT: usize = OFF_DIRECT + 4 * NDIRECT;

const_assert_eq!(BLKFILES * REC_SIZE, BLKSIZE as usize);
const_assert_eq!(OFF_INDIRECT + 4, 180); // 76 bytes of padding to 256
const_assert_eq!(NINDIRECT, 1024);

/// File type stored in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Dir,
}

impl FileType {
    pub fn from_u32(raw: u32) -> Self {
        if raw == 1 {
            FileType::Dir
        } else {
            FileType::Regular
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            FileType::Regular => 0,
            FileType::Dir => 1,
        }
    }
}

/// Decoded file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRec {
    pub name: String,
    pub size: u32,
    pub ftype: FileType,
    pub direct: [u32; NDIRECT],
    pub indirect: u32,
}

impl FileRec {
    pub fn decode(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), REC_SIZE);
        let name_len = bytes[..MAXNAMELEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAXNAMELEN);
        let w = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let mut direct = [0u32; NDIRECT];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = w(OFF_DIRECT + 4 * i);
        }
        Self {
            name: String::from_utf8_lossy(&bytes[..name_len]).into_owned(),
            size: w(OFF_SIZE),
            ftype: FileType::from_u32(w(OFF_TYPE)),
            direct,
            indirect: w(OFF_INDIRECT),
        }
    }

    pub fn encode(&self) -> [u8; REC_SIZE] {
        let mut out = [0u8; REC_SIZE];
        let name = self.name.as_bytes();
        assert!(name.len() < MAXNAMELEN, "file name too long to encode");
        out[..name.len()].copy_from_slice(name);
        out[OFF_SIZE..OFF_SIZE + 4].copy_from_slice(&self.size.to_le_bytes());
        out[OFF_TYPE..OFF_TYPE + 4].copy_from_slice(&self.ftype.to_u32().to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            out[OFF_DIRECT + 4 * i..OFF_DIRECT + 4 * i + 4].copy_from_slice(&d.to_le_bytes());
        }
        out[OFF_INDIRECT..OFF_INDIRECT + 4].copy_from_slice(&self.indirect.to_le_bytes());
        out
    }

    pub fn empty() -> Self {
        Self {
            name: String::new(),
            size: 0,
            ftype: FileType::Regular,
            direct: [0; NDIRECT],
            indirect: 0,
        }
    }
}

/// Number of bitmap blocks needed for `nblocks` blocks.
pub fn nbitblocks(nblocks: u32) -> u32 {
    nblocks.div_ceil(BLKBITSIZE)
}

/// Build a fresh disk image: reserved block, superblock with an empty root
/// directory sized one block, bitmap with everything else free.
pub fn format(nblocks: u32) -> Vec<u8> {
    assert!(nblocks >= 4 && nblocks <= MAXBLOCKS, "unreasonable disk size");
    let nbit = nbitblocks(nblocks);
    let root_block = 2 + nbit;
    assert!(root_block < nblocks, "disk too small for a root directory");

    let mut image = vec![0u8; (nblocks * BLKSIZE) as usize];

    // Bitmap: mark every real block free, then claim the reserved block,
    // the superblock, the bitmap itself, and the root directory block.
    // Bits past nblocks stay zero (in use) so they are never handed out.
    for b in 0..nblocks {
        set_bitmap_bit(&mut image, b, true);
    }
    for b in (0..root_block + 1).rev() {
        set_bitmap_bit(&mut image, b, false);
    }

    // Superblock.
    let sb = (BLKSIZE as usize)..(2 * BLKSIZE as usize);
    image[sb.start..sb.start + 4].copy_from_slice(&FS_MAGIC.to_le_bytes());
    image[sb.start + 4..sb.start + 8].copy_from_slice(&nblocks.to_le_bytes());
    let mut root = FileRec::empty();
    root.name = "/".to_string();
    root.ftype = FileType::Dir;
    root.size = BLKSIZE;
    root.direct[0] = root_block;
    image[sb.start + SUPER_ROOT_OFF as usize..sb.start + SUPER_ROOT_OFF as usize + REC_SIZE]
        .copy_from_slice(&root.encode());

    image
}

fn set_bitmap_bit(image: &mut [u8], blockno: u32, free: bool) {
    let byte = (2 * BLKSIZE + blockno / 8) as usize;
    let bit = 1u8 << (blockno % 8);
    if free {
        image[byte] |= bit;
    } else {
        image[byte] &= !bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_codec_round_trip() {
        let rec = FileRec {
            name: "hello".to_string(),
            size: 6,
            ftype: FileType::Regular,
            direct: [9, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            indirect: 0,
        };
        assert_eq!(FileRec::decode(&rec.encode()), rec);
    }

    #[test]
    fn formatted_image_has_sane_superblock() {
        let image = format(64);
        let sb = BLKSIZE as usize;
        assert_eq!(
            u32::from_le_bytes(image[sb..sb + 4].try_into().unwrap()),
            FS_MAGIC
        );
        assert_eq!(
            u32::from_le_bytes(image[sb + 4..sb + 8].try_into().unwrap()),
            64
        );
        let root = FileRec::decode(&image[sb + 8..sb + 8 + REC_SIZE]);
        assert_eq!(root.ftype, FileType::Dir);
        assert_eq!(root.size, BLKSIZE);
        assert_ne!(root.direct[0], 0);
    }

    #[test]
    fn formatted_bitmap_reserves_metadata() {
        let nblocks = 64u32;
        let image = format(nblocks);
        let is_free = |b: u32| {
            let byte = (2 * BLKSIZE + b / 8) as usize;
            image[byte] & (1 << (b % 8)) != 0
        };
        assert!(!is_free(0));
        assert!(!is_free(1));
        assert!(!is_free(2)); // bitmap block
        assert!(!is_free(3)); // root directory block
        assert!(is_free(4));
        assert!(is_free(nblocks - 1));
    }
}
