//! Path resolution and directory operations.
//!
//! Paths are forward-slash separated; resolution starts at the superblock's
//! embedded root record and descends one component at a time. A walk always
//! lands in exactly one of four places: found; missing final component with
//! the parent directory in hand (the create case); missing somewhere in the
//! middle (no directory to report); or a component too long to be a name.

use kestrel_kernel::error::KernelError;
use kestrel_kernel::Kernel;

use crate::cache::read_bytes;
use crate::file::{FileHandle, RecordLoc};
use crate::layout::{FileRec, FileType, BLKFILES, BLKSIZE, MAXNAMELEN, REC_SIZE};
use crate::FileSystem;

/// Outcome of a path walk, excluding the bad-path error.
#[derive(Debug, Clone)]
pub enum PathResolution {
    /// The whole path resolved. `dir` is the containing directory, absent
    /// when the path named the root itself.
    Found {
        dir: Option<FileHandle>,
        file: FileHandle,
    },
    /// Some component was missing. When it was the *final* component,
    /// `dir` holds the directory it would live in and `last` its name -
    /// exactly what creation needs. A component missing mid-path reports
    /// neither.
    Missing {
        dir: Option<FileHandle>,
        last: Option<String>,
    },
}

impl FileSystem {
    /// Resolve `path` from the root. `Err(BadPath)` reports an overlong
    /// component; everything else is a [`PathResolution`].
    pub fn walk_path(&self, k: &mut Kernel, path: &str) -> Result<PathResolution, KernelError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut file = FileHandle::root();
        let mut dir: Option<FileHandle> = None;

        while let Some(name) = components.next() {
            if name.len() >= MAXNAMELEN {
                return Err(KernelError::BadPath);
            }
            if self.load_rec(k, &file)?.ftype != FileType::Dir {
                return Ok(PathResolution::Missing {
                    dir: None,
                    last: None,
                });
            }
            dir = Some(file);
            match self.dir_lookup(k, &file, name)? {
                Some(found) => file = found,
                None => {
                    if components.peek().is_none() {
                        return Ok(PathResolution::Missing {
                            dir,
                            last: Some(name.to_string()),
                        });
                    }
                    return Ok(PathResolution::Missing {
                        dir: None,
                        last: None,
                    });
                }
            }
        }

        Ok(PathResolution::Found { dir, file })
    }

    /// Scan every record of every block of `dir` for an exact name match.
    /// A hit comes back with the parent back-pointer stamped.
    pub fn dir_lookup(
        &self,
        k: &mut Kernel,
        dir: &FileHandle,
        name: &str,
    ) -> Result<Option<FileHandle>, KernelError> {
        let rec = self.load_rec(k, dir)?;
        assert_eq!(rec.size % BLKSIZE, 0, "directory size not block-aligned");
        for i in 0..rec.size / BLKSIZE {
            let blkva = self.file_get_block(k, dir, i)?;
            let blockno = Self::va_to_blockno(blkva);
            for j in 0..BLKFILES as u32 {
                let entry = FileRec::decode(&read_bytes(
                    k,
                    blkva.add(j * REC_SIZE as u32),
                    REC_SIZE,
                )?);
                if entry.name == name {
                    return Ok(Some(FileHandle {
                        loc: RecordLoc::Slot {
                            block: blockno,
                            index: j,
                        },
                        parent: Some(dir.loc),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Find a free record slot in `dir`, growing the directory by one whole
    /// block when every slot is taken - directory sizes stay a multiple of
    /// the block size.
    pub fn dir_alloc_file(
        &self,
        k: &mut Kernel,
        dir: &FileHandle,
    ) -> Result<FileHandle, KernelError> {
        let rec = self.load_rec(k, dir)?;
        assert_eq!(rec.size % BLKSIZE, 0, "directory size not block-aligned");
        let nblock = rec.size / BLKSIZE;
        for i in 0..nblock {
            let blkva = self.file_get_block(k, dir, i)?;
            let blockno = Self::va_to_blockno(blkva);
            for j in 0..BLKFILES as u32 {
                let first = read_bytes(k, blkva.add(j * REC_SIZE as u32), 1)?;
                if first[0] == 0 {
                    return Ok(FileHandle {
                        loc: RecordLoc::Slot {
                            block: blockno,
                            index: j,
                        },
                        parent: Some(dir.loc),
                    });
                }
            }
        }

        // Grow by one block; a freshly allocated block reads as zeros, so
        // every slot in it is free.
        let rva = self.rec_va(k, dir.loc)?;
        crate::cache::write_u32(
            k,
            rva.add(crate::layout::OFF_SIZE as u32),
            rec.size + BLKSIZE,
        )?;
        let blkva = self.file_get_block(k, dir, nblock)?;
        Ok(FileHandle {
            loc: RecordLoc::Slot {
                block: Self::va_to_blockno(blkva),
                index: 0,
            },
            parent: Some(dir.loc),
        })
    }

    /// Create a regular file at `path`. Fails with `Exists` if something is
    /// already there, `NotFound` if the containing directory is missing.
    pub fn file_create(&self, k: &mut Kernel, path: &str) -> Result<FileHandle, KernelError> {
        match self.walk_path(k, path)? {
            PathResolution::Found { .. } => Err(KernelError::Exists),
            PathResolution::Missing {
                dir: Some(dir),
                last: Some(name),
            } => {
                let slot = self.dir_alloc_file(k, &dir)?;
                let mut rec = FileRec::empty();
                rec.name = name;
                self.store_rec(k, &slot, &rec)?;
                Ok(slot)
            }
            PathResolution::Missing { .. } => Err(KernelError::NotFound),
        }
    }

    /// Open the file at `path`.
    pub fn file_open(&self, k: &mut Kernel, path: &str) -> Result<FileHandle, KernelError> {
        match self.walk_path(k, path)? {
            PathResolution::Found { file, .. } => Ok(file),
            PathResolution::Missing { .. } => Err(KernelError::NotFound),
        }
    }

    /// Remove the file at `path`: truncate it to nothing and zero the name
    /// byte, leaving the record slot free for reuse.
    pub fn file_remove(&self, k: &mut Kernel, path: &str) -> Result<(), KernelError> {
        let file = self.file_open(k, path)?;
        self.file_truncate_blocks(k, &file, 0)?;
        let mut rec = self.load_rec(k, &file)?;
        rec.name = String::new();
        rec.size = 0;
        self.store_rec(k, &file, &rec)?;
        if let Some(parent) = file.parent {
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
}
