//! Kernel configuration: the virtual memory map and machine geometry.
//!
//! The virtual address space is split at `UTOP`: everything below it belongs
//! to the running environment, everything at or above it is kernel territory
//! that every environment shares. Two read-only windows poke through for
//! user code: the page-table self-map at `UVPT`, and nothing else.
//!
//! ```text
//!  4 GiB ┌──────────────────────┐
//!        │  kernel direct map   │  KERNBASE
//!        ├──────────────────────┤
//!        │  page-table self-map │  UVPT .. UVPT + PTSIZE  (read-only)
//!        ├──────────────────────┤
//!        │  (kernel only)       │
//!  UTOP  ├──────────────────────┤  = UXSTACKTOP
//!        │  exception stack     │  one page
//!        │  (gap page)          │
//!        │  normal user stack   │  grows down from USTACKTOP
//!        │  ...                 │
//!        │  user text / data    │  UTEXT
//!        │  staging window      │  UTEMP .. UTEMP + PTSIZE (PFTEMP at top)
//!    0   └──────────────────────┘
//! ```

/// Bytes per page (and per disk block).
pub const PGSIZE: u32 = 4096;
/// log2(PGSIZE)
pub const PGSHIFT: u32 = 12;
/// Entries per page table / page directory.
pub const NPTENTRIES: u32 = 1024;
pub const NPDENTRIES: u32 = 1024;
/// Bytes mapped by one page-directory entry.
pub const PTSIZE: u32 = PGSIZE * NPTENTRIES;

/// Base of the kernel's direct mapping of physical memory.
pub const KERNBASE: u32 = 0xF000_0000;
/// Top of user-readable virtual memory. The self-map window lives between
/// UTOP and ULIM; ordinary user mappings must stay below UTOP.
pub const ULIM: u32 = 0xEF80_0000;
/// Read-only virtual window onto the current environment's page tables.
pub const UVPT: u32 = 0xEF40_0000;
/// Top of ordinary user address space.
pub const UTOP: u32 = 0xEEC0_0000;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; one invalid guard page separates it from
/// the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
/// Conventional load address for user program text.
pub const UTEXT: u32 = 0x0080_0000;
/// Page-sized staging window used by spawn and the fault handler.
pub const UTEMP: u32 = 0x0040_0000;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// Capacity of the environment table.
pub const NENV: usize = 64;
/// Shift applied to the generation counter when composing environment ids.
/// Must leave enough low bits for a slot index (NENV <= 1 << ENVGENSHIFT).
pub const ENVGENSHIFT: u32 = 12;

/// Bytes per disk sector.
pub const SECTSIZE: usize = 512;
/// Sectors per 4 KiB block.
pub const BLKSECTS: usize = PGSIZE as usize / SECTSIZE;

/// Default number of physical page frames (4 MiB of RAM).
pub const DEFAULT_NPAGES: usize = 1024;
/// Frames at the bottom of physical memory reserved for the kernel image
/// and boot structures; never handed out by the frame allocator.
pub const NRESERVED_FRAMES: usize = 8;

/// Timer period in milliseconds; the clock fires 100 times a second.
pub const MSEC_PER_TICK: u32 = 10;

static_assertions::const_assert!(NENV <= 1 << ENVGENSHIFT);
static_assertions::const_assert_eq!(UTOP % PTSIZE, 0);
static_assertions::const_assert_eq!(UVPT % PTSIZE, 0);
static_assertions::const_assert_eq!(KERNBASE % PTSIZE, 0);

/// Boot-time description of the simulated machine.
///
/// The disk image may be any length; it is padded up to whole sectors.
pub struct MachineConfig {
    /// Number of physical 4 KiB frames.
    pub npages: usize,
    /// Initial contents of the IDE disk.
    pub disk_image: Vec<u8>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            npages: DEFAULT_NPAGES,
            disk_image: Vec::new(),
        }
    }
}

impl MachineConfig {
    /// Configuration with a prepared disk image and default RAM size.
    pub fn with_disk(disk_image: Vec<u8>) -> Self {
        Self {
            disk_image,
            ..Self::default()
        }
    }
}
