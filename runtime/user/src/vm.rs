//! Reading the page-table self-map.
//!
//! The kernel publishes a read-only window at UVPT through which an
//! environment sees its own page tables: the leaf entries appear as a flat
//! array indexed by virtual page number, and the directory entries appear
//! inside that array at the self-referential slot. These helpers do the
//! index arithmetic; the loads are ordinary user reads through the MMU.

use kestrel_kernel::config::{PGSHIFT, UVPT};
use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::Kernel;

/// Address of the leaf page-table entry covering `va`.
pub fn vpt_addr(va: VirtAddr) -> VirtAddr {
    VirtAddr::new(UVPT + 4 * va.vpn())
}

/// Address of the page-directory entry covering `va`.
pub fn vpd_addr(va: VirtAddr) -> VirtAddr {
    let uvpt_pdx = VirtAddr::new(UVPT).pdx() as u32;
    VirtAddr::new(UVPT + (uvpt_pdx << PGSHIFT) + 4 * va.pdx() as u32)
}

/// The raw leaf entry covering `va` in the current environment.
pub fn vpt_entry(k: &mut Kernel, va: VirtAddr) -> Result<u32, KernelError> {
    k.user_read_u32(vpt_addr(va))
        .map_err(|_| KernelError::Unspecified)
}

/// The raw directory entry covering `va` in the current environment.
pub fn vpd_entry(k: &mut Kernel, va: VirtAddr) -> Result<u32, KernelError> {
    k.user_read_u32(vpd_addr(va))
        .map_err(|_| KernelError::Unspecified)
}

/// Permission bits of the leaf entry covering `va`.
pub fn pte_flags(k: &mut Kernel, va: VirtAddr) -> Result<Pte, KernelError> {
    Ok(Pte::from_bits_truncate(vpt_entry(k, va)? & 0xfff))
}

/// Is `va` mapped (both levels present) in the current environment?
pub fn va_is_mapped(k: &mut Kernel, va: VirtAddr) -> Result<bool, KernelError> {
    if !Pte::from_bits_truncate(vpd_entry(k, va)? & 0xfff).contains(Pte::P) {
        return Ok(false);
    }
    Ok(Pte::from_bits_truncate(vpt_entry(k, va)? & 0xfff).contains(Pte::P))
}

/// Is the page at `va` dirty in the current environment?
pub fn va_is_dirty(k: &mut Kernel, va: VirtAddr) -> Result<bool, KernelError> {
    Ok(pte_flags(k, va)?.contains(Pte::D))
}
