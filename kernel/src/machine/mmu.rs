//! Page-table entry format and the hardware walk.
//!
//! Entries are 32 bits: a frame number in the top 20 bits and permission
//! bits in the bottom 12. The walk here is the one the MMU performs on every
//! user access: two levels, permission checks at both, accessed and dirty
//! bits set as a side effect. Everything that touches raw entry words goes
//! through the small checked helpers in this module.

use bitflags::bitflags;

use crate::config::PGSIZE;
use crate::machine::ram::Ram;
use crate::memory::address::{PhysAddr, VirtAddr};

bitflags! {
    /// Permission bits of a page-table (or page-directory) entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pte: u32 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Write-through (forbidden to user requests).
        const PWT = 1 << 3;
        /// Cache-disable (forbidden to user requests).
        const PCD = 1 << 4;
        /// Accessed; set by the MMU on any translation.
        const A = 1 << 5;
        /// Dirty; set by the MMU on a write.
        const D = 1 << 6;
        /// Large page (forbidden; only 4 KiB pages exist here).
        const PS = 1 << 7;
        /// Global (unused, forbidden to user requests).
        const G = 1 << 8;
        /// The three software-available bits.
        const AVAIL = 0xe00;
        /// Copy-on-write marker, carved out of the software bits and
        /// interpreted by the user runtime, never by the MMU.
        const COW = 1 << 11;
    }
}

impl Pte {
    /// Bits a syscall may request when establishing a mapping: present,
    /// writable, user, and the software bits. Everything else is hardware
    /// territory.
    pub const SYSCALL_ALLOWED: Pte = Pte::P
        .union(Pte::W)
        .union(Pte::U)
        .union(Pte::AVAIL);

    /// Does `perm` satisfy the rules of the mapping syscalls: P and U set,
    /// nothing outside the allowed mask?
    pub fn valid_syscall_perm(self) -> bool {
        self.contains(Pte::P | Pte::U) && Pte::SYSCALL_ALLOWED.contains(self)
    }
}

bitflags! {
    /// Page-fault error code bits, as pushed for the fault handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultErr: u32 {
        /// Fault on a present page (permission violation) rather than a
        /// missing translation.
        const PRESENT = 1 << 0;
        /// Fault caused by a write.
        const WRITE = 1 << 1;
        /// Fault taken in user mode.
        const USER = 1 << 2;
    }
}

/// A page fault produced by the simulated MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub va: VirtAddr,
    pub err: FaultErr,
}

/// Frame address carried by an entry.
#[inline]
pub fn entry_addr(entry: u32) -> PhysAddr {
    PhysAddr::new(entry & !(PGSIZE - 1))
}

/// Permission bits carried by an entry.
#[inline]
pub fn entry_flags(entry: u32) -> Pte {
    Pte::from_bits_truncate(entry & (PGSIZE - 1))
}

/// Compose an entry from a frame address and permission bits.
#[inline]
pub fn make_entry(pa: PhysAddr, flags: Pte) -> u32 {
    debug_assert_eq!(pa.as_u32() % PGSIZE, 0);
    pa.as_u32() | flags.bits()
}

/// Result of a successful two-level probe: where the leaf entry lives and
/// what it currently holds.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    /// Physical address of the leaf page-table entry word.
    pub pte_pa: PhysAddr,
    /// The leaf entry value at probe time.
    pub pte: u32,
}

/// Walk the page tables without side effects or permission checks.
///
/// Returns the leaf slot if both levels are present. This is the kernel's
/// view (`page_lookup` builds on it); the user-mode access path layers the
/// permission checks of [`access`] on top.
pub fn probe(ram: &Ram, pgdir: PhysAddr, va: VirtAddr) -> Option<Translation> {
    let pde = ram.read_u32(pgdir.add(4 * va.pdx() as u32));
    if !entry_flags(pde).contains(Pte::P) {
        return None;
    }
    let pte_pa = entry_addr(pde).add(4 * va.ptx() as u32);
    let pte = ram.read_u32(pte_pa);
    Some(Translation { pte_pa, pte })
}

/// Perform the access-time walk for a user-mode load or store.
///
/// Checks P and U at the directory level and P, U (and W for stores) at the
/// leaf, sets the accessed bit, and sets the dirty bit on a store. Returns
/// the physical address of the byte, or the fault the MMU would raise.
pub fn access(
    ram: &mut Ram,
    pgdir: PhysAddr,
    va: VirtAddr,
    write: bool,
) -> Result<PhysAddr, PageFault> {
    let fault = |err: FaultErr| PageFault {
        va,
        err: err | FaultErr::USER | if write { FaultErr::WRITE } else { FaultErr::empty() },
    };

    let pde = ram.read_u32(pgdir.add(4 * va.pdx() as u32));
    let pde_flags = entry_flags(pde);
    if !pde_flags.contains(Pte::P) {
        return Err(fault(FaultErr::empty()));
    }
    if !pde_flags.contains(Pte::U) {
        return Err(fault(FaultErr::PRESENT));
    }

    let pte_pa = entry_addr(pde).add(4 * va.ptx() as u32);
    let pte = ram.read_u32(pte_pa);
    let flags = entry_flags(pte);
    if !flags.contains(Pte::P) {
        return Err(fault(FaultErr::empty()));
    }
    if !flags.contains(Pte::U) || (write && !flags.contains(Pte::W)) {
        return Err(fault(FaultErr::PRESENT));
    }

    let mut updated = flags | Pte::A;
    if write {
        updated |= Pte::D;
    }
    if updated != flags {
        ram.write_u32(pte_pa, make_entry(entry_addr(pte), updated));
    }

    Ok(entry_addr(pte).add(va.page_offset()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_perm_mask() {
        assert!((Pte::P | Pte::U).valid_syscall_perm());
        assert!((Pte::P | Pte::U | Pte::W | Pte::COW).valid_syscall_perm());
        // Missing U, missing P, and hardware bits are all rejected.
        assert!(!Pte::P.valid_syscall_perm());
        assert!(!(Pte::U | Pte::W).valid_syscall_perm());
        assert!(!(Pte::P | Pte::U | Pte::D).valid_syscall_perm());
        assert!(!(Pte::P | Pte::U | Pte::PS).valid_syscall_perm());
    }

    #[test]
    fn entry_round_trip() {
        let pa = PhysAddr::new(0x5000);
        let e = make_entry(pa, Pte::P | Pte::W | Pte::COW);
        assert_eq!(entry_addr(e), pa);
        assert_eq!(entry_flags(e), Pte::P | Pte::W | Pte::COW);
    }
}
