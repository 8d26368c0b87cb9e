//! Translation lookaside buffer.
//!
//! Caches leaf translations for the active address space. The cache is
//! flushed whenever a new root is loaded and individual pages are dropped
//! by `invlpg`. Kernel code that mutates a mapping in the active space must
//! invalidate the page, or the stale cached translation keeps serving -
//! exactly the failure mode real hardware has.

use std::collections::HashMap;

use crate::machine::mmu::Pte;
use crate::memory::address::{PhysAddr, VirtAddr};

#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    /// Cached frame base.
    pub frame: PhysAddr,
    /// Permissions at fill time.
    pub flags: Pte,
    /// Where the leaf entry lives, so a cached-hit store can still set the
    /// dirty bit in memory.
    pub pte_pa: PhysAddr,
}

#[derive(Default)]
pub struct Tlb {
    entries: HashMap<u32, TlbEntry>,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full flush; performed on every address-space switch.
    pub fn flush(&mut self) {
        self.entries.clear();
    }

    /// Drop the translation for one virtual page.
    pub fn invlpg(&mut self, va: VirtAddr) {
        self.entries.remove(&va.vpn());
    }

    pub fn lookup(&self, va: VirtAddr) -> Option<TlbEntry> {
        self.entries.get(&va.vpn()).copied()
    }

    pub fn insert(&mut self, va: VirtAddr, entry: TlbEntry) {
        self.entries.insert(va.vpn(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> TlbEntry {
        TlbEntry {
            frame: PhysAddr::new(0x3000),
            flags: Pte::P | Pte::U,
            pte_pa: PhysAddr::new(0x2004),
        }
    }

    #[test]
    fn invlpg_drops_only_the_page() {
        let mut tlb = Tlb::new();
        tlb.insert(VirtAddr::new(0x1000), entry());
        tlb.insert(VirtAddr::new(0x2000), entry());
        tlb.invlpg(VirtAddr::new(0x1000));
        assert!(tlb.lookup(VirtAddr::new(0x1000)).is_none());
        assert!(tlb.lookup(VirtAddr::new(0x2000)).is_some());
        tlb.flush();
        assert!(tlb.lookup(VirtAddr::new(0x2000)).is_none());
    }
}
