//! The simulated machine: RAM, MMU, TLB, IDE disk, console.
//!
//! Everything the rest of the kernel treats as hardware lives here behind
//! small checked operations. The kernel proper never touches raw entry
//! words, the TLB, or the disk except through this module.

pub mod console;
pub mod ide;
pub mod mmu;
pub mod ram;
pub mod tlb;

use crate::config::MachineConfig;
use console::BufferConsole;
use ide::Ide;
use ram::Ram;
use tlb::Tlb;

pub struct Machine {
    pub ram: Ram,
    pub tlb: Tlb,
    pub ide: Ide,
    pub console: BufferConsole,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            ram: Ram::new(config.npages),
            tlb: Tlb::new(),
            ide: Ide::new(config.disk_image),
            console: BufferConsole::new(),
        }
    }
}
