//! Kestrel kernel.
//!
//! A small exokernel-style multitasking kernel for a 32-bit paged machine,
//! rendered as a hosted simulation: the hardware (RAM, MMU + TLB, IDE disk,
//! console) is the `machine` module, and the kernel runs against it as
//! ordinary Rust, so the whole stack is exercised by `cargo test`.
//!
//! # Architecture
//!
//! - `machine`: the simulated hardware and the checked operations over it
//! - `memory`: physical frame allocator and per-environment address spaces
//! - `objects`: environments (tasks) and saved register state
//! - `sched`: round-robin scheduler and the clock tick
//! - `trap`: user memory access, page-fault delivery, upcalls
//! - `syscall`: the numeric ABI and its typed handlers
//!
//! There is no ambient global state: everything lives in [`Kernel`], which
//! is threaded through every operation.

pub mod config;
pub mod error;
pub mod machine;
pub mod memory;
pub mod objects;
pub mod sched;
pub mod syscall;
pub mod trap;

use std::collections::BTreeMap;

use log::info;

use config::{MachineConfig, NPTENTRIES, NRESERVED_FRAMES, PGSIZE, PTSIZE, SECTSIZE};
use machine::mmu::{self, Pte};
use machine::Machine;
use memory::address::{Pfn, VirtAddr};
use memory::FrameAllocator;
use objects::env::{Env, EnvId};

pub use error::KernelError;
pub use machine::mmu::{FaultErr, PageFault};
pub use objects::{EnvInfo, EnvStatus, Mode, PushRegs, TrapFrame, UTrapFrame};
pub use sched::Schedule;
pub use trap::{Trap, TrapOutcome, UserFault};

/// A piece of "program text": simulated user code registered at a virtual
/// address. The page-fault upcall entry point is one of these.
pub type TextFn = fn(&mut Kernel);

/// The kernel context: machine, physical memory, environment table,
/// scheduler state. One per simulated machine.
pub struct Kernel {
    pub(crate) machine: Machine,
    pub(crate) frames: FrameAllocator,
    pub(crate) kern_pgdir: Pfn,
    pub(crate) envs: Vec<Env>,
    /// Slot of the running environment.
    pub(crate) curenv: Option<usize>,
    /// Page-directory root loaded in the MMU.
    pub(crate) cr3: Option<Pfn>,
    pub(crate) ticks: u32,
    /// True while kernel code runs; the timer must never fire then.
    pub(crate) in_kernel: bool,
    pub(crate) upcall_depth: u32,
    /// Simulated instruction memory: virtual address -> code.
    pub(crate) text: BTreeMap<u32, TextFn>,
}

impl Kernel {
    /// Bring the machine up: build the kernel address space, hand the rest
    /// of RAM to the frame allocator, and seed the idle environment in
    /// slot 0.
    pub fn boot(config: MachineConfig) -> Self {
        let npages = config.npages;
        assert!(npages >= NRESERVED_FRAMES + 8, "machine too small to boot");
        assert!(
            (npages as u64) * PGSIZE as u64 <= (1u64 << 32) - config::KERNBASE as u64,
            "RAM does not fit in the kernel window"
        );

        let mut kernel = Kernel {
            machine: Machine::new(config),
            frames: FrameAllocator::new(npages, NRESERVED_FRAMES),
            kern_pgdir: Pfn(0),
            envs: (0..config::NENV).map(Env::empty).collect(),
            curenv: None,
            cr3: None,
            ticks: 0,
            in_kernel: false,
            upcall_depth: 0,
            text: BTreeMap::new(),
        };

        kernel.kern_pgdir = kernel.build_kernel_pgdir(npages);
        info!(
            "kestrel booted: {} frames ({} free), kernel root at frame {}",
            npages,
            kernel.frames.free_count(),
            kernel.kern_pgdir.0
        );

        // Seed the idle environment; it runs iff nothing else can.
        let idle = kernel
            .env_alloc(EnvId(0))
            .expect("boot: cannot seed idle environment");
        assert_eq!(idle, 0, "idle environment must land in slot 0");

        kernel
    }

    /// Map all of physical memory at KERNBASE, kernel-only, in a fresh
    /// page directory shared (above UTOP) by every environment.
    fn build_kernel_pgdir(&mut self, npages: usize) -> Pfn {
        let pgdir = self
            .page_alloc_frame(true)
            .expect("boot: no frame for kernel page directory");
        self.frames.incref(pgdir);

        let nptabs = npages.div_ceil(NPTENTRIES as usize);
        for chunk in 0..nptabs {
            let table = self
                .page_alloc_frame(true)
                .expect("boot: no frame for kernel page table");
            self.frames.incref(table);

            let base = config::KERNBASE + chunk as u32 * PTSIZE;
            self.machine.ram.write_u32(
                pgdir.phys_addr().add(4 * VirtAddr::new(base).pdx() as u32),
                mmu::make_entry(table.phys_addr(), Pte::P | Pte::W),
            );
            for i in 0..NPTENTRIES as usize {
                let frame = chunk * NPTENTRIES as usize + i;
                if frame >= npages {
                    break;
                }
                self.machine.ram.write_u32(
                    table.phys_addr().add(4 * i as u32),
                    mmu::make_entry(Pfn(frame as u32).phys_addr(), Pte::P | Pte::W),
                );
            }
        }
        pgdir
    }

    /// Register simulated program text at a virtual address. Idempotent.
    pub fn register_text(&mut self, va: VirtAddr, f: TextFn) {
        self.text.insert(va.as_u32(), f);
    }

    /// Feed bytes to the console input queue.
    pub fn console_input(&mut self, bytes: &[u8]) {
        self.machine.console.push_input(bytes);
    }

    /// Drain everything written to the console so far.
    pub fn console_output(&mut self) -> Vec<u8> {
        self.machine.console.take_output()
    }

    /// DMA a run of sectors from the disk into the current environment's
    /// memory. The destination must be mapped user-writable; the transfer
    /// does not set the dirty bit (it is the device writing, not the user).
    pub fn ide_read(&mut self, secno: u32, va: VirtAddr, nsects: usize) -> Result<(), KernelError> {
        if va.as_u32() % SECTSIZE as u32 != 0 {
            return Err(KernelError::Inval);
        }
        let slot = self.curenv.ok_or(KernelError::BadEnv)?;
        let pgdir = self.envs[slot].pgdir;
        let mut sector = vec![0u8; SECTSIZE];
        for i in 0..nsects {
            let dst = va.add((i * SECTSIZE) as u32);
            let (pfn, flags) = self
                .page_lookup(pgdir, dst.page_base())
                .ok_or(KernelError::Inval)?;
            if !flags.contains(Pte::U | Pte::W) {
                return Err(KernelError::Inval);
            }
            self.machine.ide.read(secno + i as u32, &mut sector);
            self.machine
                .ram
                .write(pfn.phys_addr().add(dst.page_offset()), &sector);
        }
        Ok(())
    }

    /// DMA a run of sectors from the current environment's memory to disk.
    pub fn ide_write(&mut self, secno: u32, va: VirtAddr, nsects: usize) -> Result<(), KernelError> {
        if va.as_u32() % SECTSIZE as u32 != 0 {
            return Err(KernelError::Inval);
        }
        let slot = self.curenv.ok_or(KernelError::BadEnv)?;
        let pgdir = self.envs[slot].pgdir;
        let mut sector = vec![0u8; SECTSIZE];
        for i in 0..nsects {
            let src = va.add((i * SECTSIZE) as u32);
            let (pfn, flags) = self
                .page_lookup(pgdir, src.page_base())
                .ok_or(KernelError::Inval)?;
            if !flags.contains(Pte::U) {
                return Err(KernelError::Inval);
            }
            self.machine
                .ram
                .read(pfn.phys_addr().add(src.page_offset()), &mut sector);
            self.machine.ide.write(secno + i as u32, &sector);
        }
        Ok(())
    }

    /// Number of sectors on the attached disk.
    pub fn disk_sectors(&self) -> usize {
        self.machine.ide.nsectors()
    }
}
