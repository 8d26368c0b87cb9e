//! Traps: user memory access, page-fault delivery, and upcalls.
//!
//! Every user-mode load and store funnels through [`Kernel::user_read`] /
//! [`Kernel::user_write`]: the access is translated by the simulated MMU
//! (TLB first, then the page-table walk), and a fault is delivered exactly
//! the way the trap path would deliver it - either the environment dies, or
//! a fault record is pushed on its exception stack and its registered
//! upcall runs, after which the access retries.
//!
//! Kernel-mode faults do not exist here by construction: kernel code only
//! touches user memory after an explicit check, and a violation of that
//! discipline panics in the machine layer.

use log::{debug, warn};

use crate::config::{PGSIZE, UXSTACKTOP};
use crate::machine::mmu::{self, PageFault, Pte};
use crate::machine::tlb::TlbEntry;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::objects::env::EnvStatus;
use crate::objects::trapframe::{UTrapFrame, FL_IF, UTF_SIZE};
use crate::Kernel;

/// Nested upcall depth at which the kernel gives up on an environment.
const MAX_UPCALL_DEPTH: u32 = 16;

/// Retries of a single access before the kernel declares livelock: a
/// handler that keeps returning without fixing the fault.
const MAX_FAULT_RETRIES: u32 = 8;

/// A user access failed unrecoverably: the current environment was
/// destroyed while handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFault {
    Destroyed,
}

/// CPU exceptions and interrupts the dispatcher handles. Page faults and
/// syscalls have their own entry paths; the rest arrive through
/// [`Kernel::deliver_trap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    DivideError,
    Breakpoint,
    GeneralProtection,
    /// Noise on the interrupt line; ignored.
    SpuriousIrq,
}

/// What became of a delivered trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The interrupted environment resumes.
    Resumed,
    /// Control dropped into the monitor (breakpoint).
    Monitor,
    /// The faulting environment was destroyed.
    EnvDestroyed,
}

impl Kernel {
    /// Translate one user access through the TLB and page tables, with the
    /// MMU's permission checks and accessed/dirty updates.
    fn translate_user(&mut self, va: VirtAddr, write: bool) -> Result<PhysAddr, PageFault> {
        let slot = self.curenv.expect("user access with no environment");
        let pgdir = self.envs[slot].pgdir;

        if let Some(entry) = self.machine.tlb.lookup(va) {
            let mut need = Pte::P | Pte::U;
            if write {
                need |= Pte::W;
            }
            if entry.flags.contains(need) {
                if write {
                    // Dirty update on a cached hit still lands in memory.
                    let pte = self.machine.ram.read_u32(entry.pte_pa);
                    self.machine.ram.write_u32(
                        entry.pte_pa,
                        mmu::make_entry(
                            mmu::entry_addr(pte),
                            mmu::entry_flags(pte) | Pte::A | Pte::D,
                        ),
                    );
                }
                return Ok(entry.frame.add(va.page_offset()));
            }
            // Stale or insufficient cached translation faults; it is the
            // mapping syscalls' job to invalidate what they change.
            let mut err = mmu::FaultErr::PRESENT | mmu::FaultErr::USER;
            if write {
                err |= mmu::FaultErr::WRITE;
            }
            return Err(PageFault { va, err });
        }

        let pa = mmu::access(&mut self.machine.ram, pgdir.phys_addr(), va, write)?;
        if let Some(t) = mmu::probe(&self.machine.ram, pgdir.phys_addr(), va) {
            self.machine.tlb.insert(
                va,
                TlbEntry {
                    frame: mmu::entry_addr(t.pte),
                    flags: mmu::entry_flags(t.pte),
                    pte_pa: t.pte_pa,
                },
            );
        }
        Ok(pa)
    }

    fn user_access(
        &mut self,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut buf_read: Option<&mut [u8]>,
        buf_write: Option<&[u8]>,
    ) -> Result<(), UserFault> {
        let mut off = 0usize;
        while off < len {
            let cur = va.add(off as u32);
            let in_page = (PGSIZE - cur.page_offset()) as usize;
            let chunk = in_page.min(len - off);

            let mut retries = 0;
            let pa = loop {
                match self.translate_user(cur, write) {
                    Ok(pa) => break pa,
                    Err(fault) => {
                        retries += 1;
                        if retries > MAX_FAULT_RETRIES {
                            warn!("fault at {} not resolved by upcall; destroying env", cur);
                            let slot = self.curenv.expect("faulting env vanished");
                            self.env_destroy(slot);
                            return Err(UserFault::Destroyed);
                        }
                        self.page_fault(fault)?;
                    }
                }
            };

            if write {
                let src = &buf_write.as_ref().unwrap()[off..off + chunk];
                self.machine.ram.write(pa, src);
            } else {
                let dst = &mut buf_read.as_deref_mut().unwrap()[off..off + chunk];
                self.machine.ram.read(pa, dst);
            }
            off += chunk;
        }
        Ok(())
    }

    /// User-mode load of `buf.len()` bytes at `va` by the current env.
    pub fn user_read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), UserFault> {
        let len = buf.len();
        self.user_access(va, len, false, Some(buf), None)
    }

    /// User-mode store of `buf` at `va` by the current env. Takes COW
    /// faults and resumes exactly like the hardware path.
    pub fn user_write(&mut self, va: VirtAddr, buf: &[u8]) -> Result<(), UserFault> {
        self.user_access(va, buf.len(), true, None, Some(buf))
    }

    pub fn user_read_u32(&mut self, va: VirtAddr) -> Result<u32, UserFault> {
        let mut bytes = [0u8; 4];
        self.user_read(va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn user_write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), UserFault> {
        self.user_write(va, &value.to_le_bytes())
    }

    /// Deliver a user-mode page fault per the trap policy: destroy the env
    /// if it has no upcall, otherwise push a fault record on the exception
    /// stack and run the upcall, then restore the interrupted state.
    pub(crate) fn page_fault(&mut self, fault: PageFault) -> Result<(), UserFault> {
        let slot = self.curenv.expect("user fault with no environment");
        let id = self.envs[slot].id;
        debug!(
            "{} user fault va {} err {:?} eip {:#010x}",
            id, fault.va, fault.err, self.envs[slot].tf.eip
        );

        let Some(upcall) = self.envs[slot].pgfault_upcall else {
            warn!("{} faulted with no upcall registered", id);
            self.env_destroy(slot);
            return Err(UserFault::Destroyed);
        };
        if self.upcall_depth >= MAX_UPCALL_DEPTH {
            warn!("{} exception stack overflow", id);
            self.env_destroy(slot);
            return Err(UserFault::Destroyed);
        }

        self.in_kernel = true;
        let pushed = self.push_fault_record(slot, fault);
        self.in_kernel = false;
        pushed?;

        let Some(handler) = self.text.get(&upcall.as_u32()).copied() else {
            warn!("{} upcall address {} has no code", id, upcall);
            self.env_destroy(slot);
            return Err(UserFault::Destroyed);
        };
        self.envs[slot].tf.eip = upcall.as_u32();

        self.upcall_depth += 1;
        handler(self);
        self.upcall_depth -= 1;

        // The handler may have destroyed its environment (a fault it does
        // not understand is fatal by its rules).
        let env = &self.envs[slot];
        if env.id != id || matches!(env.status, EnvStatus::Free | EnvStatus::Dying) {
            return Err(UserFault::Destroyed);
        }

        self.upcall_return(slot)
    }

    /// Push the fault record onto the exception stack.
    ///
    /// A nested fault (the faulting stack pointer is already inside the
    /// exception stack) pushes below the live frame, leaving one scratch
    /// word for the return path; otherwise the record lands at the top.
    fn push_fault_record(&mut self, slot: usize, fault: PageFault) -> Result<(), UserFault> {
        let tf = self.envs[slot].tf;
        let uesp = tf.esp;
        let nested = uesp >= UXSTACKTOP - PGSIZE && uesp < UXSTACKTOP;
        let new_esp = if nested {
            uesp - 4 - UTF_SIZE
        } else {
            UXSTACKTOP - UTF_SIZE
        };
        let check_len = if nested { UTF_SIZE + 4 } else { UTF_SIZE };

        if self
            .user_mem_check(slot, VirtAddr::new(new_esp), check_len, Pte::U | Pte::W)
            .is_err()
        {
            warn!(
                "{} exception stack not writable at {:#010x}",
                self.envs[slot].id, new_esp
            );
            self.env_destroy(slot);
            return Err(UserFault::Destroyed);
        }

        let utf = UTrapFrame {
            fault_va: fault.va.as_u32(),
            err: fault.err.bits(),
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: uesp,
        };
        self.copy_to_user(slot, VirtAddr::new(new_esp), &utf.to_bytes())
            .expect("checked exception stack must accept the fault record");
        if nested {
            // Scratch word the return path would use on real hardware.
            self.copy_to_user(slot, VirtAddr::new(uesp - 4), &0u32.to_le_bytes())
                .expect("checked scratch word must be writable");
        }
        self.envs[slot].tf.esp = new_esp;
        Ok(())
    }

    /// Return from an upcall: pop the fault record the handler just ran on
    /// and resume the trap-time state it carries.
    fn upcall_return(&mut self, slot: usize) -> Result<(), UserFault> {
        let esp = self.envs[slot].tf.esp;
        let mut bytes = [0u8; UTF_SIZE as usize];
        if self
            .copy_from_user(slot, VirtAddr::new(esp), &mut bytes)
            .is_err()
        {
            self.env_destroy(slot);
            return Err(UserFault::Destroyed);
        }
        let utf = UTrapFrame::from_bytes(&bytes);
        let tf = &mut self.envs[slot].tf;
        tf.regs = utf.regs;
        tf.eip = utf.eip;
        tf.eflags = utf.eflags | FL_IF;
        tf.esp = utf.esp;
        Ok(())
    }

    /// Dispatch a trap raised while the current environment ran.
    ///
    /// Exceptions with no dedicated handler are fatal to the environment
    /// that raised them; a breakpoint drops into the monitor; a spurious
    /// interrupt is noise and is ignored.
    pub fn deliver_trap(&mut self, trap: Trap) -> TrapOutcome {
        match trap {
            Trap::SpuriousIrq => {
                warn!("spurious interrupt, ignoring");
                TrapOutcome::Resumed
            }
            Trap::Breakpoint => TrapOutcome::Monitor,
            Trap::DivideError | Trap::GeneralProtection => {
                let Some(slot) = self.curenv else {
                    panic!("unhandled trap {:?} in kernel", trap);
                };
                warn!("{} killed by {:?}", self.envs[slot].id, trap);
                self.env_destroy(slot);
                TrapOutcome::EnvDestroyed
            }
        }
    }

    /// Kernel write into an environment's user memory, honoring user
    /// permissions. Used after an explicit check; a fault here is an error,
    /// never an upcall.
    pub(crate) fn copy_to_user(
        &mut self,
        slot: usize,
        va: VirtAddr,
        buf: &[u8],
    ) -> Result<(), PageFault> {
        let pgdir = self.envs[slot].pgdir.phys_addr();
        let mut off = 0usize;
        while off < buf.len() {
            let cur = va.add(off as u32);
            let chunk = ((PGSIZE - cur.page_offset()) as usize).min(buf.len() - off);
            let pa = mmu::access(&mut self.machine.ram, pgdir, cur, true)?;
            self.machine.ram.write(pa, &buf[off..off + chunk]);
            off += chunk;
        }
        Ok(())
    }

    /// Kernel read from an environment's user memory.
    pub(crate) fn copy_from_user(
        &mut self,
        slot: usize,
        va: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), PageFault> {
        let pgdir = self.envs[slot].pgdir.phys_addr();
        let mut off = 0usize;
        while off < buf.len() {
            let cur = va.add(off as u32);
            let chunk = ((PGSIZE - cur.page_offset()) as usize).min(buf.len() - off);
            let pa = mmu::access(&mut self.machine.ram, pgdir, cur, false)?;
            self.machine.ram.read(pa, &mut buf[off..off + chunk]);
            off += chunk;
        }
        Ok(())
    }
}
