//! Environments - the kernel's unit of execution and protection.
//!
//! Each environment owns an address space and a saved trap frame. The table
//! has fixed capacity; identifiers encode a generation in the high bits and
//! the table slot in the low bits, so a recycled slot never aliases an old
//! id. Slot 0 is the idle environment, seeded at boot and scheduled only
//! when nothing else is runnable.
//!
//! ## Lifecycle
//!
//! ```text
//! Free → NotRunnable → Runnable ⇄ Running
//!                 ↘        ↓        ↙
//!                        Dying → Free
//! ```

use log::debug;

use crate::config::{ENVGENSHIFT, NENV, NPDENTRIES, UTOP, UVPT};
use crate::error::KernelError;
use crate::machine::mmu::{self, Pte};
use crate::memory::address::{Pfn, VirtAddr};
use crate::objects::trapframe::TrapFrame;
use crate::sched::Schedule;
use crate::Kernel;

/// Environment identifier: generation in the high bits, slot in the low.
///
/// `EnvId(0)` is the syscall-ABI sentinel for "the current environment".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The "current environment" sentinel accepted by every syscall.
    pub const CURRENT: EnvId = EnvId(0);

    /// Table slot this id refers to.
    #[inline]
    pub fn slot(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Scheduling state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot unused.
    Free,
    /// Teardown in progress; destroy is idempotent from here.
    Dying,
    /// Eligible for the scheduler.
    Runnable,
    /// Alive but not schedulable (fresh exofork child, blocked receiver).
    NotRunnable,
    /// Currently on the CPU.
    Running,
}

/// Transient IPC receive state.
///
/// `recving` is true exactly while the environment is blocked in receive; a
/// successful send clears it in the same step that makes the receiver
/// runnable and fills the delivery fields.
#[derive(Debug, Clone, Copy)]
pub struct IpcState {
    pub recving: bool,
    /// Where a transferred page should land; `None` means no page wanted.
    pub dstva: Option<VirtAddr>,
    /// Last received value.
    pub value: u32,
    /// Sender of the last received message.
    pub from: EnvId,
    /// Permissions of the transferred page, empty if none was sent.
    pub perm: Pte,
}

impl IpcState {
    fn idle() -> Self {
        Self {
            recving: false,
            dstva: None,
            value: 0,
            from: EnvId(0),
            perm: Pte::empty(),
        }
    }
}

pub(crate) struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub tf: TrapFrame,
    /// Page-directory root frame; meaningless while the slot is free.
    pub pgdir: Pfn,
    pub runs: u32,
    pub syscalls: u32,
    pub ipc: IpcState,
    pub pgfault_upcall: Option<VirtAddr>,
}

impl Env {
    pub(crate) fn empty(slot: usize) -> Self {
        Self {
            id: EnvId(slot as u32),
            parent: EnvId(0),
            status: EnvStatus::Free,
            tf: TrapFrame::new_user(),
            pgdir: Pfn(0),
            runs: 0,
            syscalls: 0,
            ipc: IpcState::idle(),
            pgfault_upcall: None,
        }
    }
}

/// Read-only snapshot of an environment, the user-visible view of the table.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub tf: TrapFrame,
    pub ipc_recving: bool,
    pub ipc_value: u32,
    pub ipc_from: EnvId,
    pub ipc_perm: Pte,
    pub pgfault_upcall: Option<VirtAddr>,
    pub runs: u32,
    pub syscalls: u32,
}

impl Kernel {
    /// Allocate a fresh environment.
    ///
    /// The new environment gets its own page-directory root seeded with the
    /// shared kernel mappings and the read-only self-map, a default user
    /// trap frame, and a fresh identifier. Status starts Runnable; exofork
    /// downgrades its child to NotRunnable itself.
    pub(crate) fn env_alloc(&mut self, parent: EnvId) -> Result<usize, KernelError> {
        let slot = self
            .envs
            .iter()
            .position(|e| e.status == EnvStatus::Free)
            .ok_or(KernelError::NoFreeEnv)?;

        let pgdir = self.env_setup_vm()?;

        // New id: bump the generation, keep the slot in the low bits. The
        // generation is never zero, so no valid id is ever 0.
        let prev = self.envs[slot].id.0;
        let mut generation = prev.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation == 0 {
            generation = 1 << ENVGENSHIFT;
        }

        let env = &mut self.envs[slot];
        env.id = EnvId(generation | slot as u32);
        env.parent = parent;
        env.status = EnvStatus::Runnable;
        env.tf = TrapFrame::new_user();
        env.pgdir = pgdir;
        env.runs = 0;
        env.syscalls = 0;
        env.ipc = IpcState::idle();
        env.pgfault_upcall = None;

        debug!("env {} allocated (parent {})", env.id, parent);
        Ok(slot)
    }

    /// Build an address-space root: kernel half shared with every other
    /// environment, self-map slot pointing back at the root, user half empty.
    fn env_setup_vm(&mut self) -> Result<Pfn, KernelError> {
        let pgdir = self.page_alloc_frame(true)?;
        self.frames.incref(pgdir);

        let kern = self.kern_pgdir.phys_addr();
        let pa = pgdir.phys_addr();
        for pdx in VirtAddr::new(UTOP).pdx()..NPDENTRIES as usize {
            let pde = self.machine.ram.read_u32(kern.add(4 * pdx as u32));
            self.machine.ram.write_u32(pa.add(4 * pdx as u32), pde);
        }
        // Read-only self-map: lets user code inspect its own PTEs.
        self.machine.ram.write_u32(
            pa.add(4 * VirtAddr::new(UVPT).pdx() as u32),
            mmu::make_entry(pa, Pte::P | Pte::U),
        );
        Ok(pgdir)
    }

    /// Public seeding path, used at boot for the idle environment and by
    /// harnesses standing in for the program loader.
    pub fn env_create(&mut self, parent: Option<EnvId>) -> Result<EnvId, KernelError> {
        let slot = self.env_alloc(parent.unwrap_or(EnvId(0)))?;
        Ok(self.envs[slot].id)
    }

    /// Resolve an id to a live slot.
    ///
    /// `EnvId::CURRENT` resolves to the calling environment. With
    /// `check_perm`, the caller must be the target or the target's parent.
    pub(crate) fn envid2env(&self, id: EnvId, check_perm: bool) -> Result<usize, KernelError> {
        let cur = self.curenv.ok_or(KernelError::BadEnv)?;
        if id == EnvId::CURRENT {
            return Ok(cur);
        }
        let slot = id.slot();
        let env = &self.envs[slot];
        if env.status == EnvStatus::Free || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if check_perm && slot != cur && env.parent != self.envs[cur].id {
            return Err(KernelError::BadEnv);
        }
        Ok(slot)
    }

    /// Destroy an environment: release every frame it references, free its
    /// page tables and root, and free the slot. Destroying the running
    /// environment schedules the next one. Idempotent for envs already torn
    /// down or being torn down.
    pub(crate) fn env_destroy(&mut self, slot: usize) {
        match self.envs[slot].status {
            EnvStatus::Free | EnvStatus::Dying => return,
            _ => {}
        }
        let id = self.envs[slot].id;
        self.envs[slot].status = EnvStatus::Dying;
        debug!("env {} destroyed", id);

        let pgdir = self.envs[slot].pgdir;
        self.free_user_space(pgdir);
        self.frames.decref(pgdir);
        if self.cr3 == Some(pgdir) {
            self.cr3 = None;
            self.machine.tlb.flush();
        }

        self.envs[slot].status = EnvStatus::Free;
        self.envs[slot].ipc = IpcState::idle();
        self.envs[slot].pgfault_upcall = None;

        if self.curenv == Some(slot) {
            self.curenv = None;
            let _ = self.sched_yield();
        }
    }

    /// Context-switch to an environment: it must be Runnable (or already
    /// Running and current, in which case this is a no-op).
    pub fn run(&mut self, id: EnvId) -> Result<(), KernelError> {
        let slot = id.slot();
        if self.envs[slot].status == EnvStatus::Free || self.envs[slot].id != id {
            return Err(KernelError::BadEnv);
        }
        match self.envs[slot].status {
            EnvStatus::Running if self.curenv == Some(slot) => return Ok(()),
            EnvStatus::Runnable => {}
            _ => return Err(KernelError::BadEnv),
        }
        if let Some(prev) = self.curenv {
            if self.envs[prev].status == EnvStatus::Running {
                self.envs[prev].status = EnvStatus::Runnable;
            }
        }
        let env = &mut self.envs[slot];
        env.status = EnvStatus::Running;
        env.runs += 1;
        let pgdir = env.pgdir;
        self.curenv = Some(slot);
        if self.cr3 != Some(pgdir) {
            self.cr3 = Some(pgdir);
            self.machine.tlb.flush();
        }
        Ok(())
    }

    /// The environment currently on the CPU, if any.
    pub fn current(&self) -> Option<EnvId> {
        self.curenv.map(|slot| self.envs[slot].id)
    }

    /// Read-only snapshot of an environment (the ABI's environment window).
    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        let slot = if id == EnvId::CURRENT {
            self.curenv?
        } else {
            let s = id.slot();
            if self.envs[s].status == EnvStatus::Free || self.envs[s].id != id {
                return None;
            }
            s
        };
        let e = &self.envs[slot];
        Some(EnvInfo {
            id: e.id,
            parent: e.parent,
            status: e.status,
            tf: e.tf,
            ipc_recving: e.ipc.recving,
            ipc_value: e.ipc.value,
            ipc_from: e.ipc.from,
            ipc_perm: e.ipc.perm,
            pgfault_upcall: e.pgfault_upcall,
            runs: e.runs,
            syscalls: e.syscalls,
        })
    }

    /// Log an environment's vital statistics.
    pub fn dump_env(&self, id: EnvId) {
        if let Some(info) = self.env_info(id) {
            debug!(
                "env {} parent {} status {:?} runs {} syscalls {} upcall {:?}",
                info.id, info.parent, info.status, info.runs, info.syscalls, info.pgfault_upcall
            );
        }
    }

    /// Release every user mapping below UTOP along with the second-level
    /// tables that held them. The kernel half of the directory is shared and
    /// never torn down.
    fn free_user_space(&mut self, pgdir: Pfn) {
        let pa = pgdir.phys_addr();
        for pdx in 0..VirtAddr::new(UTOP).pdx() {
            let pde_pa = pa.add(4 * pdx as u32);
            let pde = self.machine.ram.read_u32(pde_pa);
            if !mmu::entry_flags(pde).contains(Pte::P) {
                continue;
            }
            let table = mmu::entry_addr(pde);
            for ptx in 0..NPDENTRIES as usize {
                let pte_pa = table.add(4 * ptx as u32);
                let pte = self.machine.ram.read_u32(pte_pa);
                if mmu::entry_flags(pte).contains(Pte::P) {
                    let va = VirtAddr::new(((pdx as u32) << 22) | ((ptx as u32) << 12));
                    self.frames.decref(mmu::entry_addr(pte).pfn());
                    self.machine.ram.write_u32(pte_pa, 0);
                    self.tlb_invalidate(pgdir, va);
                }
            }
            self.machine.ram.write_u32(pde_pa, 0);
            self.frames.decref(table.pfn());
        }
    }

    /// Emit one tick's worth of a schedule decision after destroying the
    /// running environment from harness context.
    pub fn destroy(&mut self, id: EnvId) -> Result<Schedule, KernelError> {
        let slot = {
            let s = id.slot();
            if self.envs[s].status == EnvStatus::Free || self.envs[s].id != id {
                return Err(KernelError::BadEnv);
            }
            s
        };
        self.env_destroy(slot);
        Ok(match self.current() {
            Some(id) => Schedule::Run(id),
            None => Schedule::Halted,
        })
    }
}
