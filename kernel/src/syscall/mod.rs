//! System call surface.
//!
//! Two entry points feed the same typed handlers: [`Kernel::dispatch`], the
//! trap-gate path taking the number and five arguments, and
//! [`Kernel::sysenter`], the fast path that stages arguments in the saved
//! registers and reads the fifth from the user stack. Results travel back
//! as an `i32` in the primary result register; negative values are the
//! error codes of [`KernelError`].
//!
//! Validation discipline: every argument a handler rejects produces an
//! error kind, never a panic; every handler that allocates rolls back on a
//! later failure.

pub mod numbers;

use log::{debug, trace};

use crate::config::{PGSIZE, UTOP};
use crate::error::KernelError;
use crate::machine::mmu::Pte;
use crate::memory::address::VirtAddr;
use crate::objects::env::{EnvId, EnvStatus};
use crate::objects::trapframe::{Mode, TrapFrame, FL_IF, TF_SIZE};
use crate::Kernel;
use self::numbers::*;

/// Decode a permission argument: twelve low bits, nothing else.
fn decode_perm(raw: u32) -> Result<Pte, KernelError> {
    if raw & !(PGSIZE - 1) != 0 {
        return Err(KernelError::Inval);
    }
    Ok(Pte::from_bits_truncate(raw))
}

impl Kernel {
    fn cur_slot(&self) -> usize {
        self.curenv.expect("syscall with no current environment")
    }

    /// Print `len` bytes at `va` to the console. Destroys the caller on a
    /// bad pointer.
    pub fn sys_cputs(&mut self, va: VirtAddr, len: u32) -> Result<u32, KernelError> {
        let slot = self.cur_slot();
        self.user_mem_assert(slot, va, len, Pte::U)?;
        let mut buf = vec![0u8; len as usize];
        self.copy_from_user(slot, va, &mut buf)
            .expect("checked user string must be readable");
        for byte in buf {
            self.machine.console.putc(byte);
        }
        Ok(0)
    }

    /// Poll the console for a character; 0 when none is pending.
    pub fn sys_cgetc(&mut self) -> Result<u32, KernelError> {
        Ok(self.machine.console.getc() as u32)
    }

    /// The calling environment's id.
    pub fn sys_getenvid(&mut self) -> Result<u32, KernelError> {
        Ok(self.envs[self.cur_slot()].id.0)
    }

    /// Destroy `envid` (the caller or one of its children).
    pub fn sys_env_destroy(&mut self, envid: EnvId) -> Result<u32, KernelError> {
        let slot = self.envid2env(envid, true)?;
        debug!(
            "{} kills {}",
            self.envs[self.cur_slot()].id,
            self.envs[slot].id
        );
        self.env_destroy(slot);
        Ok(0)
    }

    /// Give up the CPU voluntarily.
    pub fn sys_yield(&mut self) -> Result<u32, KernelError> {
        self.sched_yield();
        Ok(0)
    }

    /// Bare fork: a new environment whose saved frame is a copy of the
    /// caller's with the result register rewritten to zero, so the child
    /// observes 0 when first scheduled. The address space is left empty;
    /// building it is the user runtime's job.
    pub fn sys_exofork(&mut self) -> Result<u32, KernelError> {
        let parent = self.envs[self.cur_slot()].id;
        let parent_tf = self.envs[self.cur_slot()].tf;
        let child = self.env_alloc(parent)?;
        let env = &mut self.envs[child];
        env.tf = parent_tf;
        env.tf.regs.eax = 0;
        env.status = EnvStatus::NotRunnable;
        Ok(env.id.0)
    }

    /// Set `envid`'s status to Runnable or NotRunnable.
    ///
    /// The requested status is stored as given. (An earlier rendition of
    /// this call made every valid request Runnable; that was a bug.)
    pub fn sys_env_set_status(&mut self, envid: EnvId, status: EnvStatus) -> Result<u32, KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::Inval);
        }
        let slot = self.envid2env(envid, true)?;
        self.envs[slot].status = status;
        Ok(0)
    }

    /// Install a saved frame for `envid`, coerced so the target always
    /// resumes in user mode with interrupts enabled.
    pub fn sys_env_set_trapframe(&mut self, envid: EnvId, tf: &TrapFrame) -> Result<u32, KernelError> {
        let slot = self.envid2env(envid, true)?;
        let mut tf = *tf;
        tf.mode = Mode::User;
        tf.eflags |= FL_IF;
        self.envs[slot].tf = tf;
        Ok(0)
    }

    /// Register `envid`'s page-fault upcall entry point.
    pub fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, func: VirtAddr) -> Result<u32, KernelError> {
        let slot = self.envid2env(envid, true)?;
        self.envs[slot].pgfault_upcall = Some(func);
        Ok(0)
    }

    /// Allocate a zeroed page and map it at `va` in `envid`'s space.
    pub fn sys_page_alloc(&mut self, envid: EnvId, va: VirtAddr, perm: Pte) -> Result<u32, KernelError> {
        if !perm.valid_syscall_perm() {
            return Err(KernelError::Inval);
        }
        if va.as_u32() >= UTOP || !va.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let slot = self.envid2env(envid, true)?;
        let pgdir = self.envs[slot].pgdir;
        let pfn = self.page_alloc_frame(true)?;
        if let Err(e) = self.page_insert(pgdir, pfn, va, perm) {
            // Roll back: the frame never became reachable.
            self.frames.free(pfn);
            return Err(e);
        }
        Ok(0)
    }

    /// Map the page at `srcva` in `srcenv`'s space at `dstva` in `dstenv`'s
    /// space. Write permission can only be granted if the source mapping is
    /// itself writable.
    pub fn sys_page_map(
        &mut self,
        srcenv: EnvId,
        srcva: VirtAddr,
        dstenv: EnvId,
        dstva: VirtAddr,
        perm: Pte,
    ) -> Result<u32, KernelError> {
        let src_slot = self.envid2env(srcenv, true)?;
        let dst_slot = self.envid2env(dstenv, true)?;
        if srcva.as_u32() >= UTOP
            || !srcva.is_page_aligned()
            || dstva.as_u32() >= UTOP
            || !dstva.is_page_aligned()
        {
            return Err(KernelError::Inval);
        }
        let (pfn, src_flags) = self
            .page_lookup(self.envs[src_slot].pgdir, srcva)
            .ok_or(KernelError::Inval)?;
        if !perm.valid_syscall_perm() {
            return Err(KernelError::Inval);
        }
        if perm.contains(Pte::W) && !src_flags.contains(Pte::W) {
            return Err(KernelError::Inval);
        }
        let dst_pgdir = self.envs[dst_slot].pgdir;
        self.page_insert(dst_pgdir, pfn, dstva, perm)?;
        Ok(0)
    }

    /// Unmap `va` in `envid`'s space; silent success if nothing is mapped.
    pub fn sys_page_unmap(&mut self, envid: EnvId, va: VirtAddr) -> Result<u32, KernelError> {
        let slot = self.envid2env(envid, true)?;
        if va.as_u32() >= UTOP || !va.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let pgdir = self.envs[slot].pgdir;
        self.page_remove(pgdir, va);
        Ok(0)
    }

    /// Block until a value arrives. A `dstva` below UTOP announces
    /// willingness to receive a page there. The call parks the caller and
    /// yields; the matching send plants the 0 return.
    pub fn sys_ipc_recv(&mut self, dstva: VirtAddr) -> Result<u32, KernelError> {
        let wants_page = dstva.as_u32() < UTOP;
        if wants_page && !dstva.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let slot = self.cur_slot();
        let env = &mut self.envs[slot];
        env.ipc.recving = true;
        env.ipc.dstva = wants_page.then_some(dstva);
        env.status = EnvStatus::NotRunnable;
        self.sched_yield();
        Ok(0)
    }

    /// Try to send `value` (and optionally the page at `srcva`) to `envid`.
    ///
    /// Fails immediately with `IpcNotRecv` unless the target is blocked in
    /// receive. Delivery - value, permission, sender id, wakeup, planted
    /// return - happens as one step. Returns 1 if a page was transferred,
    /// 0 otherwise.
    pub fn sys_ipc_try_send(
        &mut self,
        envid: EnvId,
        value: u32,
        srcva: VirtAddr,
        perm: Pte,
    ) -> Result<u32, KernelError> {
        let sender = self.envs[self.cur_slot()].id;
        let target = self.envid2env(envid, false)?;
        if !self.envs[target].ipc.recving {
            return Err(KernelError::IpcNotRecv);
        }

        let mut transferred = false;
        if srcva.as_u32() < UTOP {
            if let Some(dstva) = self.envs[target].ipc.dstva {
                if !srcva.is_page_aligned() {
                    return Err(KernelError::Inval);
                }
                if !perm.valid_syscall_perm() {
                    return Err(KernelError::Inval);
                }
                let src_slot = self.cur_slot();
                if self
                    .user_mem_check(src_slot, srcva, PGSIZE, Pte::U)
                    .is_err()
                {
                    return Err(KernelError::Inval);
                }
                let (pfn, _) = self
                    .page_lookup(self.envs[src_slot].pgdir, srcva)
                    .ok_or(KernelError::Inval)?;
                let dst_pgdir = self.envs[target].pgdir;
                self.page_insert(dst_pgdir, pfn, dstva, perm)?;
                transferred = true;
            }
        }

        let env = &mut self.envs[target];
        env.ipc.perm = if transferred { perm } else { Pte::empty() };
        env.ipc.recving = false;
        env.ipc.from = sender;
        env.ipc.value = value;
        env.status = EnvStatus::Runnable;
        env.tf.regs.eax = 0;
        Ok(transferred as u32)
    }

    /// Log the page-directory and page-table entries covering `va` in the
    /// caller's space.
    pub fn sys_debug_va_mapping(&mut self, va: VirtAddr) -> Result<u32, KernelError> {
        let slot = self.cur_slot();
        match self.page_lookup(self.envs[slot].pgdir, va) {
            Some((pfn, flags)) => {
                debug!("{}: va {} -> frame {} {:?}", self.envs[slot].id, va, pfn.0, flags)
            }
            None => debug!("{}: va {} not mapped", self.envs[slot].id, va),
        }
        Ok(0)
    }

    /// Numeric dispatcher: the trap-gate entry point. Decodes the number
    /// and arguments, runs the handler, and plants the return value in the
    /// caller's saved result register (unless the caller blocked, died, or
    /// was switched away from).
    pub fn dispatch(&mut self, no: u32, args: [u32; 5]) -> i32 {
        let Some(entry_slot) = self.curenv else {
            return KernelError::BadEnv.code();
        };
        let entry_id = self.envs[entry_slot].id;
        self.envs[entry_slot].syscalls += 1;
        trace!(
            "{} syscall {} ({:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
            entry_id,
            syscall_name(no),
            args[0],
            args[1],
            args[2],
            args[3],
            args[4]
        );

        self.in_kernel = true;
        let result = self.dispatch_inner(no, args);
        self.in_kernel = false;

        let ret = match result {
            Ok(v) => v as i32,
            Err(e) => e.code(),
        };
        // The receive path gets its return planted by the matching send.
        let planted = no != SYS_IPC_RECV
            && self.curenv == Some(entry_slot)
            && self.envs[entry_slot].id == entry_id;
        if planted {
            self.envs[entry_slot].tf.regs.eax = ret as u32;
        }
        ret
    }

    fn dispatch_inner(&mut self, no: u32, args: [u32; 5]) -> Result<u32, KernelError> {
        let [a1, a2, a3, a4, a5] = args;
        match no {
            SYS_CPUTS => self.sys_cputs(VirtAddr::new(a1), a2),
            SYS_CGETC => self.sys_cgetc(),
            SYS_GETENVID => self.sys_getenvid(),
            SYS_ENV_DESTROY => self.sys_env_destroy(EnvId(a1)),
            SYS_YIELD => self.sys_yield(),
            SYS_EXOFORK => self.sys_exofork(),
            SYS_ENV_SET_STATUS => {
                let status = match a2 {
                    ENV_RUNNABLE => EnvStatus::Runnable,
                    ENV_NOT_RUNNABLE => EnvStatus::NotRunnable,
                    _ => return Err(KernelError::Inval),
                };
                self.sys_env_set_status(EnvId(a1), status)
            }
            SYS_ENV_SET_PGFAULT_UPCALL => {
                self.sys_env_set_pgfault_upcall(EnvId(a1), VirtAddr::new(a2))
            }
            SYS_PAGE_ALLOC => self.sys_page_alloc(EnvId(a1), VirtAddr::new(a2), decode_perm(a3)?),
            SYS_PAGE_MAP => self.sys_page_map(
                EnvId(a1),
                VirtAddr::new(a2),
                EnvId(a3),
                VirtAddr::new(a4),
                decode_perm(a5)?,
            ),
            SYS_PAGE_UNMAP => self.sys_page_unmap(EnvId(a1), VirtAddr::new(a2)),
            SYS_IPC_RECV => self.sys_ipc_recv(VirtAddr::new(a1)),
            SYS_IPC_TRY_SEND => {
                self.sys_ipc_try_send(EnvId(a1), a2, VirtAddr::new(a3), decode_perm(a4)?)
            }
            SYS_ENV_SET_TRAPFRAME => {
                let slot = self.cur_slot();
                let va = VirtAddr::new(a2);
                self.user_mem_assert(slot, va, TF_SIZE, Pte::U)?;
                let mut bytes = [0u8; TF_SIZE as usize];
                self.copy_from_user(slot, va, &mut bytes)
                    .expect("checked trapframe must be readable");
                let tf = TrapFrame::from_user_bytes(&bytes);
                self.sys_env_set_trapframe(EnvId(a1), &tf)
            }
            SYS_DEBUG_VA_MAPPING => self.sys_debug_va_mapping(VirtAddr::new(a1)),
            _ => Err(KernelError::Inval),
        }
    }

    /// Fast-path entry: arguments staged in the saved registers, the fifth
    /// on the user stack. Mirrors the trap-gate path otherwise, and stages
    /// the return registers the fast-exit instruction pair expects.
    pub fn sysenter(&mut self) -> i32 {
        let Some(slot) = self.curenv else {
            return KernelError::BadEnv.code();
        };
        let entry_id = self.envs[slot].id;
        let regs = self.envs[slot].tf.regs;

        // On this path the frame's stack pointer mirrors the base register.
        self.envs[slot].tf.esp = regs.ebp;
        if self
            .user_mem_assert(slot, VirtAddr::new(regs.ebp), 4, Pte::U)
            .is_err()
        {
            return KernelError::Unspecified.code();
        }
        let mut a5 = [0u8; 4];
        self.copy_from_user(slot, VirtAddr::new(regs.ebp), &mut a5)
            .expect("checked stack word must be readable");

        let ret = self.dispatch(
            regs.eax,
            [regs.edx, regs.ecx, regs.ebx, regs.edi, u32::from_le_bytes(a5)],
        );

        if self.curenv == Some(slot) && self.envs[slot].id == entry_id {
            let tf = &mut self.envs[slot].tf;
            tf.regs.ecx = regs.ebp;
            tf.regs.edx = regs.esi;
        }
        ret
    }
}
