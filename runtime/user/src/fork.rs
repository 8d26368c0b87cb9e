//! Copy-on-write fork, implemented entirely in user space.
//!
//! The kernel's exofork gives us a blank child with a copy of our saved
//! frame. Everything else happens here: every present page below UTOP is
//! shared into the child copy-on-write (and our own mapping downgraded to
//! match), the child gets a fresh exception stack, and both sides rely on
//! the page-fault upcall to copy a COW page the first time either writes
//! it.

use log::error;

use kestrel_kernel::config::{PFTEMP, PGSIZE, UTOP, UXSTACKTOP};
use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::{FaultErr, Pte};
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::EnvId;
use kestrel_kernel::objects::trapframe::{UTrapFrame, UTF_SIZE};
use kestrel_kernel::Kernel;

use crate::syscall;
use crate::vm;

/// Where the fault-handler entry point is registered in the simulated text
/// segment. Every environment using this runtime shares the same program
/// image, so one address serves all of them.
pub const PGFAULT_ENTRY: VirtAddr = VirtAddr::new(0x0010_0000);

/// Install the copy-on-write page-fault handler for the current
/// environment: allocate its exception stack if it has none yet, register
/// the entry point, and tell the kernel about it. Idempotent.
pub fn set_pgfault_handler(k: &mut Kernel) -> Result<(), KernelError> {
    let uxstack = VirtAddr::new(UXSTACKTOP - PGSIZE);
    if !vm::va_is_mapped(k, uxstack)? {
        syscall::sys_page_alloc(k, EnvId::CURRENT, uxstack, Pte::P | Pte::U | Pte::W)?;
    }
    k.register_text(PGFAULT_ENTRY, pgfault_entry);
    syscall::sys_env_set_pgfault_upcall(k, EnvId::CURRENT, PGFAULT_ENTRY)
}

/// Share the page at `va` with `child` at the same address.
///
/// Writable or copy-on-write pages go over as copy-on-write, and our own
/// mapping is downgraded to copy-on-write in the same breath; pages already
/// marked COW are forwarded without touching our mapping again; read-only
/// pages are shared as they are.
fn duppage(k: &mut Kernel, child: EnvId, va: VirtAddr) -> Result<(), KernelError> {
    let flags = vm::pte_flags(k, va)?;
    let cow = Pte::P | Pte::U | Pte::COW;
    if flags.contains(Pte::COW) {
        syscall::sys_page_map(k, EnvId::CURRENT, va, child, va, cow)?;
    } else if flags.contains(Pte::W) {
        syscall::sys_page_map(k, EnvId::CURRENT, va, child, va, cow)?;
        syscall::sys_page_map(k, EnvId::CURRENT, va, EnvId::CURRENT, va, cow)?;
    } else {
        syscall::sys_page_map(k, EnvId::CURRENT, va, child, va, Pte::P | Pte::U)?;
    }
    Ok(())
}

/// Fork the current environment.
///
/// Returns the child's id; the child itself observes 0 in its saved result
/// register when it is first scheduled. The child's address space mirrors
/// the parent's copy-on-write, except for a fresh exception stack.
pub fn fork(k: &mut Kernel) -> Result<EnvId, KernelError> {
    set_pgfault_handler(k)?;
    let child = syscall::sys_exofork(k)?;

    // Parent branch: walk our own page tables through the self-map and
    // share everything below UTOP, skipping the exception stack.
    let uxstack = VirtAddr::new(UXSTACKTOP - PGSIZE);
    let npd = VirtAddr::new(UTOP).pdx();
    for pdx in 0..npd {
        let probe = VirtAddr::new((pdx as u32) << 22);
        if !Pte::from_bits_truncate(vm::vpd_entry(k, probe)? & 0xfff).contains(Pte::P) {
            continue;
        }
        for ptx in 0..1024u32 {
            let va = VirtAddr::new(((pdx as u32) << 22) | (ptx << 12));
            if va == uxstack {
                continue;
            }
            if Pte::from_bits_truncate(vm::vpt_entry(k, va)? & 0xfff).contains(Pte::P) {
                duppage(k, child, va)?;
            }
        }
    }

    syscall::sys_page_alloc(k, child, uxstack, Pte::P | Pte::U | Pte::W)?;
    syscall::sys_env_set_pgfault_upcall(k, child, PGFAULT_ENTRY)?;
    syscall::sys_env_set_status(k, child, true)?;
    Ok(child)
}

/// The page-fault upcall. Runs on the exception stack with a fault record
/// at the saved stack pointer.
///
/// A write to a copy-on-write page gets a private writable copy staged
/// through PFTEMP. Any other fault is fatal to the environment.
fn pgfault_entry(k: &mut Kernel) {
    let Some(info) = k.env_info(EnvId::CURRENT) else {
        return;
    };
    let mut bytes = [0u8; UTF_SIZE as usize];
    if k.user_read(VirtAddr::new(info.tf.esp), &mut bytes).is_err() {
        return;
    }
    let utf = UTrapFrame::from_bytes(&bytes);
    let fault_va = VirtAddr::new(utf.fault_va).page_base();
    let err = FaultErr::from_bits_truncate(utf.err);

    let flags = match vm::pte_flags(k, fault_va) {
        Ok(f) => f,
        Err(_) => return,
    };
    if !err.contains(FaultErr::WRITE) || !flags.contains(Pte::COW) {
        error!(
            "{} fatal fault at {} (err {:?}): not a write to a copy-on-write page",
            info.id, fault_va, err
        );
        let _ = syscall::sys_env_destroy(k, EnvId::CURRENT);
        return;
    }

    // Fresh page at PFTEMP, copy the shared contents, swing it into place,
    // drop the staging mapping.
    let pftemp = VirtAddr::new(PFTEMP);
    if syscall::sys_page_alloc(k, EnvId::CURRENT, pftemp, Pte::P | Pte::U | Pte::W).is_err() {
        let _ = syscall::sys_env_destroy(k, EnvId::CURRENT);
        return;
    }
    let mut page = vec![0u8; PGSIZE as usize];
    if k.user_read(fault_va, &mut page).is_err() || k.user_write(pftemp, &page).is_err() {
        return;
    }
    if syscall::sys_page_map(
        k,
        EnvId::CURRENT,
        pftemp,
        EnvId::CURRENT,
        fault_va,
        Pte::P | Pte::U | Pte::W,
    )
    .is_err()
    {
        let _ = syscall::sys_env_destroy(k, EnvId::CURRENT);
        return;
    }
    let _ = syscall::sys_page_unmap(k, EnvId::CURRENT, pftemp);
}
