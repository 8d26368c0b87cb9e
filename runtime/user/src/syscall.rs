//! Typed wrappers over the numeric syscall ABI.
//!
//! Each wrapper stages its arguments the way the trap gate does and goes
//! through [`Kernel::dispatch`], so the numeric encoding - including error
//! codes - is exercised on every call. Negative returns decode back into
//! [`KernelError`] kinds.

use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::EnvId;
use kestrel_kernel::syscall::numbers::*;
use kestrel_kernel::Kernel;

/// The "no page" sentinel: an address at or above UTOP.
pub const NO_PAGE: VirtAddr = VirtAddr::new(u32::MAX);

fn syscall(k: &mut Kernel, no: u32, args: [u32; 5]) -> Result<u32, KernelError> {
    let ret = k.dispatch(no, args);
    match KernelError::from_code(ret) {
        Some(e) => Err(e),
        None => Ok(ret as u32),
    }
}

pub fn sys_cputs(k: &mut Kernel, va: VirtAddr, len: u32) -> Result<(), KernelError> {
    syscall(k, SYS_CPUTS, [va.as_u32(), len, 0, 0, 0]).map(|_| ())
}

pub fn sys_cgetc(k: &mut Kernel) -> Result<u8, KernelError> {
    syscall(k, SYS_CGETC, [0; 5]).map(|c| c as u8)
}

pub fn sys_getenvid(k: &mut Kernel) -> Result<EnvId, KernelError> {
    syscall(k, SYS_GETENVID, [0; 5]).map(EnvId)
}

pub fn sys_env_destroy(k: &mut Kernel, envid: EnvId) -> Result<(), KernelError> {
    syscall(k, SYS_ENV_DESTROY, [envid.0, 0, 0, 0, 0]).map(|_| ())
}

pub fn sys_yield(k: &mut Kernel) -> Result<(), KernelError> {
    syscall(k, SYS_YIELD, [0; 5]).map(|_| ())
}

pub fn sys_exofork(k: &mut Kernel) -> Result<EnvId, KernelError> {
    syscall(k, SYS_EXOFORK, [0; 5]).map(EnvId)
}

pub fn sys_env_set_status(k: &mut Kernel, envid: EnvId, runnable: bool) -> Result<(), KernelError> {
    let status = if runnable { ENV_RUNNABLE } else { ENV_NOT_RUNNABLE };
    syscall(k, SYS_ENV_SET_STATUS, [envid.0, status, 0, 0, 0]).map(|_| ())
}

pub fn sys_env_set_pgfault_upcall(
    k: &mut Kernel,
    envid: EnvId,
    func: VirtAddr,
) -> Result<(), KernelError> {
    syscall(k, SYS_ENV_SET_PGFAULT_UPCALL, [envid.0, func.as_u32(), 0, 0, 0]).map(|_| ())
}

pub fn sys_page_alloc(
    k: &mut Kernel,
    envid: EnvId,
    va: VirtAddr,
    perm: Pte,
) -> Result<(), KernelError> {
    syscall(k, SYS_PAGE_ALLOC, [envid.0, va.as_u32(), perm.bits(), 0, 0]).map(|_| ())
}

pub fn sys_page_map(
    k: &mut Kernel,
    srcenv: EnvId,
    srcva: VirtAddr,
    dstenv: EnvId,
    dstva: VirtAddr,
    perm: Pte,
) -> Result<(), KernelError> {
    syscall(
        k,
        SYS_PAGE_MAP,
        [srcenv.0, srcva.as_u32(), dstenv.0, dstva.as_u32(), perm.bits()],
    )
    .map(|_| ())
}

pub fn sys_page_unmap(k: &mut Kernel, envid: EnvId, va: VirtAddr) -> Result<(), KernelError> {
    syscall(k, SYS_PAGE_UNMAP, [envid.0, va.as_u32(), 0, 0, 0]).map(|_| ())
}

pub fn sys_ipc_recv(k: &mut Kernel, dstva: VirtAddr) -> Result<(), KernelError> {
    syscall(k, SYS_IPC_RECV, [dstva.as_u32(), 0, 0, 0, 0]).map(|_| ())
}

pub fn sys_ipc_try_send(
    k: &mut Kernel,
    to: EnvId,
    value: u32,
    srcva: VirtAddr,
    perm: Pte,
) -> Result<u32, KernelError> {
    syscall(
        k,
        SYS_IPC_TRY_SEND,
        [to.0, value, srcva.as_u32(), perm.bits(), 0],
    )
}

/// Install a saved frame for `envid` via the numeric path: the frame is
/// staged in the caller's memory at `scratch_va` (which must be mapped
/// writable) and passed by pointer, as the ABI requires.
pub fn sys_env_set_trapframe(
    k: &mut Kernel,
    envid: EnvId,
    tf: &kestrel_kernel::objects::trapframe::TrapFrame,
    scratch_va: VirtAddr,
) -> Result<(), KernelError> {
    k.user_write(scratch_va, &tf.to_user_bytes())
        .map_err(|_| KernelError::Unspecified)?;
    syscall(k, SYS_ENV_SET_TRAPFRAME, [envid.0, scratch_va.as_u32(), 0, 0, 0]).map(|_| ())
}

pub fn sys_debug_va_mapping(k: &mut Kernel, va: VirtAddr) -> Result<(), KernelError> {
    syscall(k, SYS_DEBUG_VA_MAPPING, [va.as_u32(), 0, 0, 0, 0]).map(|_| ())
}

/// Print a string through the console syscall, staging it on the user
/// stack page by page.
pub fn cputs(k: &mut Kernel, scratch_va: VirtAddr, s: &str) -> Result<(), KernelError> {
    k.user_write(scratch_va, s.as_bytes())
        .map_err(|_| KernelError::Unspecified)?;
    sys_cputs(k, scratch_va, s.len() as u32)
}
