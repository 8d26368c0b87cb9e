//! Synchronous IPC wrappers.
//!
//! The kernel primitive is try-send/recv; these wrappers add the blocking
//! conventions. In the hosted harness a blocked receive cannot suspend the
//! calling thread, so the receive comes in two halves: [`recv_start`]
//! parks the current environment in the kernel's receive state and yields,
//! and [`recv_finish`] reads the delivered message once the environment has
//! been resumed by a sender.

use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::EnvId;
use kestrel_kernel::Kernel;

use crate::syscall::{self, NO_PAGE};

/// Attempts a sender makes before giving up on a receiver that never
/// blocks in receive.
const SEND_RETRIES: u32 = 64;

/// A delivered message: the value, who sent it, and the permission of the
/// transferred page (empty when no page came along).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub value: u32,
    pub from: EnvId,
    pub perm: Pte,
}

/// Block the current environment in receive. Pass `Some(va)` to accept a
/// page mapped at `va`; `None` refuses page transfer.
pub fn recv_start(k: &mut Kernel, dst: Option<VirtAddr>) -> Result<(), KernelError> {
    syscall::sys_ipc_recv(k, dst.unwrap_or(NO_PAGE))
}

/// Read the message delivered to `me` after a sender resumed it.
pub fn recv_finish(k: &Kernel, me: EnvId) -> Result<Message, KernelError> {
    let info = k.env_info(me).ok_or(KernelError::BadEnv)?;
    if info.ipc_recving {
        // Still parked: no send has matched yet.
        return Err(KernelError::IpcNotRecv);
    }
    Ok(Message {
        value: info.ipc_value,
        from: info.ipc_from,
        perm: info.ipc_perm,
    })
}

/// Send `value` (and optionally the page at `va` with `perm`) to `to`,
/// retrying with a yield between attempts until the target blocks in
/// receive. Errors other than "not receiving" are returned immediately.
pub fn send(
    k: &mut Kernel,
    to: EnvId,
    value: u32,
    page: Option<(VirtAddr, Pte)>,
) -> Result<bool, KernelError> {
    let me = syscall::sys_getenvid(k)?;
    for _ in 0..SEND_RETRIES {
        let result = match page {
            Some((va, perm)) => syscall::sys_ipc_try_send(k, to, value, va, perm),
            None => syscall::sys_ipc_try_send(k, to, value, NO_PAGE, Pte::empty()),
        };
        match result {
            Ok(transferred) => return Ok(transferred == 1),
            Err(KernelError::IpcNotRecv) => {
                // Be CPU-friendly, then resume our turn when the harness
                // schedule comes back around.
                syscall::sys_yield(k)?;
                k.run(me)?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(KernelError::IpcNotRecv)
}
