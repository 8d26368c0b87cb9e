//! Spawn: start a child environment from a program image.
//!
//! The image format is the loader's business and not ours; spawn's job is
//! the contract with the kernel primitives: build the child's stack in a
//! staging page and swing it into place, map the image page by page the
//! same way, install the entry point and stack pointer with
//! `env_set_trapframe`, and mark the child runnable.

use kestrel_kernel::config::{PGSIZE, USTACKTOP, UTEMP, UTEXT};
use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::EnvId;
use kestrel_kernel::Kernel;

use crate::syscall;

/// Spawn a child running `image` (loaded at UTEXT) with the given
/// command-line arguments. Returns the child's id; the child starts at
/// `entry` with the conventional (argc, argv) stack.
pub fn spawn(
    k: &mut Kernel,
    image: &[u8],
    entry: VirtAddr,
    args: &[&str],
) -> Result<EnvId, KernelError> {
    if image.is_empty() {
        return Err(KernelError::NotExec);
    }
    let child = syscall::sys_exofork(k)?;

    let esp = init_stack(k, child, args)?;

    // Map the image into the child one page at a time through the staging
    // window; a fresh page is zeroed, so a short tail page is zero-filled.
    let utemp = VirtAddr::new(UTEMP);
    let mut off = 0usize;
    while off < image.len() {
        let chunk = (PGSIZE as usize).min(image.len() - off);
        syscall::sys_page_alloc(k, EnvId::CURRENT, utemp, Pte::P | Pte::U | Pte::W)?;
        k.user_write(utemp, &image[off..off + chunk])
            .map_err(|_| KernelError::Unspecified)?;
        syscall::sys_page_map(
            k,
            EnvId::CURRENT,
            utemp,
            child,
            VirtAddr::new(UTEXT + off as u32),
            Pte::P | Pte::U | Pte::W,
        )?;
        syscall::sys_page_unmap(k, EnvId::CURRENT, utemp)?;
        off += chunk;
    }

    // Entry point and stack pointer go in through the trapframe syscall,
    // staged through the same window.
    let mut tf = k.env_info(child).ok_or(KernelError::BadEnv)?.tf;
    tf.eip = entry.as_u32();
    tf.esp = esp;
    syscall::sys_page_alloc(k, EnvId::CURRENT, utemp, Pte::P | Pte::U | Pte::W)?;
    syscall::sys_env_set_trapframe(k, child, &tf, utemp)?;
    syscall::sys_page_unmap(k, EnvId::CURRENT, utemp)?;

    syscall::sys_env_set_status(k, child, true)?;
    Ok(child)
}

/// Build the child's initial stack page: argument strings at the top, the
/// argv pointer array below them, then the argv pointer and argc, which is
/// where the stack pointer lands.
fn init_stack(k: &mut Kernel, child: EnvId, args: &[&str]) -> Result<u32, KernelError> {
    let string_size: usize = args.iter().map(|a| a.len() + 1).sum();
    let argv_size = 4 * (args.len() + 1);
    // Room for strings, alignment slack, the pointer array, argv and argc.
    if string_size + argv_size + 12 > PGSIZE as usize {
        return Err(KernelError::NoMem);
    }

    let base = USTACKTOP - PGSIZE;
    let mut page = vec![0u8; PGSIZE as usize];

    // Strings at the top of the page; the pointer array below them,
    // rounded down to word alignment.
    let mut str_off = PGSIZE as usize - string_size;
    let argv_off = (str_off & !3) - argv_size;
    for (i, arg) in args.iter().enumerate() {
        let child_ptr = base + str_off as u32;
        page[argv_off + 4 * i..argv_off + 4 * i + 4].copy_from_slice(&child_ptr.to_le_bytes());
        page[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        str_off += arg.len() + 1;
    }
    // argv[argc] stays null. Below the array: the argv pointer and argc.
    let esp_off = argv_off - 8;
    page[esp_off..esp_off + 4].copy_from_slice(&(args.len() as u32).to_le_bytes());
    page[esp_off + 4..esp_off + 8].copy_from_slice(&(base + argv_off as u32).to_le_bytes());

    let utemp = VirtAddr::new(UTEMP);
    syscall::sys_page_alloc(k, EnvId::CURRENT, utemp, Pte::P | Pte::U | Pte::W)?;
    k.user_write(utemp, &page)
        .map_err(|_| KernelError::Unspecified)?;
    syscall::sys_page_map(
        k,
        EnvId::CURRENT,
        utemp,
        child,
        VirtAddr::new(base),
        Pte::P | Pte::U | Pte::W,
    )?;
    syscall::sys_page_unmap(k, EnvId::CURRENT, utemp)?;

    Ok(base + esp_off as u32)
}
