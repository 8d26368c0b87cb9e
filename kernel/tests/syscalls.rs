//! End-to-end exercises of the syscall surface: environment lifecycle,
//! page mapping, IPC, fault upcalls, and the scheduler, all driven the way
//! a user environment would drive them.

use kestrel_kernel::config::{MachineConfig, PGSIZE, UTOP, UXSTACKTOP};
use kestrel_kernel::error::KernelError;
use kestrel_kernel::machine::mmu::Pte;
use kestrel_kernel::memory::address::VirtAddr;
use kestrel_kernel::objects::env::{EnvId, EnvStatus};
use kestrel_kernel::objects::trapframe::{TrapFrame, UTrapFrame, FL_IF, UTF_SIZE};
use kestrel_kernel::syscall::numbers::*;
use kestrel_kernel::{Kernel, Schedule, Trap, TrapOutcome, UserFault};

const RW: Pte = Pte::P.union(Pte::U).union(Pte::W);
const RO: Pte = Pte::P.union(Pte::U);

fn boot() -> Kernel {
    Kernel::boot(MachineConfig::default())
}

fn user_env(k: &mut Kernel) -> EnvId {
    let id = k.env_create(None).expect("env_create");
    k.run(id).expect("run");
    id
}

fn runnable_child(k: &mut Kernel) -> EnvId {
    let child = EnvId(k.sys_exofork().expect("exofork"));
    k.sys_env_set_status(child, EnvStatus::Runnable).expect("set_status");
    child
}

#[test]
fn exofork_return_values() {
    let mut k = boot();
    let parent = user_env(&mut k);

    let ret = k.sys_exofork().expect("exofork");
    assert!((ret as i32) > 0, "parent sees a positive child id");

    let child = EnvId(ret);
    assert_ne!(child, parent);
    let info = k.env_info(child).expect("child exists");
    assert_eq!(info.status, EnvStatus::NotRunnable);
    assert_eq!(info.parent, parent);
    // The child observes 0 in its result register when first scheduled.
    assert_eq!(info.tf.regs.eax, 0);
}

#[test]
fn env_ids_never_recycle() {
    let mut k = boot();
    let a = k.env_create(None).unwrap();
    let slot = a.slot();
    k.destroy(a).unwrap();
    let b = k.env_create(None).unwrap();
    assert_eq!(b.slot(), slot, "slot is reused");
    assert_ne!(a, b, "but the id is fresh");
    assert!(k.env_info(a).is_none());
}

#[test]
fn page_alloc_validates_arguments() {
    let mut k = boot();
    user_env(&mut k);

    let va = VirtAddr::new(0x0080_0000);
    // Missing user bit, hardware bits, unaligned va, kernel-half va.
    assert_eq!(
        k.sys_page_alloc(EnvId::CURRENT, va, Pte::P),
        Err(KernelError::Inval)
    );
    assert_eq!(
        k.sys_page_alloc(EnvId::CURRENT, va, RW | Pte::D),
        Err(KernelError::Inval)
    );
    assert_eq!(
        k.sys_page_alloc(EnvId::CURRENT, VirtAddr::new(0x0080_0123), RW),
        Err(KernelError::Inval)
    );
    assert_eq!(
        k.sys_page_alloc(EnvId::CURRENT, VirtAddr::new(UTOP), RW),
        Err(KernelError::Inval)
    );

    k.sys_page_alloc(EnvId::CURRENT, va, RW).expect("valid alloc");
    // A fresh page reads as zeros.
    assert_eq!(k.user_read_u32(va).unwrap(), 0);
}

#[test]
fn page_map_shares_the_frame() {
    let mut k = boot();
    let parent = user_env(&mut k);
    let child = runnable_child(&mut k);

    let va = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, va, RW).unwrap();
    k.user_write_u32(va, 0x1234_5678).unwrap();
    k.sys_page_map(EnvId::CURRENT, va, child, va, RW).unwrap();

    let (pf_parent, _) = k.va_mapping(parent, va).unwrap();
    let (pf_child, flags) = k.va_mapping(child, va).unwrap();
    assert_eq!(pf_parent, pf_child, "one frame, two mappings");
    assert!(flags.contains(Pte::W));

    // Writable sharing: the child's store is visible to the parent.
    k.run(child).unwrap();
    assert_eq!(k.user_read_u32(va).unwrap(), 0x1234_5678);
    k.user_write_u32(va, 0x9abc_def0).unwrap();
    k.run(parent).unwrap();
    assert_eq!(k.user_read_u32(va).unwrap(), 0x9abc_def0);
}

#[test]
fn page_map_refuses_write_grant_on_readonly_source() {
    let mut k = boot();
    user_env(&mut k);
    let child = runnable_child(&mut k);

    let va = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, va, RO).unwrap();
    assert_eq!(
        k.sys_page_map(EnvId::CURRENT, va, child, va, RW),
        Err(KernelError::Inval)
    );
    k.sys_page_map(EnvId::CURRENT, va, child, va, RO).expect("read-only share");
}

#[test]
fn page_unmap_is_silent_on_missing_mapping() {
    let mut k = boot();
    user_env(&mut k);
    assert_eq!(
        k.sys_page_unmap(EnvId::CURRENT, VirtAddr::new(0x0080_0000)),
        Ok(0)
    );
}

#[test]
fn unmap_invalidates_the_cached_translation() {
    let mut k = boot();
    user_env(&mut k);
    let va = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, va, RW).unwrap();
    k.user_write_u32(va, 7).unwrap(); // warm the TLB
    k.sys_page_unmap(EnvId::CURRENT, va).unwrap();
    // With no upcall registered the faulting env dies; a stale TLB entry
    // would have let the read slip through instead.
    assert_eq!(k.user_read_u32(va), Err(UserFault::Destroyed));
}

#[test]
fn remap_downgrade_revokes_write() {
    let mut k = boot();
    user_env(&mut k);
    let va = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, va, RW).unwrap();
    k.user_write_u32(va, 7).unwrap();
    k.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, RO).unwrap();
    assert_eq!(k.user_read_u32(va).unwrap(), 7);
    assert_eq!(k.user_write_u32(va, 8), Err(UserFault::Destroyed));
}

#[test]
fn refcounts_match_reachability() {
    let mut k = boot();
    let parent = user_env(&mut k);
    let child = runnable_child(&mut k);

    let a = VirtAddr::new(0x0080_0000);
    let b = VirtAddr::new(0x0080_1000);
    k.sys_page_alloc(EnvId::CURRENT, a, RW).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, b, RW).unwrap();
    k.sys_page_map(EnvId::CURRENT, a, child, a, RW).unwrap();
    k.sys_page_map(EnvId::CURRENT, a, child, b, RW).unwrap();

    let (fa, _) = k.va_mapping(parent, a).unwrap();
    let (fb, _) = k.va_mapping(parent, b).unwrap();
    assert_eq!(k.frame_refcount(fa), 3);
    assert_eq!(k.frame_refcount(fb), 1);
    for pfn in [fa, fb] {
        assert_eq!(
            k.frame_refcount(pfn) as usize,
            k.count_user_references(pfn),
            "refcount equals the number of slots referencing the frame"
        );
    }

    // Idempotent reinsert: same frame, same va, count unchanged.
    k.sys_page_map(EnvId::CURRENT, a, EnvId::CURRENT, a, RW).unwrap();
    assert_eq!(k.frame_refcount(fa), 3);

    // Tearing the child down releases its share.
    k.destroy(child).unwrap();
    assert_eq!(k.frame_refcount(fa), 1);
    assert_eq!(k.count_user_references(fa), 1);
}

#[test]
fn destroy_releases_every_frame() {
    let mut k = boot();
    user_env(&mut k);
    let before = k.free_frame_count();

    let child = runnable_child(&mut k);
    k.run(child).unwrap();
    for i in 0..4u32 {
        let va = VirtAddr::new(0x0080_0000 + i * PGSIZE);
        k.sys_page_alloc(EnvId::CURRENT, va, RW).unwrap();
        k.user_write_u32(va, i).unwrap();
    }
    assert!(k.free_frame_count() < before);
    k.destroy(child).unwrap();
    assert_eq!(k.free_frame_count(), before);
}

#[test]
fn authorisation_requires_parenthood() {
    let mut k = boot();
    user_env(&mut k);
    let stranger = k.env_create(None).unwrap();

    assert_eq!(k.sys_env_destroy(stranger), Err(KernelError::BadEnv));
    assert_eq!(
        k.sys_env_set_status(stranger, EnvStatus::NotRunnable),
        Err(KernelError::BadEnv)
    );
    // But a stale or garbage id is bad-env even without permission rules.
    assert_eq!(k.sys_env_destroy(EnvId(0xdead_0000)), Err(KernelError::BadEnv));
}

#[test]
fn set_status_stores_the_requested_status() {
    let mut k = boot();
    user_env(&mut k);
    let child = EnvId(k.sys_exofork().unwrap());

    k.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
    assert_eq!(k.env_info(child).unwrap().status, EnvStatus::Runnable);

    // The requested status lands as given - NotRunnable stays NotRunnable.
    k.sys_env_set_status(child, EnvStatus::NotRunnable).unwrap();
    assert_eq!(k.env_info(child).unwrap().status, EnvStatus::NotRunnable);

    // Only the two schedulable states are accepted.
    assert_eq!(
        k.sys_env_set_status(child, EnvStatus::Dying),
        Err(KernelError::Inval)
    );
    assert_eq!(
        k.dispatch(SYS_ENV_SET_STATUS, [child.0, 99, 0, 0, 0]),
        KernelError::Inval.code()
    );
}

#[test]
fn set_trapframe_coerces_user_mode() {
    let mut k = boot();
    user_env(&mut k);
    let child = EnvId(k.sys_exofork().unwrap());

    // Stage the frame in user memory and install it through the ABI.
    let stage = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, stage, RW).unwrap();
    let mut tf = TrapFrame::new_user();
    tf.eip = 0x0090_0000;
    tf.esp = 0x0091_0000;
    tf.eflags = 0; // interrupts off - must be coerced back on
    k.user_write(stage, &tf.to_user_bytes()).unwrap();
    assert_eq!(
        k.dispatch(SYS_ENV_SET_TRAPFRAME, [child.0, stage.as_u32(), 0, 0, 0]),
        0
    );

    let installed = k.env_info(child).unwrap().tf;
    assert_eq!(installed.eip, 0x0090_0000);
    assert_eq!(installed.esp, 0x0091_0000);
    assert_ne!(installed.eflags & FL_IF, 0, "interrupts forced on");

    // A bad frame pointer destroys the caller, like any bad pointer the
    // kernel is asked to dereference.
    let caller = k.current().unwrap();
    let bad = VirtAddr::new(0x00a0_0000);
    assert!(k.dispatch(SYS_ENV_SET_TRAPFRAME, [child.0, bad.as_u32(), 0, 0, 0]) < 0);
    assert!(k.env_info(caller).is_none());
}

#[test]
fn ipc_delivers_value_and_page_atomically() {
    let mut k = boot();
    let sender = user_env(&mut k);
    let receiver = k.env_create(None).unwrap();

    let src = VirtAddr::new(0x0080_0000);
    let dst = VirtAddr::new(0x00a0_0000);

    // Receiver blocks first.
    k.run(receiver).unwrap();
    k.sys_ipc_recv(dst).unwrap();
    assert_eq!(k.env_info(receiver).unwrap().status, EnvStatus::NotRunnable);
    assert!(k.env_info(receiver).unwrap().ipc_recving);

    // Sender prepares a page and sends value 42 with it.
    k.run(sender).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, src, RW).unwrap();
    k.user_write_u32(src, 0xfeed_beef).unwrap();
    let ret = k.sys_ipc_try_send(receiver, 42, src, RW).unwrap();
    assert_eq!(ret, 1, "page was transferred");

    // Delivery is one step: value, perm, sender id, wakeup, planted zero.
    let info = k.env_info(receiver).unwrap();
    assert!(!info.ipc_recving);
    assert_eq!(info.ipc_value, 42);
    assert_eq!(info.ipc_from, sender);
    assert!(info.ipc_perm.contains(Pte::W));
    assert_eq!(info.status, EnvStatus::Runnable);
    assert_eq!(info.tf.regs.eax, 0);

    let (f_src, _) = k.va_mapping(sender, src).unwrap();
    let (f_dst, flags) = k.va_mapping(receiver, dst).unwrap();
    assert_eq!(f_src, f_dst, "both ends map the same frame");
    assert!(flags.contains(Pte::W));

    k.run(receiver).unwrap();
    assert_eq!(k.user_read_u32(dst).unwrap(), 0xfeed_beef);
}

#[test]
fn ipc_send_without_receiver_fails() {
    let mut k = boot();
    let sender = user_env(&mut k);
    let other = k.env_create(None).unwrap();

    assert_eq!(
        k.sys_ipc_try_send(other, 1, VirtAddr::new(u32::MAX), Pte::empty()),
        Err(KernelError::IpcNotRecv)
    );

    // A second send after a successful one also fails: recving was cleared
    // atomically with delivery.
    k.run(other).unwrap();
    k.sys_ipc_recv(VirtAddr::new(u32::MAX)).unwrap();
    k.run(sender).unwrap();
    assert_eq!(
        k.sys_ipc_try_send(other, 1, VirtAddr::new(u32::MAX), Pte::empty()),
        Ok(0)
    );
    assert_eq!(
        k.sys_ipc_try_send(other, 2, VirtAddr::new(u32::MAX), Pte::empty()),
        Err(KernelError::IpcNotRecv)
    );
}

#[test]
fn ipc_no_page_when_receiver_declines() {
    let mut k = boot();
    let sender = user_env(&mut k);
    let receiver = k.env_create(None).unwrap();

    k.run(receiver).unwrap();
    k.sys_ipc_recv(VirtAddr::new(u32::MAX)).unwrap(); // no page wanted

    k.run(sender).unwrap();
    let src = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, src, RW).unwrap();
    let ret = k.sys_ipc_try_send(receiver, 9, src, RW).unwrap();
    assert_eq!(ret, 0, "no mapping transferred");
    let info = k.env_info(receiver).unwrap();
    assert_eq!(info.ipc_value, 9);
    assert!(info.ipc_perm.is_empty());
}

#[test]
fn ipc_recv_rejects_unaligned_destination() {
    let mut k = boot();
    user_env(&mut k);
    assert_eq!(
        k.sys_ipc_recv(VirtAddr::new(0x0080_0004)),
        Err(KernelError::Inval)
    );
}

const FIX_ENTRY: VirtAddr = VirtAddr::new(0x0010_0000);

/// Upcall that maps a fresh writable page over whatever faulted.
fn fixing_handler(k: &mut Kernel) {
    let info = k.env_info(EnvId::CURRENT).unwrap();
    let mut bytes = [0u8; UTF_SIZE as usize];
    k.user_read(VirtAddr::new(info.tf.esp), &mut bytes).unwrap();
    let utf = UTrapFrame::from_bytes(&bytes);
    let fva = VirtAddr::new(utf.fault_va).page_base();
    k.sys_page_alloc(EnvId::CURRENT, fva, RW).unwrap();
}

fn install_upcall(k: &mut Kernel, entry: VirtAddr, handler: fn(&mut Kernel)) {
    k.sys_page_alloc(EnvId::CURRENT, VirtAddr::new(UXSTACKTOP - PGSIZE), RW)
        .unwrap();
    k.register_text(entry, handler);
    k.sys_env_set_pgfault_upcall(EnvId::CURRENT, entry).unwrap();
}

#[test]
fn upcall_resumes_the_faulting_access() {
    let mut k = boot();
    user_env(&mut k);
    install_upcall(&mut k, FIX_ENTRY, fixing_handler);

    let va = VirtAddr::new(0x00a0_0000);
    k.user_write_u32(va, 5).expect("write resumes after the upcall");
    assert_eq!(k.user_read_u32(va).unwrap(), 5);
    assert!(k.va_mapping(EnvId::CURRENT, va).is_some());
}

#[test]
fn fault_without_upcall_destroys_the_env() {
    let mut k = boot();
    let id = user_env(&mut k);
    assert_eq!(
        k.user_write_u32(VirtAddr::new(0x00a0_0000), 1),
        Err(UserFault::Destroyed)
    );
    assert!(k.env_info(id).is_none());
}

const NEST_X: u32 = 0x00a0_0000;
const NEST_Y: u32 = 0x00b0_0000;

/// Upcall that provokes a nested fault while handling the first one, then
/// fixes whichever page faulted. The nested invocation checks the frame
/// placement rule: below the live frame, past one scratch word.
fn nesting_handler(k: &mut Kernel) {
    let info = k.env_info(EnvId::CURRENT).unwrap();
    let mut bytes = [0u8; UTF_SIZE as usize];
    k.user_read(VirtAddr::new(info.tf.esp), &mut bytes).unwrap();
    let utf = UTrapFrame::from_bytes(&bytes);
    let fva = VirtAddr::new(utf.fault_va).page_base();

    if fva.as_u32() == NEST_X {
        assert_eq!(info.tf.esp, UXSTACKTOP - UTF_SIZE);
        k.user_write_u32(VirtAddr::new(NEST_Y), 7).unwrap();
    } else {
        assert_eq!(fva.as_u32(), NEST_Y);
        assert_eq!(info.tf.esp, UXSTACKTOP - UTF_SIZE - 4 - UTF_SIZE);
    }
    k.sys_page_alloc(EnvId::CURRENT, fva, RW).unwrap();
}

#[test]
fn nested_fault_pushes_below_the_live_frame() {
    let mut k = boot();
    user_env(&mut k);
    install_upcall(&mut k, FIX_ENTRY, nesting_handler);

    k.user_write_u32(VirtAddr::new(NEST_X), 5).unwrap();
    assert_eq!(k.user_read_u32(VirtAddr::new(NEST_X)).unwrap(), 5);
    assert_eq!(k.user_read_u32(VirtAddr::new(NEST_Y)).unwrap(), 7);
}

#[test]
fn scheduler_is_weakly_fair() {
    let mut k = boot();
    let a = user_env(&mut k);
    let b = k.env_create(None).unwrap();
    let c = k.env_create(None).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        match k.clock_tick() {
            Schedule::Run(id) => seen.push(id),
            Schedule::Halted => panic!("runnable envs exist"),
        }
    }
    for id in [a, b, c] {
        assert!(seen.contains(&id), "{} ran within N ticks", id);
    }
    assert!(
        seen.iter().all(|id| id.slot() != 0),
        "idle does not run while others are runnable"
    );
}

#[test]
fn idle_runs_last_and_halt_follows() {
    let mut k = boot();
    let a = user_env(&mut k);
    let idle = match k.destroy(a).unwrap() {
        Schedule::Run(id) => id,
        Schedule::Halted => panic!("idle should still be runnable"),
    };
    assert_eq!(idle.slot(), 0);
    assert_eq!(k.clock_tick(), Schedule::Run(idle));
    assert_eq!(k.destroy(idle).unwrap(), Schedule::Halted);
    assert_eq!(k.clock_tick(), Schedule::Halted);
}

#[test]
fn destroy_is_idempotent() {
    let mut k = boot();
    user_env(&mut k);
    let child = runnable_child(&mut k);
    assert_eq!(k.sys_env_destroy(child), Ok(0));
    assert_eq!(k.sys_env_destroy(child), Err(KernelError::BadEnv));
}

#[test]
fn stray_exceptions_kill_the_env_spurious_irqs_do_not() {
    let mut k = boot();
    let id = user_env(&mut k);

    assert_eq!(k.deliver_trap(Trap::SpuriousIrq), TrapOutcome::Resumed);
    assert!(k.env_info(id).is_some());
    assert_eq!(k.deliver_trap(Trap::Breakpoint), TrapOutcome::Monitor);
    assert!(k.env_info(id).is_some());

    assert_eq!(k.deliver_trap(Trap::DivideError), TrapOutcome::EnvDestroyed);
    assert!(k.env_info(id).is_none());
}

#[test]
fn timer_accounts_ticks() {
    let mut k = boot();
    user_env(&mut k);
    for _ in 0..5 {
        k.clock_tick();
    }
    assert_eq!(k.time_msec(), 50);
}

#[test]
fn cputs_writes_the_console() {
    let mut k = boot();
    user_env(&mut k);
    let va = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, va, RW).unwrap();
    k.user_write(va, b"hello, machine\n").unwrap();
    k.sys_cputs(va, 15).unwrap();
    assert_eq!(k.console_output(), b"hello, machine\n");
}

#[test]
fn cputs_with_bad_pointer_destroys_caller() {
    let mut k = boot();
    let id = user_env(&mut k);
    assert!(k.sys_cputs(VirtAddr::new(0x00a0_0000), 4).is_err());
    assert!(k.env_info(id).is_none());
}

#[test]
fn cgetc_polls_the_console() {
    let mut k = boot();
    user_env(&mut k);
    assert_eq!(k.sys_cgetc(), Ok(0));
    k.console_input(b"x");
    assert_eq!(k.sys_cgetc(), Ok(b'x' as u32));
}

#[test]
fn dispatch_speaks_negative_error_codes() {
    let mut k = boot();
    let id = user_env(&mut k);

    assert_eq!(k.dispatch(SYS_GETENVID, [0; 5]), id.0 as i32);
    assert_eq!(k.dispatch(NSYSCALLS + 7, [0; 5]), KernelError::Inval.code());
    // Permission word with bits above the low twelve is rejected outright.
    assert_eq!(
        k.dispatch(SYS_PAGE_ALLOC, [0, 0x0080_0000, 0x1007, 0, 0]),
        KernelError::Inval.code()
    );
    // The return value is planted in the saved result register.
    assert_eq!(
        k.env_info(EnvId::CURRENT).unwrap().tf.regs.eax,
        KernelError::Inval.code() as u32
    );
}

#[test]
fn sysenter_reads_fifth_argument_from_the_stack() {
    let mut k = boot();
    let id = user_env(&mut k);

    let stack = VirtAddr::new(0x0080_0000);
    k.sys_page_alloc(EnvId::CURRENT, stack, RW).unwrap();
    k.user_write_u32(stack, 0).unwrap();

    let mut tf = TrapFrame::new_user();
    tf.regs.eax = SYS_GETENVID;
    tf.regs.ebp = stack.as_u32();
    tf.regs.esi = 0x5151_5151;
    k.sys_env_set_trapframe(EnvId::CURRENT, &tf).unwrap();

    let ret = k.sysenter();
    assert_eq!(ret, id.0 as i32);

    // The fast-exit staging: result in eax, return esp in ecx, return eip
    // register image in edx.
    let after = k.env_info(EnvId::CURRENT).unwrap().tf;
    assert_eq!(after.regs.eax, id.0);
    assert_eq!(after.regs.ecx, stack.as_u32());
    assert_eq!(after.regs.edx, 0x5151_5151);
}
