//! Saved register state.
//!
//! A `TrapFrame` is what the trap entry path saves and what `env_run`
//! restores: the general registers, instruction and stack pointers, flags,
//! and the privilege of the interrupted context. A `UTrapFrame` is the
//! smaller record the kernel pushes onto the user exception stack when it
//! delivers a page fault to a registered upcall.

use crate::config::USTACKTOP;

/// Interrupt-enable bit in the flags word.
pub const FL_IF: u32 = 0x200;

/// General-purpose registers in push order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Stack pointer as pushed; ignored on restore.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Privilege of the interrupted context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    User,
    Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
    pub mode: Mode,
}

/// Size of the user-visible portion serialized by `env_set_trapframe`:
/// eight registers, eip, eflags, esp.
pub const TF_SIZE: u32 = 44;

impl TrapFrame {
    /// Fresh user frame: empty registers, stack at the top of the normal
    /// user stack, interrupts enabled.
    pub fn new_user() -> Self {
        Self {
            regs: PushRegs::default(),
            trapno: 0,
            err: 0,
            eip: 0,
            eflags: FL_IF,
            esp: USTACKTOP,
            mode: Mode::User,
        }
    }

    /// Decode the user-supplied layout of `env_set_trapframe`.
    ///
    /// The caller provides registers, eip, eflags, and esp; privilege and
    /// interrupt state are coerced afterwards by the syscall.
    pub fn from_user_bytes(bytes: &[u8; TF_SIZE as usize]) -> Self {
        let w = |i: usize| u32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            regs: PushRegs {
                edi: w(0),
                esi: w(1),
                ebp: w(2),
                oesp: w(3),
                ebx: w(4),
                edx: w(5),
                ecx: w(6),
                eax: w(7),
            },
            trapno: 0,
            err: 0,
            eip: w(8),
            eflags: w(9),
            esp: w(10),
            mode: Mode::User,
        }
    }

    pub fn to_user_bytes(&self) -> [u8; TF_SIZE as usize] {
        let mut out = [0u8; TF_SIZE as usize];
        let words = [
            self.regs.edi,
            self.regs.esi,
            self.regs.ebp,
            self.regs.oesp,
            self.regs.ebx,
            self.regs.edx,
            self.regs.ecx,
            self.regs.eax,
            self.eip,
            self.eflags,
            self.esp,
        ];
        for (i, w) in words.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

/// Size of the fault record pushed on the exception stack: fault address,
/// error code, eight registers, eip, eflags, esp.
pub const UTF_SIZE: u32 = 52;

/// The record a page-fault upcall receives on its alternate stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapFrame {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapFrame {
    pub fn to_bytes(&self) -> [u8; UTF_SIZE as usize] {
        let mut out = [0u8; UTF_SIZE as usize];
        let words = [
            self.fault_va,
            self.err,
            self.regs.edi,
            self.regs.esi,
            self.regs.ebp,
            self.regs.oesp,
            self.regs.ebx,
            self.regs.edx,
            self.regs.ecx,
            self.regs.eax,
            self.eip,
            self.eflags,
            self.esp,
        ];
        for (i, w) in words.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; UTF_SIZE as usize]) -> Self {
        let w = |i: usize| u32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            fault_va: w(0),
            err: w(1),
            regs: PushRegs {
                edi: w(2),
                esi: w(3),
                ebp: w(4),
                oesp: w(5),
                ebx: w(6),
                edx: w(7),
                ecx: w(8),
                eax: w(9),
            },
            eip: w(10),
            eflags: w(11),
            esp: w(12),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utrapframe_codec_round_trip() {
        let utf = UTrapFrame {
            fault_va: 0x0080_0123,
            err: 7,
            regs: PushRegs {
                eax: 1,
                ebx: 2,
                ecx: 3,
                edx: 4,
                esi: 5,
                edi: 6,
                ebp: 7,
                oesp: 8,
            },
            eip: 0x0080_0000,
            eflags: FL_IF,
            esp: 0xeebf_d000,
        };
        assert_eq!(UTrapFrame::from_bytes(&utf.to_bytes()), utf);
    }

    #[test]
    fn trapframe_codec_round_trip() {
        let mut tf = TrapFrame::new_user();
        tf.eip = 0x80_0000;
        tf.regs.eax = 0x1234;
        let decoded = TrapFrame::from_user_bytes(&tf.to_user_bytes());
        assert_eq!(decoded.eip, tf.eip);
        assert_eq!(decoded.regs, tf.regs);
        assert_eq!(decoded.esp, tf.esp);
    }
}
