//! Kernel objects: environments and their saved register state.

pub mod env;
pub mod trapframe;

pub use env::{EnvId, EnvInfo, EnvStatus, IpcState};
pub use trapframe::{Mode, PushRegs, TrapFrame, UTrapFrame, FL_IF, TF_SIZE, UTF_SIZE};
