//! Kestrel user runtime.
//!
//! The library a user environment links against: thin wrappers over the
//! numeric syscall ABI, helpers for reading the page-table self-map, and
//! the three higher-level services built purely on kernel primitives -
//! copy-on-write [`fork`], synchronous [`ipc`], and [`spawn`].
//!
//! Everything here runs as the *current* environment of the kernel it is
//! handed; the harness context-switches with [`kestrel_kernel::Kernel::run`]
//! before driving an environment's code.

pub mod fork;
pub mod ipc;
pub mod spawn;
pub mod syscall;
pub mod vm;

pub use fork::fork;
pub use spawn::spawn;
