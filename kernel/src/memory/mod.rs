//! Memory management: type-safe addresses, the physical frame allocator,
//! and per-environment address spaces.

pub mod address;
pub mod frame;
pub mod vspace;

pub use address::{Pfn, PhysAddr, VirtAddr};
pub use frame::FrameAllocator;
