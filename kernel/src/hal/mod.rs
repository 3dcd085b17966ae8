//! The simulated hardware: physical memory and the block device.
//!
//! Everything in here stands in for silicon, not for kernel code. Host
//! synchronization primitives are allowed on this side of the line; kernel
//! code above it must use the kernel's own locks.

pub mod disk;
pub mod mem;
