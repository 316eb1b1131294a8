//! Library root: re-exports every module so the `kernel` binary and the
//! host-side test harness (`kernel_as_a_lib`) build from one source tree
//! instead of two.
//!
//! Laid out as a lib+bin pair so the CPU-independent logic (free-list
//! bookkeeping, PTE/PGROUNDUP arithmetic, the `deallocuvm` directory-skip
//! helper) can be exercised with `cargo test` on the host, without
//! booting a CPU.

// `cargo test` links this lib against the host's std-backed test harness,
// so `no_std` only applies to the real (freestanding) build.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(feature = "kernel_as_a_lib"), allow(dead_code))]

pub mod param;
pub mod memlayout;
pub mod mmu;
pub mod x86;
pub mod spinlock;
pub mod sleeplock;
pub mod string;
pub mod kalloc;
pub mod vm;
pub mod proc;
pub mod traps;
pub mod trap;
pub mod lapic;
pub mod fsiface;
pub mod drivers;
pub mod file;
pub mod console;
pub mod printf;

#[cfg(not(feature = "kernel_as_a_lib"))]
pub mod asm;
