//! Kernel configuration constants.
//!
//! Centralised here (rather than scattered `const` items) so the rest of
//! the kernel can be tuned by editing one file, mirroring how the original
//! kernel's `param.h` is included everywhere sizes and limits are needed.

/// Max number of processes the process table can hold.
pub const NPROC: usize = 64;
/// Max number of CPUs the `cpus` table can track.
pub const NCPU: usize = 8;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Open files per system.
pub const NFILE: usize = 100;
/// Max number of active inodes.
pub const NINODE: usize = 50;
/// Device major numbers.
pub const NDEV: usize = 10;
/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;
/// Max exec arguments.
pub const MAXARG: usize = 32;
/// Max path name length.
pub const MAXPATH: usize = 128;
/// Size (in pages) of a process's kernel stack.
pub const KSTACKSIZE: usize = 1;
