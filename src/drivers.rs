//! Syscall demultiplexer and device-interrupt-handler boundary.
//!
//! The syscall demultiplexer and the IDE/keyboard/UART drivers are
//! deliberately out of scope here: the trap handler
//! only ever consumes `syscall`, `ideintr`, `kbdintr`, `uartintr` as
//! named external interfaces. A production build links this crate
//! against the real syscall table and drivers instead of the stand-ins
//! below.

/// Read `myproc().tf`'s syscall number/arguments, perform the call, and
/// store its return value in `tf->eax`.
pub fn syscall() {}

/// Service a completed IDE request.
pub fn ideintr() {}

/// Service a keyboard interrupt.
pub fn kbdintr() {}

/// Service a COM1 UART interrupt.
pub fn uartintr() {}
