//! Hand-written assembly. Boot/entry assembly and the interrupt-vector
//! stubs are out of scope here and are expected to be
//! supplied externally at link time; `swtch` (the in-scope context-switch
//! primitive) is authored here.

use core::arch::global_asm;

global_asm!(include_str!("swtch.S"));
