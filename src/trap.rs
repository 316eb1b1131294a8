//! IDT construction and the top-level trap handler.
//!
//! Each vector is an interrupt gate
//! at DPL 0 (so `int n` from user mode faults), except the syscall
//! vector, a trap gate at DPL 3 that leaves IF alone.

use crate::drivers::{ideintr, kbdintr, syscall, uartintr};
use crate::lapic::lapiceoi;
use crate::mmu::{GateDesc, TrapFrame, SEG_KCODE};
use crate::proc::{cpuid, myproc, proc_yield};
use crate::spinlock::Spinlock;
use crate::traps::{IRQ_COM1, IRQ_IDE, IRQ_KBD, IRQ_SPURIOUS, IRQ_TIMER, T_IRQ0, T_SYSCALL};
use crate::x86::rcr2;

const NIDT: usize = 256;

static mut IDT: [GateDesc; NIDT] = [GateDesc::NULL; NIDT];

/// Tick counter, bumped by CPU 0 on every timer interrupt; processes
/// sleeping on its address wake once per tick.
static mut TICKS: u32 = 0;
static mut TICKSLOCK: Spinlock = Spinlock::new("time");

extern "C" {
    /// 256 trap-entry stub addresses, one per vector, each of which pushes
    /// a [`TrapFrame`] and calls `trap`. Interrupt-vector stubs are out of
    /// scope here; this array is supplied externally and
    /// only read, never authored, by this module.
    static vectors: [usize; NIDT];
}

/// Build the (CPU-shared) IDT: every vector an interrupt gate at DPL 0,
/// except [`T_SYSCALL`], a DPL 3 trap gate.
pub fn tvinit() {
    unsafe {
        for (i, slot) in IDT.iter_mut().enumerate() {
            *slot = GateDesc::set(false, (SEG_KCODE << 3) as u16, vectors[i] as u32, 0);
        }
        IDT[T_SYSCALL as usize] = GateDesc::set(
            true,
            (SEG_KCODE << 3) as u16,
            vectors[T_SYSCALL as usize] as u32,
            3,
        );
    }
}

/// Load the IDT register on this CPU.
pub fn idtinit() {
    unsafe { crate::x86::lidt(IDT.as_ptr(), NIDT) };
}

/// Dispatch a trap by `tf.trapno`. Called from the
/// (externally supplied) trap entry stub with interrupts still disabled
/// and `tf` pointing at a live trap frame on the current kernel stack.
///
/// # Safety
/// `tf` must be a valid, uniquely-owned [`TrapFrame`] for the duration of
/// this call.
pub unsafe fn trap(tf: *mut TrapFrame) {
    let tf = &mut *tf;

    if tf.trapno == T_SYSCALL {
        let p = myproc();
        if p.is_null() {
            panic!("syscall trap with no current process");
        }
        if (*p).killed {
            crate::proc::exit();
        }
        (*p).tf = tf as *mut TrapFrame;
        syscall();
        if (*p).killed {
            crate::proc::exit();
        }
        return;
    }

    if tf.trapno >= T_IRQ0 {
        match tf.trapno - T_IRQ0 {
            irq if irq == IRQ_TIMER => {
                if cpuid() == 0 {
                    TICKSLOCK.acquire();
                    TICKS += 1;
                    crate::proc::wakeup(core::ptr::addr_of!(TICKS) as usize);
                    TICKSLOCK.release();
                }
                lapiceoi();
            }
            irq if irq == IRQ_IDE => {
                ideintr();
                lapiceoi();
            }
            irq if irq == IRQ_IDE + 1 => {
                // Bochs generates spurious IDE1 interrupts; nothing to do.
            }
            irq if irq == IRQ_KBD => {
                kbdintr();
                lapiceoi();
            }
            irq if irq == IRQ_COM1 => {
                uartintr();
                lapiceoi();
            }
            irq if irq == IRQ_SPURIOUS => {
                log::warn!("cpu{}: spurious interrupt at {:#x}:{:#x}", cpuid(), tf.cs, tf.eip);
                lapiceoi();
            }
            _ => {
                log::warn!(
                    "unexpected IRQ {} from cpu {} eip {:#x}",
                    tf.trapno - T_IRQ0,
                    cpuid(),
                    tf.eip
                );
                lapiceoi();
            }
        }
    } else {
        let p = myproc();
        if p.is_null() || (tf.cs & 3) == 0 {
            log::error!(
                "unexpected trap {} from cpu {} eip {:#x} (cr2={:#x})",
                tf.trapno,
                cpuid(),
                tf.eip,
                rcr2()
            );
            panic!("trap");
        }
        log::warn!(
            "pid {} trap {} err {} on cpu {} eip {:#x} addr {:#x} -- kill proc",
            (*p).pid,
            tf.trapno,
            tf.err,
            cpuid(),
            tf.eip,
            rcr2()
        );
        (*p).killed = true;
    }

    // Force process exit if it has been killed and this is a user trap.
    let p = myproc();
    if !p.is_null() && (*p).killed && (tf.cs & 3) == 3 {
        crate::proc::exit();
    }

    // A timer tick on a RUNNING process is the preemption point.
    if !p.is_null() && (*p).state == crate::proc::ProcState::Running && tf.trapno == T_IRQ0 + IRQ_TIMER {
        proc_yield();
    }

    // Re-check: the process may have been killed while it was yielded.
    let p = myproc();
    if !p.is_null() && (*p).killed && (tf.cs & 3) == 3 {
        crate::proc::exit();
    }
}
