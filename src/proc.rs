//! Process table, per-CPU scheduler, sleep/wakeup, fork/exit/wait/kill --
//! the concurrency heart of the kernel.
//!
//! `Cpu`/`Proc`/`Context` are static fixed-size tables discovered by
//! `mycpu`/`myproc`, with x86's `Context` shape and the full
//! scheduler/sleep/wakeup/fork/exit/wait state machine.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::file::File;
use crate::fsiface::{idup, iput, namei, INode};
use crate::kalloc::{kalloc, kfree};
use crate::lapic::lapicid;
use crate::mmu::{TaskState, TrapFrame, NSEGS, PGSIZE};
use crate::param::{NCPU, NOFILE, NPROC};
use crate::spinlock::Spinlock;
use crate::string::safestrcpy;
use crate::vm::{
    allocuvm, copyuvm, deallocuvm, freevm, inituvm, setupkvm, switchkvm, switchuvm, PageTable,
};
use crate::x86::readeflags;
use crate::mmu::FL_IF;

extern "C" {
    /// Tiny assembly stub that pops a [`TrapFrame`] off the kernel stack
    /// and `iret`s into user mode. Out of scope here (interrupt-vector /
    /// entry assembly): provided by the trap stubs.
    fn trapret();
}

/// Saved callee-saved registers for a kernel-thread context switch
/// (`swtch`). Laid out to match `asm/swtch.S`'s "switch stacks" point:
/// `eip` is not saved explicitly by `swtch` itself, but sits on the stack
/// right where this struct says it does, and `allocproc` relies on that.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Per-CPU state, discovered via the local APIC id.
pub struct Cpu {
    pub apicid: u8,
    /// `swtch` target to re-enter `scheduler` from a running process: a
    /// pointer to the saved `Context` on this CPU's own boot stack, not an
    /// embedded struct: `swtch`'s `old`/`new` convention needs the address
    /// of a pointer-sized slot, not an embedded struct.
    pub scheduler: *mut Context,
    /// Used by the CPU to find the stack to switch to on a ring crossing.
    pub ts: TaskState,
    pub gdt: [crate::mmu::SegDesc; NSEGS],
    pub started: bool,
    /// Depth of `push_off` nesting.
    pub ncli: i32,
    /// Were interrupts enabled before the outermost `push_off`?
    pub intena: bool,
    /// The process running on this CPU, or null.
    pub proc: *mut Proc,
}

impl Cpu {
    const fn zeroed() -> Self {
        Cpu {
            apicid: 0,
            scheduler: core::ptr::null_mut(),
            ts: TaskState::ZEROED,
            gdt: [crate::mmu::SegDesc::NULL; NSEGS],
            started: false,
            ncli: 0,
            intena: false,
            proc: core::ptr::null_mut(),
        }
    }
}

pub static mut CPUS: [Cpu; NCPU] = [const { Cpu::zeroed() }; NCPU];
/// Number of CPUs actually brought up. Multi-CPU bring-up (MP table
/// parsing, startup IPIs) is a boot/driver concern out of this crate's
/// scope; this kernel runs CPU 0 only until that glue is supplied.
pub static NCPU_ACTIVE: u32 = 1;

/// Per-process state. `lock` and the fields under it may be touched from
/// any CPU; the remaining fields are private to the process and need no
/// lock because only the process itself (or the scheduler, while it is
/// not `RUNNING`) touches them.
pub struct Proc {
    pub sz: usize,
    pub pgdir: *mut PageTable,
    pub kstack: usize,
    pub state: ProcState,
    pub pid: u32,
    pub parent: *mut Proc,
    pub tf: *mut TrapFrame,
    pub context: *mut Context,
    pub chan: usize,
    pub killed: bool,
    pub ofile: [*mut File; NOFILE],
    pub cwd: *mut INode,
    pub name: [u8; 16],
}

impl Proc {
    const fn zeroed() -> Self {
        Proc {
            sz: 0,
            pgdir: core::ptr::null_mut(),
            kstack: 0,
            state: ProcState::Unused,
            pid: 0,
            parent: core::ptr::null_mut(),
            tf: core::ptr::null_mut(),
            context: core::ptr::null_mut(),
            chan: 0,
            killed: false,
            ofile: [core::ptr::null_mut(); NOFILE],
            cwd: core::ptr::null_mut(),
            name: [0; 16],
        }
    }
}

struct Ptable {
    lock: Spinlock,
    proc: [Proc; NPROC],
}

static mut PTABLE: Ptable = Ptable {
    lock: Spinlock::new("ptable"),
    proc: [const { Proc::zeroed() }; NPROC],
};

static mut INIT_PROC: *mut Proc = core::ptr::null_mut();
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Initialize the ptable lock. Everything else in `PTABLE` is already
/// zeroed at link time.
pub fn pinit() {
    // Spinlock::new already produced a ready-to-use lock at static init.
}

/// Must be called with interrupts disabled, to avoid a race against this
/// thread being rescheduled onto a different CPU mid-read.
pub fn cpuid() -> u8 {
    unsafe { lapicid() }
}

/// Return this CPU's `Cpu` record. Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    if readeflags() & FL_IF != 0 {
        panic!("mycpu called with interrupts enabled");
    }
    let apicid = unsafe { lapicid() };
    unsafe {
        for c in CPUS.iter_mut().take(NCPU_ACTIVE as usize) {
            if c.apicid == apicid {
                return c;
            }
        }
    }
    panic!("unknown apicid");
}

/// Return a pointer to the currently running process, or null.
pub fn myproc() -> *mut Proc {
    crate::spinlock::push_off();
    let p = mycpu().proc;
    crate::spinlock::pop_off();
    p
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Look in the process table for an `UNUSED` proc; if found, initialize
/// the state required to run in the kernel and return it with its kernel
/// stack and trap-frame/context carved top-down.
/// Returns null if there are no free slots or a memory allocation fails.
fn allocproc() -> *mut Proc {
    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();

    let mut found: *mut Proc = core::ptr::null_mut();
    for p in ptable.proc.iter_mut() {
        if p.state == ProcState::Unused {
            found = p as *mut Proc;
            break;
        }
    }
    if found.is_null() {
        ptable.lock.release();
        return core::ptr::null_mut();
    }

    let p = unsafe { &mut *found };
    p.state = ProcState::Embryo;
    p.pid = allocpid();
    ptable.lock.release();

    let kstack = kalloc();
    if kstack.is_null() {
        p.state = ProcState::Unused;
        return core::ptr::null_mut();
    }
    p.kstack = kstack as usize;
    let sp_top = p.kstack + PGSIZE;

    // Carve the kernel stack top-down: trap frame, then the return
    // address into `trapret`, then a zeroed context with `eip = forkret`.
    let mut sp = sp_top - core::mem::size_of::<TrapFrame>();
    p.tf = sp as *mut TrapFrame;

    sp -= core::mem::size_of::<usize>();
    unsafe { (sp as *mut usize).write(trapret as usize) };

    sp -= core::mem::size_of::<Context>();
    p.context = sp as *mut Context;
    unsafe {
        core::ptr::write_bytes(p.context, 0, 1);
        (*p.context).eip = forkret as usize as u32;
    }

    found
}

/// A user program that calls `exec("/init")`; stands in for the real
/// `initcode` blob an exec-capable core would embed (the ELF loader and
/// exec syscall are out of this crate's scope). It is
/// never executed by anything in this crate; it only needs to exist so
/// `userinit` has bytes to map.
static INITCODE: [u8; 4] = [0xeb, 0xfe, 0, 0]; // jmp $ (spin)

/// Set up the first user process: page directory via `setupkvm`, the
/// embedded init blob loaded at virtual 0, trap frame primed for a DPL 3
/// return to `eip = 0`.
pub fn userinit(kernel_data: usize) {
    let p = allocproc();
    if p.is_null() {
        panic!("userinit: allocproc failed");
    }
    unsafe { INIT_PROC = p };
    let p = unsafe { &mut *p };

    p.pgdir = setupkvm(kernel_data);
    if p.pgdir.is_null() {
        panic!("userinit: out of memory");
    }
    inituvm(p.pgdir, &INITCODE);
    p.sz = PGSIZE;

    unsafe {
        let tf = &mut *p.tf;
        core::ptr::write_bytes(tf as *mut TrapFrame, 0, 1);
        tf.cs = ((crate::mmu::SEG_UCODE << 3) | crate::mmu::DPL_USER as u16) as u16;
        tf.ds = ((crate::mmu::SEG_UDATA << 3) | crate::mmu::DPL_USER as u16) as u16;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = FL_IF;
        tf.esp = PGSIZE as u32;
        tf.eip = 0;
    }

    safestrcpy(p.name.as_mut_ptr(), b"initcode\0".as_ptr(), p.name.len());
    p.cwd = namei("/").unwrap_or(core::ptr::null_mut());

    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();
    p.state = ProcState::Runnable;
    ptable.lock.release();
}

/// Grow or shrink the current process's address space by `n` bytes.
pub fn growproc(n: isize) -> i32 {
    let p = unsafe { &mut *myproc() };
    let mut sz = p.sz;
    if n > 0 {
        let newsz = allocuvm(p.pgdir, sz, sz + n as usize);
        if newsz == 0 {
            return -1;
        }
        sz = newsz;
    } else if n < 0 {
        sz = deallocuvm(p.pgdir, sz, sz - (-n) as usize);
    }
    p.sz = sz;
    switchuvm(p.kstack, p.pgdir);
    0
}

/// Create a new process by duplicating the calling process. The child
/// resumes as if `fork` had returned 0.
pub fn fork(kernel_data: usize) -> i32 {
    let curproc = unsafe { &mut *myproc() };

    let np = allocproc();
    if np.is_null() {
        return -1;
    }
    let np_ref = unsafe { &mut *np };

    let newpgdir = copyuvm(curproc.pgdir, curproc.sz, kernel_data);
    if newpgdir.is_null() {
        kfree(np_ref.kstack as *mut u8);
        np_ref.kstack = 0;
        np_ref.state = ProcState::Unused;
        return -1;
    }
    np_ref.pgdir = newpgdir;
    np_ref.sz = curproc.sz;
    np_ref.parent = curproc as *mut Proc;

    unsafe {
        *np_ref.tf = *curproc.tf;
        (*np_ref.tf).eax = 0; // child's fork() returns 0
    }

    for i in 0..NOFILE {
        if !curproc.ofile[i].is_null() {
            np_ref.ofile[i] = crate::file::filedup(curproc.ofile[i]);
        }
    }
    np_ref.cwd = idup(curproc.cwd);
    np_ref.name = curproc.name;

    let pid = np_ref.pid;

    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();
    np_ref.state = ProcState::Runnable;
    ptable.lock.release();

    pid as i32
}

/// Close all open files, reparent children to `initproc`, become a
/// zombie, and hand control back to the scheduler. Never returns.
pub fn exit() -> ! {
    let curproc = unsafe { &mut *myproc() };
    let init_proc = unsafe { INIT_PROC };
    if curproc as *mut Proc == init_proc {
        panic!("init exiting");
    }

    for i in 0..NOFILE {
        if !curproc.ofile[i].is_null() {
            crate::file::fileclose(curproc.ofile[i]);
            curproc.ofile[i] = core::ptr::null_mut();
        }
    }

    crate::fsiface::begin_op();
    iput(curproc.cwd);
    crate::fsiface::end_op();
    curproc.cwd = core::ptr::null_mut();

    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();

    // Parent might be sleeping in wait() (wait() sleeps on chan = itself).
    wakeup1(curproc.parent as usize);

    for p in ptable.proc.iter_mut() {
        if p.parent == curproc as *mut Proc {
            p.parent = init_proc;
            if p.state == ProcState::Zombie {
                wakeup1(init_proc as usize);
            }
        }
    }

    curproc.state = ProcState::Zombie;
    sched();
    panic!("zombie exited");
}

/// Wait for any child to exit; reap it and return its pid, or -1 if the
/// caller has no children (or has been killed).
pub fn wait() -> i32 {
    let curproc = myproc();
    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();

    loop {
        let mut have_kids = false;
        for p in ptable.proc.iter_mut() {
            if p.parent != curproc {
                continue;
            }
            have_kids = true;
            if p.state == ProcState::Zombie {
                let pid = p.pid;
                kfree(p.kstack as *mut u8);
                p.kstack = 0;
                freevm(p.pgdir);
                p.pgdir = core::ptr::null_mut();
                p.pid = 0;
                p.parent = core::ptr::null_mut();
                p.name = [0; 16];
                p.killed = false;
                p.chan = 0;
                p.state = ProcState::Unused;
                ptable.lock.release();
                return pid as i32;
            }
        }

        if !have_kids || unsafe { (*curproc).killed } {
            ptable.lock.release();
            return -1;
        }

        sleep_locked(curproc as usize, &mut ptable.lock);
    }
}

/// Per-CPU scheduler loop; never returns. Picks a `RUNNABLE` process,
/// switches to its address space and TSS, and `swtch`es into it. Regains
/// control here when the process calls `sched`.
pub fn scheduler() -> ! {
    let c = mycpu();
    loop {
        crate::x86::sti();

        let ptable = unsafe { &mut PTABLE };
        ptable.lock.acquire();
        for p in ptable.proc.iter_mut() {
            if p.state != ProcState::Runnable {
                continue;
            }

            c.proc = p as *mut Proc;
            switchuvm(p.kstack, p.pgdir);
            p.state = ProcState::Running;

            unsafe {
                // old = &c.scheduler (address of the pointer field, which
                // swtch fills in with the resumption point the next time
                // this CPU re-enters its scheduler); new = p.context, the
                // pointer `allocproc`/a prior `swtch` already carved.
                swtch(&mut c.scheduler as *mut *mut Context as *mut Context, p.context);
            }

            switchkvm();
            c.proc = core::ptr::null_mut();
        }
        ptable.lock.release();
    }
}

/// Re-enter the scheduler from a process thread. Requires the ptable
/// lock held, exactly one lock held overall, the process not `RUNNING`,
/// and interrupts disabled -- the only place ordinary process threads do
/// this.
fn sched() {
    let p = unsafe { &mut *myproc() };
    let c = mycpu();

    if !unsafe { PTABLE.lock.holding() } {
        panic!("sched ptable.lock");
    }
    if c.ncli != 1 {
        panic!("sched locks");
    }
    if p.state == ProcState::Running {
        panic!("sched running");
    }
    if readeflags() & FL_IF != 0 {
        panic!("sched interruptible");
    }

    let intena = c.intena;
    unsafe {
        // old = &p.context (address of the pointer field, filled in with
        // where this process's state now lives); new = c.scheduler, the
        // pointer `scheduler`'s own `swtch` call left pointing at its
        // saved context.
        swtch(&mut p.context as *mut *mut Context as *mut Context, c.scheduler);
    }
    c.intena = intena;
}

/// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();
    unsafe { (*myproc()).state = ProcState::Runnable };
    sched();
    ptable.lock.release();
}

/// A fork child's very first scheduling lands here:
/// release the ptable lock inherited from `scheduler`, run the late
/// process-context init exactly once, and return into `trapret`.
extern "C" fn forkret() {
    static mut FIRST: bool = true;

    unsafe { PTABLE.lock.release() };

    unsafe {
        if FIRST {
            FIRST = false;
            crate::fsiface::iinit();
            crate::fsiface::initlog(crate::param::ROOTDEV);
        }
    }
    // Returns into `trapret`, which `iret`s into user mode using the trap
    // frame `allocproc` prepared for this process.
}

/// Atomically release `lk` and put the caller to sleep on `chan`; on
/// wake, reacquire `lk`. Uses the ptable-lock hand-off protocol (spec
/// section 4.4 / 9) to close the lost-wakeup window between "I will
/// sleep" and "I am asleep".
pub fn sleep(chan: usize, lk: &mut Spinlock) {
    let p = unsafe { &mut *myproc() };

    let ptable_lock_ptr = unsafe { core::ptr::addr_of_mut!(PTABLE.lock) };
    let swapped = lk as *mut Spinlock != ptable_lock_ptr;
    if swapped {
        unsafe { (*ptable_lock_ptr).acquire() };
        lk.release();
    }

    p.chan = chan;
    p.state = ProcState::Sleeping;
    sched();
    p.chan = 0;

    if swapped {
        unsafe { (*ptable_lock_ptr).release() };
        lk.acquire();
    }
}

/// Variant of `sleep` for callers that already hold the ptable lock
/// themselves (`wait`).
fn sleep_locked(chan: usize, ptable_lock: &mut Spinlock) {
    let p = unsafe { &mut *myproc() };
    p.chan = chan;
    p.state = ProcState::Sleeping;
    sched();
    p.chan = 0;
    let _ = ptable_lock;
}

/// Move every process sleeping on `chan` to `RUNNABLE`. Caller must hold
/// the ptable lock.
fn wakeup1(chan: usize) {
    let ptable = unsafe { &mut PTABLE };
    for p in ptable.proc.iter_mut() {
        if p.state == ProcState::Sleeping && p.chan == chan {
            p.state = ProcState::Runnable;
        }
    }
}

/// Lock-wrapping variant of `wakeup1`.
pub fn wakeup(chan: usize) {
    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();
    wakeup1(chan);
    ptable.lock.release();
}

/// Mark pid as killed. If it is sleeping, also mark it `RUNNABLE` so it
/// observes the flag; actual termination happens at the next kernel-to-
/// user trap return.
pub fn kill(pid: u32) -> i32 {
    let ptable = unsafe { &mut PTABLE };
    ptable.lock.acquire();
    for p in ptable.proc.iter_mut() {
        if p.pid == pid {
            p.killed = true;
            if p.state == ProcState::Sleeping {
                // chan is intentionally left set; wakeup1 only acts on
                // Sleeping processes, so a concurrent wakeup1 for this
                // chan simply skips this process once its state flips here.
                p.state = ProcState::Runnable;
            }
            ptable.lock.release();
            return 0;
        }
    }
    ptable.lock.release();
    -1
}

/// Debug listing of the process table (`P` console hotkey in the
/// original); useful from a panic handler or a debugger script.
pub fn procdump() {
    let ptable = unsafe { &mut PTABLE };
    for p in ptable.proc.iter() {
        if p.state == ProcState::Unused {
            continue;
        }
        crate::printf::cprintf_args(format_args!(
            "{} {:?} {}\n",
            p.pid,
            p.state,
            core::str::from_utf8(&p.name).unwrap_or("?")
        ));
    }
}

/// Context switch primitive: save the caller's callee-saved registers at
/// `*old`, switch to the stack described by `new`, and resume there.
/// Implemented in `asm/swtch.S`; everything else `swtch` needs is
/// already on the stack by the time it runs.
extern "C" {
    fn swtch(old: *mut Context, new: *mut Context);
}

#[cfg(test)]
mod tests {
    use super::*;

    // allocproc/fork/exit/scheduler etc. all reach `mycpu()`/`kalloc()`/
    // the real ptable lock, none of which are safe to exercise on a host
    // test binary (see spinlock::tests). Only the data model's static
    // shape and initial values are host-testable here.

    #[test]
    fn context_layout_matches_swtch_push_order() {
        // `asm/swtch.S` pushes edi, esi, ebx, ebp in that order and relies
        // on `eip` sitting immediately above them on the stack; a `repr(C)`
        // struct of 5 u32 fields is exactly that layout.
        assert_eq!(core::mem::size_of::<Context>(), 5 * 4);
    }

    #[test]
    fn proc_zeroed_starts_unused_with_no_resources() {
        let p = Proc::zeroed();
        assert_eq!(p.state, ProcState::Unused);
        assert_eq!(p.pid, 0);
        assert!(p.pgdir.is_null());
        assert!(p.tf.is_null());
        assert!(p.context.is_null());
        assert!(!p.killed);
        assert!(p.ofile.iter().all(|f| f.is_null()));
    }

    #[test]
    fn cpu_zeroed_has_no_nested_cli_and_no_running_proc() {
        let c = Cpu::zeroed();
        assert_eq!(c.ncli, 0);
        assert!(!c.intena);
        assert!(!c.started);
        assert!(c.proc.is_null());
    }
}
