//! Kernel entry point and boot sequence.
//!
//! Boot runs the two-phase `kinit1`/`kinit2` x86 allocator sequence
//! before the kernel page table maps all of physical memory. Multi-CPU
//! bring-up (MP table parsing, startup IPIs) is out of scope (see
//! [`msk::lapic`]); this binary only ever finds CPU 0 and falls straight
//! into `scheduler`.

#![no_std]
#![no_main]
#![feature(panic_info_message)]

use core::sync::atomic::{AtomicBool, Ordering};

use msk::memlayout::{p2v, PHYSTOP};
use msk::proc::cpuid;
use msk::{console, file, kalloc, printf, proc, trap, vm};

extern "C" {
    /// First address after the kernel image, provided by the linker script.
    /// Interrupt-vector stubs, boot/entry assembly and this symbol's linker
    /// script are out of scope here; only consumed.
    static end: u8;
}

/// Memory reserved for the lock-free allocator phase, before the full
/// kernel page table (which maps all of physical memory) exists.
const EARLY_PHYS_LIMIT: usize = 4 * 1024 * 1024;

static STARTED: AtomicBool = AtomicBool::new(false);

#[no_mangle]
pub extern "C" fn kmain() -> ! {
    if cpuid() == 0 {
        console::Console::init();
        printf::init_logging();
        log::info!("kernel booting");

        let end_addr = unsafe { &end as *const u8 as usize };

        kalloc::kinit1(end_addr, p2v(EARLY_PHYS_LIMIT)); // phase 1: this CPU only, no lock yet
        vm::kvmalloc(end_addr); // kernel page table, CR3 loaded
        vm::seginit();
        proc::pinit();
        trap::tvinit();
        trap::idtinit();
        file::fileinit();
        kalloc::kinit2(p2v(EARLY_PHYS_LIMIT), p2v(PHYSTOP)); // phase 2: lock enabled
        proc::userinit(end_addr);

        core::sync::atomic::fence(Ordering::SeqCst);
        STARTED.store(true, Ordering::SeqCst);
        log::info!("boot complete");
    } else {
        while !STARTED.load(Ordering::SeqCst) {}
        core::sync::atomic::fence(Ordering::SeqCst);

        vm::switchkvm();
        vm::seginit();
        trap::idtinit();
        log::info!("cpu{} starting", cpuid());
    }

    proc::scheduler();
}

#[no_mangle]
extern "C" fn eh_personality() {}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    msk::x86::cli();
    if let Some(location) = info.location() {
        printf::cprintf_args(format_args!(
            "kernel panic at {}:{}: {}\n",
            location.file(),
            location.line(),
            info.message().unwrap_or(format_args!(""))
        ));
    } else {
        printf::cprintf_args(format_args!("kernel panic\n"));
    }
    proc::procdump();
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}
