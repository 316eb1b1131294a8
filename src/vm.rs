//! Two-level x86 page tables: kernel map, per-process user map
//! grow/shrink/copy/free, user<->kernel copy.
//!
//! Allocators return `Option` where the call site branches on failure
//! right away, raw nullable pointers where null is a long-lived value
//! threaded through further calls, and panics on the invariants that
//! should never be violated by a correctly-behaving caller.

use crate::fsiface::{readi, INode};
use crate::kalloc::{kalloc, kfree};
use crate::memlayout::{kmap, p2v, v2p, KERNBASE};
use crate::mmu::{
    SegDesc, NPDENTRIES, PGSIZE, PTE_P, PTE_U, PTE_W, SEG_KCODE, SEG_KDATA, SEG_TSS,
    SEG_UCODE, SEG_UDATA, STA_R, STA_W, STA_X, DPL_USER, NSEGS,
};
use crate::proc::mycpu;
use crate::string::{memmove, memset};
use crate::x86::{lcr3, lgdt};
use crate::{PDX, PGADDR, PGROUNDDOWN, PGROUNDUP, PTE_ADDR, PTE_FLAGS, PTX};

/// A page directory or page table: 1024 32-bit entries filling one frame.
pub type PageTable = [u32; NPDENTRIES];

/// The kernel-only page directory shared by `scheduler` on every CPU
/// before any process is running.
static mut KPGDIR: *mut PageTable = core::ptr::null_mut();

/// Set up the CPU's kernel segment descriptors and install the GDT.
/// Called once per CPU at boot, before paging is turned on.
pub fn seginit() {
    let c = mycpu();
    c.gdt[SEG_KCODE as usize] = SegDesc::seg(STA_X | STA_R, 0, 0xffff_ffff, 0);
    c.gdt[SEG_KDATA as usize] = SegDesc::seg(STA_W, 0, 0xffff_ffff, 0);
    c.gdt[SEG_UCODE as usize] = SegDesc::seg(STA_X | STA_R, 0, 0xffff_ffff, DPL_USER);
    c.gdt[SEG_UDATA as usize] = SegDesc::seg(STA_W, 0, 0xffff_ffff, DPL_USER);
    unsafe { lgdt(c.gdt.as_ptr(), NSEGS) };
}

/// Return the address of the PTE for virtual address `va` in `pgdir`.
/// If `alloc` and no page table exists for this PDE, allocate and zero one.
fn walkpgdir(pgdir: *mut PageTable, va: usize, alloc: bool) -> Option<*mut u32> {
    unsafe {
        let pde = &mut (*pgdir)[PDX!(va)];
        let pgtab: *mut PageTable = if *pde & PTE_P != 0 {
            p2v(PTE_ADDR!(*pde) as usize) as *mut PageTable
        } else {
            if !alloc {
                return None;
            }
            let pg = kalloc();
            if pg.is_null() {
                return None;
            }
            memset(pg, 0, PGSIZE);
            *pde = (v2p(pg as usize) as u32) | PTE_P | PTE_W | PTE_U;
            pg as *mut PageTable
        };
        Some(&mut (*pgtab)[PTX!(va)] as *mut u32)
    }
}

/// Map `[va, va+size)` to `[pa, pa+size)` with permission bits `perm`,
/// allocating page-table pages as needed. `va`/`size` need not be
/// page-aligned; the loop walks whole pages including the one holding the
/// final byte.
pub fn mappages(pgdir: *mut PageTable, va: usize, size: usize, mut pa: usize, perm: u32) -> i32 {
    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);
    loop {
        let pte = match walkpgdir(pgdir, a, true) {
            Some(p) => p,
            None => return -1,
        };
        unsafe {
            if *pte & PTE_P != 0 {
                panic!("mappages: remap");
            }
            *pte = (pa as u32) | perm | PTE_P;
        }
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    0
}

/// Allocate a page directory and map the kernel's fixed high half into it.
/// Returns null (after freeing anything partially built) on allocation
/// failure. `data` is the first writable kernel virtual address.
pub fn setupkvm(data: usize) -> *mut PageTable {
    let pgdir = kalloc() as *mut PageTable;
    if pgdir.is_null() {
        return core::ptr::null_mut();
    }
    memset(pgdir as *mut u8, 0, PGSIZE);

    if v2p(data) as usize >= crate::memlayout::PHYSTOP {
        panic!("setupkvm: PHYSTOP too low");
    }

    for region in kmap(data).iter() {
        if mappages(pgdir, region.virt, region.size(), region.phys_start, region.perm) < 0 {
            freevm(pgdir);
            return core::ptr::null_mut();
        }
    }
    pgdir
}

/// Build and install (in `KPGDIR`) the scheduler's kernel-only page
/// directory, used while no process is running on this CPU.
pub fn kvmalloc(data: usize) {
    unsafe {
        KPGDIR = setupkvm(data);
        if KPGDIR.is_null() {
            panic!("kvmalloc");
        }
    }
    switchkvm();
}

/// Load CR3 with the kernel-only page directory.
pub fn switchkvm() {
    unsafe { lcr3(v2p(KPGDIR as usize) as u32) };
}

/// Install this CPU's TSS and switch CR3 to `p`'s page directory.
///
/// # Panics
/// If `p`, its kernel stack, or its page directory is null: switching to
/// a process without these set up is a kernel bug, not a recoverable
/// condition.
pub fn switchuvm(kstack: usize, pgdir: *mut PageTable) {
    if kstack == 0 {
        panic!("switchuvm: no kstack");
    }
    if pgdir.is_null() {
        panic!("switchuvm: no pgdir");
    }

    crate::spinlock::push_off();
    let c = mycpu();
    c.gdt[SEG_TSS as usize] = SegDesc::seg(
        crate::mmu::STS_T32A,
        &c.ts as *const _ as u32,
        (core::mem::size_of::<crate::mmu::TaskState>() - 1) as u32,
        0,
    );
    // Task descriptors are not marked `s` (application); clear it so the
    // CPU treats this as a system descriptor.
    c.gdt[SEG_TSS as usize].0 &= !(1u64 << 44);
    c.ts.ss0 = (SEG_KDATA << 3) as u16;
    c.ts.esp0 = (kstack + crate::param::KSTACKSIZE * PGSIZE) as u32;
    // setprotected() denies user-mode port I/O entirely.
    c.ts.iomb = 0xFFFF;
    unsafe {
        crate::x86::ltr((SEG_TSS << 3) as u16);
        lcr3(v2p(pgdir as usize) as u32);
    }
    crate::spinlock::pop_off();
}

/// Load the first process's image (`init`, at most one page) at virtual
/// address 0.
pub fn inituvm(pgdir: *mut PageTable, init: &[u8]) {
    if init.len() >= PGSIZE {
        panic!("inituvm: more than a page");
    }
    let mem = kalloc();
    if mem.is_null() {
        panic!("inituvm: out of memory");
    }
    memset(mem, 0, PGSIZE);
    mappages(pgdir, 0, PGSIZE, v2p(mem as usize), PTE_W | PTE_U);
    memmove(mem, init.as_ptr(), init.len());
}

/// Load program bytes from `ip` at file offset `offset` into the already
/// page-aligned, already-mapped user region `[addr, addr+sz)`.
///
/// # Safety
/// Caller must hold whatever lock `ip` requires per the FS boundary.
pub unsafe fn loaduvm(
    pgdir: *mut PageTable,
    addr: usize,
    ip: *mut INode,
    offset: u32,
    sz: usize,
) -> i32 {
    if addr % PGSIZE != 0 {
        panic!("loaduvm: addr must be page aligned");
    }
    let mut i = 0;
    while i < sz {
        let pte = match walkpgdir(pgdir, addr + i, false) {
            Some(p) => p,
            None => panic!("loaduvm: address should exist"),
        };
        let pa = PTE_ADDR!(*pte) as usize;
        let n = if sz - i < PGSIZE { sz - i } else { PGSIZE };
        if readi(ip, p2v(pa) as *mut u8, offset + i as u32, n as u32) != n as i32 {
            return -1;
        }
        i += PGSIZE;
    }
    0
}

/// Grow a user address space from `oldsz` to `newsz`, allocating and
/// zeroing new frames. Returns the new size, or 0 (with any partial
/// growth unwound) on failure.
pub fn allocuvm(pgdir: *mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= KERNBASE {
        return 0;
    }
    if newsz < oldsz {
        return oldsz;
    }

    let mut a = PGROUNDUP!(oldsz);
    while a < newsz {
        let mem = kalloc();
        if mem.is_null() {
            deallocuvm(pgdir, newsz, oldsz);
            return 0;
        }
        memset(mem, 0, PGSIZE);
        if mappages(pgdir, a, PGSIZE, v2p(mem as usize), PTE_W | PTE_U) < 0 {
            kfree(mem);
            deallocuvm(pgdir, newsz, oldsz);
            return 0;
        }
        a += PGSIZE;
    }
    newsz
}

/// Shrink a user address space from `oldsz` to `newsz`, freeing the
/// frames that fall out of range.
pub fn deallocuvm(pgdir: *mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut a = PGROUNDUP!(newsz);
    while a < oldsz {
        match walkpgdir(pgdir, a, false) {
            None => {
                // No page table for this whole directory entry range;
                // skip to the next one.
                a = PGADDR_DIR_ADVANCE(a);
                continue;
            }
            Some(pte) => unsafe {
                if *pte & PTE_P != 0 {
                    let pa = PTE_ADDR!(*pte) as usize;
                    if pa == 0 {
                        panic!("deallocuvm");
                    }
                    kfree(p2v(pa) as *mut u8);
                    *pte = 0;
                }
            },
        }
        a += PGSIZE;
    }
    newsz
}

/// Round `a` up to the first address covered by the next page-directory
/// entry, used by `deallocuvm` to skip unmapped directory ranges quickly.
fn PGADDR_DIR_ADVANCE(a: usize) -> usize {
    PGADDR!(PDX!(a) + 1, 0, 0)
}

/// Free a page directory and all the user mappings and page-table pages
/// it refers to.
pub fn freevm(pgdir: *mut PageTable) {
    if pgdir.is_null() {
        panic!("freevm: no pgdir");
    }
    deallocuvm(pgdir, KERNBASE, 0);
    unsafe {
        for i in 0..NPDENTRIES {
            let pde = (*pgdir)[i];
            if pde & PTE_P != 0 {
                let v = p2v(PTE_ADDR!(pde) as usize) as *mut u8;
                kfree(v);
            }
        }
    }
    kfree(pgdir as *mut u8);
}

/// Clear `PTE_U` on the mapping for `va`, used to carve a guard page just
/// below the user stack.
pub fn clearpteu(pgdir: *mut PageTable, va: usize) {
    match walkpgdir(pgdir, va, false) {
        None => panic!("clearpteu"),
        Some(pte) => unsafe { *pte &= !PTE_U },
    }
}

/// Duplicate a user address space (`fork`): a fresh page directory with
/// every page physically copied. Returns null (after `freevm`ing the
/// partial copy) on failure.
pub fn copyuvm(pgdir: *mut PageTable, sz: usize, data: usize) -> *mut PageTable {
    let d = setupkvm(data);
    if d.is_null() {
        return core::ptr::null_mut();
    }

    let mut i = 0;
    while i < sz {
        let pte = match walkpgdir(pgdir, i, false) {
            Some(p) => p,
            None => panic!("copyuvm: pte should exist"),
        };
        unsafe {
            if *pte & PTE_P == 0 {
                panic!("copyuvm: page not present");
            }
            let pa = PTE_ADDR!(*pte) as usize;
            let flags = PTE_FLAGS!(*pte);
            let mem = kalloc();
            if mem.is_null() {
                freevm(d);
                return core::ptr::null_mut();
            }
            memmove(mem, p2v(pa) as *const u8, PGSIZE);
            if mappages(d, i, PGSIZE, v2p(mem as usize), flags) < 0 {
                kfree(mem);
                freevm(d);
                return core::ptr::null_mut();
            }
        }
        i += PGSIZE;
    }
    d
}

/// Translate a user virtual address to its kernel-virtual alias, if it is
/// present and user-accessible.
pub fn uva2ka(pgdir: *mut PageTable, uva: usize) -> *mut u8 {
    match walkpgdir(pgdir, uva, false) {
        None => core::ptr::null_mut(),
        Some(pte) => unsafe {
            if *pte & PTE_P == 0 || *pte & PTE_U == 0 {
                core::ptr::null_mut()
            } else {
                p2v(PTE_ADDR!(*pte) as usize) as *mut u8
            }
        },
    }
}

/// Copy `len` bytes from `src` into the (possibly non-current) user
/// address space `pgdir`, starting at `va`. Handles a partial first page.
pub fn copyout(pgdir: *mut PageTable, va: usize, src: *const u8, len: usize) -> i32 {
    let mut buf = src;
    let mut remaining = len;
    let mut dst_va = va;

    while remaining > 0 {
        let va0 = PGROUNDDOWN!(dst_va);
        let pa0 = uva2ka(pgdir, va0);
        if pa0.is_null() {
            return -1;
        }
        let mut n = PGSIZE - (dst_va - va0);
        if n > remaining {
            n = remaining;
        }
        unsafe {
            memmove(pa0.add(dst_va - va0), buf, n);
        }
        remaining -= n;
        buf = unsafe { buf.add(n) };
        dst_va = va0 + PGSIZE;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{NPTENTRIES, PTXSHIFT};

    #[test]
    fn pgaddr_dir_advance_jumps_to_the_start_of_the_next_pde_range() {
        // Anywhere inside PDE 5's range advances to the first address of
        // PDE 6 - the whole-directory-entry skip `deallocuvm` relies on
        // when no page table at all exists for that range.
        let one_pde_span = NPTENTRIES * PGSIZE;
        let mid_of_pde5 = 5 * one_pde_span + 0x1234;
        assert_eq!(PGADDR_DIR_ADVANCE(mid_of_pde5), 6 * one_pde_span);

        // Already at the very start of a PDE's range: still advances a
        // full entry, never stalls.
        let start_of_pde5 = 5 * one_pde_span;
        assert_eq!(PGADDR_DIR_ADVANCE(start_of_pde5), 6 * one_pde_span);
    }

    #[test]
    fn pgaddr_dir_advance_is_consistent_with_pdx() {
        let a = 3 * NPTENTRIES * PGSIZE + 17 * PGSIZE + 0x42;
        let advanced = PGADDR_DIR_ADVANCE(a);
        assert_eq!(PDX!(advanced as u32), PDX!(a as u32) + 1);
        assert_eq!(advanced % (1usize << PTXSHIFT), 0);
    }
}
