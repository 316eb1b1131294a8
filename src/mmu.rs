//! x86 memory-management-unit definitions: segment descriptors, gate
//! descriptors, the task state segment, page-table entry shape, and the
//! address-splitting macros used throughout [`crate::vm`].

/// Eflags: interrupt enable.
pub const FL_IF: u32 = 0x0000_0200;

/// CR0: protection enable.
pub const CR0_PE: u32 = 0x0000_0001;
/// CR0: write protect.
pub const CR0_WP: u32 = 0x0001_0000;
/// CR0: paging.
pub const CR0_PG: u32 = 0x8000_0000;

/// CR4: page size extension.
pub const CR4_PSE: u32 = 0x0000_0010;

// Segment selectors. Index into cpu.gdt, scaled by 3 to form a selector.
pub const SEG_KCODE: u16 = 1;
pub const SEG_KDATA: u16 = 2;
pub const SEG_UCODE: u16 = 3;
pub const SEG_UDATA: u16 = 4;
pub const SEG_TSS: u16 = 5;
pub const NSEGS: usize = 6;

pub const DPL_USER: u8 = 0x3;

// Application segment type bits.
pub const STA_X: u8 = 0x8; // executable
pub const STA_W: u8 = 0x2; // writeable (non-executable segments)
pub const STA_R: u8 = 0x2; // readable (executable segments)

// System segment type bits.
pub const STS_T32A: u8 = 0x9; // available 32-bit TSS
pub const STS_IG32: u8 = 0xE; // 32-bit interrupt gate
pub const STS_TG32: u8 = 0xF; // 32-bit trap gate

/// Segment descriptor, laid out exactly as the CPU expects it in the GDT.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SegDesc(pub u64);

impl SegDesc {
    /// A blank (not-present) descriptor, used to pad slot 0 of every GDT.
    pub const NULL: SegDesc = SegDesc(0);

    /// Build a normal (page-granular) segment descriptor. `limit` is the
    /// desired byte limit (e.g. `0xffffffff` for a flat 4 GiB segment);
    /// the 4K-granularity bit below scales the stored 20-bit field back up.
    pub const fn seg(seg_type: u8, base: u32, limit: u32, dpl: u8) -> SegDesc {
        let lim_15_0 = ((limit >> 12) & 0xffff) as u64;
        let base_15_0 = (base & 0xffff) as u64;
        let base_23_16 = ((base >> 16) & 0xff) as u64;
        let lim_19_16 = ((limit >> 28) & 0xf) as u64;
        let base_31_24 = ((base >> 24) & 0xff) as u64;

        let low = lim_15_0 | (base_15_0 << 16) | (base_23_16 << 32)
            | ((seg_type as u64 & 0xf) << 40)
            | (1u64 << 44) // s = 1 (application)
            | ((dpl as u64 & 0x3) << 45)
            | (1u64 << 47) // p = 1 (present)
            | (lim_19_16 << 48)
            | (1u64 << 54) // db = 1 (32-bit segment)
            | (1u64 << 55) // g = 1 (4K granularity)
            | (base_31_24 << 56);
        SegDesc(low)
    }
}

/// Gate descriptor for an entry in the IDT.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct GateDesc(pub u64);

impl GateDesc {
    pub const NULL: GateDesc = GateDesc(0);

    /// Build an interrupt/trap gate.
    ///
    /// `is_trap`: trap gates leave IF alone; interrupt gates clear it.
    /// `sel`: code segment selector for the handler.
    /// `off`: offset of the handler within that segment.
    /// `dpl`: privilege level required to invoke this gate with `int`.
    pub const fn set(is_trap: bool, sel: u16, off: u32, dpl: u8) -> GateDesc {
        let off_15_0 = (off & 0xffff) as u64;
        let off_31_16 = ((off >> 16) & 0xffff) as u64;
        let ty = if is_trap { STS_TG32 } else { STS_IG32 } as u64;
        let bits = off_15_0
            | ((sel as u64) << 16)
            | (ty << 40)
            | ((dpl as u64 & 0x3) << 45)
            | (1u64 << 47) // present
            | (off_31_16 << 48);
        GateDesc(bits)
    }
}

/// Task state segment, used by the CPU to find the kernel stack on a
/// ring transition and to hold saved register state across `swtch`-free
/// hardware task switches (unused here beyond `esp0`/`ss0`/`iomb`).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct TaskState {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u16,
    padding1: u16,
    pub esp1: u32,
    pub ss1: u16,
    padding2: u16,
    pub esp2: u32,
    pub ss2: u16,
    padding3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    padding4: u16,
    pub cs: u16,
    padding5: u16,
    pub ss: u16,
    padding6: u16,
    pub ds: u16,
    padding7: u16,
    pub fs: u16,
    padding8: u16,
    pub gs: u16,
    padding9: u16,
    pub ldt: u16,
    padding10: u16,
    pub t: u16,
    /// I/O map base address. `0xffff` denies all user port I/O.
    pub iomb: u16,
}

impl TaskState {
    pub const ZEROED: TaskState = TaskState {
        link: 0,
        esp0: 0,
        ss0: 0,
        padding1: 0,
        esp1: 0,
        ss1: 0,
        padding2: 0,
        esp2: 0,
        ss2: 0,
        padding3: 0,
        cr3: 0,
        eip: 0,
        eflags: 0,
        eax: 0,
        ecx: 0,
        edx: 0,
        ebx: 0,
        esp: 0,
        ebp: 0,
        esi: 0,
        edi: 0,
        es: 0,
        padding4: 0,
        cs: 0,
        padding5: 0,
        ss: 0,
        padding6: 0,
        ds: 0,
        padding7: 0,
        fs: 0,
        padding8: 0,
        gs: 0,
        padding9: 0,
        ldt: 0,
        padding10: 0,
        t: 0,
        iomb: 0,
    };
}

// Virtual address split: 10 bits directory | 10 bits table | 12 bits offset.
pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;
pub const PGSIZE: usize = 4096;

pub const PTXSHIFT: u32 = 12;
pub const PDXSHIFT: u32 = 22;

#[macro_export]
macro_rules! PGROUNDUP {
    ($sz:expr) => {
        ((($sz) + $crate::mmu::PGSIZE - 1) & !($crate::mmu::PGSIZE - 1))
    };
}

#[macro_export]
macro_rules! PGROUNDDOWN {
    ($a:expr) => {
        (($a) & !($crate::mmu::PGSIZE - 1))
    };
}

#[macro_export]
macro_rules! PDX {
    ($va:expr) => {
        ((($va) as u32 >> $crate::mmu::PDXSHIFT) & 0x3FF) as usize
    };
}

#[macro_export]
macro_rules! PTX {
    ($va:expr) => {
        ((($va) as u32 >> $crate::mmu::PTXSHIFT) & 0x3FF) as usize
    };
}

#[macro_export]
macro_rules! PGADDR {
    ($d:expr, $t:expr, $o:expr) => {
        ((($d) << $crate::mmu::PDXSHIFT) | (($t) << $crate::mmu::PTXSHIFT) | ($o)) as usize
    };
}

bitflags::bitflags! {
    /// Page table / directory entry flags (a PTE is a 20-bit
    /// frame number ∥ 12-bit flags). Kept as a flags set rather than a
    /// wrapper around the whole entry: a PTE mixes these bits with a raw
    /// physical frame number in the same word (see [`PTE_ADDR`]), so
    /// every call site still builds and reads entries as plain `u32`s.
    pub struct PteFlags: u32 {
        const P = 0x001; // present
        const W = 0x002; // writeable
        const U = 0x004; // user-accessible
        const PS = 0x080; // page size (4MiB)
    }
}

pub const PTE_P: u32 = PteFlags::P.bits();
pub const PTE_W: u32 = PteFlags::W.bits();
pub const PTE_U: u32 = PteFlags::U.bits();
pub const PTE_PS: u32 = PteFlags::PS.bits();

#[macro_export]
macro_rules! PTE_ADDR {
    ($pte:expr) => {
        (($pte) as u32 & !0xFFFu32)
    };
}

#[macro_export]
macro_rules! PTE_FLAGS {
    ($pte:expr) => {
        (($pte) as u32 & 0xFFFu32)
    };
}

/// A page-table/directory entry. The low 12 bits are flags, the high 20
/// address a 4 KiB-aligned physical frame.
pub type PteT = u32;

/// Trap frame: the register snapshot built on the kernel stack by the
/// hardware (on any ring transition) and by the trap entry stub (`pusha`
/// plus the saved segment registers), handed to `trap()`.
///
/// Field order is load-bearing: it mirrors exactly what the CPU and the
/// (externally supplied) trap stub push, low address first.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct TrapFrame {
    // pushed by `pusha`
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    oesp: u32, // useless & ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,
    pub trapno: u32,

    // pushed by the CPU itself
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    // pushed by the CPU only when crossing privilege rings
    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pgroundup_rounds_to_the_next_page_boundary() {
        assert_eq!(PGROUNDUP!(0), 0);
        assert_eq!(PGROUNDUP!(1), PGSIZE);
        assert_eq!(PGROUNDUP!(PGSIZE), PGSIZE);
        assert_eq!(PGROUNDUP!(PGSIZE + 1), 2 * PGSIZE);
    }

    #[test]
    fn pgrounddown_truncates_to_the_page_boundary() {
        assert_eq!(PGROUNDDOWN!(0), 0);
        assert_eq!(PGROUNDDOWN!(PGSIZE - 1), 0);
        assert_eq!(PGROUNDDOWN!(PGSIZE), PGSIZE);
        assert_eq!(PGROUNDDOWN!(PGSIZE + 1), PGSIZE);
    }

    #[test]
    fn pdx_ptx_split_a_virtual_address_into_directory_and_table_index() {
        // va = dir 3, table 7, offset 0x123
        let va: u32 = (3u32 << PDXSHIFT) | (7u32 << PTXSHIFT) | 0x123;
        assert_eq!(PDX!(va), 3);
        assert_eq!(PTX!(va), 7);
    }

    #[test]
    fn pgaddr_is_the_inverse_of_pdx_ptx() {
        let va = PGADDR!(3usize, 7usize, 0x123usize);
        assert_eq!(PDX!(va as u32), 3);
        assert_eq!(PTX!(va as u32), 7);
        assert_eq!(va & 0xFFF, 0x123);
    }

    #[test]
    fn pte_addr_and_flags_split_a_raw_entry() {
        let pte: u32 = 0x0012_3000 | PTE_P | PTE_W;
        assert_eq!(PTE_ADDR!(pte), 0x0012_3000);
        assert_eq!(PTE_FLAGS!(pte), PTE_P | PTE_W);
    }

    #[test]
    fn pte_flags_constants_match_the_bitflags_definition() {
        assert_eq!(PTE_P, PteFlags::P.bits());
        assert_eq!(PTE_W, PteFlags::W.bits());
        assert_eq!(PTE_U, PteFlags::U.bits());
        assert_eq!(PTE_PS, PteFlags::PS.bits());
        // The four flags occupy disjoint bits within the 12-bit flags field.
        assert_eq!(PTE_P | PTE_W | PTE_U | PTE_PS, 0x087);
    }

    #[test]
    fn seg_desc_encodes_base_limit_and_dpl() {
        let d = SegDesc::seg(STA_X | STA_R, 0, 0xffff_ffff, DPL_USER);
        let bits = d.0;
        // Present (bit 47), 4K-granular (bit 55), 32-bit (bit 54).
        assert_ne!(bits & (1 << 47), 0);
        assert_ne!(bits & (1 << 55), 0);
        assert_ne!(bits & (1 << 54), 0);
        // DPL occupies bits 45-46.
        assert_eq!((bits >> 45) & 0x3, DPL_USER as u64);
        // Type occupies bits 40-43.
        assert_eq!((bits >> 40) & 0xf, (STA_X | STA_R) as u64);
    }

    #[test]
    fn gate_desc_distinguishes_interrupt_from_trap_gates() {
        let int_gate = GateDesc::set(false, 0x8, 0x1000, 0);
        let trap_gate = GateDesc::set(true, 0x8, 0x1000, 3);

        let int_type = (int_gate.0 >> 40) & 0xf;
        let trap_type = (trap_gate.0 >> 40) & 0xf;
        assert_eq!(int_type as u8, STS_IG32);
        assert_eq!(trap_type as u8, STS_TG32);

        // DPL 3 on the syscall trap gate, reachable from user mode.
        assert_eq!((trap_gate.0 >> 45) & 0x3, 3);
        // Present bit set on both.
        assert_ne!(int_gate.0 & (1 << 47), 0);
        assert_ne!(trap_gate.0 & (1 << 47), 0);
    }

    #[test]
    fn task_state_zeroed_denies_user_port_io_is_not_implicit() {
        // ZEROED is a plain zero value; switchuvm is responsible for
        // setting iomb = 0xFFFF before a process ever runs.
        assert_eq!(TaskState::ZEROED.iomb, 0);
    }

    #[test]
    fn trap_frame_field_order_is_load_bearing() {
        // The hardware/stub pushes low-to-high exactly in declaration
        // order; a `repr(C)` struct preserves that, but pad fields must
        // keep every u16 register natively aligned.
        assert_eq!(core::mem::size_of::<TrapFrame>() % 4, 0);
    }
}
