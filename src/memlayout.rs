//! Physical and virtual memory layout for the 32-bit protected-mode model.
//!
//! Kernel address space, identical in every process's page directory:
//!   KERNBASE .. KERNBASE+EXTMEM  -> phys 0..EXTMEM           (I/O hole, writable)
//!   KERNLINK .. data             -> phys V2P(KERNLINK)..     (kernel text, read-only)
//!   data     .. KERNBASE+PHYSTOP -> phys data..PHYSTOP       (kernel data + free RAM)
//!   DEVSPACE ..                  -> identity-mapped devices  (writable)

use crate::mmu::PTE_W;

/// First address after the I/O hole.
pub const EXTMEM: usize = 0x10_0000;
/// Top physical memory the allocator may use.
pub const PHYSTOP: usize = 0xE00_0000;
/// Where devices are mapped (identity, just under the top of the address
/// space so the size computed below wraps to cover everything above it).
pub const DEVSPACE: usize = 0xFE00_0000;

/// First kernel virtual address.
pub const KERNBASE: usize = 0x8000_0000;
/// Address where the kernel is linked.
pub const KERNLINK: usize = KERNBASE + EXTMEM;

#[inline(always)]
pub const fn v2p(a: usize) -> usize {
    a - KERNBASE
}

#[inline(always)]
pub const fn p2v(a: usize) -> usize {
    a + KERNBASE
}

/// One entry of the static kernel mapping table consulted by
/// [`crate::vm::setupkvm`]. `phys_end.wrapping_sub(phys_start)` is the
/// region's size; the last entry deliberately has `phys_end < phys_start`
/// so the wrapping subtraction covers every remaining device address up
/// to the top of the 32-bit space, matching the original kmap table.
pub struct Kmap {
    pub virt: usize,
    pub phys_start: usize,
    pub phys_end: usize,
    pub perm: u32,
}

impl Kmap {
    pub fn size(&self) -> usize {
        self.phys_end.wrapping_sub(self.phys_start)
    }
}

/// The kernel's fixed high-half mapping, built once and installed in every
/// process's page directory. `data` is the first writable kernel virtual
/// address (after read-only text+rodata); since this crate has no linker
/// script of its own, it is supplied by the caller of
/// [`crate::vm::setupkvm`] rather than named here as an `extern` symbol.
pub fn kmap(data: usize) -> [Kmap; 4] {
    [
        Kmap { virt: KERNBASE, phys_start: 0, phys_end: EXTMEM, perm: PTE_W },
        Kmap { virt: KERNLINK, phys_start: v2p(KERNLINK), phys_end: v2p(data), perm: 0 },
        Kmap { virt: data, phys_start: v2p(data), phys_end: PHYSTOP, perm: PTE_W },
        Kmap { virt: DEVSPACE, phys_start: DEVSPACE, phys_end: 0, perm: PTE_W },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2p_and_p2v_round_trip() {
        let phys = 0x0012_3000;
        assert_eq!(v2p(p2v(phys)), phys);

        let virt = KERNBASE + 0x1000;
        assert_eq!(p2v(v2p(virt)), virt);
    }

    #[test]
    fn kmap_regions_cover_io_hole_text_and_data_in_order() {
        let data = KERNLINK + 0x1000;
        let regions = kmap(data);

        assert_eq!(regions[0].virt, KERNBASE);
        assert_eq!(regions[0].size(), EXTMEM);

        assert_eq!(regions[1].virt, KERNLINK);
        assert_eq!(regions[1].size(), v2p(data) - v2p(KERNLINK));

        assert_eq!(regions[2].virt, data);
        assert_eq!(regions[2].size(), PHYSTOP - v2p(data));

        // Regions are laid out low-to-high in both virtual and physical
        // address order, with no gaps between the first three.
        assert!(regions[0].virt < regions[1].virt);
        assert!(regions[1].virt < regions[2].virt);
        assert_eq!(regions[0].phys_end, regions[1].phys_start);
        assert_eq!(regions[1].phys_end, regions[2].phys_start);
    }

    #[test]
    fn device_region_wraps_to_cover_the_rest_of_the_address_space() {
        let regions = kmap(KERNLINK + 0x1000);
        let dev = &regions[3];
        assert_eq!(dev.virt, DEVSPACE);
        assert_eq!(dev.phys_start, DEVSPACE);
        // phys_end (0) < phys_start (DEVSPACE): size wraps around instead
        // of underflowing, covering everything above DEVSPACE.
        assert_eq!(dev.size(), 0usize.wrapping_sub(DEVSPACE));
        assert!(dev.size() > DEVSPACE);
    }
}
