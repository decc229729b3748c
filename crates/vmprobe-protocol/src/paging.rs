//! x86-64 4-level page-table walk.
//!
//! Shared by backends (as their MMU) and by the debug core (for
//! virtual-to-physical translation through guest memory). The walk is
//! parameterised over a physical `u64` reader so it works against any
//! source of guest RAM.

use crate::{page_offset, PAGE_MASK};

/// Entry is present.
pub const PTE_PRESENT: u64 = 1 << 0;
/// Entry is writable.
pub const PTE_WRITABLE: u64 = 1 << 1;
/// Entry is user-accessible.
pub const PTE_USER: u64 = 1 << 2;
/// PDPTE/PDE maps a large page instead of pointing at a table.
pub const PTE_PAGE_SIZE: u64 = 1 << 7;
/// No-execute.
pub const PTE_NX: u64 = 1 << 63;
/// Physical-address bits of an entry.
pub const M_PTE_PADDR: u64 = 0x000f_ffff_ffff_f000;

/// `CR0.PG`: paging enabled.
pub const CR0_PG: u64 = 1 << 31;

const SIZE_1G: u64 = 1 << 30;
const SIZE_2M: u64 = 1 << 21;

/// Page-table indices of a virtual address, PML4 first.
pub fn split_vaddr(vaddr: u64) -> [u64; 4] {
    [
        (vaddr >> 39) & 0x1ff,
        (vaddr >> 30) & 0x1ff,
        (vaddr >> 21) & 0x1ff,
        (vaddr >> 12) & 0x1ff,
    ]
}

/// Result of a successful walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Guest-physical address of the byte at the virtual address.
    pub gpa: u64,
    /// Size of the mapping page (4 KiB, 2 MiB or 1 GiB).
    pub page_size: u64,
    /// Leaf entry flags.
    pub writable: bool,
}

impl Translation {
    /// Guest-physical base of the 4 KiB frame containing `gpa`.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.gpa & PAGE_MASK
    }
}

/// Walk the tables rooted at `cr3` for `vaddr`.
///
/// `read` fetches one 8-byte entry from guest-physical memory. Returns
/// `Ok(None)` when a level is not present.
pub fn translate<E>(
    cr3: u64,
    vaddr: u64,
    mut read: impl FnMut(u64) -> Result<u64, E>,
) -> Result<Option<Translation>, E> {
    let [l4, l3, l2, l1] = split_vaddr(vaddr);
    let mut writable = true;

    let pml4e = read((cr3 & M_PTE_PADDR) + l4 * 8)?;
    if pml4e & PTE_PRESENT == 0 {
        return Ok(None);
    }
    writable &= pml4e & PTE_WRITABLE != 0;

    let pdpte = read((pml4e & M_PTE_PADDR) + l3 * 8)?;
    if pdpte & PTE_PRESENT == 0 {
        return Ok(None);
    }
    writable &= pdpte & PTE_WRITABLE != 0;
    if pdpte & PTE_PAGE_SIZE != 0 {
        let base = pdpte & M_PTE_PADDR & !(SIZE_1G - 1);
        return Ok(Some(Translation {
            gpa: base + (vaddr & (SIZE_1G - 1)),
            page_size: SIZE_1G,
            writable,
        }));
    }

    let pde = read((pdpte & M_PTE_PADDR) + l2 * 8)?;
    if pde & PTE_PRESENT == 0 {
        return Ok(None);
    }
    writable &= pde & PTE_WRITABLE != 0;
    if pde & PTE_PAGE_SIZE != 0 {
        let base = pde & M_PTE_PADDR & !(SIZE_2M - 1);
        return Ok(Some(Translation {
            gpa: base + (vaddr & (SIZE_2M - 1)),
            page_size: SIZE_2M,
            writable,
        }));
    }

    let pte = read((pde & M_PTE_PADDR) + l1 * 8)?;
    if pte & PTE_PRESENT == 0 {
        return Ok(None);
    }
    writable &= pte & PTE_WRITABLE != 0;
    Ok(Some(Translation {
        gpa: (pte & M_PTE_PADDR) + page_offset(vaddr),
        page_size: crate::PAGE_SIZE,
        writable,
    }))
}
