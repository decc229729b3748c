//! Guest physical memory for the simulated machine.
//!
//! [`GuestMemoryManager`] owns a single `mmap`-backed region starting at
//! guest-physical address 0 and offers bounds-checked byte and `u64`
//! access, full dumps for the save slot, and a [`PageTableBuilder`] that
//! writes x86-64 4-level tables into the region.
//!
//! # Guest Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Unused                    │
//! 0x0001_0000  ├───────────────────────────┤  ← PAGE_TABLE_START
//!              │  Page-table pool           │  (bump allocated)
//! 0x0010_0000  ├───────────────────────────┤  ← KERNEL_TEXT_PHYS
//!              │  Kernel text               │
//! 0x0014_0000  ├───────────────────────────┤  ← KERNEL_DATA_PHYS
//!              │  Kernel data               │
//! 0x0020_0000  ├───────────────────────────┤  ← USER_PHYS_START
//!              │  One code page per process │
//!              │  ...                       │
//!              └───────────────────────────┘
//! ```

use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};
use vmprobe_protocol::paging::{M_PTE_PADDR, PTE_PAGE_SIZE, PTE_PRESENT, PTE_USER, PTE_WRITABLE};
use vmprobe_protocol::paging::split_vaddr;
use vmprobe_protocol::PAGE_SIZE;

// ═══════════════════════════════════════════════════════════════════════
//  Memory layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Start of the page-table pool.
pub const PAGE_TABLE_START: u64 = 0x0001_0000;

/// End (exclusive) of the page-table pool.
pub const PAGE_TABLE_END: u64 = 0x0010_0000;

/// Physical address of the kernel text.
pub const KERNEL_TEXT_PHYS: u64 = 0x0010_0000;

/// Physical address of the kernel data page.
pub const KERNEL_DATA_PHYS: u64 = 0x0014_0000;

/// First physical page handed out to user processes.
pub const USER_PHYS_START: u64 = 0x0020_0000;

/// Smallest guest RAM the layout fits in.
pub const MIN_MEMORY_SIZE: usize = 4 * 1024 * 1024;

const SIZE_2M: u64 = 1 << 21;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors that can occur during guest memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The `vm-memory` crate failed to create the guest memory region.
    #[error("failed to create guest memory region of {size} bytes")]
    Create {
        /// Requested allocation size.
        size: usize,
    },

    /// An access falls outside guest memory.
    #[error("access {address:#x}+{len:#x} outside guest memory")]
    OutOfRange {
        /// Start of the access.
        address: u64,
        /// Length of the access.
        len: usize,
    },

    /// Snapshot data length does not match the guest memory size.
    #[error("snapshot size mismatch: expected {expected} bytes, got {actual}")]
    SnapshotSizeMismatch {
        /// Expected byte count (the guest memory size).
        expected: usize,
        /// Actual byte count of the provided data.
        actual: usize,
    },

    /// The page-table pool is exhausted.
    #[error("page-table pool exhausted")]
    TablePoolExhausted,

    /// A mapping request was not aligned to its page size.
    #[error("unaligned mapping {vaddr:#x} -> {paddr:#x}")]
    Unaligned {
        /// Virtual address requested.
        vaddr: u64,
        /// Physical address requested.
        paddr: u64,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestMemoryManager
// ═══════════════════════════════════════════════════════════════════════

/// Owns the guest RAM of one simulated machine.
///
/// The `mmap`-backed memory uses interior mutability, so writers take
/// `&self` like the `vm-memory` API does. Callers serialise access
/// through the machine lock.
pub struct GuestMemoryManager {
    memory: GuestMemoryMmap,
    size: usize,
}

impl GuestMemoryManager {
    /// Create a zeroed region of `size` bytes at guest-physical 0.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Create`] if the `mmap` allocation fails.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let regions = [(GuestAddress(0), size)];
        let memory = GuestMemoryMmap::<()>::from_ranges(&regions)
            .map_err(|_| MemoryError::Create { size })?;

        info!(
            "Guest memory created: {} MB ({} bytes)",
            size / (1024 * 1024),
            size,
        );

        Ok(Self { memory, size })
    }

    /// Total size of guest memory in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        let end = address.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size as u64 => Ok(()),
            _ => Err(MemoryError::OutOfRange { address, len }),
        }
    }

    /// Copy `buf.len()` bytes from `address`.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(address, buf.len())?;
        self.memory
            .read_slice(buf, GuestAddress(address))
            .map_err(|_| MemoryError::OutOfRange {
                address,
                len: buf.len(),
            })
    }

    /// Copy `data` to `address`.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check(address, data.len())?;
        self.memory
            .write_slice(data, GuestAddress(address))
            .map_err(|_| MemoryError::OutOfRange {
                address,
                len: data.len(),
            })
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        self.check(address, 8)?;
        self.memory
            .read_obj::<u64>(GuestAddress(address))
            .map_err(|_| MemoryError::OutOfRange { address, len: 8 })
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&self, address: u64, value: u64) -> Result<(), MemoryError> {
        self.check(address, 8)?;
        self.memory
            .write_obj(value, GuestAddress(address))
            .map_err(|_| MemoryError::OutOfRange { address, len: 8 })
    }

    /// Copy all of guest memory.
    pub fn dump(&self) -> Result<Vec<u8>, MemoryError> {
        let mut data = vec![0u8; self.size];
        self.read(0, &mut data)?;
        Ok(data)
    }

    /// Overwrite all of guest memory with `data`.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::SnapshotSizeMismatch`] if `data` is not exactly
    ///   [`size()`](Self::size) bytes.
    pub fn restore(&self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.size {
            return Err(MemoryError::SnapshotSizeMismatch {
                expected: self.size,
                actual: data.len(),
            });
        }
        self.write(0, data)?;
        info!("Guest memory restored: {} bytes", self.size);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Page-table construction
// ═══════════════════════════════════════════════════════════════════════

/// Writes 4-level page tables into guest memory.
///
/// Table pages come from a bump allocator over
/// `[PAGE_TABLE_START, PAGE_TABLE_END)`. Tables can be shared between
/// roots with [`share_pml4_entry`](Self::share_pml4_entry), which is how
/// every process gets the same kernel half.
pub struct PageTableBuilder<'a> {
    memory: &'a GuestMemoryManager,
    next: u64,
}

impl<'a> PageTableBuilder<'a> {
    /// Start allocating at [`PAGE_TABLE_START`].
    pub fn new(memory: &'a GuestMemoryManager) -> Self {
        Self {
            memory,
            next: PAGE_TABLE_START,
        }
    }

    /// Allocate a zeroed table page.
    pub fn alloc_table(&mut self) -> Result<u64, MemoryError> {
        if self.next + PAGE_SIZE > PAGE_TABLE_END {
            return Err(MemoryError::TablePoolExhausted);
        }
        let table = self.next;
        self.next += PAGE_SIZE;
        self.memory.write(table, &[0u8; PAGE_SIZE as usize])?;
        Ok(table)
    }

    /// Physical address of the next table page that would be handed out.
    pub fn high_water(&self) -> u64 {
        self.next
    }

    /// Follow (or create) the table referenced by entry `index` of `table`.
    fn descend(&mut self, table: u64, index: u64, user: bool) -> Result<u64, MemoryError> {
        let slot = table + index * 8;
        let entry = self.memory.read_u64(slot)?;
        if entry & PTE_PRESENT != 0 {
            return Ok(entry & M_PTE_PADDR);
        }
        let next = self.alloc_table()?;
        let flags = PTE_PRESENT | PTE_WRITABLE | if user { PTE_USER } else { 0 };
        self.memory.write_u64(slot, next | flags)?;
        Ok(next)
    }

    /// Map one 4 KiB page.
    pub fn map_4k(
        &mut self,
        pml4: u64,
        vaddr: u64,
        paddr: u64,
        writable: bool,
        user: bool,
    ) -> Result<(), MemoryError> {
        if vaddr % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned { vaddr, paddr });
        }
        let [l4, l3, l2, l1] = split_vaddr(vaddr);
        let pdpt = self.descend(pml4, l4, user)?;
        let pd = self.descend(pdpt, l3, user)?;
        let pt = self.descend(pd, l2, user)?;
        let mut flags = PTE_PRESENT;
        if writable {
            flags |= PTE_WRITABLE;
        }
        if user {
            flags |= PTE_USER;
        }
        self.memory.write_u64(pt + l1 * 8, paddr | flags)
    }

    /// Map one 2 MiB page.
    pub fn map_2m(&mut self, pml4: u64, vaddr: u64, paddr: u64) -> Result<(), MemoryError> {
        if vaddr % SIZE_2M != 0 || paddr % SIZE_2M != 0 {
            return Err(MemoryError::Unaligned { vaddr, paddr });
        }
        let [l4, l3, l2, _] = split_vaddr(vaddr);
        let pdpt = self.descend(pml4, l4, false)?;
        let pd = self.descend(pdpt, l3, false)?;
        self.memory
            .write_u64(pd + l2 * 8, paddr | PTE_PRESENT | PTE_WRITABLE | PTE_PAGE_SIZE)
    }

    /// Copy PML4 entry `index` of `from` into `to`, sharing the subtree.
    pub fn share_pml4_entry(&mut self, from: u64, to: u64, index: u64) -> Result<(), MemoryError> {
        let entry = self.memory.read_u64(from + index * 8)?;
        self.memory.write_u64(to + index * 8, entry)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use vmprobe_protocol::paging::translate;

    const MB: usize = 1024 * 1024;

    #[test]
    fn layout_constants_are_ordered() {
        assert!(PAGE_TABLE_START < PAGE_TABLE_END);
        assert!(PAGE_TABLE_END <= KERNEL_TEXT_PHYS);
        assert!(KERNEL_TEXT_PHYS < KERNEL_DATA_PHYS);
        assert!(KERNEL_DATA_PHYS < USER_PHYS_START);
        assert!(USER_PHYS_START < MIN_MEMORY_SIZE as u64);
    }

    #[test]
    fn create_guest_memory() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        assert_eq!(mem.size(), 4 * MB);
    }

    #[test]
    fn byte_round_trip() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        mem.write(0x3000, &data).unwrap();
        let mut back = vec![0u8; 4096];
        mem.read(0x3000, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn access_past_end_is_rejected() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let end = (4 * MB) as u64;
        let mut buf = [0u8; 16];
        assert!(matches!(
            mem.read(end - 8, &mut buf),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(mem.write_u64(end, 1).is_err());
        assert!(mem.read(u64::MAX - 2, &mut buf).is_err());
        mem.read(end - 16, &mut buf).unwrap();
    }

    #[test]
    fn dump_and_restore() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        mem.write_u64(0x1000, 0xdead_beef).unwrap();
        let snap = mem.dump().unwrap();
        mem.write_u64(0x1000, 0).unwrap();
        mem.restore(&snap).unwrap();
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0xdead_beef);
    }

    #[test]
    fn restore_rejects_wrong_size() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let err = mem.restore(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::SnapshotSizeMismatch {
                expected,
                actual: 10,
            } if expected == 4 * MB
        ));
    }

    #[test]
    fn built_tables_translate() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let mut pt = PageTableBuilder::new(&mem);
        let root = pt.alloc_table().unwrap();
        pt.map_4k(root, 0x40_0000, 0x20_0000, false, true).unwrap();
        pt.map_2m(root, 0xffff_8880_0000_0000, 0).unwrap();

        let tr = translate(root, 0x40_0123, |a| mem.read_u64(a))
            .unwrap()
            .unwrap();
        assert_eq!(tr.gpa, 0x20_0123);
        assert!(!tr.writable);

        let tr = translate(root, 0xffff_8880_0012_3456, |a| mem.read_u64(a))
            .unwrap()
            .unwrap();
        assert_eq!(tr.gpa, 0x12_3456);
        assert_eq!(tr.page_size, SIZE_2M);

        assert!(translate(root, 0x50_0000, |a| mem.read_u64(a))
            .unwrap()
            .is_none());
    }

    #[test]
    fn shared_pml4_entry_aliases_subtree() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let mut pt = PageTableBuilder::new(&mem);
        let a = pt.alloc_table().unwrap();
        let b = pt.alloc_table().unwrap();
        let kva = 0xffff_ffff_8100_0000;
        pt.map_4k(a, kva, KERNEL_TEXT_PHYS, false, false).unwrap();
        pt.share_pml4_entry(a, b, 511).unwrap();

        let tr = translate(b, kva, |x| mem.read_u64(x)).unwrap().unwrap();
        assert_eq!(tr.gpa, KERNEL_TEXT_PHYS);
    }

    #[test]
    fn unaligned_mapping_is_rejected() {
        let mem = GuestMemoryManager::new(4 * MB).unwrap();
        let mut pt = PageTableBuilder::new(&mem);
        let root = pt.alloc_table().unwrap();
        assert!(matches!(
            pt.map_4k(root, 0x1001, 0x2000, true, false),
            Err(MemoryError::Unaligned { .. })
        ));
        assert!(pt.map_2m(root, 0x20_0000, 0x1000).is_err());
    }
}
