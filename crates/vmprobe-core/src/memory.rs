//! Guest memory access: physical, virtual and translation.
//!
//! Transfers run under the program lock so they see a stable set of
//! software-breakpoint patches: reads return the original bytes under
//! patched sites, and writes over a patched site update the saved
//! original while the `int3` stays in place.
//!
//! Virtual transfers are all-or-nothing with respect to translation:
//! every page of the range is translated before the first byte moves.

use log::trace;
use vmprobe_protocol::paging::{self, CR0_PG};
use vmprobe_protocol::{page_offset, BackendError, Register, INT3, PAGE_SIZE};

use crate::error::{DebugError, Result};
use crate::session::{Geometry, Session};

/// Address space a virtual access is translated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageRoot {
    /// Paging disabled: linear equals physical.
    Identity,
    /// 4-level tables rooted at this `CR3` value.
    Table(u64),
}

/// One page-bounded piece of a virtual transfer.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    gpa: u64,
    offset: usize,
    len: usize,
}

fn check_physical(geometry: Geometry, gpa: u64, len: usize) -> Result<()> {
    match gpa.checked_add(len as u64) {
        Some(end) if end <= geometry.memory_size => Ok(()),
        _ => Err(DebugError::OutOfRange { address: gpa, len }),
    }
}

impl Session {
    /// Copy guest-physical memory at `gpa` into `buf`.
    pub fn read_physical(&self, buf: &mut [u8], gpa: u64) -> Result<()> {
        let geometry = self.ready()?;
        if buf.is_empty() {
            return Ok(());
        }
        check_physical(geometry, gpa, buf.len())?;
        let _table = self.lock_table();
        self.read_physical_locked(buf, gpa)?;
        Ok(())
    }

    /// Copy `buf` into guest-physical memory at `gpa`.
    pub fn write_physical(&self, buf: &[u8], gpa: u64) -> Result<()> {
        let geometry = self.ready()?;
        if buf.is_empty() {
            return Ok(());
        }
        check_physical(geometry, gpa, buf.len())?;
        let _table = self.lock_table();
        self.write_physical_locked(buf, gpa)?;
        Ok(())
    }

    /// Read `buf.len()` bytes at `gva` in `vcpu`'s current address space.
    pub fn read_virtual(&self, vcpu: u32, buf: &mut [u8], gva: u64) -> Result<()> {
        self.check_vcpu(vcpu)?;
        if buf.is_empty() {
            return Ok(());
        }
        let _table = self.lock_table();
        let root = self.vcpu_root(vcpu)?;
        self.read_virtual_locked(root, buf, gva)
    }

    /// Write `buf` at `gva` in `vcpu`'s current address space.
    pub fn write_virtual(&self, vcpu: u32, buf: &[u8], gva: u64) -> Result<()> {
        self.check_vcpu(vcpu)?;
        if buf.is_empty() {
            return Ok(());
        }
        let _table = self.lock_table();
        let root = self.vcpu_root(vcpu)?;
        self.write_virtual_locked(root, buf, gva)
    }

    /// Read at `gva` in the address space rooted at `asid` (a `CR3` value).
    pub fn read_virtual_in(&self, asid: u64, buf: &mut [u8], gva: u64) -> Result<()> {
        self.ready()?;
        if buf.is_empty() {
            return Ok(());
        }
        let _table = self.lock_table();
        self.read_virtual_locked(PageRoot::Table(asid), buf, gva)
    }

    /// Write at `gva` in the address space rooted at `asid`.
    pub fn write_virtual_in(&self, asid: u64, buf: &[u8], gva: u64) -> Result<()> {
        self.ready()?;
        if buf.is_empty() {
            return Ok(());
        }
        let _table = self.lock_table();
        self.write_virtual_locked(PageRoot::Table(asid), buf, gva)
    }

    /// Guest-physical address `gva` maps to for `vcpu` right now.
    pub fn virtual_to_physical(&self, vcpu: u32, gva: u64) -> Result<u64> {
        self.check_vcpu(vcpu)?;
        let root = self.vcpu_root(vcpu)?;
        self.resolve(root, gva)
    }

    /// Guest-physical address `gva` maps to under page-table root `asid`.
    pub fn translate(&self, asid: u64, gva: u64) -> Result<u64> {
        self.ready()?;
        self.resolve(PageRoot::Table(asid), gva)
    }

    /// The address space `vcpu` currently runs in.
    pub(crate) fn vcpu_root(&self, vcpu: u32) -> Result<PageRoot> {
        let cr0 = self.backend.read_register(vcpu, Register::Cr0)?;
        if cr0 & CR0_PG == 0 {
            return Ok(PageRoot::Identity);
        }
        Ok(PageRoot::Table(self.backend.read_register(vcpu, Register::Cr3)?))
    }

    /// Translate one address.
    pub(crate) fn resolve(&self, root: PageRoot, gva: u64) -> Result<u64> {
        let cr3 = match root {
            PageRoot::Identity => return Ok(gva),
            PageRoot::Table(cr3) => cr3,
        };
        let walk = paging::translate(cr3, gva, |entry| {
            let mut raw = [0u8; 8];
            self.backend.read_physical(entry, &mut raw)?;
            Ok::<_, BackendError>(u64::from_le_bytes(raw))
        });
        match walk {
            Ok(Some(translation)) => {
                trace!("{:#x} -> {:#x} via {:#x}", gva, translation.gpa, cr3);
                Ok(translation.gpa)
            }
            Ok(None) | Err(BackendError::PhysicalRange { .. }) => {
                Err(DebugError::Unmapped { address: gva })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Translate every page of `[gva, gva + len)` up front.
    fn map_range(&self, root: PageRoot, gva: u64, len: usize) -> Result<Vec<Chunk>> {
        let geometry = self.ready()?;
        let mut chunks = Vec::with_capacity(len / PAGE_SIZE as usize + 2);
        let mut offset = 0;
        while offset < len {
            let va = gva.wrapping_add(offset as u64);
            let in_page = (PAGE_SIZE - page_offset(va)) as usize;
            let chunk_len = in_page.min(len - offset);
            let gpa = self.resolve(root, va)?;
            check_physical(geometry, gpa, chunk_len)?;
            chunks.push(Chunk {
                gpa,
                offset,
                len: chunk_len,
            });
            offset += chunk_len;
        }
        Ok(chunks)
    }

    fn read_virtual_locked(&self, root: PageRoot, buf: &mut [u8], gva: u64) -> Result<()> {
        let len = buf.len();
        for chunk in self.map_range(root, gva, len)? {
            let part = &mut buf[chunk.offset..chunk.offset + chunk.len];
            if let Err(source) = self.read_physical_locked(part, chunk.gpa) {
                return Err(partial(gva, chunk.offset, len, source));
            }
        }
        Ok(())
    }

    fn write_virtual_locked(&self, root: PageRoot, buf: &[u8], gva: u64) -> Result<()> {
        let len = buf.len();
        for chunk in self.map_range(root, gva, len)? {
            let part = &buf[chunk.offset..chunk.offset + chunk.len];
            if let Err(source) = self.write_physical_locked(part, chunk.gpa) {
                return Err(partial(gva, chunk.offset, len, source));
            }
        }
        Ok(())
    }

    /// Backend read with patched sites replaced by their original bytes.
    pub(crate) fn read_physical_locked(
        &self,
        buf: &mut [u8],
        gpa: u64,
    ) -> std::result::Result<(), BackendError> {
        self.backend.read_physical(gpa, buf)?;
        let end = gpa + buf.len() as u64;
        for (site, patch) in self.exits.view().patches_in(gpa, end) {
            buf[(site - gpa) as usize] = patch.original;
        }
        Ok(())
    }

    /// Backend write that keeps `int3` patches in place and records the
    /// new bytes beneath them.
    pub(crate) fn write_physical_locked(
        &self,
        buf: &[u8],
        gpa: u64,
    ) -> std::result::Result<(), BackendError> {
        let end = gpa + buf.len() as u64;
        let sites: Vec<_> = self.exits.view().patches_in(gpa, end).collect();
        if sites.is_empty() {
            return self.backend.write_physical(gpa, buf);
        }

        let mut bytes = buf.to_vec();
        {
            let mut view = self.exits.view_mut();
            for &(site, _) in &sites {
                let index = (site - gpa) as usize;
                view.set_original(site, buf[index]);
                bytes[index] = INT3;
            }
        }
        let result = self.backend.write_physical(gpa, &bytes);
        if result.is_err() {
            let mut view = self.exits.view_mut();
            for &(site, patch) in &sites {
                view.set_original(site, patch.original);
            }
        }
        result
    }
}

fn partial(address: u64, done: usize, len: usize, source: BackendError) -> DebugError {
    if done == 0 {
        DebugError::from(source)
    } else {
        DebugError::PartialFault {
            address,
            done,
            len,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attached, sim_config};
    use vmprobe_sim::guest::{KERNEL_BASE, KERNEL_DATA_VA, PHYSMAP_BASE, USER_CODE_VA};
    use vmprobe_sim::memory::{KERNEL_DATA_PHYS, KERNEL_TEXT_PHYS};

    const SCRATCH_PHYS: u64 = 0x80_0000;

    #[test]
    fn physical_page_round_trip() {
        let (_vm, _p, session) = attached("mem-physical", sim_config());
        let mut original = vec![0u8; PAGE_SIZE as usize];
        session.read_physical(&mut original, SCRATCH_PHYS).unwrap();

        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7) as u8).collect();
        assert_ne!(page, original);
        session.write_physical(&page, SCRATCH_PHYS).unwrap();
        let mut back = vec![0u8; PAGE_SIZE as usize];
        session.read_physical(&mut back, SCRATCH_PHYS).unwrap();
        assert_eq!(back, page);

        session.write_physical(&original, SCRATCH_PHYS).unwrap();
        session.read_physical(&mut back, SCRATCH_PHYS).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn physical_bounds() {
        let (_vm, _p, session) = attached("mem-bounds", sim_config());
        let size = session.physical_memory_size().unwrap();
        let mut buf = [0u8; 16];
        session.read_physical(&mut buf, size - 16).unwrap();
        assert!(matches!(
            session.read_physical(&mut buf, size - 8),
            Err(DebugError::OutOfRange { .. })
        ));
        assert!(matches!(
            session.write_physical(&buf, u64::MAX - 4),
            Err(DebugError::OutOfRange { .. })
        ));
        session.write_physical(&[], size + 100).unwrap();
    }

    #[test]
    fn virtual_writes_of_every_size_up_to_a_page() {
        let (_vm, _p, session) = attached("mem-virtual-sizes", sim_config());
        let gva = PHYSMAP_BASE + SCRATCH_PHYS;
        let pattern: Vec<u8> = (0..=PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        for size in (0..=PAGE_SIZE as usize).step_by(97).chain([1, 4095, 4096]) {
            session.write_virtual(0, &pattern[..size], gva).unwrap();
            let mut back = vec![0u8; size];
            session.read_virtual(0, &mut back, gva).unwrap();
            assert_eq!(back, &pattern[..size], "size {}", size);
        }
    }

    #[test]
    fn empty_transfer_skips_translation() {
        let (_vm, _p, session) = attached("mem-empty", sim_config());
        session.write_virtual(0, &[], 0xdead_0000_0000).unwrap();
        session.read_virtual(1, &mut [], 0xdead_0000_0000).unwrap();
    }

    #[test]
    fn virtual_range_is_all_or_nothing() {
        let (_vm, _p, session) = attached("mem-all-or-nothing", sim_config());
        // The kernel data page is mapped; the page after it is not.
        let before = [0x11u8; 8];
        session.write_virtual(0, &before, KERNEL_DATA_VA + PAGE_SIZE - 8).unwrap();
        let err = session
            .write_virtual(0, &[0x22; 16], KERNEL_DATA_VA + PAGE_SIZE - 8)
            .unwrap_err();
        assert!(matches!(err, DebugError::Unmapped { address } if address == KERNEL_DATA_VA + PAGE_SIZE));
        let mut back = [0u8; 8];
        session
            .read_physical(&mut back, KERNEL_DATA_PHYS + PAGE_SIZE - 8)
            .unwrap();
        assert_eq!(back, before);
    }

    #[test]
    fn translation_follows_cr3() {
        let (vm, _p, session) = attached("mem-translate", sim_config());
        let roots = vm.process_roots();
        let p0 = session.translate(roots[0], USER_CODE_VA).unwrap();
        let p1 = session.translate(roots[1], USER_CODE_VA).unwrap();
        assert_ne!(p0, p1);
        assert_eq!(session.virtual_to_physical(0, USER_CODE_VA).unwrap(), p0);

        // Switching vCPU 0 to the other process changes its view.
        session.write_register(0, Register::Cr3, roots[1]).unwrap();
        assert_eq!(session.virtual_to_physical(0, USER_CODE_VA).unwrap(), p1);

        assert_eq!(
            session.translate(roots[1], KERNEL_BASE + 0x10).unwrap(),
            KERNEL_TEXT_PHYS + 0x10
        );
        assert!(matches!(
            session.translate(roots[0], 0x7000_0000),
            Err(DebugError::Unmapped { .. })
        ));
    }

    #[test]
    fn explicit_address_space_access() {
        let (vm, _p, session) = attached("mem-asid", sim_config());
        let roots = vm.process_roots();
        let mut code0 = [0u8; 3];
        let mut code1 = [0u8; 3];
        session.read_virtual_in(roots[0], &mut code0, USER_CODE_VA).unwrap();
        session.read_virtual_in(roots[1], &mut code1, USER_CODE_VA).unwrap();
        assert_eq!(code0, code1, "both processes run the same loop");

        session.write_virtual_in(roots[1], &[0x90], USER_CODE_VA).unwrap();
        session.read_virtual_in(roots[0], &mut code0, USER_CODE_VA).unwrap();
        session.read_virtual_in(roots[1], &mut code1, USER_CODE_VA).unwrap();
        assert_ne!(code0[0], 0x90);
        assert_eq!(code1[0], 0x90);
    }

    #[test]
    fn paging_disabled_is_identity() {
        let (_vm, _p, session) = attached("mem-identity", sim_config());
        let cr0 = session.read_register(0, Register::Cr0).unwrap();
        session.write_register(0, Register::Cr0, cr0 & !CR0_PG).unwrap();
        assert_eq!(session.virtual_to_physical(0, SCRATCH_PHYS).unwrap(), SCRATCH_PHYS);
    }

    #[test]
    fn out_of_range_vcpu() {
        let (_vm, _p, session) = attached("mem-vcpu", sim_config());
        let mut buf = [0u8; 4];
        assert!(matches!(
            session.read_virtual(7, &mut buf, KERNEL_BASE),
            Err(DebugError::InvalidArgument(_))
        ));
    }
}
