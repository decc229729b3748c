//! Breakpoint manager.
//!
//! Breakpoints live in a fixed-capacity arena; a breakpoint's id is its
//! slot index, and freed slots are reused lowest first. Each kind is
//! enforced differently:
//!
//! | Kind       | Enforcement                                   | Shared resource          |
//! |------------|-----------------------------------------------|--------------------------|
//! | `Software` | `int3` patched over one guest-physical byte   | patch record, refcounted |
//! | `Page`     | page traps on every frame the range touches   | per-frame, per-access refcounts |
//! | `Hardware` | one DR0–DR3 slot on every targeted vCPU       | slot ownership           |
//!
//! Virtual addresses of `Software` and `Page` breakpoints are resolved to
//! guest-physical frames when the breakpoint is set.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use vmprobe_protocol::{
    dr7, page_base, Access, AddressSpace, AsidFilter, BreakpointKind, CpuTarget, Register,
    TrapMask, HW_BREAKPOINT_SLOTS, INT3, MAX_BREAKPOINTS, PAGE_SIZE,
};

use crate::error::{DebugError, Result};
use crate::exits::Matcher;
use crate::memory::PageRoot;
use crate::session::{Geometry, Session};

// ═══════════════════════════════════════════════════════════════════════
//  Public types
// ═══════════════════════════════════════════════════════════════════════

/// Handle of a set breakpoint: its slot in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u8);

impl BreakpointId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Slot index.
    pub const fn index(self) -> u8 {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u8)
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp#{}", self.0)
    }
}

/// Parameters of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointRequest {
    pub kind: BreakpointKind,
    pub access: Access,
    pub space: AddressSpace,
    pub address: u64,
    /// Bytes covered, at least 1.
    pub length: u64,
    pub cpu: CpuTarget,
    pub asid: AsidFilter,
}

impl BreakpointRequest {
    /// An `int3` breakpoint on one instruction, on every vCPU, in any
    /// address space.
    pub fn software(space: AddressSpace, address: u64) -> Self {
        Self {
            kind: BreakpointKind::Software,
            access: Access::Execute,
            space,
            address,
            length: 1,
            cpu: CpuTarget::All,
            asid: AsidFilter::Any,
        }
    }

    /// An execute page breakpoint over `[address, address + length)`.
    pub fn page(space: AddressSpace, address: u64, length: u64) -> Self {
        Self {
            kind: BreakpointKind::Page,
            length,
            ..Self::software(space, address)
        }
    }

    /// A debug-register breakpoint on a virtual address.
    pub fn hardware(address: u64, access: Access, length: u64) -> Self {
        Self {
            kind: BreakpointKind::Hardware,
            access,
            length,
            ..Self::software(AddressSpace::Virtual, address)
        }
    }

    pub fn with_access(self, access: Access) -> Self {
        Self { access, ..self }
    }

    pub fn on_cpu(self, cpu: CpuTarget) -> Self {
        Self { cpu, ..self }
    }

    pub fn in_address_space(self, asid: AsidFilter) -> Self {
        Self { asid, ..self }
    }

    fn end(&self) -> u64 {
        self.address.wrapping_add(self.length)
    }

    fn validate(&self, geometry: Geometry) -> Result<()> {
        let invalid = |msg: String| Err(DebugError::InvalidArgument(msg));
        if self.length == 0 {
            return invalid("breakpoint length must be at least 1".into());
        }
        if self.address.checked_add(self.length).is_none() {
            return invalid(format!(
                "range {:#x}+{:#x} wraps the address space",
                self.address, self.length
            ));
        }
        if let CpuTarget::Specific(vcpu) = self.cpu {
            if vcpu >= geometry.cpu_count {
                return invalid(format!("vCPU {} out of range", vcpu));
            }
        }
        match self.kind {
            BreakpointKind::Software => {
                if self.access != Access::Execute {
                    return invalid("software breakpoints only trap execution".into());
                }
                if self.length != 1 {
                    return invalid("software breakpoints cover one byte".into());
                }
            }
            BreakpointKind::Page => {}
            BreakpointKind::Hardware => {
                if self.space != AddressSpace::Virtual {
                    return invalid("hardware breakpoints take virtual addresses".into());
                }
                if dr7::len_bits(self.length).is_none() {
                    return invalid(format!(
                        "hardware breakpoint length {} is not 1, 2, 4 or 8",
                        self.length
                    ));
                }
                if self.access == Access::Execute && self.length != 1 {
                    return invalid("execute hardware breakpoints have length 1".into());
                }
                if self.address % self.length != 0 {
                    return invalid(format!(
                        "address {:#x} is not aligned to {}",
                        self.address, self.length
                    ));
                }
            }
        }
        if self.space == AddressSpace::Physical && self.end() > geometry.memory_size {
            return Err(DebugError::OutOfRange {
                address: self.address,
                len: self.length as usize,
            });
        }
        Ok(())
    }
}

/// A set breakpoint as reported by [`Session::breakpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub id: BreakpointId,
    pub request: BreakpointRequest,
    /// Times the breakpoint stopped the VM.
    pub hits: u64,
    /// Guest-physical patch site (`Software`) or trapped frames (`Page`).
    pub frames: Vec<u64>,
    /// `(vcpu, slot)` pairs programmed for a `Hardware` breakpoint.
    pub debug_slots: Vec<(u32, u8)>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Table
// ═══════════════════════════════════════════════════════════════════════

/// What a breakpoint holds in the backend.
#[derive(Debug, Clone)]
pub(crate) enum Armed {
    Patch { gpa: u64 },
    Frames { frames: Vec<u64> },
    Slots { slots: Vec<(u32, usize)> },
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) request: BreakpointRequest,
    pub(crate) armed: Armed,
    hits: Arc<AtomicU64>,
}

/// Page traps held on one frame, counted per access bit.
#[derive(Debug, Default, Clone, Copy)]
struct FrameRefs {
    execute: u32,
    read: u32,
    write: u32,
}

impl FrameRefs {
    fn counters(&mut self) -> [(TrapMask, &mut u32); 3] {
        [
            (TrapMask::EXECUTE, &mut self.execute),
            (TrapMask::READ, &mut self.read),
            (TrapMask::WRITE, &mut self.write),
        ]
    }

    fn add(&mut self, mask: TrapMask) {
        for (bit, count) in self.counters() {
            if mask.intersects(bit) {
                *count += 1;
            }
        }
    }

    fn remove(&mut self, mask: TrapMask) {
        for (bit, count) in self.counters() {
            if mask.intersects(bit) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn mask(&self) -> TrapMask {
        let mut mask = TrapMask::NONE;
        if self.execute > 0 {
            mask = mask | TrapMask::EXECUTE;
        }
        if self.read > 0 {
            mask = mask | TrapMask::READ;
        }
        if self.write > 0 {
            mask = mask | TrapMask::WRITE;
        }
        mask
    }
}

const OCCUPANCY_WORDS: usize = (MAX_BREAKPOINTS + 63) / 64;

/// Fixed-capacity breakpoint arena. Guarded by the session's program
/// lock.
pub(crate) struct BreakpointTable {
    capacity: usize,
    occupied: [u64; OCCUPANCY_WORDS],
    entries: Vec<Option<Entry>>,
    frames: HashMap<u64, FrameRefs>,
}

impl BreakpointTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_BREAKPOINTS);
        Self {
            capacity,
            occupied: [0; OCCUPANCY_WORDS],
            entries: (0..capacity).map(|_| None).collect(),
            frames: HashMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Claim the lowest free slot.
    fn allocate(&mut self) -> Option<BreakpointId> {
        for (word_index, word) in self.occupied.iter_mut().enumerate() {
            let free = (!*word).trailing_zeros() as usize;
            if free == 64 {
                continue;
            }
            let index = word_index * 64 + free;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << free;
            return Some(BreakpointId::from_index(index));
        }
        None
    }

    fn is_occupied(&self, id: BreakpointId) -> bool {
        let index = id.index() as usize;
        index < self.capacity && self.occupied[index / 64] & (1 << (index % 64)) != 0
    }

    fn insert(&mut self, id: BreakpointId, entry: Entry) {
        self.entries[id.index() as usize] = Some(entry);
    }

    /// Free a slot, returning what it held.
    fn release(&mut self, id: BreakpointId) -> Option<Entry> {
        if !self.is_occupied(id) {
            return None;
        }
        let index = id.index() as usize;
        self.occupied[index / 64] &= !(1 << (index % 64));
        self.entries[index].take()
    }

    pub(crate) fn ids(&self) -> Vec<BreakpointId> {
        (0..self.capacity)
            .map(BreakpointId::from_index)
            .filter(|&id| self.is_occupied(id) && self.entries[id.index() as usize].is_some())
            .collect()
    }

    pub(crate) fn entry(&self, id: BreakpointId) -> Option<&Entry> {
        self.entries.get(id.index() as usize)?.as_ref()
    }

    /// Every `(vcpu, slot)` held by a hardware breakpoint.
    pub(crate) fn owned_slots(&self) -> Vec<(u32, usize, BreakpointId)> {
        self.ids()
            .into_iter()
            .filter_map(|id| match &self.entry(id)?.armed {
                Armed::Slots { slots } => {
                    Some(slots.iter().map(move |&(v, s)| (v, s, id)).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn info(&self, id: BreakpointId) -> Option<BreakpointInfo> {
        let entry = self.entry(id)?;
        let (frames, debug_slots) = match &entry.armed {
            Armed::Patch { gpa } => (vec![*gpa], Vec::new()),
            Armed::Frames { frames } => (frames.clone(), Vec::new()),
            Armed::Slots { slots } => (
                Vec::new(),
                slots.iter().map(|&(v, s)| (v, s as u8)).collect(),
            ),
        };
        Some(BreakpointInfo {
            id,
            request: entry.request,
            hits: entry.hits.load(Ordering::Relaxed),
            frames,
            debug_slots,
        })
    }
}

/// Keep the first error of a best-effort sequence.
fn keep_first(outcome: &mut Result<()>, step: Result<()>) {
    if let Err(err) = step {
        warn!("breakpoint cleanup step failed: {}", err);
        if outcome.is_ok() {
            *outcome = Err(err);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session operations
// ═══════════════════════════════════════════════════════════════════════

impl Session {
    /// Set a breakpoint and arm it in the backend.
    ///
    /// # Errors
    ///
    /// - [`DebugError::CapacityExceeded`] if the table is full, or a
    ///   targeted vCPU has no free debug register.
    /// - [`DebugError::InvalidArgument`] for an inconsistent request.
    /// - [`DebugError::Unmapped`] if a virtual page of the range is not
    ///   present.
    /// - [`DebugError::OutOfRange`] for a physical range outside RAM.
    pub fn set_breakpoint(&self, request: BreakpointRequest) -> Result<BreakpointId> {
        let geometry = self.ready()?;
        request.validate(geometry)?;

        let mut table = self.lock_table();
        let id = table.allocate().ok_or_else(|| {
            DebugError::CapacityExceeded(format!(
                "all {} breakpoint slots are in use",
                table.capacity()
            ))
        })?;

        let hits = Arc::new(AtomicU64::new(0));
        let matcher = Matcher {
            kind: request.kind,
            access: request.access,
            space: request.space,
            start: request.address,
            end: request.end(),
            cpu: request.cpu,
            asid: request.asid,
            hits: Arc::clone(&hits),
        };
        let armed = match request.kind {
            BreakpointKind::Software => self.arm_patch(id, &request, matcher),
            BreakpointKind::Page => self.arm_frames(&mut table, id, &request, matcher),
            BreakpointKind::Hardware => self.arm_slots(id, &request, matcher, geometry),
        };
        let armed = match armed {
            Ok(armed) => armed,
            Err(err) => {
                table.release(id);
                return Err(err);
            }
        };

        debug!(
            "{} set: {:?} {:?} {:?} {:#x}+{:#x} on {:?} in {:?} -> {:?}",
            id,
            request.kind,
            request.access,
            request.space,
            request.address,
            request.length,
            request.cpu,
            request.asid,
            armed,
        );
        table.insert(id, Entry { request, armed, hits });
        Ok(id)
    }

    /// Disarm and free a breakpoint. Unknown or out-of-range ids are a
    /// no-op.
    ///
    /// Cleanup is best effort: every step is attempted and the first
    /// backend failure is returned. The id is freed either way.
    pub fn unset_breakpoint(&self, id: BreakpointId) -> Result<()> {
        self.ready()?;
        let mut table = self.lock_table();
        self.disarm_locked(&mut table, id)
    }

    /// Details of one breakpoint.
    pub fn breakpoint(&self, id: BreakpointId) -> Result<Option<BreakpointInfo>> {
        self.ready()?;
        Ok(self.lock_table().info(id))
    }

    /// Details of every set breakpoint, in id order.
    pub fn breakpoints(&self) -> Result<Vec<BreakpointInfo>> {
        self.ready()?;
        let table = self.lock_table();
        Ok(table.ids().into_iter().filter_map(|id| table.info(id)).collect())
    }

    /// Unset every breakpoint.
    pub fn clear_breakpoints(&self) -> Result<()> {
        self.ready()?;
        let mut table = self.lock_table();
        self.clear_locked(&mut table)
    }

    pub(crate) fn clear_locked(&self, table: &mut BreakpointTable) -> Result<()> {
        let mut outcome = Ok(());
        for id in table.ids() {
            keep_first(&mut outcome, self.disarm_locked(table, id));
        }
        outcome
    }

    /// Page-table root virtual addresses of `request` are resolved in.
    fn resolution_root(&self, request: &BreakpointRequest) -> Result<PageRoot> {
        match request.asid {
            AsidFilter::Only(root) => Ok(PageRoot::Table(root)),
            AsidFilter::Any => {
                let vcpu = match request.cpu {
                    CpuTarget::Specific(vcpu) => vcpu,
                    CpuTarget::All => 0,
                };
                self.vcpu_root(vcpu)
            }
        }
    }

    fn arm_patch(
        &self,
        id: BreakpointId,
        request: &BreakpointRequest,
        matcher: Matcher,
    ) -> Result<Armed> {
        let gpa = match request.space {
            AddressSpace::Physical => request.address,
            AddressSpace::Virtual => {
                let root = self.resolution_root(request)?;
                self.resolve(root, request.address)?
            }
        };

        let known = self.exits.view().patch(gpa).map(|p| p.original);
        let original = match known {
            Some(byte) => byte,
            None => {
                let mut byte = [0u8; 1];
                self.backend.read_physical(gpa, &mut byte)?;
                byte[0]
            }
        };

        let fresh = {
            let mut view = self.exits.view_mut();
            view.arm(id, matcher);
            view.add_patch(gpa, original)
        };
        if fresh {
            if let Err(err) = self.backend.write_physical(gpa, &[INT3]) {
                let mut view = self.exits.view_mut();
                view.disarm(id);
                view.release_patch(gpa);
                view.forget_patch(gpa);
                return Err(err.into());
            }
        }
        Ok(Armed::Patch { gpa })
    }

    fn arm_frames(
        &self,
        table: &mut BreakpointTable,
        id: BreakpointId,
        request: &BreakpointRequest,
        matcher: Matcher,
    ) -> Result<Armed> {
        let first = page_base(request.address);
        let last = page_base(request.end() - 1);
        let pages = (last - first) / PAGE_SIZE + 1;

        let mut frames = Vec::with_capacity(pages as usize);
        match request.space {
            AddressSpace::Physical => {
                frames.extend((0..pages).map(|i| first + i * PAGE_SIZE));
            }
            AddressSpace::Virtual => {
                let root = self.resolution_root(request)?;
                for i in 0..pages {
                    let page = first + i * PAGE_SIZE;
                    let gpa = self.resolve(root, page.max(request.address))?;
                    frames.push(page_base(gpa));
                }
            }
        }
        frames.sort_unstable();
        frames.dedup();

        self.exits.view_mut().arm(id, matcher);
        let mask = request.access.trap_mask();
        for (done, &frame) in frames.iter().enumerate() {
            if let Err(err) = self.add_trap(table, frame, mask) {
                for &armed in &frames[..done] {
                    let _ = self.remove_trap(table, armed, mask);
                }
                self.exits.view_mut().disarm(id);
                return Err(err);
            }
        }
        Ok(Armed::Frames { frames })
    }

    fn arm_slots(
        &self,
        id: BreakpointId,
        request: &BreakpointRequest,
        matcher: Matcher,
        geometry: Geometry,
    ) -> Result<Armed> {
        let vcpus: Vec<u32> = match request.cpu {
            CpuTarget::Specific(vcpu) => vec![vcpu],
            CpuTarget::All => (0..geometry.cpu_count).collect(),
        };
        let current = vcpus
            .iter()
            .map(|&vcpu| Ok((vcpu, self.backend.read_register(vcpu, Register::Dr7)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut picks = Vec::with_capacity(current.len());
        {
            let view = self.exits.view();
            for &(vcpu, dr7) in &current {
                let slot = (0..HW_BREAKPOINT_SLOTS)
                    .find(|&s| view.slot_owner(vcpu, s).is_none() && !dr7::is_enabled(dr7, s))
                    .ok_or_else(|| {
                        DebugError::CapacityExceeded(format!(
                            "no free debug register on vCPU {}",
                            vcpu
                        ))
                    })?;
                picks.push((vcpu, slot, dr7));
            }
        }

        {
            let mut view = self.exits.view_mut();
            view.arm(id, matcher);
            for &(vcpu, slot, _) in &picks {
                view.own_slot(vcpu, slot, id);
            }
        }

        for (done, &(vcpu, slot, dr7)) in picks.iter().enumerate() {
            if let Err(err) = self.program_slot(vcpu, slot, dr7, request) {
                for &(v, s, _) in &picks[..done] {
                    let _ = self.clear_slot(v, s);
                }
                let mut view = self.exits.view_mut();
                view.disarm(id);
                for &(v, s, _) in &picks {
                    view.release_slot(v, s);
                }
                return Err(err);
            }
        }
        Ok(Armed::Slots {
            slots: picks.into_iter().map(|(v, s, _)| (v, s)).collect(),
        })
    }

    /// Write the address register of `slot` and enable it in DR7.
    pub(crate) fn program_slot(
        &self,
        vcpu: u32,
        slot: usize,
        dr7: u64,
        request: &BreakpointRequest,
    ) -> Result<u64> {
        let address_register = Register::debug_address(slot)
            .ok_or_else(|| DebugError::InvalidArgument(format!("no debug slot {}", slot)))?;
        let enabled = dr7::enable(dr7, slot, request.access, request.length).ok_or_else(|| {
            DebugError::InvalidArgument(format!("length {} not encodable", request.length))
        })?;
        self.backend
            .write_register(vcpu, address_register, request.address)?;
        self.backend.write_register(vcpu, Register::Dr7, enabled)?;
        Ok(enabled)
    }

    fn clear_slot(&self, vcpu: u32, slot: usize) -> Result<()> {
        let dr7 = self.backend.read_register(vcpu, Register::Dr7)?;
        self.backend
            .write_register(vcpu, Register::Dr7, dr7::disable(dr7, slot))?;
        Ok(())
    }

    fn add_trap(&self, table: &mut BreakpointTable, frame: u64, mask: TrapMask) -> Result<()> {
        let refs = table.frames.entry(frame).or_default();
        let before = refs.mask();
        refs.add(mask);
        let after = refs.mask();
        if after != before {
            if let Err(err) = self.backend.set_page_trap(frame, after) {
                refs.remove(mask);
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn remove_trap(&self, table: &mut BreakpointTable, frame: u64, mask: TrapMask) -> Result<()> {
        let Some(refs) = table.frames.get_mut(&frame) else {
            return Ok(());
        };
        let before = refs.mask();
        refs.remove(mask);
        let after = refs.mask();
        if after.is_empty() {
            table.frames.remove(&frame);
            self.backend.clear_page_trap(frame)?;
        } else if after != before {
            self.backend.set_page_trap(frame, after)?;
        }
        Ok(())
    }

    fn disarm_locked(&self, table: &mut BreakpointTable, id: BreakpointId) -> Result<()> {
        let Some(entry) = table.release(id) else {
            return Ok(());
        };
        self.exits.view_mut().disarm(id);

        let mut outcome = Ok(());
        match &entry.armed {
            Armed::Patch { gpa } => {
                let restore = self.exits.view_mut().release_patch(*gpa);
                if let Some(original) = restore {
                    match self.backend.write_physical(*gpa, &[original]) {
                        Ok(()) => self.exits.view_mut().forget_patch(*gpa),
                        Err(err) => keep_first(&mut outcome, Err(err.into())),
                    }
                }
            }
            Armed::Frames { frames } => {
                let mask = entry.request.access.trap_mask();
                for &frame in frames {
                    keep_first(&mut outcome, self.remove_trap(table, frame, mask));
                }
            }
            Armed::Slots { slots } => {
                for &(vcpu, slot) in slots {
                    match self.clear_slot(vcpu, slot) {
                        Ok(()) => self.exits.view_mut().release_slot(vcpu, slot),
                        Err(err) => keep_first(&mut outcome, Err(err)),
                    }
                }
            }
        }
        debug!("{} unset", id);
        outcome
    }
}
