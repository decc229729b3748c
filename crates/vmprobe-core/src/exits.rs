//! Guest-exit routing.
//!
//! The backend calls [`ExitRouter::on_exit`] with its execution lock held.
//! The router decides from the [`ArmedView`], a snapshot of what the
//! breakpoint table has armed, and never calls back into the backend.
//!
//! # Publication order
//!
//! The view is kept a superset of what is live in the guest:
//!
//! - arming publishes the matcher (and patch record) before the backend
//!   is programmed;
//! - disarming withdraws the matcher first, and drops the patch record or
//!   slot owner only after the backend has been reverted.
//!
//! A trap that arrives in between finds its patch or slot but no matcher
//! and is stepped over.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use log::debug;
use vmprobe_protocol::{
    Access, AddressSpace, AsidFilter, BreakpointKind, CpuTarget, ExitContext, ExitHandler,
    ExitVerdict, GuestExit, StateFlags, TrapMask, HW_BREAKPOINT_SLOTS,
};

use crate::breakpoints::BreakpointId;
use crate::monitor::{StateMonitor, StopCause, StopInfo};

/// Exit-side description of one armed breakpoint.
#[derive(Debug, Clone)]
pub(crate) struct Matcher {
    pub(crate) kind: BreakpointKind,
    pub(crate) access: Access,
    pub(crate) space: AddressSpace,
    pub(crate) start: u64,
    /// Exclusive.
    pub(crate) end: u64,
    pub(crate) cpu: CpuTarget,
    pub(crate) asid: AsidFilter,
    pub(crate) hits: Arc<AtomicU64>,
}

impl Matcher {
    fn covers(&self, ctx: &ExitContext, linear: u64, gpa: u64) -> bool {
        let address = match self.space {
            AddressSpace::Virtual => linear,
            AddressSpace::Physical => gpa,
        };
        self.cpu.covers(ctx.vcpu)
            && self.asid.matches(ctx.cr3)
            && (self.start..self.end).contains(&address)
    }
}

/// An `int3` written into guest memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Patch {
    pub(crate) original: u8,
    pub(crate) refs: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ArmedView {
    matchers: BTreeMap<BreakpointId, Matcher>,
    patches: BTreeMap<u64, Patch>,
    debug_slots: Vec<[Option<BreakpointId>; HW_BREAKPOINT_SLOTS]>,
}

impl ArmedView {
    pub(crate) fn with_vcpus(count: u32) -> Self {
        Self {
            debug_slots: vec![[None; HW_BREAKPOINT_SLOTS]; count as usize],
            ..Default::default()
        }
    }

    pub(crate) fn arm(&mut self, id: BreakpointId, matcher: Matcher) {
        self.matchers.insert(id, matcher);
    }

    pub(crate) fn disarm(&mut self, id: BreakpointId) {
        self.matchers.remove(&id);
    }

    /// Take a reference on the patch at `gpa`. Returns `true` if the
    /// patch is new and the `int3` still has to be written.
    pub(crate) fn add_patch(&mut self, gpa: u64, original: u8) -> bool {
        match self.patches.get_mut(&gpa) {
            Some(patch) => {
                let fresh = patch.refs == 0;
                patch.refs += 1;
                fresh
            }
            None => {
                self.patches.insert(gpa, Patch { original, refs: 1 });
                true
            }
        }
    }

    /// Drop a reference on the patch at `gpa`. Returns the original byte
    /// when the last reference is gone and the byte must be restored.
    pub(crate) fn release_patch(&mut self, gpa: u64) -> Option<u8> {
        let patch = self.patches.get_mut(&gpa)?;
        patch.refs = patch.refs.saturating_sub(1);
        (patch.refs == 0).then_some(patch.original)
    }

    /// Forget the patch at `gpa` once guest memory no longer holds it.
    pub(crate) fn forget_patch(&mut self, gpa: u64) {
        if self.patches.get(&gpa).is_some_and(|p| p.refs == 0) {
            self.patches.remove(&gpa);
        }
    }

    pub(crate) fn patch(&self, gpa: u64) -> Option<Patch> {
        self.patches.get(&gpa).copied()
    }

    /// Patches with `gpa` in `[start, end)`.
    pub(crate) fn patches_in(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, Patch)> + '_ {
        self.patches.range(start..end).map(|(&gpa, &p)| (gpa, p))
    }

    /// Every patch currently written into guest memory.
    pub(crate) fn live_patches(&self) -> Vec<(u64, Patch)> {
        self.patches.iter().map(|(&gpa, &p)| (gpa, p)).collect()
    }

    pub(crate) fn set_original(&mut self, gpa: u64, original: u8) {
        if let Some(patch) = self.patches.get_mut(&gpa) {
            patch.original = original;
        }
    }

    pub(crate) fn own_slot(&mut self, vcpu: u32, slot: usize, id: BreakpointId) {
        if let Some(slots) = self.debug_slots.get_mut(vcpu as usize) {
            slots[slot] = Some(id);
        }
    }

    pub(crate) fn release_slot(&mut self, vcpu: u32, slot: usize) {
        if let Some(slots) = self.debug_slots.get_mut(vcpu as usize) {
            slots[slot] = None;
        }
    }

    pub(crate) fn slot_owner(&self, vcpu: u32, slot: usize) -> Option<BreakpointId> {
        self.debug_slots.get(vcpu as usize)?.get(slot).copied().flatten()
    }

    fn find(
        &self,
        kind: BreakpointKind,
        access: TrapMask,
        ctx: &ExitContext,
        linear: u64,
        gpa: u64,
    ) -> Option<(BreakpointId, &Matcher)> {
        self.matchers
            .iter()
            .find(|(_, m)| {
                m.kind == kind
                    && m.access.trap_mask().intersects(access)
                    && m.covers(ctx, linear, gpa)
            })
            .map(|(&id, m)| (id, m))
    }
}

/// The session's [`ExitHandler`]: owns the state monitor and the armed
/// view.
pub(crate) struct ExitRouter {
    pub(crate) monitor: StateMonitor,
    view: RwLock<ArmedView>,
}

impl ExitRouter {
    pub(crate) fn new() -> Self {
        Self {
            monitor: StateMonitor::new(),
            view: RwLock::new(ArmedView::default()),
        }
    }

    pub(crate) fn view(&self) -> RwLockReadGuard<'_, ArmedView> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn view_mut(&self) -> RwLockWriteGuard<'_, ArmedView> {
        self.view.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self, ctx: &ExitContext, cause: StopCause, flags: StateFlags) -> ExitVerdict {
        debug!(
            "vCPU {} stopped at {:#x} ({:?}), state {}",
            ctx.vcpu, ctx.rip, cause, flags
        );
        self.monitor.record_stop(
            StopInfo {
                vcpu: ctx.vcpu,
                rip: ctx.rip,
                cr3: ctx.cr3,
                cause,
            },
            flags,
        );
        ExitVerdict::Stop
    }

    fn hit(&self, ctx: &ExitContext, id: BreakpointId, matcher: &Matcher, hard: bool) -> ExitVerdict {
        matcher.hits.fetch_add(1, Ordering::Relaxed);
        let mut flags = StateFlags::PAUSED | StateFlags::BREAKPOINT_HIT;
        if hard {
            flags |= StateFlags::HARD_BREAKPOINT_HIT;
        }
        self.stop(ctx, StopCause::Breakpoint { id }, flags)
    }
}

impl ExitHandler for ExitRouter {
    fn on_exit(&self, ctx: &ExitContext, exit: &GuestExit) -> ExitVerdict {
        let view = self.view();
        match *exit {
            GuestExit::SoftwareBreakpoint { gpa } => {
                let Some(patch) = view.patch(gpa) else {
                    // Not ours: the guest's own int3.
                    return ExitVerdict::Reinject;
                };
                match view.find(BreakpointKind::Software, TrapMask::EXECUTE, ctx, ctx.rip, gpa) {
                    Some((id, m)) => self.hit(ctx, id, m, false),
                    None => ExitVerdict::StepOverPatched {
                        original: patch.original,
                    },
                }
            }
            GuestExit::PageTrap { gpa, linear, access } => {
                match view.find(BreakpointKind::Page, access, ctx, linear, gpa) {
                    Some((id, m)) => self.hit(ctx, id, m, false),
                    None => ExitVerdict::StepOver,
                }
            }
            GuestExit::DebugTrap { slot, .. } => match view.slot_owner(ctx.vcpu, slot as usize) {
                Some(id) => match view.matchers.get(&id) {
                    Some(m) if m.asid.matches(ctx.cr3) => self.hit(ctx, id, m, true),
                    _ => ExitVerdict::StepOver,
                },
                None => self.stop(
                    ctx,
                    StopCause::DebugRegister { slot },
                    StateFlags::PAUSED
                        | StateFlags::BREAKPOINT_HIT
                        | StateFlags::HARD_BREAKPOINT_HIT
                        | StateFlags::DEBUGGER_ALERTED,
                ),
            },
            GuestExit::Fault { vector } => self.stop(
                ctx,
                StopCause::Fault { vector },
                StateFlags::PAUSED | StateFlags::DEBUGGER_ALERTED,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmprobe_protocol::StopOrigin;

    const CTX: ExitContext = ExitContext {
        vcpu: 0,
        rip: 0x40_0000,
        cr3: 0x1_0000,
    };

    fn matcher(kind: BreakpointKind, space: AddressSpace, start: u64, len: u64) -> Matcher {
        Matcher {
            kind,
            access: Access::Execute,
            space,
            start,
            end: start + len,
            cpu: CpuTarget::All,
            asid: AsidFilter::Any,
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    fn router() -> ExitRouter {
        let router = ExitRouter::new();
        *router.view_mut() = ArmedView::with_vcpus(2);
        router
    }

    #[test]
    fn foreign_int3_is_reinjected() {
        let r = router();
        let verdict = r.on_exit(&CTX, &GuestExit::SoftwareBreakpoint { gpa: 0x20_0000 });
        assert_eq!(verdict, ExitVerdict::Reinject);
        assert!(!r.monitor.peek().is_paused());
    }

    #[test]
    fn matching_patch_stops_and_counts() {
        let r = router();
        let m = matcher(BreakpointKind::Software, AddressSpace::Virtual, CTX.rip, 1);
        let hits = Arc::clone(&m.hits);
        {
            let mut view = r.view_mut();
            view.arm(BreakpointId::from_index(0), m);
            view.add_patch(0x20_0000, 0x48);
        }
        let verdict = r.on_exit(&CTX, &GuestExit::SoftwareBreakpoint { gpa: 0x20_0000 });
        assert_eq!(verdict, ExitVerdict::Stop);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(StopOrigin::classify(r.monitor.peek()), StopOrigin::Mine);
        assert_eq!(
            r.monitor.stop_info().and_then(|s| s.breakpoint()),
            Some(BreakpointId::from_index(0))
        );
    }

    #[test]
    fn patch_out_of_scope_runs_original_byte() {
        let r = router();
        let mut m = matcher(BreakpointKind::Software, AddressSpace::Virtual, CTX.rip, 1);
        m.asid = AsidFilter::Only(0x9_0000);
        {
            let mut view = r.view_mut();
            view.arm(BreakpointId::from_index(0), m);
            view.add_patch(0x20_0000, 0x48);
        }
        let verdict = r.on_exit(&CTX, &GuestExit::SoftwareBreakpoint { gpa: 0x20_0000 });
        assert_eq!(verdict, ExitVerdict::StepOverPatched { original: 0x48 });
    }

    #[test]
    fn page_trap_respects_range_and_access() {
        let r = router();
        let mut m = matcher(BreakpointKind::Page, AddressSpace::Physical, 0x20_0000, 0x1000);
        m.access = Access::Write;
        r.view_mut().arm(BreakpointId::from_index(1), m);

        let read = GuestExit::PageTrap {
            gpa: 0x20_0010,
            linear: 0x40_0010,
            access: TrapMask::READ,
        };
        assert_eq!(r.on_exit(&CTX, &read), ExitVerdict::StepOver);
        let outside = GuestExit::PageTrap {
            gpa: 0x20_1000,
            linear: 0x40_1000,
            access: TrapMask::WRITE,
        };
        assert_eq!(r.on_exit(&CTX, &outside), ExitVerdict::StepOver);
        let write = GuestExit::PageTrap {
            gpa: 0x20_0ff8,
            linear: 0x40_0ff8,
            access: TrapMask::WRITE,
        };
        assert_eq!(r.on_exit(&CTX, &write), ExitVerdict::Stop);
    }

    #[test]
    fn unowned_debug_slot_is_reported_as_other() {
        let r = router();
        let verdict = r.on_exit(&CTX, &GuestExit::DebugTrap { slot: 2, dr6: 0x4 });
        assert_eq!(verdict, ExitVerdict::Stop);
        let state = r.monitor.peek();
        assert!(state.contains(StateFlags::HARD_BREAKPOINT_HIT));
        assert_eq!(StopOrigin::classify(state), StopOrigin::Other);
    }

    #[test]
    fn owned_slot_without_matcher_is_skipped() {
        let r = router();
        r.view_mut().own_slot(0, 1, BreakpointId::from_index(4));
        let verdict = r.on_exit(&CTX, &GuestExit::DebugTrap { slot: 1, dr6: 0x2 });
        assert_eq!(verdict, ExitVerdict::StepOver);
    }

    #[test]
    fn patch_references_are_counted() {
        let mut view = ArmedView::with_vcpus(1);
        assert!(view.add_patch(0x5000, 0x90));
        assert!(!view.add_patch(0x5000, 0xcc));
        assert_eq!(view.release_patch(0x5000), None);
        assert_eq!(view.release_patch(0x5000), Some(0x90));
        assert!(view.patch(0x5000).is_some(), "kept until the byte is restored");
        view.forget_patch(0x5000);
        assert!(view.patch(0x5000).is_none());
    }

    #[test]
    fn guest_fault_pauses_without_hit() {
        let r = router();
        let verdict = r.on_exit(&CTX, &GuestExit::Fault { vector: 14 });
        assert_eq!(verdict, ExitVerdict::Stop);
        let state = r.monitor.peek();
        assert!(state.is_paused());
        assert!(!state.contains(StateFlags::BREAKPOINT_HIT));
        assert_eq!(
            r.monitor.stop_info().map(|s| s.cause),
            Some(StopCause::Fault { vector: 14 })
        );
    }
}
