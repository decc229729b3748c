//! Snapshot manager: one save slot per session.
//!
//! The backend captures registers, memory and device state. Around that,
//! the core keeps breakpoints consistent:
//!
//! - `save()` lifts every `int3` patch for the capture, so the slot holds
//!   clean guest memory, and records which debug registers the table
//!   owned.
//! - `restore()` re-reads the original bytes from the restored memory and
//!   patches them again, reprograms the debug registers of hardware
//!   breakpoints set now, and disables slots that were only owned at save
//!   time. Page traps are not part of the capture and stay armed.

use std::sync::{MutexGuard, PoisonError};

use log::{info, warn};
use vmprobe_protocol::{dr7, Register, StateFlags, HW_BREAKPOINT_SLOTS, INT3};

use crate::error::{DebugError, Result};
use crate::session::Session;

/// Debug-register slots the breakpoint table owned at save time.
#[derive(Debug, Clone, Default)]
pub(crate) struct SavedSlots {
    owned: Vec<(u32, usize)>,
}

impl Session {
    fn saved_slots(&self) -> MutexGuard<'_, Option<SavedSlots>> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture the VM into the save slot, replacing any earlier capture.
    ///
    /// # Errors
    ///
    /// [`DebugError::NotPaused`] unless the VM is paused.
    pub fn save(&self) -> Result<()> {
        self.ready()?;
        let table = self.lock_table();
        if !self.backend.is_paused() {
            return Err(DebugError::NotPaused);
        }

        let patches = self.exits.view().live_patches();
        let mut outcome: Result<()> = Ok(());
        for &(gpa, patch) in &patches {
            if let Err(err) = self.backend.write_physical(gpa, &[patch.original]) {
                outcome = Err(err.into());
                break;
            }
        }
        if outcome.is_ok() {
            outcome = self.backend.save_state().map_err(DebugError::from);
        }
        for &(gpa, _) in &patches {
            if let Err(err) = self.backend.write_physical(gpa, &[INT3]) {
                warn!("failed to re-patch {:#x} after save: {}", gpa, err);
                if outcome.is_ok() {
                    outcome = Err(err.into());
                }
            }
        }
        outcome?;

        let owned = table
            .owned_slots()
            .into_iter()
            .map(|(vcpu, slot, _)| (vcpu, slot))
            .collect();
        *self.saved_slots() = Some(SavedSlots { owned });
        info!(
            "Snapshot of {:?} saved ({} breakpoint patches lifted)",
            self.name(),
            patches.len()
        );
        Ok(())
    }

    /// Overwrite the live VM with the save slot. Pauses the VM first;
    /// breakpoints set now stay armed.
    ///
    /// # Errors
    ///
    /// [`DebugError::NoSnapshot`] if nothing was saved; the VM is left
    /// untouched in that case.
    pub fn restore(&self) -> Result<()> {
        let geometry = self.ready()?;
        let table = self.lock_table();
        let owned_at_save = match &*self.saved_slots() {
            Some(saved) => saved.owned.clone(),
            None => return Err(DebugError::NoSnapshot),
        };

        self.pause_locked()?;
        self.backend.restore_state()?;

        // Restored memory is the clean capture.
        let patches = self.exits.view().live_patches();
        for (gpa, patch) in patches {
            if patch.refs == 0 {
                self.exits.view_mut().forget_patch(gpa);
                continue;
            }
            let mut byte = [0u8; 1];
            self.backend.read_physical(gpa, &mut byte)?;
            self.exits.view_mut().set_original(gpa, byte[0]);
            self.backend.write_physical(gpa, &[INT3])?;
        }

        let owned_now = table.owned_slots();
        for vcpu in 0..geometry.cpu_count {
            let restored = self.backend.read_register(vcpu, Register::Dr7)?;
            let mut value = restored;
            for slot in 0..HW_BREAKPOINT_SLOTS {
                let owner = owned_now
                    .iter()
                    .find(|&&(v, s, _)| v == vcpu && s == slot)
                    .and_then(|&(_, _, id)| table.entry(id));
                if let Some(entry) = owner {
                    value = self.program_slot(vcpu, slot, value, &entry.request)?;
                } else if owned_at_save.contains(&(vcpu, slot)) {
                    value = dr7::disable(value, slot);
                }
            }
            if value != restored {
                self.backend.write_register(vcpu, Register::Dr7, value)?;
            }
        }

        let monitor = &self.exits.monitor;
        monitor.clear_stop();
        monitor.transition(|_| Some(StateFlags::PAUSED));
        info!("Snapshot of {:?} restored", self.name());
        Ok(())
    }

    /// `true` once `save()` has succeeded on this session.
    pub fn has_snapshot(&self) -> Result<bool> {
        self.ready()?;
        Ok(self.saved_slots().is_some())
    }
}
