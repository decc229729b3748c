//! Execution control: pause, resume and single-step.

use log::{debug, warn};
use vmprobe_protocol::{Register, StateFlags, INT3};

use crate::error::{DebugError, Result};
use crate::monitor::StopCause;
use crate::session::Session;

impl Session {
    /// Stop every vCPU. Idempotent: pausing a paused VM is not a state
    /// change.
    pub fn pause(&self) -> Result<()> {
        self.ready()?;
        let _table = self.lock_table();
        self.pause_locked()
    }

    /// Let every vCPU run. Idempotent.
    ///
    /// With [`step_over_on_resume`](crate::SessionConfig::step_over_on_resume),
    /// a vCPU still parked on the instruction it stopped at is first
    /// stepped past it, so the stop is not reported again.
    pub fn resume(&self) -> Result<()> {
        self.ready()?;
        let _table = self.lock_table();
        if self.config().step_over_on_resume {
            self.step_off_stop()?;
        }
        // No exit can fire while the backend is paused, so nothing moves
        // the word between the mark and `backend.resume()`.
        let mark = self.exits.monitor.mark();
        self.backend.resume()?;
        if self.exits.monitor.commit_resume(mark) {
            debug!("{:?} resumed", self.name());
        }
        Ok(())
    }

    /// Execute exactly one instruction on `vcpu` with traps suppressed.
    ///
    /// Requires a paused VM; other vCPUs do not advance. A software
    /// breakpoint under `rip` is lifted for the step and put back after.
    /// The VM stays paused and the step itself is not reported as a
    /// state change; the current stop (if any) is considered handled.
    pub fn single_step(&self, vcpu: u32) -> Result<()> {
        self.check_vcpu(vcpu)?;
        let _table = self.lock_table();
        if !self.backend.is_paused() {
            return Err(DebugError::NotPaused);
        }
        self.step_locked(vcpu)?;
        self.exits.monitor.clear_stop();
        self.exits.monitor.settle(StateFlags::PAUSED);
        Ok(())
    }

    /// Pause the backend and record it. Called with the program lock held.
    pub(crate) fn pause_locked(&self) -> Result<()> {
        self.backend.pause()?;
        if self
            .exits
            .monitor
            .transition(|state| (!state.is_paused()).then_some(StateFlags::PAUSED))
        {
            debug!("{:?} paused", self.name());
        }
        Ok(())
    }

    /// Step the stopped vCPU past its breakpoint if it has not moved.
    /// Called with the program lock held.
    fn step_off_stop(&self) -> Result<()> {
        let Some(stop) = self.exits.monitor.stop_info() else {
            return Ok(());
        };
        if matches!(stop.cause, StopCause::Fault { .. }) || !self.backend.is_paused() {
            return Ok(());
        }
        if self.backend.read_register(stop.vcpu, Register::Rip)? != stop.rip {
            return Ok(());
        }
        debug!("stepping vCPU {} off {:#x}", stop.vcpu, stop.rip);
        self.step_locked(stop.vcpu)
    }

    /// Single-step with any patch under `rip` lifted. Called with the
    /// program lock held.
    pub(crate) fn step_locked(&self, vcpu: u32) -> Result<()> {
        let rip = self.backend.read_register(vcpu, Register::Rip)?;
        let site = self
            .vcpu_root(vcpu)
            .and_then(|root| self.resolve(root, rip))
            .ok()
            .and_then(|gpa| self.exits.view().patch(gpa).map(|p| (gpa, p.original)));

        if let Some((gpa, original)) = site {
            self.backend.write_physical(gpa, &[original])?;
        }
        let stepped = self.backend.single_step(vcpu);
        if let Some((gpa, _)) = site {
            if let Err(err) = self.backend.write_physical(gpa, &[INT3]) {
                warn!("failed to re-patch {:#x} after step: {}", gpa, err);
                stepped?;
                return Err(err.into());
            }
        }
        stepped?;
        Ok(())
    }
}
