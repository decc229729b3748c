//! The simulated machine: memory, vCPUs, MSRs, page traps and the
//! per-instruction trap pipeline.
//!
//! # Trap pipeline
//!
//! Before an instruction retires, [`Machine::step`] checks, in order:
//!
//! 1. DR0–DR3 execute breakpoints against `rip`.
//! 2. Execute page traps on the frame `rip` lives in.
//! 3. A patched `int3` at `rip`.
//! 4. DR0–DR3 data breakpoints and read/write page traps against the
//!    memory operand.
//!
//! Each hit is reported to the attached [`ExitHandler`]. `Stop` pauses the
//! whole machine with the vCPU still on the instruction; the other
//! verdicts dismiss that one trap and the pipeline carries on. Faults
//! always pause the machine.

use std::collections::HashMap;

use log::{debug, warn};
use vmprobe_protocol::paging;
use vmprobe_protocol::{
    dr7, page_base, ExitContext, ExitHandler, ExitVerdict, GuestExit, TrapMask, INT3,
    HW_BREAKPOINT_SLOTS, PAGE_SIZE,
};

use crate::cpu::{MsrFile, VcpuState, DR6_INIT};
use crate::interp::{self, Decoded, Fault, MAX_INSN_LEN, VECTOR_PF, VECTOR_UD};
use crate::memory::GuestMemoryManager;
use crate::scheduler::VcpuScheduler;
use crate::snapshot::MachineSnapshot;

/// Result of one scheduled instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction retired.
    Retired,
    /// The machine paused before the instruction retired.
    Stopped,
}

/// Complete state of the simulated machine.
pub struct Machine {
    pub memory: GuestMemoryManager,
    pub vcpus: Vec<VcpuState>,
    pub msrs: MsrFile,
    pub traps: HashMap<u64, TrapMask>,
    pub scheduler: VcpuScheduler,
    pub paused: bool,
    pub shutdown: bool,
    pub saved: Option<MachineSnapshot>,
    /// Instructions retired since boot (restored with the save slot).
    pub retired: u64,
}

/// Instruction bytes fetched at `rip`.
struct Fetched {
    bytes: [u8; MAX_INSN_LEN],
    len: usize,
    gpa: u64,
}

impl Machine {
    /// Translate a linear address of `vcpu` through its current `CR3`.
    pub fn translate(&self, vcpu: usize, linear: u64) -> Option<u64> {
        let state = &self.vcpus[vcpu];
        if !state.paging_enabled() {
            return Some(linear);
        }
        paging::translate(state.sregs.cr3, linear, |a| self.memory.read_u64(a))
            .ok()
            .flatten()
            .map(|t| t.gpa)
    }

    fn fetch(&self, vcpu: usize, rip: u64) -> Result<Fetched, Fault> {
        let mut out = Fetched {
            bytes: [0u8; MAX_INSN_LEN],
            len: 0,
            gpa: 0,
        };
        // (linear, gpa) of the page the current byte lives in.
        let mut base: Option<(u64, u64)> = None;
        for i in 0..MAX_INSN_LEN {
            let linear = rip.wrapping_add(i as u64);
            if i == 0 || linear % PAGE_SIZE == 0 {
                base = self.translate(vcpu, linear).map(|gpa| (linear, gpa));
            }
            let gpa = match base {
                Some((base_linear, base_gpa)) => base_gpa + (linear - base_linear),
                None => break,
            };
            let mut byte = [0u8; 1];
            if self.memory.read(gpa, &mut byte).is_err() {
                break;
            }
            if i == 0 {
                out.gpa = gpa;
            }
            out.bytes[i] = byte[0];
            out.len += 1;
        }
        if out.len == 0 {
            return Err(Fault { vector: VECTOR_PF });
        }
        Ok(out)
    }

    fn deliver(
        &mut self,
        handler: Option<&dyn ExitHandler>,
        vcpu: usize,
        exit: GuestExit,
    ) -> ExitVerdict {
        let state = &self.vcpus[vcpu];
        let ctx = ExitContext {
            vcpu: vcpu as u32,
            rip: state.regs.rip,
            cr3: state.sregs.cr3,
        };
        let verdict = match handler {
            Some(h) => h.on_exit(&ctx, &exit),
            None => ExitVerdict::Stop,
        };
        debug!("vCPU {} {:?} at {:#x} -> {:?}", vcpu, exit, ctx.rip, verdict);
        if verdict == ExitVerdict::Stop {
            self.paused = true;
        }
        verdict
    }

    fn fault(&mut self, handler: Option<&dyn ExitHandler>, vcpu: usize, fault: Fault) {
        let verdict = self.deliver(handler, vcpu, GuestExit::Fault { vector: fault.vector });
        if verdict != ExitVerdict::Stop {
            warn!(
                "vCPU {} fault {} cannot be dismissed, pausing",
                vcpu, fault.vector
            );
            self.paused = true;
        }
    }

    /// Debug-register slot of `vcpu` matching an access, if any.
    fn debug_match(&self, vcpu: usize, linear: u64, len: u64, access: TrapMask) -> Option<usize> {
        let debug = &self.vcpus[vcpu].debug;
        (0..HW_BREAKPOINT_SLOTS).find(|&slot| {
            if !dr7::is_enabled(debug.dr7, slot) {
                return false;
            }
            let rw = dr7::rw_field(debug.dr7, slot);
            let wanted = match rw {
                0b00 => TrapMask::EXECUTE,
                0b01 => TrapMask::WRITE,
                _ => TrapMask::READ | TrapMask::WRITE,
            };
            if !wanted.intersects(access) {
                return false;
            }
            let start = debug.db[slot];
            let end = start.wrapping_add(dr7::len_field(debug.dr7, slot));
            if access == TrapMask::EXECUTE {
                linear == start
            } else {
                linear < end && start < linear.wrapping_add(len)
            }
        })
    }

    fn raise_debug(
        &mut self,
        handler: Option<&dyn ExitHandler>,
        vcpu: usize,
        slot: usize,
    ) -> ExitVerdict {
        let dr6 = DR6_INIT | (1 << slot);
        self.vcpus[vcpu].debug.dr6 = dr6;
        self.deliver(
            handler,
            vcpu,
            GuestExit::DebugTrap {
                slot: slot as u8,
                dr6,
            },
        )
    }

    fn page_trapped(&self, gpa: u64, access: TrapMask) -> bool {
        self.traps
            .get(&page_base(gpa))
            .is_some_and(|mask| mask.intersects(access))
    }

    /// Run one instruction of `vcpu` through the trap pipeline.
    pub fn step(&mut self, vcpu: usize, handler: Option<&dyn ExitHandler>) -> StepOutcome {
        let rip = self.vcpus[vcpu].regs.rip;

        if let Some(slot) = self.debug_match(vcpu, rip, 1, TrapMask::EXECUTE) {
            if self.raise_debug(handler, vcpu, slot) == ExitVerdict::Stop {
                return StepOutcome::Stopped;
            }
        }

        let mut fetched = match self.fetch(vcpu, rip) {
            Ok(f) => f,
            Err(fault) => {
                self.fault(handler, vcpu, fault);
                return StepOutcome::Stopped;
            }
        };

        if self.page_trapped(fetched.gpa, TrapMask::EXECUTE) {
            let exit = GuestExit::PageTrap {
                gpa: fetched.gpa,
                linear: rip,
                access: TrapMask::EXECUTE,
            };
            if self.deliver(handler, vcpu, exit) == ExitVerdict::Stop {
                return StepOutcome::Stopped;
            }
        }

        if fetched.bytes[0] == INT3 {
            let exit = GuestExit::SoftwareBreakpoint { gpa: fetched.gpa };
            match self.deliver(handler, vcpu, exit) {
                ExitVerdict::Stop => return StepOutcome::Stopped,
                ExitVerdict::StepOverPatched { original } => fetched.bytes[0] = original,
                ExitVerdict::StepOver | ExitVerdict::Reinject => {}
            }
        }

        let decoded = match interp::decode(&fetched.bytes[..fetched.len]) {
            Some(d) => d,
            None => {
                self.fault(handler, vcpu, Fault { vector: VECTOR_UD });
                return StepOutcome::Stopped;
            }
        };

        let operand = match self.resolve_operand(vcpu, &decoded) {
            Ok(op) => op,
            Err(fault) => {
                self.fault(handler, vcpu, fault);
                return StepOutcome::Stopped;
            }
        };

        if let Some((linear, gpa, access)) = operand {
            if let Some(slot) = self.debug_match(vcpu, linear, 8, access) {
                if self.raise_debug(handler, vcpu, slot) == ExitVerdict::Stop {
                    return StepOutcome::Stopped;
                }
            }
            if self.page_trapped(gpa, access) {
                let exit = GuestExit::PageTrap {
                    gpa,
                    linear,
                    access,
                };
                if self.deliver(handler, vcpu, exit) == ExitVerdict::Stop {
                    return StepOutcome::Stopped;
                }
            }
        }

        let gpa = operand.map(|(_, gpa, _)| gpa);
        match interp::execute(&decoded, &mut self.vcpus[vcpu], &self.msrs, &self.memory, gpa) {
            Ok(()) => {
                self.retired += 1;
                StepOutcome::Retired
            }
            Err(fault) => {
                self.fault(handler, vcpu, fault);
                StepOutcome::Stopped
            }
        }
    }

    /// Execute one instruction of `vcpu` with every trap suppressed.
    pub fn step_untrapped(&mut self, vcpu: usize) -> Result<(), Fault> {
        let rip = self.vcpus[vcpu].regs.rip;
        let fetched = self.fetch(vcpu, rip)?;
        let decoded =
            interp::decode(&fetched.bytes[..fetched.len]).ok_or(Fault { vector: VECTOR_UD })?;
        let operand = self.resolve_operand(vcpu, &decoded)?;
        let gpa = operand.map(|(_, gpa, _)| gpa);
        interp::execute(&decoded, &mut self.vcpus[vcpu], &self.msrs, &self.memory, gpa)?;
        self.retired += 1;
        Ok(())
    }

    fn resolve_operand(
        &self,
        vcpu: usize,
        decoded: &Decoded,
    ) -> Result<Option<(u64, u64, TrapMask)>, Fault> {
        match decoded.memory_operand(&self.vcpus[vcpu]) {
            None => Ok(None),
            Some((linear, access)) => {
                let gpa = self
                    .translate(vcpu, linear)
                    .ok_or(Fault { vector: VECTOR_PF })?;
                Ok(Some((linear, gpa, access)))
            }
        }
    }

    /// Run up to `budget` scheduled instructions, stopping early when the
    /// machine pauses.
    pub fn run_batch(&mut self, handler: Option<&dyn ExitHandler>, budget: u64) {
        for _ in 0..budget {
            if self.paused || self.shutdown {
                return;
            }
            let vcpu = self.scheduler.active();
            if self.step(vcpu, handler) == StepOutcome::Stopped {
                return;
            }
            self.scheduler.retire();
        }
    }
}
