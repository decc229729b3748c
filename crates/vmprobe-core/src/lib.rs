//! vmprobe core: a debug control plane for hypervisor-hosted VMs.
//!
//! A controlling process attaches a [`Session`] to a VM published by name,
//! then pauses, inspects and mutates its architectural state (registers,
//! MSRs, physical and virtual memory), sets software, page and hardware
//! breakpoints, single-steps vCPUs and saves/restores the whole machine.
//! Breakpoint hits arrive asynchronously and are observed through the
//! level state word and the edge-triggered "state changed" signal.
//!
//! # Architecture
//!
//! - [`transport`]: Name-based rendezvous and the one-debugger lease
//! - [`session`]: Session lifecycle, configuration, program lock
//! - [`monitor`]: State word, generation counter, stop details
//! - [`registers`]: Register and MSR access
//! - [`memory`]: Physical/virtual access and translation
//! - [`breakpoints`]: Fixed-capacity breakpoint table
//! - [`exits`]: Guest-exit routing (the hypervisor-facing handler)
//! - [`execution`]: Pause, resume, single-step
//! - [`snapshot`]: One save slot per session
//! - [`timer`]: Cancellable deadlines for polling loops
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vmprobe_core::{AddressSpace, BreakpointRequest, Deadline, Session, StateFlags};
//!
//! # fn main() -> vmprobe_core::Result<()> {
//! let session = Session::open("guest0")?;
//! session.init()?;
//! let lstar = session.read_msr(0, vmprobe_core::MSR_IA32_LSTAR)?;
//! session.set_breakpoint(BreakpointRequest::software(AddressSpace::Virtual, lstar))?;
//! session.resume()?;
//! let deadline = Deadline::after(Duration::from_secs(1));
//! while let Some(state) = session.wait_for_state_change(&deadline)? {
//!     if state.contains(StateFlags::BREAKPOINT_HIT) {
//!         println!("hit: {:?}", session.stop_info()?);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod breakpoints;
pub mod error;
pub mod execution;
pub mod exits;
pub mod memory;
pub mod monitor;
pub mod registers;
pub mod session;
pub mod snapshot;
pub mod timer;
pub mod transport;

pub use breakpoints::{BreakpointId, BreakpointInfo, BreakpointRequest};
pub use error::{DebugError, Result, TransportError};
pub use monitor::{StopCause, StopInfo};
pub use session::{Session, SessionConfig};
pub use timer::Deadline;
pub use transport::{Publication, Transport};

pub use vmprobe_protocol::{
    Access, AddressSpace, AsidFilter, BreakpointKind, CpuTarget, Register, StateFlags,
    StopOrigin, MAX_BREAKPOINTS, MSR_IA32_CSTAR, MSR_IA32_EFER, MSR_IA32_FMASK,
    MSR_IA32_FS_BASE, MSR_IA32_GS_BASE, MSR_IA32_KERNEL_GS_BASE, MSR_IA32_LSTAR,
    MSR_IA32_STAR, MSR_IA32_SYSENTER_CS, MSR_IA32_SYSENTER_EIP, MSR_IA32_SYSENTER_ESP,
    PAGE_SIZE,
};
