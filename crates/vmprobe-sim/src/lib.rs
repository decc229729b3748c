//! vmprobe simulator: a deterministic software x86-64 machine behind the
//! [`vmprobe_protocol::Hypervisor`] interface.
//!
//! The simulator gives the debug core something real to drive without a
//! host hypervisor: a long-mode guest with multiple processes, a syscall
//! entry path, page tables, debug registers, MSRs and a single save slot.
//!
//! # Architecture
//!
//! - [`memory`]: Guest RAM (vm-memory) and page-table construction
//! - [`cpu`]: vCPU register file and MSRs
//! - [`interp`]: Decoder/executor for the instruction subset the guest uses
//! - [`guest`]: The synthetic kernel and processes
//! - [`scheduler`]: Seeded vCPU interleaving
//! - [`machine`]: Per-instruction trap pipeline
//! - [`snapshot`]: Save slot capture and restore
//! - [`vm`]: Runner thread and the `Hypervisor` implementation

pub mod cpu;
pub mod guest;
pub mod interp;
pub mod machine;
pub mod memory;
pub mod scheduler;
pub mod snapshot;
pub mod vm;

pub use vm::{SimConfig, SimError, SimulatedVm};
