//! [`SimulatedVm`]: a running simulated machine behind the [`Hypervisor`]
//! trait.
//!
//! # Execution model
//!
//! A dedicated runner thread executes the machine in batches of
//! [`SimConfig::batch`] instructions. Each batch runs under the machine
//! lock, so every `Hypervisor` call (which takes the same lock) observes
//! the machine between two instructions and is atomic with respect to
//! guest execution. While paused the runner sleeps on a condition
//! variable.
//!
//! The exit handler is called from inside a batch with the machine lock
//! held.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use thiserror::Error;
use vmprobe_protocol::{
    page_base, BackendError, ExitHandler, Hypervisor, Register, TrapMask,
};

use crate::guest;
use crate::interp::Fault;
use crate::machine::Machine;
use crate::memory::{GuestMemoryManager, MemoryError, MIN_MEMORY_SIZE};
use crate::scheduler::{SchedulerConfig, VcpuScheduler};
use crate::snapshot::MachineSnapshot;

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Configuration for a simulated VM.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of vCPUs.
    pub vcpus: usize,
    /// Number of guest processes (distinct page-table roots).
    pub processes: usize,
    /// Guest RAM in bytes.
    pub memory_size: usize,
    /// vCPU scheduling.
    pub scheduler: SchedulerConfig,
    /// Instructions per runner batch.
    pub batch: u64,
    /// Start with the machine paused.
    pub start_paused: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vcpus: 2,
            processes: 2,
            memory_size: 16 * 1024 * 1024,
            scheduler: SchedulerConfig::default(),
            batch: 256,
            start_paused: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors from building or running a simulated VM.
#[derive(Error, Debug)]
pub enum SimError {
    /// Guest memory could not be created or populated.
    #[error("guest memory: {0}")]
    Memory(#[from] MemoryError),

    /// The guest image could not be set up.
    #[error("guest setup: {0}")]
    Setup(#[from] BackendError),

    /// The configuration cannot be booted.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The runner thread could not be spawned.
    #[error("failed to spawn runner thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<MemoryError> for BackendError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfRange { address, len } => BackendError::PhysicalRange { address, len },
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

impl From<SimError> for BackendError {
    fn from(err: SimError) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SimulatedVm
// ═══════════════════════════════════════════════════════════════════════

struct Shared {
    machine: Mutex<Machine>,
    wake: Condvar,
    handler: Mutex<Option<Arc<dyn ExitHandler>>>,
    batch: u64,
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn ExitHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A booted simulated machine with its runner thread.
///
/// Dropping the VM stops and joins the runner.
pub struct SimulatedVm {
    shared: Arc<Shared>,
    runner: Mutex<Option<JoinHandle<()>>>,
    roots: Vec<u64>,
    cpu_count: u32,
    memory_size: u64,
}

impl SimulatedVm {
    /// Build the guest and start the runner thread.
    ///
    /// # Errors
    ///
    /// - [`SimError::Config`] for zero vCPUs or too little RAM.
    /// - [`SimError::Memory`] if guest memory cannot be set up.
    /// - [`SimError::Spawn`] if the runner thread cannot start.
    pub fn boot(config: SimConfig) -> Result<Self, SimError> {
        if config.vcpus == 0 {
            return Err(SimError::Config("at least one vCPU is required".into()));
        }
        if config.memory_size < MIN_MEMORY_SIZE {
            return Err(SimError::Config(format!(
                "memory size {} is below the minimum of {}",
                config.memory_size, MIN_MEMORY_SIZE
            )));
        }
        if config.processes == 0 || config.processes > guest::MAX_PROCESSES {
            return Err(SimError::Config(format!(
                "process count must be 1..={}",
                guest::MAX_PROCESSES
            )));
        }

        let memory = GuestMemoryManager::new(config.memory_size)?;
        let image = guest::build(&memory, config.processes, config.vcpus)?;
        let roots = image.roots.clone();
        let machine = Machine {
            memory,
            vcpus: image.vcpus,
            msrs: image.msrs,
            traps: Default::default(),
            scheduler: VcpuScheduler::new(config.vcpus, &config.scheduler),
            paused: config.start_paused,
            shutdown: false,
            saved: None,
            retired: 0,
        };

        let shared = Arc::new(Shared {
            machine: Mutex::new(machine),
            wake: Condvar::new(),
            handler: Mutex::new(None),
            batch: config.batch.max(1),
        });

        let runner_shared = Arc::clone(&shared);
        let runner = thread::Builder::new()
            .name("vmprobe-sim".into())
            .spawn(move || run(runner_shared))
            .map_err(SimError::Spawn)?;

        info!(
            "Simulated VM booted: {} vCPUs, {} processes, {} MB",
            config.vcpus,
            config.processes,
            config.memory_size / (1024 * 1024),
        );

        Ok(Self {
            shared,
            runner: Mutex::new(Some(runner)),
            roots,
            cpu_count: config.vcpus as u32,
            memory_size: config.memory_size as u64,
        })
    }

    /// Instructions retired since boot.
    pub fn retired(&self) -> u64 {
        self.shared.machine().retired
    }

    /// Page-table root of each guest process, in process order.
    pub fn process_roots(&self) -> &[u64] {
        &self.roots
    }

    fn check_vcpu(&self, vcpu: u32) -> Result<usize, BackendError> {
        if vcpu < self.cpu_count {
            Ok(vcpu as usize)
        } else {
            Err(BackendError::InvalidVcpu { vcpu })
        }
    }
}

impl Drop for SimulatedVm {
    fn drop(&mut self) {
        self.shared.machine().shutdown = true;
        self.shared.wake.notify_all();
        let handle = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("simulator runner thread panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let mut machine = shared.machine();
        while machine.paused && !machine.shutdown {
            machine = shared
                .wake
                .wait(machine)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if machine.shutdown {
            debug!("simulator runner exiting");
            return;
        }
        // Read under the machine lock; detach clears it under the same lock.
        let handler = shared.handler();
        machine.run_batch(handler.as_deref(), shared.batch);
        drop(machine);
        thread::yield_now();
    }
}

fn fault_error(vcpu: u32, fault: Fault) -> BackendError {
    BackendError::GuestFault {
        vcpu,
        vector: fault.vector,
    }
}

impl Hypervisor for SimulatedVm {
    fn attach(&self, handler: Arc<dyn ExitHandler>) -> Result<(), BackendError> {
        let mut slot = self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(BackendError::HandlerAttached);
        }
        *slot = Some(handler);
        debug!("exit handler attached");
        Ok(())
    }

    fn detach(&self) {
        // Taking the machine lock first waits out a batch that may still
        // be using the old handler.
        let _machine = self.shared.machine();
        self.shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("exit handler detached");
    }

    fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    fn physical_memory_size(&self) -> u64 {
        self.memory_size
    }

    fn is_paused(&self) -> bool {
        self.shared.machine().paused
    }

    fn pause(&self) -> Result<(), BackendError> {
        self.shared.machine().paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), BackendError> {
        self.shared.machine().paused = false;
        self.shared.wake.notify_all();
        Ok(())
    }

    fn single_step(&self, vcpu: u32) -> Result<(), BackendError> {
        let idx = self.check_vcpu(vcpu)?;
        let mut machine = self.shared.machine();
        if !machine.paused {
            return Err(BackendError::NotPaused);
        }
        machine
            .step_untrapped(idx)
            .map_err(|fault| fault_error(vcpu, fault))
    }

    fn read_register(&self, vcpu: u32, register: Register) -> Result<u64, BackendError> {
        let idx = self.check_vcpu(vcpu)?;
        Ok(self.shared.machine().vcpus[idx].get(register))
    }

    fn write_register(
        &self,
        vcpu: u32,
        register: Register,
        value: u64,
    ) -> Result<(), BackendError> {
        let idx = self.check_vcpu(vcpu)?;
        self.shared.machine().vcpus[idx].set(register, value)
    }

    fn read_msr(&self, vcpu: u32, index: u32) -> Result<u64, BackendError> {
        self.check_vcpu(vcpu)?;
        self.shared.machine().msrs.read(index)
    }

    fn write_msr(&self, vcpu: u32, index: u32, value: u64) -> Result<(), BackendError> {
        self.check_vcpu(vcpu)?;
        self.shared.machine().msrs.write(index, value)
    }

    fn read_physical(&self, gpa: u64, buf: &mut [u8]) -> Result<(), BackendError> {
        Ok(self.shared.machine().memory.read(gpa, buf)?)
    }

    fn write_physical(&self, gpa: u64, data: &[u8]) -> Result<(), BackendError> {
        Ok(self.shared.machine().memory.write(gpa, data)?)
    }

    fn set_page_trap(&self, frame: u64, mask: TrapMask) -> Result<(), BackendError> {
        let frame = page_base(frame);
        if frame >= self.memory_size {
            return Err(BackendError::PhysicalRange {
                address: frame,
                len: 1,
            });
        }
        let mut machine = self.shared.machine();
        if mask.is_empty() {
            machine.traps.remove(&frame);
        } else {
            machine.traps.insert(frame, mask);
        }
        Ok(())
    }

    fn clear_page_trap(&self, frame: u64) -> Result<(), BackendError> {
        self.shared.machine().traps.remove(&page_base(frame));
        Ok(())
    }

    fn save_state(&self) -> Result<(), BackendError> {
        let mut machine = self.shared.machine();
        let snapshot = MachineSnapshot::capture(&machine)?;
        machine.saved = Some(snapshot);
        Ok(())
    }

    fn restore_state(&self) -> Result<(), BackendError> {
        let mut machine = self.shared.machine();
        let snapshot = machine.saved.take().ok_or(BackendError::NoSavedState)?;
        let result = snapshot.restore(&mut machine);
        machine.saved = Some(snapshot);
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use vmprobe_protocol::{ExitContext, ExitVerdict, GuestExit, MSR_IA32_LSTAR};

    fn paused_vm() -> SimulatedVm {
        SimulatedVm::boot(SimConfig {
            start_paused: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn rejects_bad_configs() {
        let zero = SimConfig {
            vcpus: 0,
            ..Default::default()
        };
        assert!(matches!(SimulatedVm::boot(zero), Err(SimError::Config(_))));
        let tiny = SimConfig {
            memory_size: 4096,
            ..Default::default()
        };
        assert!(matches!(SimulatedVm::boot(tiny), Err(SimError::Config(_))));
    }

    #[test]
    fn paused_vm_does_not_advance() {
        let vm = paused_vm();
        let rip = vm.read_register(0, Register::Rip).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(vm.read_register(0, Register::Rip).unwrap(), rip);
        assert_eq!(vm.retired(), 0);
    }

    #[test]
    fn resume_runs_guest_and_pause_stops_it() {
        let vm = paused_vm();
        vm.resume().unwrap();
        assert!(wait_until(|| vm.retired() > 1_000));
        vm.pause().unwrap();
        let frozen = vm.retired();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(vm.retired(), frozen);
        assert!(vm.read_register(0, Register::Rbx).unwrap() > 0);
    }

    #[test]
    fn single_step_requires_pause() {
        let vm = SimulatedVm::boot(SimConfig::default()).unwrap();
        assert!(matches!(vm.single_step(0), Err(BackendError::NotPaused)));
        vm.pause().unwrap();
        let rip = vm.read_register(0, Register::Rip).unwrap();
        vm.single_step(0).unwrap();
        assert_ne!(vm.read_register(0, Register::Rip).unwrap(), rip);
    }

    #[test]
    fn invalid_vcpu_and_msr() {
        let vm = paused_vm();
        assert!(matches!(
            vm.read_register(9, Register::Rax),
            Err(BackendError::InvalidVcpu { vcpu: 9 })
        ));
        assert!(matches!(
            vm.read_msr(0, 0xdead),
            Err(BackendError::UnknownMsr { .. })
        ));
        assert_eq!(vm.read_msr(1, MSR_IA32_LSTAR).unwrap(), guest::KERNEL_BASE);
    }

    #[test]
    fn physical_bounds_are_checked() {
        let vm = paused_vm();
        let end = vm.physical_memory_size();
        let mut buf = [0u8; 8];
        assert!(matches!(
            vm.read_physical(end - 4, &mut buf),
            Err(BackendError::PhysicalRange { .. })
        ));
        assert!(vm.set_page_trap(end, TrapMask::EXECUTE).is_err());
    }

    #[test]
    fn restore_without_save_fails() {
        let vm = paused_vm();
        assert!(matches!(vm.restore_state(), Err(BackendError::NoSavedState)));
        vm.save_state().unwrap();
        vm.restore_state().unwrap();
        vm.restore_state().unwrap();
    }

    struct StopAll;

    impl ExitHandler for StopAll {
        fn on_exit(&self, _: &ExitContext, _: &GuestExit) -> ExitVerdict {
            ExitVerdict::Stop
        }
    }

    #[test]
    fn second_handler_is_rejected() {
        let vm = paused_vm();
        vm.attach(Arc::new(StopAll)).unwrap();
        assert!(matches!(
            vm.attach(Arc::new(StopAll)),
            Err(BackendError::HandlerAttached)
        ));
        vm.detach();
        vm.attach(Arc::new(StopAll)).unwrap();
    }

    #[test]
    fn trap_with_handler_pauses_machine() {
        let vm = paused_vm();
        vm.attach(Arc::new(StopAll)).unwrap();
        vm.set_page_trap(crate::memory::KERNEL_TEXT_PHYS, TrapMask::EXECUTE)
            .unwrap();
        vm.resume().unwrap();
        assert!(wait_until(|| vm.is_paused()));
        let rip0 = vm.read_register(0, Register::Rip).unwrap();
        let rip1 = vm.read_register(1, Register::Rip).unwrap();
        assert!(rip0 == guest::KERNEL_BASE || rip1 == guest::KERNEL_BASE);
    }
}
