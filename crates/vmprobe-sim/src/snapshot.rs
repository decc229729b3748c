//! The machine's single save slot.

use log::info;

use crate::cpu::{MsrFile, VcpuState};
use crate::machine::Machine;
use crate::memory::MemoryError;
use crate::scheduler::SchedulerSnapshot;

/// Everything needed to put the machine back to an exact point.
///
/// Page traps are debugger configuration, not guest state, and are left
/// out on purpose: a restore keeps whatever traps are armed at the time.
#[derive(Clone, Debug)]
pub struct MachineSnapshot {
    pub vcpus: Vec<VcpuState>,
    pub msrs: MsrFile,
    pub memory: Vec<u8>,
    pub scheduler: SchedulerSnapshot,
    pub retired: u64,
}

impl MachineSnapshot {
    /// Capture the complete state of `machine`.
    pub fn capture(machine: &Machine) -> Result<Self, MemoryError> {
        let memory = machine.memory.dump()?;
        info!(
            "Machine state captured: {} vCPUs, {} bytes of RAM, {} retired",
            machine.vcpus.len(),
            memory.len(),
            machine.retired,
        );
        Ok(Self {
            vcpus: machine.vcpus.clone(),
            msrs: machine.msrs.clone(),
            memory,
            scheduler: machine.scheduler.snapshot(),
            retired: machine.retired,
        })
    }

    /// Overwrite the live state of `machine`.
    pub fn restore(&self, machine: &mut Machine) -> Result<(), MemoryError> {
        machine.memory.restore(&self.memory)?;
        machine.vcpus.clone_from(&self.vcpus);
        machine.msrs = self.msrs.clone();
        machine.scheduler.restore(&self.scheduler);
        machine.retired = self.retired;
        info!("Machine state restored to {} retired", self.retired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest;
    use crate::memory::GuestMemoryManager;
    use crate::scheduler::{SchedulerConfig, VcpuScheduler};
    use std::collections::HashMap;
    use vmprobe_protocol::{Register, TrapMask, MSR_IA32_LSTAR};

    fn machine() -> Machine {
        let memory = GuestMemoryManager::new(8 << 20).unwrap();
        let image = guest::build(&memory, 2, 2).unwrap();
        Machine {
            memory,
            vcpus: image.vcpus,
            msrs: image.msrs,
            traps: HashMap::new(),
            scheduler: VcpuScheduler::new(2, &SchedulerConfig::default()),
            paused: false,
            shutdown: false,
            saved: None,
            retired: 0,
        }
    }

    #[test]
    fn restore_rewinds_registers_memory_and_msrs() {
        let mut m = machine();
        m.run_batch(None, 10);
        let snap = MachineSnapshot::capture(&m).unwrap();
        let rip = m.vcpus[0].get(Register::Rip);

        m.run_batch(None, 500);
        m.msrs.write(MSR_IA32_LSTAR, 0).unwrap();
        m.memory.write(0x5000, &[0xaa; 16]).unwrap();

        snap.restore(&mut m).unwrap();
        assert_eq!(m.vcpus[0].get(Register::Rip), rip);
        assert_eq!(m.msrs.read(MSR_IA32_LSTAR).unwrap(), guest::KERNEL_BASE);
        let mut buf = [0u8; 16];
        m.memory.read(0x5000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(m.retired, snap.retired);
    }

    #[test]
    fn traps_survive_restore() {
        let mut m = machine();
        let snap = MachineSnapshot::capture(&m).unwrap();
        m.traps.insert(0x20_0000, TrapMask::EXECUTE);
        snap.restore(&mut m).unwrap();
        assert_eq!(m.traps.get(&0x20_0000), Some(&TrapMask::EXECUTE));
    }

    #[test]
    fn restored_machine_replays_identically() {
        let mut m = machine();
        m.run_batch(None, 77);
        let snap = MachineSnapshot::capture(&m).unwrap();

        m.run_batch(None, 300);
        let first: Vec<u64> = m.vcpus.iter().map(|v| v.regs.rip).collect();

        snap.restore(&mut m).unwrap();
        m.run_batch(None, 300);
        let second: Vec<u64> = m.vcpus.iter().map(|v| v.regs.rip).collect();
        assert_eq!(first, second);
    }
}
