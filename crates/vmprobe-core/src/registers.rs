//! Register and MSR access.
//!
//! Each read or write is a single backend round-trip; nothing is cached
//! and no cross-register consistency is implied. The core does not
//! require a paused VM, but values read from a running vCPU are stale by
//! the time they are returned.

use log::trace;
use vmprobe_protocol::Register;

use crate::error::{DebugError, Result};
use crate::session::Session;

impl Session {
    /// Read one register of `vcpu`.
    pub fn read_register(&self, vcpu: u32, register: Register) -> Result<u64> {
        self.check_vcpu(vcpu)?;
        let value = self.backend.read_register(vcpu, register)?;
        trace!("vCPU {} {:?} = {:#x}", vcpu, register, value);
        Ok(value)
    }

    /// Write one register of `vcpu`.
    ///
    /// Writing `Cr3` switches the address space later virtual accesses
    /// of this vCPU translate in.
    pub fn write_register(&self, vcpu: u32, register: Register, value: u64) -> Result<()> {
        self.check_vcpu(vcpu)?;
        trace!("vCPU {} {:?} := {:#x}", vcpu, register, value);
        self.backend.write_register(vcpu, register, value)?;
        Ok(())
    }

    /// Read a register by its wire code.
    pub fn read_register_code(&self, vcpu: u32, code: u8) -> Result<u64> {
        self.read_register(vcpu, register_from_code(code)?)
    }

    /// Write a register by its wire code.
    pub fn write_register_code(&self, vcpu: u32, code: u8, value: u64) -> Result<()> {
        self.write_register(vcpu, register_from_code(code)?, value)
    }

    /// Read MSR `index`. MSRs are machine-wide; `vcpu` is validated only.
    pub fn read_msr(&self, vcpu: u32, index: u32) -> Result<u64> {
        self.check_vcpu(vcpu)?;
        let value = self.backend.read_msr(vcpu, index)?;
        trace!("MSR {:#x} = {:#x}", index, value);
        Ok(value)
    }

    /// Write MSR `index`.
    pub fn write_msr(&self, vcpu: u32, index: u32, value: u64) -> Result<()> {
        self.check_vcpu(vcpu)?;
        trace!("MSR {:#x} := {:#x}", index, value);
        self.backend.write_msr(vcpu, index, value)?;
        Ok(())
    }
}

fn register_from_code(code: u8) -> Result<Register> {
    Register::from_code(code)
        .ok_or_else(|| DebugError::InvalidArgument(format!("unknown register code {}", code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attached, sim_config};
    use vmprobe_protocol::{MSR_IA32_LSTAR, MSR_IA32_STAR};
    use vmprobe_sim::guest::KERNEL_BASE;

    #[test]
    fn general_registers_round_trip_per_vcpu() {
        let (_vm, _p, session) = attached("reg-round-trip", sim_config());
        for vcpu in 0..2 {
            for (i, &register) in [Register::Rax, Register::R15, Register::Rflags, Register::Dr3]
                .iter()
                .enumerate()
            {
                let value = 0x1000 * (vcpu as u64 + 1) + i as u64;
                session.write_register(vcpu, register, value).unwrap();
                assert_eq!(session.read_register(vcpu, register).unwrap(), value);
            }
        }
        assert_ne!(
            session.read_register(0, Register::Rax).unwrap(),
            session.read_register(1, Register::Rax).unwrap()
        );
    }

    fn is_narrow(register: Register) -> bool {
        matches!(
            register,
            Register::Cs
                | Register::Ds
                | Register::Es
                | Register::Fs
                | Register::Gs
                | Register::Ss
                | Register::GdtrLimit
                | Register::IdtrLimit
        )
    }

    #[test]
    fn every_register_round_trips_full_width() {
        let (_vm, _p, session) = attached("reg-full-width", sim_config());
        let wide = 0xdead_beef_cafe_0010;
        for register in Register::ALL {
            let value = if is_narrow(register) { 0xbeef } else { wide };
            session.write_register(1, register, value).unwrap();
            assert_eq!(session.read_register(1, register).unwrap(), value, "{:?}", register);
        }
    }

    #[test]
    fn narrow_registers_reject_values_that_do_not_fit() {
        let (_vm, _p, session) = attached("reg-narrow", sim_config());
        for register in Register::ALL.into_iter().filter(|&r| is_narrow(r)) {
            session.write_register(0, register, 0x1234).unwrap();
            assert!(
                matches!(
                    session.write_register(0, register, 0xdead_beef_cafe_0010),
                    Err(DebugError::InvalidArgument(_))
                ),
                "{:?}",
                register
            );
            assert!(matches!(
                session.write_register(0, register, 0x1_0000),
                Err(DebugError::InvalidArgument(_))
            ));
            assert_eq!(session.read_register(0, register).unwrap(), 0x1234);
        }
    }

    #[test]
    fn every_register_is_addressable() {
        let (_vm, _p, session) = attached("reg-all", sim_config());
        for register in Register::ALL {
            session.read_register(0, register).unwrap();
        }
    }

    #[test]
    fn wire_codes() {
        let (_vm, _p, session) = attached("reg-codes", sim_config());
        session
            .write_register_code(1, Register::Rbx.code(), 0xfeed)
            .unwrap();
        assert_eq!(session.read_register(1, Register::Rbx).unwrap(), 0xfeed);
        assert!(matches!(
            session.read_register_code(0, 200),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn msrs_round_trip_and_are_machine_wide() {
        let (_vm, _p, session) = attached("reg-msr", sim_config());
        let original = session.read_msr(0, MSR_IA32_LSTAR).unwrap();
        assert_eq!(original, KERNEL_BASE);
        session.write_msr(0, MSR_IA32_LSTAR, 0xffff_8000_dead_0000).unwrap();
        assert_eq!(
            session.read_msr(1, MSR_IA32_LSTAR).unwrap(),
            0xffff_8000_dead_0000
        );
        session.write_msr(0, MSR_IA32_LSTAR, original).unwrap();
        assert_eq!(session.read_msr(0, MSR_IA32_LSTAR).unwrap(), original);

        session.write_msr(1, MSR_IA32_STAR, 0x0023_0010_0000_0000).unwrap();
        assert_eq!(
            session.read_msr(0, MSR_IA32_STAR).unwrap(),
            0x0023_0010_0000_0000
        );
        assert!(matches!(
            session.read_msr(0, 0x1234),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn vcpu_index_is_checked() {
        let (_vm, _p, session) = attached("reg-vcpu", sim_config());
        assert!(matches!(
            session.read_register(2, Register::Rip),
            Err(DebugError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.write_msr(5, MSR_IA32_LSTAR, 0),
            Err(DebugError::InvalidArgument(_))
        ));
    }
}
