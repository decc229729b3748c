//! vCPU register file and machine-wide MSRs.
//!
//! Each simulated vCPU keeps its architectural state in the same
//! `kvm_bindings` structures a KVM backend exchanges with the kernel
//! (`kvm_regs`, `kvm_sregs`, `kvm_debugregs`), so the save slot and the
//! register mapping look exactly like a hardware backend's.
//!
//! MSRs are modelled as a single machine-wide file: a write through any
//! vCPU is visible through every other one.

use std::collections::BTreeMap;

use kvm_bindings::{kvm_debugregs, kvm_regs, kvm_segment, kvm_sregs};
use vmprobe_protocol::{BackendError, Register, KNOWN_MSRS, MSR_IA32_EFER};

// ─── Control-register bits ───────────────────────────────────────────

/// `CR0.PE`: protected mode.
pub const CR0_PE: u64 = 1 << 0;
/// `CR0.PG`: paging.
pub const CR0_PG: u64 = 1 << 31;
/// `CR4.PAE`: physical address extension.
pub const CR4_PAE: u64 = 1 << 5;
/// `EFER.SCE`: `SYSCALL` enable.
pub const EFER_SCE: u64 = 1 << 0;
/// `EFER.LME`: long mode enable.
pub const EFER_LME: u64 = 1 << 8;
/// `EFER.LMA`: long mode active.
pub const EFER_LMA: u64 = 1 << 10;
/// RFLAGS bit 1 always reads as one.
pub const RFLAGS_FIXED: u64 = 1 << 1;
/// RFLAGS interrupt enable.
pub const RFLAGS_IF: u64 = 1 << 9;
/// DR6 reset value.
pub const DR6_INIT: u64 = 0xffff_0ff0;
/// DR7 reset value.
pub const DR7_INIT: u64 = 0x400;

/// Kernel code selector (ring 0).
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector (ring 0).
pub const KERNEL_DS: u16 = 0x10;
/// User code selector (ring 3).
pub const USER_CS: u16 = 0x33;
/// User data selector (ring 3).
pub const USER_DS: u16 = 0x2b;

/// Flat 64-bit segment with the given selector.
pub fn flat_segment(selector: u16, code: bool) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        type_: if code { 0xb } else { 0x3 },
        present: 1,
        dpl: (selector & 3) as u8,
        db: if code { 0 } else { 1 },
        s: 1,
        l: if code { 1 } else { 0 },
        g: 1,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// General-purpose registers in x86 encoding order.
const GPR_ORDER: [Register; 16] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

// ═══════════════════════════════════════════════════════════════════════
//  vCPU state
// ═══════════════════════════════════════════════════════════════════════

/// Architectural state of one vCPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct VcpuState {
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub debug: kvm_debugregs,
}

impl VcpuState {
    /// A vCPU in 64-bit user mode under page-table root `cr3`, about to
    /// execute `rip`.
    pub fn long_mode(cr3: u64, rip: u64) -> Self {
        let mut state = VcpuState::default();
        state.regs.rip = rip;
        state.regs.rflags = RFLAGS_FIXED | RFLAGS_IF;
        state.sregs.cr0 = CR0_PE | CR0_PG;
        state.sregs.cr3 = cr3;
        state.sregs.cr4 = CR4_PAE;
        state.sregs.efer = EFER_SCE | EFER_LME | EFER_LMA;
        state.sregs.cs = flat_segment(USER_CS, true);
        let data = flat_segment(USER_DS, false);
        state.sregs.ds = data;
        state.sregs.es = data;
        state.sregs.fs = data;
        state.sregs.gs = data;
        state.sregs.ss = data;
        state.debug.dr6 = DR6_INIT;
        state.debug.dr7 = DR7_INIT;
        state
    }

    /// Read one architectural register.
    pub fn get(&self, register: Register) -> u64 {
        let r = &self.regs;
        let s = &self.sregs;
        match register {
            Register::Rax => r.rax,
            Register::Rbx => r.rbx,
            Register::Rcx => r.rcx,
            Register::Rdx => r.rdx,
            Register::Rsi => r.rsi,
            Register::Rdi => r.rdi,
            Register::Rsp => r.rsp,
            Register::Rbp => r.rbp,
            Register::R8 => r.r8,
            Register::R9 => r.r9,
            Register::R10 => r.r10,
            Register::R11 => r.r11,
            Register::R12 => r.r12,
            Register::R13 => r.r13,
            Register::R14 => r.r14,
            Register::R15 => r.r15,
            Register::Rip => r.rip,
            Register::Rflags => r.rflags,
            Register::Cs => u64::from(s.cs.selector),
            Register::Ds => u64::from(s.ds.selector),
            Register::Es => u64::from(s.es.selector),
            Register::Fs => u64::from(s.fs.selector),
            Register::Gs => u64::from(s.gs.selector),
            Register::Ss => u64::from(s.ss.selector),
            Register::Cr0 => s.cr0,
            Register::Cr2 => s.cr2,
            Register::Cr3 => s.cr3,
            Register::Cr4 => s.cr4,
            Register::Cr8 => s.cr8,
            Register::Dr0 => self.debug.db[0],
            Register::Dr1 => self.debug.db[1],
            Register::Dr2 => self.debug.db[2],
            Register::Dr3 => self.debug.db[3],
            Register::Dr6 => self.debug.dr6,
            Register::Dr7 => self.debug.dr7,
            Register::GdtrBase => s.gdt.base,
            Register::GdtrLimit => u64::from(s.gdt.limit),
            Register::IdtrBase => s.idt.base,
            Register::IdtrLimit => u64::from(s.idt.limit),
            Register::FsBase => s.fs.base,
            Register::GsBase => s.gs.base,
        }
    }

    /// Write one architectural register.
    ///
    /// Narrow registers (selectors, descriptor-table limits) reject a
    /// value wider than 16 bits and are left unchanged.
    pub fn set(&mut self, register: Register, value: u64) -> Result<(), BackendError> {
        let narrow = || {
            u16::try_from(value).map_err(|_| BackendError::RegisterWidth {
                register,
                value,
                bits: u16::BITS,
            })
        };
        let r = &mut self.regs;
        let s = &mut self.sregs;
        match register {
            Register::Rax => r.rax = value,
            Register::Rbx => r.rbx = value,
            Register::Rcx => r.rcx = value,
            Register::Rdx => r.rdx = value,
            Register::Rsi => r.rsi = value,
            Register::Rdi => r.rdi = value,
            Register::Rsp => r.rsp = value,
            Register::Rbp => r.rbp = value,
            Register::R8 => r.r8 = value,
            Register::R9 => r.r9 = value,
            Register::R10 => r.r10 = value,
            Register::R11 => r.r11 = value,
            Register::R12 => r.r12 = value,
            Register::R13 => r.r13 = value,
            Register::R14 => r.r14 = value,
            Register::R15 => r.r15 = value,
            Register::Rip => r.rip = value,
            Register::Rflags => r.rflags = value,
            Register::Cs => s.cs.selector = narrow()?,
            Register::Ds => s.ds.selector = narrow()?,
            Register::Es => s.es.selector = narrow()?,
            Register::Fs => s.fs.selector = narrow()?,
            Register::Gs => s.gs.selector = narrow()?,
            Register::Ss => s.ss.selector = narrow()?,
            Register::Cr0 => s.cr0 = value,
            Register::Cr2 => s.cr2 = value,
            Register::Cr3 => s.cr3 = value,
            Register::Cr4 => s.cr4 = value,
            Register::Cr8 => s.cr8 = value,
            Register::Dr0 => self.debug.db[0] = value,
            Register::Dr1 => self.debug.db[1] = value,
            Register::Dr2 => self.debug.db[2] = value,
            Register::Dr3 => self.debug.db[3] = value,
            Register::Dr6 => self.debug.dr6 = value,
            Register::Dr7 => self.debug.dr7 = value,
            Register::GdtrBase => s.gdt.base = value,
            Register::GdtrLimit => s.gdt.limit = narrow()?,
            Register::IdtrBase => s.idt.base = value,
            Register::IdtrLimit => s.idt.limit = narrow()?,
            Register::FsBase => s.fs.base = value,
            Register::GsBase => s.gs.base = value,
        }
        Ok(())
    }

    /// General-purpose register by its x86 encoding.
    pub fn gpr(&self, encoding: u8) -> u64 {
        self.get(GPR_ORDER[usize::from(encoding & 0xf)])
    }

    /// General-purpose register by its x86 encoding (0 = rax … 7 = rdi,
    /// 8–15 = r8–r15).
    pub fn gpr_mut(&mut self, encoding: u8) -> &mut u64 {
        let r = &mut self.regs;
        match encoding & 0xf {
            0 => &mut r.rax,
            1 => &mut r.rcx,
            2 => &mut r.rdx,
            3 => &mut r.rbx,
            4 => &mut r.rsp,
            5 => &mut r.rbp,
            6 => &mut r.rsi,
            7 => &mut r.rdi,
            8 => &mut r.r8,
            9 => &mut r.r9,
            10 => &mut r.r10,
            11 => &mut r.r11,
            12 => &mut r.r12,
            13 => &mut r.r13,
            14 => &mut r.r14,
            _ => &mut r.r15,
        }
    }

    /// `true` while `CR0.PG` is set.
    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.sregs.cr0 & CR0_PG != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  MSR file
// ═══════════════════════════════════════════════════════════════════════

/// Machine-wide model-specific registers.
#[derive(Clone, Debug)]
pub struct MsrFile {
    values: BTreeMap<u32, u64>,
}

impl Default for MsrFile {
    fn default() -> Self {
        let mut values: BTreeMap<u32, u64> = KNOWN_MSRS.iter().map(|&i| (i, 0)).collect();
        values.insert(MSR_IA32_EFER, EFER_SCE | EFER_LME | EFER_LMA);
        Self { values }
    }
}

impl MsrFile {
    /// Read an MSR.
    pub fn read(&self, index: u32) -> Result<u64, BackendError> {
        self.values
            .get(&index)
            .copied()
            .ok_or(BackendError::UnknownMsr { index })
    }

    /// Write an MSR.
    pub fn write(&mut self, index: u32, value: u64) -> Result<(), BackendError> {
        match self.values.get_mut(&index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(BackendError::UnknownMsr { index }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmprobe_protocol::MSR_IA32_LSTAR;

    #[test]
    fn every_register_round_trips() {
        let mut state = VcpuState::long_mode(0x1000, 0x40_0000);
        for reg in Register::ALL {
            let value = match reg {
                Register::Cs
                | Register::Ds
                | Register::Es
                | Register::Fs
                | Register::Gs
                | Register::Ss
                | Register::GdtrLimit
                | Register::IdtrLimit => 0xbeef,
                _ => 0xdead_beef_dead_beef,
            };
            state.set(reg, value).unwrap();
            assert_eq!(state.get(reg), value, "{:?} did not round-trip", reg);
        }
    }

    #[test]
    fn narrow_registers_reject_wide_values() {
        let mut state = VcpuState::default();
        state.set(Register::Cs, 0x33).unwrap();
        assert!(matches!(
            state.set(Register::Cs, 0x1_0033),
            Err(BackendError::RegisterWidth { register: Register::Cs, bits: 16, .. })
        ));
        assert_eq!(state.get(Register::Cs), 0x33, "rejected write left the selector alone");
    }

    #[test]
    fn long_mode_defaults() {
        let state = VcpuState::long_mode(0x9000, 0x40_0000);
        assert!(state.paging_enabled());
        assert_eq!(state.get(Register::Cr3), 0x9000);
        assert_eq!(state.get(Register::Cs), u64::from(USER_CS));
        assert_eq!(state.get(Register::Dr7), DR7_INIT);
    }

    #[test]
    fn gpr_encoding_matches_x86_order() {
        let mut state = VcpuState::default();
        *state.gpr_mut(3) = 7;
        *state.gpr_mut(6) = 9;
        assert_eq!(state.get(Register::Rbx), 7);
        assert_eq!(state.get(Register::Rsi), 9);
    }

    #[test]
    fn msr_file_rejects_unknown_index() {
        let mut msrs = MsrFile::default();
        msrs.write(MSR_IA32_LSTAR, u64::MAX).unwrap();
        assert_eq!(msrs.read(MSR_IA32_LSTAR).unwrap(), u64::MAX);
        assert!(matches!(
            msrs.read(0x1234),
            Err(BackendError::UnknownMsr { index: 0x1234 })
        ));
        assert!(msrs.write(0x1234, 0).is_err());
    }
}
