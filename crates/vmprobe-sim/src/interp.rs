//! Decoder and executor for the x86-64 subset the simulated guest uses.
//!
//! | Bytes                 | Instruction          |
//! |-----------------------|----------------------|
//! | `90`                  | `nop`                |
//! | `cc`                  | `int3`               |
//! | `f4`                  | `hlt` (no-op here)   |
//! | `0f 05`               | `syscall`            |
//! | `48 0f 07`            | `sysretq`            |
//! | `48/49 ff c0+r`       | `inc r64`            |
//! | `eb ib`               | `jmp rel8`           |
//! | `48/49 b8+r iq`       | `mov r64, imm64`     |
//! | `48 89 /r` (mod 00)   | `mov [r64], r64`     |
//! | `48 8b /r` (mod 00)   | `mov r64, [r64]`     |
//!
//! Anything else raises `#UD`.

use vmprobe_protocol::{TrapMask, MSR_IA32_FMASK, MSR_IA32_LSTAR};

use crate::cpu::{flat_segment, MsrFile, VcpuState, KERNEL_CS, KERNEL_DS, RFLAGS_FIXED};
use crate::cpu::{USER_CS, USER_DS};
use crate::memory::GuestMemoryManager;

/// Longest encoding in the subset.
pub const MAX_INSN_LEN: usize = 10;

/// Invalid opcode.
pub const VECTOR_UD: u8 = 6;
/// General protection.
pub const VECTOR_GP: u8 = 13;
/// Page fault.
pub const VECTOR_PF: u8 = 14;

/// A guest exception raised while fetching or executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
}

/// Decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Nop,
    Int3,
    Syscall,
    Sysret,
    Inc { reg: u8 },
    Jmp { rel: i8 },
    MovImm { reg: u8, imm: u64 },
    Store { base: u8, src: u8 },
    Load { base: u8, dst: u8 },
}

/// An instruction with its encoded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub insn: Insn,
    pub len: u8,
}

impl Decoded {
    /// Linear address and access kind of the memory operand, if any.
    pub fn memory_operand(&self, state: &VcpuState) -> Option<(u64, TrapMask)> {
        match self.insn {
            Insn::Store { base, .. } => Some((state.gpr(base), TrapMask::WRITE)),
            Insn::Load { base, .. } => Some((state.gpr(base), TrapMask::READ)),
            _ => None,
        }
    }
}

/// Decode the instruction at the start of `bytes`.
///
/// Returns `None` for unsupported or truncated encodings.
pub fn decode(bytes: &[u8]) -> Option<Decoded> {
    let op = |len: u8, insn: Insn| Some(Decoded { insn, len });
    match *bytes {
        [0x90, ..] | [0xf4, ..] => op(1, Insn::Nop),
        [0xcc, ..] => op(1, Insn::Int3),
        [0x0f, 0x05, ..] => op(2, Insn::Syscall),
        [0xeb, rel, ..] => op(2, Insn::Jmp { rel: rel as i8 }),
        [0x48, 0x0f, 0x07, ..] => op(3, Insn::Sysret),
        [rex @ (0x48 | 0x49), 0xff, modrm, ..] if modrm & 0xf8 == 0xc0 => {
            let reg = (modrm & 7) | ((rex & 1) << 3);
            op(3, Insn::Inc { reg })
        }
        [rex @ (0x48 | 0x49), b @ 0xb8..=0xbf, ref rest @ ..] if rest.len() >= 8 => {
            let mut imm = [0u8; 8];
            imm.copy_from_slice(&rest[..8]);
            let reg = (b - 0xb8) | ((rex & 1) << 3);
            op(
                10,
                Insn::MovImm {
                    reg,
                    imm: u64::from_le_bytes(imm),
                },
            )
        }
        [0x48, opcode @ (0x89 | 0x8b), modrm, ..] if modrm >> 6 == 0 => {
            let rm = modrm & 7;
            // rm 4 needs a SIB byte, rm 5 is RIP-relative.
            if rm == 4 || rm == 5 {
                return None;
            }
            let reg = (modrm >> 3) & 7;
            let insn = if opcode == 0x89 {
                Insn::Store { base: rm, src: reg }
            } else {
                Insn::Load { base: rm, dst: reg }
            };
            op(3, insn)
        }
        _ => None,
    }
}

/// Execute `decoded` on `state`.
///
/// `operand_gpa` is the already translated (and trap-checked) address of
/// the memory operand, for instructions that have one.
pub fn execute(
    decoded: &Decoded,
    state: &mut VcpuState,
    msrs: &MsrFile,
    memory: &GuestMemoryManager,
    operand_gpa: Option<u64>,
) -> Result<(), Fault> {
    let next = state.regs.rip.wrapping_add(u64::from(decoded.len));
    match decoded.insn {
        Insn::Nop => state.regs.rip = next,
        // Delivered with no guest IDT: the breakpoint trap returns to the
        // following instruction.
        Insn::Int3 => state.regs.rip = next,
        Insn::Syscall => {
            let lstar = msrs.read(MSR_IA32_LSTAR).map_err(|_| Fault {
                vector: VECTOR_GP,
            })?;
            let fmask = msrs.read(MSR_IA32_FMASK).unwrap_or(0);
            state.regs.rcx = next;
            state.regs.r11 = state.regs.rflags;
            state.regs.rflags = (state.regs.rflags & !fmask) | RFLAGS_FIXED;
            state.regs.rip = lstar;
            state.sregs.cs = flat_segment(KERNEL_CS, true);
            state.sregs.ss = flat_segment(KERNEL_DS, false);
        }
        Insn::Sysret => {
            state.regs.rip = state.regs.rcx;
            state.regs.rflags = state.regs.r11 | RFLAGS_FIXED;
            state.sregs.cs = flat_segment(USER_CS, true);
            state.sregs.ss = flat_segment(USER_DS, false);
        }
        Insn::Inc { reg } => {
            let r = state.gpr_mut(reg);
            *r = r.wrapping_add(1);
            state.regs.rip = next;
        }
        Insn::Jmp { rel } => {
            state.regs.rip = next.wrapping_add(i64::from(rel) as u64);
        }
        Insn::MovImm { reg, imm } => {
            *state.gpr_mut(reg) = imm;
            state.regs.rip = next;
        }
        Insn::Store { src, .. } => {
            let gpa = operand_gpa.ok_or(Fault { vector: VECTOR_PF })?;
            let value = state.gpr(src);
            memory
                .write_u64(gpa, value)
                .map_err(|_| Fault { vector: VECTOR_PF })?;
            state.regs.rip = next;
        }
        Insn::Load { dst, .. } => {
            let gpa = operand_gpa.ok_or(Fault { vector: VECTOR_PF })?;
            let value = memory
                .read_u64(gpa)
                .map_err(|_| Fault { vector: VECTOR_PF })?;
            *state.gpr_mut(dst) = value;
            state.regs.rip = next;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Assembler helpers
// ═══════════════════════════════════════════════════════════════════════

/// Encoders for building guest code.
pub mod asm {
    pub const NOP: [u8; 1] = [0x90];
    pub const SYSCALL: [u8; 2] = [0x0f, 0x05];
    pub const SYSRETQ: [u8; 3] = [0x48, 0x0f, 0x07];
    /// `mov [rdi], rax`
    pub const STORE_RAX_TO_RDI: [u8; 3] = [0x48, 0x89, 0x07];
    /// `mov rax, [rdi]`
    pub const LOAD_RAX_FROM_RDI: [u8; 3] = [0x48, 0x8b, 0x07];

    /// `inc r64` for registers 0–7 (rax … rdi).
    pub fn inc(reg: u8) -> [u8; 3] {
        [0x48, 0xff, 0xc0 | (reg & 7)]
    }

    /// `jmp rel8`.
    pub fn jmp(rel: i8) -> [u8; 2] {
        [0xeb, rel as u8]
    }

    /// `mov r64, imm64` for registers 0–7.
    pub fn mov_imm(reg: u8, imm: u64) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0] = 0x48;
        out[1] = 0xb8 + (reg & 7);
        out[2..].copy_from_slice(&imm.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmprobe_protocol::Register;

    fn machine() -> (VcpuState, MsrFile, GuestMemoryManager) {
        let mut msrs = MsrFile::default();
        msrs.write(MSR_IA32_LSTAR, 0xffff_ffff_8100_0000).unwrap();
        (
            VcpuState::long_mode(0x1000, 0x40_0000),
            msrs,
            GuestMemoryManager::new(4 << 20).unwrap(),
        )
    }

    #[test]
    fn decodes_every_supported_form() {
        assert_eq!(decode(&[0x90]).unwrap().insn, Insn::Nop);
        assert_eq!(decode(&[0xcc]).unwrap().insn, Insn::Int3);
        assert_eq!(decode(&asm::SYSCALL).unwrap().len, 2);
        assert_eq!(decode(&asm::SYSRETQ).unwrap().insn, Insn::Sysret);
        assert_eq!(decode(&asm::inc(3)).unwrap().insn, Insn::Inc { reg: 3 });
        assert_eq!(decode(&[0x49, 0xff, 0xc1]).unwrap().insn, Insn::Inc { reg: 9 });
        assert_eq!(decode(&asm::jmp(-7)).unwrap().insn, Insn::Jmp { rel: -7 });
        let mov = decode(&asm::mov_imm(7, 0x1122_3344_5566_7788)).unwrap();
        assert_eq!(mov.len, 10);
        assert_eq!(
            mov.insn,
            Insn::MovImm {
                reg: 7,
                imm: 0x1122_3344_5566_7788
            }
        );
        assert_eq!(
            decode(&asm::STORE_RAX_TO_RDI).unwrap().insn,
            Insn::Store { base: 7, src: 0 }
        );
        assert_eq!(
            decode(&asm::LOAD_RAX_FROM_RDI).unwrap().insn,
            Insn::Load { base: 7, dst: 0 }
        );
    }

    #[test]
    fn rejects_unknown_and_truncated() {
        assert_eq!(decode(&[0x0f, 0x0b]), None);
        assert_eq!(decode(&[0x48, 0xbf, 1, 2, 3]), None);
        assert_eq!(decode(&[0x48, 0x89, 0x04]), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn syscall_and_sysret_round_trip() {
        let (mut state, msrs, mem) = machine();
        state.regs.rflags = 0x246;
        let syscall = decode(&asm::SYSCALL).unwrap();
        execute(&syscall, &mut state, &msrs, &mem, None).unwrap();
        assert_eq!(state.get(Register::Rip), 0xffff_ffff_8100_0000);
        assert_eq!(state.get(Register::Rcx), 0x40_0002);
        assert_eq!(state.get(Register::R11), 0x246);
        assert_eq!(state.get(Register::Cs), u64::from(KERNEL_CS));

        let sysret = decode(&asm::SYSRETQ).unwrap();
        execute(&sysret, &mut state, &msrs, &mem, None).unwrap();
        assert_eq!(state.get(Register::Rip), 0x40_0002);
        assert_eq!(state.get(Register::Rflags), 0x246);
        assert_eq!(state.get(Register::Cs), u64::from(USER_CS));
    }

    #[test]
    fn jmp_is_relative_to_next_instruction() {
        let (mut state, msrs, mem) = machine();
        state.regs.rip = 0x40_0005;
        let jmp = decode(&asm::jmp(-7)).unwrap();
        execute(&jmp, &mut state, &msrs, &mem, None).unwrap();
        assert_eq!(state.regs.rip, 0x40_0000);
    }

    #[test]
    fn store_and_load_use_operand_gpa() {
        let (mut state, msrs, mem) = machine();
        state.regs.rax = 0xabcd;
        let store = decode(&asm::STORE_RAX_TO_RDI).unwrap();
        execute(&store, &mut state, &msrs, &mem, Some(0x3000)).unwrap();
        assert_eq!(mem.read_u64(0x3000).unwrap(), 0xabcd);

        state.regs.rax = 0;
        let load = decode(&asm::LOAD_RAX_FROM_RDI).unwrap();
        execute(&load, &mut state, &msrs, &mem, Some(0x3000)).unwrap();
        assert_eq!(state.regs.rax, 0xabcd);

        let err = execute(&load, &mut state, &msrs, &mem, None).unwrap_err();
        assert_eq!(err.vector, VECTOR_PF);
    }
}
