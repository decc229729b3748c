//! Shared vocabulary between the vmprobe debug core and hypervisor backends.
//!
//! This crate defines the types both sides of the debug boundary agree
//! on: the state word bits, the register enumeration, MSR indices,
//! breakpoint attributes, the guest-exit/verdict pair exchanged on every
//! intercepted event, and the two traits that form the boundary itself.
//!
//! # Boundary
//!
//! ```text
//!   debug core (vmprobe-core)              hypervisor backend
//!   ─────────────────────────              ──────────────────
//!   Session ── Hypervisor trait ─────────▶ pause / resume / step
//!                                          registers, MSRs, RAM
//!                                          page traps, save slot
//!   ExitHandler ◀──────── on_exit(ctx, exit) ── vCPU intercepts
//!               ────────▶ ExitVerdict
//! ```
//!
//! 1. The core attaches an [`ExitHandler`] during session init.
//! 2. Whenever a vCPU hits an armed trap (patched `int3`, page trap,
//!    debug register) the backend calls [`ExitHandler::on_exit`] with the
//!    vCPU context and the exit reason.
//! 3. The handler answers with an [`ExitVerdict`]: stop the machine, step
//!    past the trap transparently, or re-inject the exception.
//!
//! The handler is invoked while the backend holds its execution lock, so
//! it must never call back into the [`Hypervisor`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod paging;

// ═══════════════════════════════════════════════════════════════════════
//  Geometry
// ═══════════════════════════════════════════════════════════════════════

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Number of breakpoint slots in a session's table.
///
/// Breakpoint ids are slot indices and fit in a `u8`.
pub const MAX_BREAKPOINTS: usize = 255;

/// Number of hardware debug-address registers (DR0–DR3) per vCPU.
pub const HW_BREAKPOINT_SLOTS: usize = 4;

/// The byte patched into guest code for a software breakpoint (`int3`).
pub const INT3: u8 = 0xcc;

/// Round `addr` down to its page boundary.
#[inline]
pub fn page_base(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Offset of `addr` within its page.
#[inline]
pub fn page_offset(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

// ═══════════════════════════════════════════════════════════════════════
//  Model-specific registers
// ═══════════════════════════════════════════════════════════════════════

/// Legacy `SYSENTER` code segment.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
/// Legacy `SYSENTER` stack pointer.
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
/// Legacy `SYSENTER` entry point.
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
/// Extended feature enable register (LME, LMA, NXE, SCE).
pub const MSR_IA32_EFER: u32 = 0xc000_0080;
/// `SYSCALL` segment selectors.
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
/// 64-bit `SYSCALL` entry point.
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
/// Compatibility-mode `SYSCALL` entry point.
pub const MSR_IA32_CSTAR: u32 = 0xc000_0083;
/// `SYSCALL` RFLAGS mask.
pub const MSR_IA32_FMASK: u32 = 0xc000_0084;
/// FS segment base.
pub const MSR_IA32_FS_BASE: u32 = 0xc000_0100;
/// GS segment base.
pub const MSR_IA32_GS_BASE: u32 = 0xc000_0101;
/// GS base swapped in by `SWAPGS`.
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// Every MSR index a backend is expected to model.
pub const KNOWN_MSRS: [u32; 11] = [
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_IA32_EFER,
    MSR_IA32_STAR,
    MSR_IA32_LSTAR,
    MSR_IA32_CSTAR,
    MSR_IA32_FMASK,
    MSR_IA32_FS_BASE,
    MSR_IA32_GS_BASE,
    MSR_IA32_KERNEL_GS_BASE,
];

// ═══════════════════════════════════════════════════════════════════════
//  State word
// ═══════════════════════════════════════════════════════════════════════

/// The run/pause state word of a debugged VM.
///
/// A level value: reading it never consumes anything. Transitions are
/// reported separately by the core's edge detector.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateFlags(u8);

impl StateFlags {
    /// No bits set: the VM is running.
    pub const RUNNING: StateFlags = StateFlags(0);
    /// All vCPUs are stopped.
    pub const PAUSED: StateFlags = StateFlags(0x01);
    /// The stop was caused by a breakpoint or debug trap.
    pub const BREAKPOINT_HIT: StateFlags = StateFlags(0x02);
    /// The current stop has already been reported, or was not raised by
    /// the session's own breakpoint table.
    pub const DEBUGGER_ALERTED: StateFlags = StateFlags(0x04);
    /// The breakpoint stop came from a debug register.
    pub const HARD_BREAKPOINT_HIT: StateFlags = StateFlags(0x08);

    const ALL_BITS: u8 = 0x0f;

    /// Raw bit representation.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    #[inline]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        StateFlags(bits & Self::ALL_BITS)
    }

    /// `true` if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no bit is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bitwise union.
    #[inline]
    pub const fn union(self, other: StateFlags) -> Self {
        StateFlags(self.0 | other.0)
    }

    /// `self` with the bits of `other` cleared.
    #[inline]
    pub const fn difference(self, other: StateFlags) -> Self {
        StateFlags(self.0 & !other.0)
    }

    /// Shorthand for `contains(PAUSED)`.
    #[inline]
    pub const fn is_paused(self) -> bool {
        self.contains(Self::PAUSED)
    }
}

impl std::ops::BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: StateFlags) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateFlags({:#04x} {})", self.0, self)
    }
}

impl fmt::Display for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("RUNNING");
        }
        let names = [
            (Self::PAUSED, "PAUSED"),
            (Self::BREAKPOINT_HIT, "BREAKPOINT_HIT"),
            (Self::DEBUGGER_ALERTED, "DEBUGGER_ALERTED"),
            (Self::HARD_BREAKPOINT_HIT, "HARD_BREAKPOINT_HIT"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Who a breakpoint stop belongs to, derived from the state word.
///
/// `DEBUGGER_ALERTED` clear on a breakpoint stop means the stop is a
/// fresh hit of the session's own table that no state read has reported
/// yet. Set means it was already reported, or it was raised by a trap
/// the table does not own (a debug register written directly, a guest
/// fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopOrigin {
    /// Fresh stop of one of the session's own breakpoints.
    Mine,
    /// Stop already reported, or not raised by the breakpoint table.
    Other,
    /// The state word does not describe a breakpoint stop.
    Unknown,
}

impl StopOrigin {
    /// Classify a state word.
    pub fn classify(state: StateFlags) -> Self {
        if !state.contains(StateFlags::PAUSED | StateFlags::BREAKPOINT_HIT) {
            StopOrigin::Unknown
        } else if state.contains(StateFlags::DEBUGGER_ALERTED) {
            StopOrigin::Other
        } else {
            StopOrigin::Mine
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registers
// ═══════════════════════════════════════════════════════════════════════

/// Architectural registers addressable per vCPU.
///
/// The discriminant is the register's stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsi = 4,
    Rdi = 5,
    Rsp = 6,
    Rbp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
    Rflags = 17,
    Cs = 18,
    Ds = 19,
    Es = 20,
    Fs = 21,
    Gs = 22,
    Ss = 23,
    Cr0 = 24,
    Cr2 = 25,
    Cr3 = 26,
    Cr4 = 27,
    Cr8 = 28,
    Dr0 = 29,
    Dr1 = 30,
    Dr2 = 31,
    Dr3 = 32,
    Dr6 = 33,
    Dr7 = 34,
    GdtrBase = 35,
    GdtrLimit = 36,
    IdtrBase = 37,
    IdtrLimit = 38,
    FsBase = 39,
    GsBase = 40,
}

impl Register {
    /// Every register, ordered by code.
    pub const ALL: [Register; 41] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::Rsp,
        Register::Rbp,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
        Register::Rip,
        Register::Rflags,
        Register::Cs,
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
        Register::Ss,
        Register::Cr0,
        Register::Cr2,
        Register::Cr3,
        Register::Cr4,
        Register::Cr8,
        Register::Dr0,
        Register::Dr1,
        Register::Dr2,
        Register::Dr3,
        Register::Dr6,
        Register::Dr7,
        Register::GdtrBase,
        Register::GdtrLimit,
        Register::IdtrBase,
        Register::IdtrLimit,
        Register::FsBase,
        Register::GsBase,
    ];

    /// Stable numeric code.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look a register up by its numeric code.
    pub fn from_code(code: u8) -> Option<Register> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// The debug-address register for hardware slot `slot` (0–3).
    pub fn debug_address(slot: usize) -> Option<Register> {
        match slot {
            0 => Some(Register::Dr0),
            1 => Some(Register::Dr1),
            2 => Some(Register::Dr2),
            3 => Some(Register::Dr3),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  DR7 encoding
// ═══════════════════════════════════════════════════════════════════════

/// Debug-control register (DR7) bit layout for the four address slots.
///
/// ```text
///   bit 2n     Ln   local enable for slot n
///   bit 2n+1   Gn   global enable for slot n
///   bits 16+4n R/Wn 00 exec, 01 write, 11 read/write
///   bits 18+4n LENn 00 1 byte, 01 2 bytes, 11 4 bytes, 10 8 bytes
/// ```
pub mod dr7 {
    use super::Access;

    const RW_SHIFT: usize = 16;
    const LEN_SHIFT: usize = 18;

    /// Bit 10 reads as one on real hardware.
    pub const RESERVED_ONE: u64 = 1 << 10;

    /// R/W field encoding for an access kind.
    pub fn rw_bits(access: Access) -> u64 {
        match access {
            Access::Execute => 0b00,
            Access::Write => 0b01,
            Access::ReadWrite => 0b11,
        }
    }

    /// LEN field encoding for a breakpoint length, `None` if the length
    /// cannot be expressed in a debug register.
    pub fn len_bits(len: u64) -> Option<u64> {
        match len {
            1 => Some(0b00),
            2 => Some(0b01),
            4 => Some(0b11),
            8 => Some(0b10),
            _ => None,
        }
    }

    /// All DR7 bits owned by `slot`.
    pub fn slot_mask(slot: usize) -> u64 {
        (0b11 << (slot * 2)) | ((0b1111) << (RW_SHIFT + slot * 4))
    }

    /// `dr7` with `slot` enabled for the given access and length.
    ///
    /// Returns `None` if the length is not encodable.
    pub fn enable(dr7: u64, slot: usize, access: Access, len: u64) -> Option<u64> {
        let len = len_bits(len)?;
        let cleared = dr7 & !slot_mask(slot);
        Some(
            cleared
                | RESERVED_ONE
                | (0b11 << (slot * 2))
                | (rw_bits(access) << (RW_SHIFT + slot * 4))
                | (len << (LEN_SHIFT + slot * 4)),
        )
    }

    /// `dr7` with every bit of `slot` cleared.
    pub fn disable(dr7: u64, slot: usize) -> u64 {
        dr7 & !slot_mask(slot)
    }

    /// `true` if either enable bit of `slot` is set.
    pub fn is_enabled(dr7: u64, slot: usize) -> bool {
        dr7 & (0b11 << (slot * 2)) != 0
    }

    /// Raw R/W field of `slot`.
    pub fn rw_field(dr7: u64, slot: usize) -> u64 {
        (dr7 >> (RW_SHIFT + slot * 4)) & 0b11
    }

    /// Decoded length in bytes of `slot`.
    pub fn len_field(dr7: u64, slot: usize) -> u64 {
        match (dr7 >> (LEN_SHIFT + slot * 4)) & 0b11 {
            0b00 => 1,
            0b01 => 2,
            0b11 => 4,
            _ => 8,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Breakpoint attributes
// ═══════════════════════════════════════════════════════════════════════

/// How a breakpoint is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// `int3` patched into guest physical memory.
    Software,
    /// Page traps over every frame a range touches.
    Page,
    /// Debug-address register on each targeted vCPU.
    Hardware,
}

/// The kind of guest access a breakpoint fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Instruction fetch.
    Execute,
    /// Data write.
    Write,
    /// Data read or write.
    ReadWrite,
}

impl Access {
    /// The page-trap bits that enforce this access kind.
    pub fn trap_mask(self) -> TrapMask {
        match self {
            Access::Execute => TrapMask::EXECUTE,
            Access::Write => TrapMask::WRITE,
            Access::ReadWrite => TrapMask::READ | TrapMask::WRITE,
        }
    }
}

/// Which address space a breakpoint address is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Guest-virtual (linear) address.
    Virtual,
    /// Guest-physical address.
    Physical,
}

/// The vCPUs a breakpoint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuTarget {
    /// Only the vCPU with this index.
    Specific(u32),
    /// Every vCPU.
    All,
}

impl CpuTarget {
    /// `true` if `vcpu` is in scope.
    #[inline]
    pub fn covers(self, vcpu: u32) -> bool {
        match self {
            CpuTarget::Specific(idx) => idx == vcpu,
            CpuTarget::All => true,
        }
    }
}

/// Address-space (page-table root) filter of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsidFilter {
    /// Fire in any address space.
    Any,
    /// Fire only while `CR3` selects this page-table root.
    Only(u64),
}

impl AsidFilter {
    /// `true` if a vCPU running with `cr3` is in scope.
    ///
    /// PCID and flag bits in the low 12 bits of `cr3` are ignored.
    #[inline]
    pub fn matches(self, cr3: u64) -> bool {
        match self {
            AsidFilter::Any => true,
            AsidFilter::Only(root) => page_base(root) == page_base(cr3),
        }
    }
}

/// Page-trap bits for one guest frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TrapMask(u8);

impl TrapMask {
    pub const NONE: TrapMask = TrapMask(0);
    pub const EXECUTE: TrapMask = TrapMask(0x1);
    pub const READ: TrapMask = TrapMask(0x2);
    pub const WRITE: TrapMask = TrapMask(0x4);

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `true` if any bit is shared with `other`.
    #[inline]
    pub const fn intersects(self, other: TrapMask) -> bool {
        self.0 & other.0 != 0
    }

    /// `true` if no bit is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for TrapMask {
    type Output = TrapMask;

    fn bitor(self, rhs: TrapMask) -> TrapMask {
        TrapMask(self.0 | rhs.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Guest exits
// ═══════════════════════════════════════════════════════════════════════

/// The vCPU an exit was raised on, at the moment of the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitContext {
    /// vCPU index.
    pub vcpu: u32,
    /// Instruction pointer of the trapping instruction (not yet executed).
    pub rip: u64,
    /// Page-table root the vCPU runs under.
    pub cr3: u64,
}

/// Why a vCPU left guest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// The vCPU fetched an `int3` byte at this guest-physical address.
    SoftwareBreakpoint {
        /// Guest-physical address of the `int3`.
        gpa: u64,
    },
    /// An access hit a trapped frame.
    PageTrap {
        /// Guest-physical address accessed.
        gpa: u64,
        /// Linear address accessed (`rip` for instruction fetches).
        linear: u64,
        /// The single access bit that was performed.
        access: TrapMask,
    },
    /// A debug-address register matched.
    DebugTrap {
        /// Matching slot (0–3).
        slot: u8,
        /// DR6 status as the hardware would report it.
        dr6: u64,
    },
    /// The guest raised an exception it cannot handle.
    Fault {
        /// Exception vector.
        vector: u8,
    },
}

/// What the backend should do with an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    /// Pause the whole machine; the vCPU stays on the trapping instruction.
    Stop,
    /// Ignore this trap and carry on with the instruction.
    StepOver,
    /// The trap is a patched `int3` that is not interesting: execute the
    /// instruction as if its first byte were `original`.
    StepOverPatched {
        /// Byte the patch displaced.
        original: u8,
    },
    /// Deliver the exception to the guest.
    Reinject,
}

/// Receiver of guest exits. Implemented by the debug core.
pub trait ExitHandler: Send + Sync {
    /// Decide what to do with `exit`.
    ///
    /// Called with the backend's execution lock held; must not call back
    /// into the [`Hypervisor`].
    fn on_exit(&self, ctx: &ExitContext, exit: &GuestExit) -> ExitVerdict;
}

// ═══════════════════════════════════════════════════════════════════════
//  Hypervisor boundary
// ═══════════════════════════════════════════════════════════════════════

/// Errors reported by a hypervisor backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The vCPU index does not exist.
    #[error("no such vCPU {vcpu}")]
    InvalidVcpu {
        /// Requested vCPU index.
        vcpu: u32,
    },

    /// The backend does not model this register.
    #[error("register {register:?} is not supported")]
    UnsupportedRegister {
        /// Requested register.
        register: Register,
    },

    /// The value does not fit a narrow register (selector or limit).
    #[error("value {value:#x} does not fit the {bits}-bit register {register:?}")]
    RegisterWidth {
        /// Register written.
        register: Register,
        /// Rejected value.
        value: u64,
        /// Width of the register.
        bits: u32,
    },

    /// The backend does not model this MSR.
    #[error("MSR {index:#x} is not supported")]
    UnknownMsr {
        /// Requested MSR index.
        index: u32,
    },

    /// A physical access lies (partly) outside guest RAM.
    #[error("physical range {address:#x}+{len:#x} is outside guest memory")]
    PhysicalRange {
        /// Start of the access.
        address: u64,
        /// Length of the access.
        len: usize,
    },

    /// The operation needs a paused machine.
    #[error("operation requires the VM to be paused")]
    NotPaused,

    /// Restore was requested before any save.
    #[error("no saved state")]
    NoSavedState,

    /// Another exit handler is already attached.
    #[error("an exit handler is already attached")]
    HandlerAttached,

    /// The guest faulted while the backend executed on the caller's behalf.
    #[error("guest fault (vector {vector}) on vCPU {vcpu}")]
    GuestFault {
        /// vCPU that faulted.
        vcpu: u32,
        /// Exception vector.
        vector: u8,
    },

    /// The backend has shut down or lost its VM.
    #[error("hypervisor backend unavailable: {0}")]
    Unavailable(String),
}

/// A hypervisor instance the debug core can drive.
///
/// Every method is a synchronous round-trip and atomic with respect to
/// guest execution: no instruction retires while a call is in progress.
pub trait Hypervisor: Send + Sync {
    /// Install the exit handler. At most one may be attached.
    fn attach(&self, handler: Arc<dyn ExitHandler>) -> Result<(), BackendError>;

    /// Remove the exit handler, if any. With no handler, traps stop the
    /// machine.
    fn detach(&self);

    /// Number of vCPUs, fixed for the lifetime of the VM.
    fn cpu_count(&self) -> u32;

    /// Size of guest physical memory in bytes.
    fn physical_memory_size(&self) -> u64;

    /// `true` while no vCPU is executing.
    fn is_paused(&self) -> bool;

    /// Stop all vCPUs. Idempotent.
    fn pause(&self) -> Result<(), BackendError>;

    /// Let all vCPUs run. Idempotent.
    fn resume(&self) -> Result<(), BackendError>;

    /// Execute exactly one instruction on `vcpu` with all traps
    /// suppressed. Requires a paused machine.
    fn single_step(&self, vcpu: u32) -> Result<(), BackendError>;

    /// Read one register of `vcpu`.
    fn read_register(&self, vcpu: u32, register: Register) -> Result<u64, BackendError>;

    /// Write one register of `vcpu`.
    fn write_register(&self, vcpu: u32, register: Register, value: u64)
        -> Result<(), BackendError>;

    /// Read an MSR as seen by `vcpu`.
    fn read_msr(&self, vcpu: u32, index: u32) -> Result<u64, BackendError>;

    /// Write an MSR as seen by `vcpu`.
    fn write_msr(&self, vcpu: u32, index: u32, value: u64) -> Result<(), BackendError>;

    /// Copy guest-physical memory into `buf`.
    fn read_physical(&self, gpa: u64, buf: &mut [u8]) -> Result<(), BackendError>;

    /// Copy `data` into guest-physical memory.
    fn write_physical(&self, gpa: u64, data: &[u8]) -> Result<(), BackendError>;

    /// Trap the given accesses to the frame containing `frame`, replacing
    /// any previous mask for it.
    fn set_page_trap(&self, frame: u64, mask: TrapMask) -> Result<(), BackendError>;

    /// Remove every trap on the frame containing `frame`.
    fn clear_page_trap(&self, frame: u64) -> Result<(), BackendError>;

    /// Capture registers, memory and device state into the save slot,
    /// overwriting any previous capture.
    fn save_state(&self) -> Result<(), BackendError>;

    /// Overwrite live state with the save slot. Page traps are debugger
    /// configuration and are not part of the slot.
    fn restore_state(&self) -> Result<(), BackendError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_codes_round_trip() {
        for (i, reg) in Register::ALL.iter().enumerate() {
            assert_eq!(reg.code() as usize, i, "{:?} out of order", reg);
            assert_eq!(Register::from_code(reg.code()), Some(*reg));
        }
        assert_eq!(Register::from_code(Register::ALL.len() as u8), None);
    }

    #[test]
    fn stop_origin_follows_alerted_bit() {
        let hit = StateFlags::PAUSED | StateFlags::BREAKPOINT_HIT;
        assert_eq!(StopOrigin::classify(hit), StopOrigin::Mine);
        assert_eq!(
            StopOrigin::classify(hit | StateFlags::DEBUGGER_ALERTED),
            StopOrigin::Other
        );
        assert_eq!(StopOrigin::classify(StateFlags::PAUSED), StopOrigin::Unknown);
        assert_eq!(StopOrigin::classify(StateFlags::RUNNING), StopOrigin::Unknown);
    }

    #[test]
    fn state_flags_display_lists_bits() {
        let s = StateFlags::PAUSED | StateFlags::BREAKPOINT_HIT;
        assert_eq!(s.to_string(), "PAUSED|BREAKPOINT_HIT");
        assert_eq!(StateFlags::RUNNING.to_string(), "RUNNING");
        assert_eq!(StateFlags::from_bits_truncate(0xff).bits(), 0x0f);
    }

    #[test]
    fn dr7_exec_slot0_matches_hand_encoding() {
        // L0 | G0 | reserved bit 10, exec, 1 byte.
        let dr7 = dr7::enable(0, 0, Access::Execute, 1).unwrap();
        assert_eq!(dr7, 0x403);
        assert!(dr7::is_enabled(dr7, 0));
        assert!(!dr7::is_enabled(dr7, 1));
    }

    #[test]
    fn dr7_slots_are_independent() {
        let dr7 = dr7::enable(0, 1, Access::Write, 4).unwrap();
        let dr7 = dr7::enable(dr7, 3, Access::ReadWrite, 8).unwrap();
        assert_eq!(dr7::rw_field(dr7, 1), 0b01);
        assert_eq!(dr7::len_field(dr7, 1), 4);
        assert_eq!(dr7::rw_field(dr7, 3), 0b11);
        assert_eq!(dr7::len_field(dr7, 3), 8);

        let dr7 = dr7::disable(dr7, 1);
        assert!(!dr7::is_enabled(dr7, 1));
        assert!(dr7::is_enabled(dr7, 3));
    }

    #[test]
    fn dr7_rejects_odd_lengths() {
        assert!(dr7::enable(0, 0, Access::Write, 3).is_none());
        assert!(dr7::len_bits(16).is_none());
    }

    #[test]
    fn asid_filter_ignores_pcid_bits() {
        let filter = AsidFilter::Only(0x1000);
        assert!(filter.matches(0x1000));
        assert!(filter.matches(0x1001));
        assert!(!filter.matches(0x2000));
        assert!(AsidFilter::Any.matches(0xdead_0000));
    }

    #[test]
    fn cpu_target_scoping() {
        assert!(CpuTarget::All.covers(7));
        assert!(CpuTarget::Specific(1).covers(1));
        assert!(!CpuTarget::Specific(1).covers(0));
    }

    #[test]
    fn read_write_access_traps_both_directions() {
        let mask = Access::ReadWrite.trap_mask();
        assert!(mask.intersects(TrapMask::READ));
        assert!(mask.intersects(TrapMask::WRITE));
        assert!(!mask.intersects(TrapMask::EXECUTE));
    }
}
