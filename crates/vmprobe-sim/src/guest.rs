//! The synthetic guest the simulated machine boots.
//!
//! A miniature OS is enough to exercise every debug feature:
//!
//! - **Kernel**: text mapped at [`KERNEL_BASE`] in the upper half, with
//!   the `SYSCALL` entry point (`IA32_LSTAR`) at its first byte. The entry
//!   path counts syscalls in `rbx`, stores the syscall number to the
//!   kernel data page and returns with `sysretq`.
//! - **Processes**: one code page each at [`USER_CODE_VA`], every process
//!   with its own page-table root. The upper half (kernel text, kernel
//!   data and a 2 MiB direct map of RAM at [`PHYSMAP_BASE`]) is shared
//!   between all roots.
//! - **vCPUs**: vCPU `i` starts in process `i % processes`.
//!
//! ```text
//!   user:   inc rsi ; syscall ; jmp user
//!   kernel: nop × 16 ; inc rbx ; mov rdi, KERNEL_DATA_VA
//!           mov [rdi], rax ; sysretq
//! ```

use log::info;
use vmprobe_protocol::{PAGE_SIZE, MSR_IA32_FMASK, MSR_IA32_LSTAR, MSR_IA32_STAR};

use crate::cpu::{MsrFile, VcpuState, KERNEL_CS, USER_CS};
use crate::interp::asm;
use crate::vm::SimError;
use crate::memory::{
    GuestMemoryManager, MemoryError, PageTableBuilder, KERNEL_DATA_PHYS, KERNEL_TEXT_PHYS,
    USER_PHYS_START,
};

/// Virtual base of the kernel text; also the `SYSCALL` entry point.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8100_0000;

/// Pages of kernel text mapped at [`KERNEL_BASE`].
pub const KERNEL_TEXT_PAGES: u64 = 64;

/// Virtual address of the kernel data page.
pub const KERNEL_DATA_VA: u64 = 0xffff_ffff_8200_0000;

/// Virtual base of the 2 MiB direct map of guest RAM.
pub const PHYSMAP_BASE: u64 = 0xffff_8880_0000_0000;

/// Virtual address of every process's code page.
pub const USER_CODE_VA: u64 = 0x0040_0000;

/// `nop`s at the start of the syscall entry path.
pub const ENTRY_SLED: usize = 16;

/// Most processes the page-table pool is sized for.
pub const MAX_PROCESSES: usize = 32;

const SIZE_2M: u64 = 1 << 21;
const PML4_KERNEL: u64 = 511;
const PML4_PHYSMAP: u64 = 273;

/// Layout of a booted guest.
#[derive(Debug, Clone)]
pub struct GuestImage {
    /// Page-table root of each process.
    pub roots: Vec<u64>,
    /// Initial state of each vCPU.
    pub vcpus: Vec<VcpuState>,
    /// Initial MSR values.
    pub msrs: MsrFile,
}

/// Machine code of the syscall entry path.
pub fn kernel_entry_code() -> Vec<u8> {
    let mut code = Vec::new();
    code.extend(std::iter::repeat(asm::NOP[0]).take(ENTRY_SLED));
    code.extend_from_slice(&asm::inc(3));
    code.extend_from_slice(&asm::mov_imm(7, KERNEL_DATA_VA));
    code.extend_from_slice(&asm::STORE_RAX_TO_RDI);
    code.extend_from_slice(&asm::SYSRETQ);
    code
}

/// Machine code of a process's main loop.
pub fn user_loop_code() -> Vec<u8> {
    let mut code = Vec::new();
    code.extend_from_slice(&asm::inc(6));
    code.extend_from_slice(&asm::SYSCALL);
    code.extend_from_slice(&asm::jmp(-7));
    code
}

/// Offset of the `syscall` instruction inside [`user_loop_code`].
pub const USER_SYSCALL_OFFSET: u64 = 3;

/// Physical address of process `index`'s code page.
pub fn user_code_phys(index: usize) -> u64 {
    USER_PHYS_START + index as u64 * PAGE_SIZE
}

/// Write the guest into `memory` and compute its initial vCPU states.
///
/// # Errors
///
/// Returns [`SimError::Memory`] if the layout does not fit into `memory`.
pub fn build(
    memory: &GuestMemoryManager,
    processes: usize,
    vcpus: usize,
) -> Result<GuestImage, SimError> {
    let processes = processes.clamp(1, MAX_PROCESSES);
    let last_user_page = user_code_phys(processes - 1) + PAGE_SIZE;
    if last_user_page > memory.size() as u64 {
        return Err(MemoryError::OutOfRange {
            address: user_code_phys(processes - 1),
            len: PAGE_SIZE as usize,
        }
        .into());
    }

    memory.write(KERNEL_TEXT_PHYS, &kernel_entry_code())?;

    let mut tables = PageTableBuilder::new(memory);
    let roots = (0..processes)
        .map(|_| tables.alloc_table())
        .collect::<Result<Vec<_>, MemoryError>>()?;

    // Kernel half goes into the first root, then is shared.
    let kernel_root = roots[0];
    for page in 0..KERNEL_TEXT_PAGES {
        tables.map_4k(
            kernel_root,
            KERNEL_BASE + page * PAGE_SIZE,
            KERNEL_TEXT_PHYS + page * PAGE_SIZE,
            false,
            false,
        )?;
    }
    tables.map_4k(kernel_root, KERNEL_DATA_VA, KERNEL_DATA_PHYS, true, false)?;
    let ram = memory.size() as u64;
    let mut offset = 0;
    while offset + SIZE_2M <= ram {
        tables.map_2m(kernel_root, PHYSMAP_BASE + offset, offset)?;
        offset += SIZE_2M;
    }
    for &root in &roots[1..] {
        tables.share_pml4_entry(kernel_root, root, PML4_KERNEL)?;
        tables.share_pml4_entry(kernel_root, root, PML4_PHYSMAP)?;
    }

    let user_code = user_loop_code();
    for (index, &root) in roots.iter().enumerate() {
        let phys = user_code_phys(index);
        memory.write(phys, &user_code)?;
        tables.map_4k(root, USER_CODE_VA, phys, false, true)?;
    }

    let vcpus = (0..vcpus.max(1))
        .map(|i| {
            let process = i % processes;
            let mut state = VcpuState::long_mode(roots[process], USER_CODE_VA);
            state.regs.rax = process as u64 + 1;
            state.regs.rsp = 0;
            state
        })
        .collect();

    let mut msrs = MsrFile::default();
    msrs.write(MSR_IA32_LSTAR, KERNEL_BASE)?;
    let star = (u64::from(USER_CS - 16) << 48) | (u64::from(KERNEL_CS) << 32);
    msrs.write(MSR_IA32_STAR, star)?;
    msrs.write(MSR_IA32_FMASK, 0)?;

    info!(
        "Guest built: {} processes, kernel at {:#x}, page tables up to {:#x}",
        processes,
        KERNEL_BASE,
        tables.high_water(),
    );

    Ok(GuestImage { roots, vcpus, msrs })
}
