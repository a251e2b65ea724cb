//! x86_64 context switching implementation
//!
//! Uses inline assembly for the voluntary switch. Only the callee-saved
//! registers of the System V AMD64 ABI are preserved; everything else is
//! dead across a voluntary yield by definition.

use std::arch::naked_asm;

/// Callee-saved register set for a voluntary switch.
///
/// Offsets are referenced from assembly and must not change:
///
/// ```text
/// 0x00: rsp   0x08: rip   0x10: rbx   0x18: rbp
/// 0x20: r12   0x28: r13   0x30: r14   0x38: r15
/// ```
#[repr(C)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prime a fresh coroutine context.
///
/// Sets up the stack so that the first switch into `regs` enters
/// `entry_fn(entry_arg)` through the trampoline.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory and `stack_top` must be
/// the high end of a mapped stack region.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Keep rsp 16-byte aligned at the trampoline so the `call` into the
    // entry function leaves the frame aligned per the System V ABI.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = co_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function never returns; it terminates the coroutine by
/// switching back to the scheduling context itself.
#[unsafe(naked)]
pub unsafe extern "C" fn co_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
/// Returns (into the saved context) when something later switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _old_regs: *mut SavedRegs,
    _new_regs: *const SavedRegs,
) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
