//! x86_64 context switching implementation
//!
//! Uses naked inline assembly, stable in Rust 1.88+. Only the System V
//! callee-saved registers need to survive a voluntary switch; everything
//! else is clobbered by the `context_switch` call itself.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended fiber.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
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

/// Initialize a fresh context so that switching to it enters `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// high end of a live, exclusively-owned stack.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // 16-byte alignment per System V AMD64 ABI. The trampoline's `call`
    // pushes the return address, leaving rsp ≡ 8 (mod 16) at function
    // entry as the ABI requires.
    let sp = stack_top as usize & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: calls the entry function with its argument.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {returned}",
        "ud2",
        returned = sym super::entry_returned,
    );
}

/// Save the caller's callee-saved registers into `save` and resume `restore`.
///
/// Returns when something later switches back to `save`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `restore` must hold
/// either a freshly initialized context or one saved by a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _restore: *const Context) {
    naked_asm!(
        // Save into `save` (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `restore` (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
