//! aarch64 context switching implementation
//!
//! Saves the AAPCS64 callee-saved state: sp, the resume address, x19-x28,
//! the frame pointer and d8-d15. The resume address slot doubles as the
//! entry trampoline for freshly initialized contexts.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended fiber.
///
/// Layout (byte offsets, all 8-byte slots):
/// 0x00 sp, 0x08 resume pc, 0x10-0x58 x19-x28, 0x60 x29, 0x68-0xA0 d8-d15.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    regs: [u64; 21],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self { regs: [0; 21] }
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
    // sp must stay 16-byte aligned at all times on aarch64.
    let sp = stack_top as usize & !0xF;

    let ctx = &mut *ctx;
    ctx.regs = [0; 21];
    ctx.regs[0] = sp as u64;
    ctx.regs[1] = entry_trampoline as usize as u64;
    ctx.regs[2] = entry_fn as u64; // x19
    ctx.regs[3] = entry_arg as u64; // x20
}

/// First frame of every fiber: calls the entry function with its argument.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {returned}",
        "brk #0x1",
        returned = sym super::entry_returned,
    );
}

/// Save the caller's callee-saved registers into `save` and resume `restore`.
///
/// The resume pc of a context saved here is the caller's return address, so
/// switching back makes this call appear to return normally.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `restore` must hold
/// either a freshly initialized context or one saved by a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _restore: *const Context) {
    naked_asm!(
        // Save into `save` (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from `restore` (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ldr x9, [x1, #0x08]",
        "br x9",
    );
}
