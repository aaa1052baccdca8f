//! Architecture-specific context switching
//!
//! A fiber's execution state is an opaque `Context`: the callee-saved
//! register block plus stack and resume pointers. Four operations cover the
//! whole capability: create (`init_context`), resume/suspend (both are
//! `context_switch`), destroy (plain drop of the zeroed block).
//!
//! Invariants, regardless of mechanism: at most one fiber per thread is
//! executing, stacks are exclusively owned by their fiber, and a context is
//! only destroyed from a terminal state.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, init_context, context_switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, init_context, context_switch};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Called by the trampoline if a fiber entry function ever returns.
///
/// Entry functions terminate by switching back to their resumer; falling off
/// the end would return into a dead stack frame.
pub(crate) extern "C" fn entry_returned() -> ! {
    spindle_core::log_error!("fiber entry returned instead of switching out");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static mut MAIN_CTX: Context = Context::zeroed();
    static mut FIBER_CTX: Context = Context::zeroed();

    extern "C" fn entry(arg: usize) {
        HITS.store(arg, Ordering::SeqCst);
        unsafe {
            context_switch(
                std::ptr::addr_of_mut!(FIBER_CTX),
                std::ptr::addr_of!(MAIN_CTX),
            );
        }
        unreachable!();
    }

    #[test]
    fn test_switch_in_and_out() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        unsafe {
            init_context(std::ptr::addr_of_mut!(FIBER_CTX), top, entry as usize, 42);
            context_switch(
                std::ptr::addr_of_mut!(MAIN_CTX),
                std::ptr::addr_of!(FIBER_CTX),
            );
        }
        assert_eq!(HITS.load(Ordering::SeqCst), 42);
    }

    static ALIGN_REM: AtomicUsize = AtomicUsize::new(usize::MAX);
    static mut ALIGN_MAIN_CTX: Context = Context::zeroed();
    static mut ALIGN_FIBER_CTX: Context = Context::zeroed();

    // The compiler places this at a frame offset assuming the ABI entry
    // alignment; if `init_context` got that wrong the local lands
    // misaligned at runtime.
    extern "C" fn align_entry(_arg: usize) {
        #[repr(align(16))]
        struct Slot([u8; 16]);
        let slot = Slot([0; 16]);
        ALIGN_REM.store(&slot as *const Slot as usize % 16, Ordering::SeqCst);
        unsafe {
            context_switch(
                std::ptr::addr_of_mut!(ALIGN_FIBER_CTX),
                std::ptr::addr_of!(ALIGN_MAIN_CTX),
            );
        }
        unreachable!();
    }

    #[test]
    fn test_entry_stack_alignment() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        unsafe {
            init_context(
                std::ptr::addr_of_mut!(ALIGN_FIBER_CTX),
                top,
                align_entry as usize,
                0,
            );
            context_switch(
                std::ptr::addr_of_mut!(ALIGN_MAIN_CTX),
                std::ptr::addr_of!(ALIGN_FIBER_CTX),
            );
        }
        assert_eq!(ALIGN_REM.load(Ordering::SeqCst), 0);
    }
}
