//! Fiber stack allocation
//!
//! Stacks come from anonymous `mmap` regions with a `PROT_NONE` guard page
//! at the low end, so runaway recursion faults instead of silently
//! corrupting a neighboring allocation. The region is unmapped when the
//! owning fiber is dropped.

use spindle_core::constants::GUARD_SIZE;
use spindle_core::{RtError, RtResult};

/// An owned, guard-paged fiber stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
}

// The stack region is exclusively owned by one fiber and only touched by
// the thread currently executing that fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of `size` usable bytes plus one guard page below it.
    pub fn alloc(size: usize) -> RtResult<Self> {
        let page = page_size();
        let usable = size.max(page).next_multiple_of(page);
        let total = usable + GUARD_SIZE.max(page);

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::Os(errno()));
        }

        // Guard page at the low end; the stack grows down toward it.
        let rc = unsafe { libc::mprotect(base, GUARD_SIZE.max(page), libc::PROT_NONE) };
        if rc != 0 {
            let err = errno();
            unsafe { libc::munmap(base, total) };
            return Err(RtError::Os(err));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the region; initial stack pointer for a fresh context.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between the top and the guard page.
    #[inline]
    pub fn usable(&self) -> usize {
        self.total - GUARD_SIZE.max(page_size())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if rc != 0 {
            spindle_core::log_error!("munmap of fiber stack failed: errno {}", errno());
        }
    }
}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
