//! Per-fd bookkeeping for the hook layer
//!
//! The hooks need to know, per descriptor: is it a socket (only sockets
//! get fiber-suspension treatment), did the *user* ask for non-blocking
//! mode (then the hooks pass straight through), and what read/write
//! timeouts apply. Sockets are forced into kernel-level `O_NONBLOCK` at
//! first sight so the runtime can multiplex them; the user-visible
//! blocking flag is emulated on top.

use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use spindle_core::constants::TIMEOUT_NONE;

use crate::origins;

const INITIAL_SLOTS: usize = 64;

/// Which per-fd timeout a hooked operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// Kernel-level O_NONBLOCK was forced on by us.
    sys_nonblock: bool,
    /// The user explicitly asked for non-blocking mode.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut is_socket = false;
        let mut sys_nonblock = false;

        let mut st = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } == 0 {
            let st = unsafe { st.assume_init() };
            is_socket = st.st_mode & libc::S_IFMT == libc::S_IFSOCK;
        }

        if is_socket {
            let flags = unsafe { origins::real_fcntl()(fd, libc::F_GETFL) };
            if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                unsafe { origins::real_fcntl()(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_NONE),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide slab of `FdCtx`, indexed by raw fd.
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            fds: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// Look up the context for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read().unwrap();
            match fds.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                Some(None) if !auto_create => return None,
                None if !auto_create => return None,
                _ => {}
            }
        }

        let mut fds = self.fds.write().unwrap();
        if idx >= fds.len() {
            let mut new_len = fds.len();
            while new_len <= idx {
                new_len = new_len * 3 / 2 + 1;
            }
            fds.resize(new_len, None);
        }
        // Probing the fd (fstat, fcntl) happens outside any hook path, so
        // a concurrent creator is harmless; first insert wins.
        if fds[idx].is_none() {
            fds[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        fds[idx].clone()
    }

    /// Forget `fd`, marking any outstanding context closed.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if let Some(slot) = fds.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

/// The process-wide fd manager.
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_is_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { origins::real_fcntl()(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_manager().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_is_left_alone() {
        let mut pair = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(pair.as_mut_ptr()) }, 0);

        let ctx = fd_manager().get(pair[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        fd_manager().remove(pair[0]);
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_slab_grows_past_initial_size() {
        // Way past INITIAL_SLOTS; no fd probe succeeds but the slot must
        // still exist.
        let ctx = fd_manager().get(500, true).unwrap();
        assert!(!ctx.is_socket());
        fd_manager().remove(500);
        assert!(fd_manager().get(500, false).is_none());
    }

    #[test]
    fn test_timeouts_default_to_none() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), TIMEOUT_NONE);
        assert_eq!(ctx.timeout(TimeoutKind::Send), TIMEOUT_NONE);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        fd_manager().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_remove_marks_closed() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(!ctx.is_closed());
        fd_manager().remove(fd);
        assert!(ctx.is_closed());
        unsafe { libc::close(fd) };
    }
}
