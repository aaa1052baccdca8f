//! Blocking-call interposition
//!
//! Re-exports of the libc I/O surface, compiled into the final binary so
//! the linker prefers them over glibc. Each hook decides per call whether
//! to get involved:
//!
//! - hooking disabled on this thread, fd unknown, fd not a socket, or the
//!   user asked for non-blocking mode: straight passthrough to the real
//!   libc function;
//! - otherwise the operation is tried once on the (kernel-nonblocking)
//!   socket, and on `EAGAIN` the calling fiber registers an event with
//!   the current reactor, optionally arms the fd's timeout as a condition
//!   timer, and parks. The event or the timer resumes it.
//!
//! Timeouts surface as `-1`/`ETIMEDOUT`, exactly like a `SO_RCVTIMEO`
//! expiry on a real blocking socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use spindle_core::{config, log_debug, log_error};
use spindle_runtime::{CancelFlag, Event, Fiber, IoManager};

use crate::fd::{fd_manager, FdCtx, TimeoutKind};
use crate::origins;

// Scheduler workers enable the flag for their threads; everything else
// defaults to passthrough.
pub use spindle_core::hookflag::{hook_enabled, set_hook_enabled};

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v };
}

/// Try a non-blocking operation; on EAGAIN park the fiber until the fd is
/// ready or the fd's timeout expires.
///
/// `f` is re-invoked after every wakeup, so spurious readiness (or a
/// competitor draining the socket first) just parks again.
unsafe fn do_io<F>(fd: c_int, name: &str, event: Event, timeout_kind: TimeoutKind, f: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !hook_enabled() {
        return f();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            // Not on a reactor worker; the kernel-nonblocking result is
            // the best we can do.
            return n;
        };
        log_debug!("{} on fd {} would block, parking fiber", name, fd);

        let flag = CancelFlag::new();
        let timer = if timeout_ms != spindle_core::constants::TIMEOUT_NONE {
            let weak = Arc::downgrade(&flag);
            let flag2 = Arc::downgrade(&flag);
            let iom2 = iom.clone();
            Some(iom.add_condition_timer(
                timeout_ms,
                move || {
                    let Some(flag) = flag2.upgrade() else { return };
                    if flag.errno.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    flag.errno.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    iom2.cancel_event(fd, event);
                },
                weak,
                false,
            ))
        } else {
            None
        };

        if let Err(err) = iom.add_event(fd, event, None) {
            log_error!("{} failed to register {:?} on fd {}: {}", name, event, fd, err);
            if let Some(t) = timer {
                t.cancel();
            }
            return -1;
        }
        Fiber::yield_to_hold();

        if let Some(t) = timer {
            t.cancel();
        }
        // Deliberate tie-break: when the deadline and readiness land in the
        // same instant, the timer wins and the call reports ETIMEDOUT even
        // though data may already be available. A retry after the timeout
        // succeeds immediately, so the race is benign; keep the flag check
        // ahead of any use of the wakeup.
        let cancelled = flag.errno.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Woken by readiness; retry the operation.
    }
}

/// Fiber-suspending `connect` with a timeout (ms; `TIMEOUT_NONE` waits
/// forever).
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return origins::real_connect()(fd, addr, addrlen);
    }
    let Some(ctx) = fd_manager().get(fd, true) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return origins::real_connect()(fd, addr, addrlen);
    }

    let n = origins::real_connect()(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };

    let flag = CancelFlag::new();
    let timer = if timeout_ms != spindle_core::constants::TIMEOUT_NONE {
        let weak = Arc::downgrade(&flag);
        let flag2 = Arc::downgrade(&flag);
        let iom2 = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(flag) = flag2.upgrade() else { return };
                if flag.errno.load(Ordering::SeqCst) != 0 {
                    return;
                }
                flag.errno.store(libc::ETIMEDOUT, Ordering::SeqCst);
                iom2.cancel_event(fd, Event::Write);
            },
            weak,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(t) = timer {
                t.cancel();
            }
            let cancelled = flag.errno.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(t) = timer {
                t.cancel();
            }
            log_error!("connect failed to register WRITE on fd {}: {}", fd, err);
            return -1;
        }
    }

    // Connection attempt finished; the verdict is in SO_ERROR.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = origins::real_getsockopt()(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    );
    if rc != 0 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Park the current fiber for `ms` via a one-shot timer.
///
/// Returns false when there is no reactor or fiber context to park in.
fn timer_park(ms: u64) -> bool {
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let fiber = Fiber::current();
    if fiber.is_root() {
        return false;
    }
    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || {
            sched.schedule_fiber(fiber.clone(), None);
        },
        false,
    );
    Fiber::yield_to_hold();
    true
}

// --- exported symbols -------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() || !timer_park(seconds as u64 * 1000) {
        return origins::real_sleep()(seconds);
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    if !hook_enabled() || !timer_park(usec as u64 / 1000) {
        return origins::real_usleep()(usec);
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() || req.is_null() {
        return origins::real_nanosleep()(req, rem);
    }
    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    if !timer_park(ms) {
        return origins::real_nanosleep()(req, rem);
    }
    if !rem.is_null() {
        (*rem).tv_sec = 0;
        (*rem).tv_nsec = 0;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = origins::real_socket()(domain, ty, protocol);
    if hook_enabled() && fd >= 0 {
        fd_manager().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, config::tcp_connect_timeout_ms().get())
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(sockfd, "accept", Event::Read, TimeoutKind::Recv, || {
        origins::real_accept()(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && hook_enabled() {
        fd_manager().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, || {
        origins::real_read()(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, || {
        origins::real_readv()(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", Event::Read, TimeoutKind::Recv, || {
        origins::real_recv()(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", Event::Read, TimeoutKind::Recv, || {
        origins::real_recvfrom()(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", Event::Read, TimeoutKind::Recv, || {
        origins::real_recvmsg()(sockfd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, TimeoutKind::Send, || {
        origins::real_write()(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, || {
        origins::real_writev()(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(sockfd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "send", Event::Write, TimeoutKind::Send, || {
        origins::real_send()(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(sockfd, "sendto", Event::Write, TimeoutKind::Send, || {
        origins::real_sendto()(sockfd, buf, len, flags, dest_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(sockfd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "sendmsg", Event::Write, TimeoutKind::Send, || {
        origins::real_sendmsg()(sockfd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return origins::real_close()(fd);
    }
    if let Some(_ctx) = fd_manager().get(fd, false) {
        // Wake anything parked on the fd before the descriptor goes away.
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().remove(fd);
    }
    origins::real_close()(fd)
}

/// Non-variadic export: every `fcntl` command passes at most one word of
/// argument, so a single trailing `usize` is ABI-compatible with the C
/// declaration on the supported targets.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if hook_enabled() {
                if let Some(ctx) = managed_socket(fd) {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The kernel flag stays whatever the runtime needs.
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                }
            }
            origins::real_fcntl()(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = origins::real_fcntl()(fd, cmd);
            if flags == -1 || !hook_enabled() {
                return flags;
            }
            match managed_socket(fd) {
                // Report the user's view of the blocking flag, not the
                // forced kernel state.
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => origins::real_fcntl()(fd, cmd, arg),
    }
}

/// Non-variadic export; see `fcntl` above for the ABI argument.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO && hook_enabled() && !arg.is_null() {
        if let Some(ctx) = managed_socket(fd) {
            ctx.set_user_nonblock(*(arg as *const c_int) != 0);
            // Keep the kernel side non-blocking regardless of the
            // user-requested mode.
            let mut forced: c_int = 1;
            return origins::real_ioctl()(fd, request, &mut forced as *mut c_int);
        }
    }
    origins::real_ioctl()(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    origins::real_getsockopt()(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_manager().get(sockfd, true) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zeroed timeval means "block forever" in socket semantics.
            ctx.set_timeout(
                kind,
                if ms == 0 {
                    spindle_core::constants::TIMEOUT_NONE
                } else {
                    ms
                },
            );
        }
    }
    origins::real_setsockopt()(sockfd, level, optname, optval, optlen)
}

fn managed_socket(fd: c_int) -> Option<Arc<FdCtx>> {
    let ctx = fd_manager().get(fd, false)?;
    if ctx.is_socket() && !ctx.is_closed() {
        Some(ctx)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn reactor(name: &str) -> Arc<IoManager> {
        IoManager::new(2, false, name)
    }

    #[test]
    fn test_passthrough_when_disabled() {
        let mut pair = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        assert!(!hook_enabled());

        let n = unsafe { send(pair[0], b"hi".as_ptr() as *const c_void, 2, 0) };
        assert_eq!(n, 2);
        let mut buf = [0u8; 8];
        let n = unsafe { recv(pair[1], buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");

        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_usleep_parks_fiber() {
        let iom = reactor("hook-sleep");
        let (tx, rx) = mpsc::channel();
        iom.spawn(move || {
            set_hook_enabled(true);
            let start = Instant::now();
            let rc = unsafe { usleep(30_000) };
            tx.send((rc, start.elapsed())).unwrap();
        });
        let (rc, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(rc, 0);
        assert!(elapsed >= Duration::from_millis(25), "only slept {:?}", elapsed);
        iom.stop();
    }

    #[test]
    fn test_recv_times_out_with_etimedout() {
        let iom = reactor("hook-timeout");
        let mut pair = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
        };
        assert_eq!(rc, 0);

        let (tx, rx) = mpsc::channel();
        let fd = pair[0];
        iom.spawn(move || {
            set_hook_enabled(true);
            let ctx = fd_manager().get(fd, true).unwrap();
            ctx.set_timeout(TimeoutKind::Recv, 50);

            let start = Instant::now();
            let mut buf = [0u8; 8];
            let n = unsafe { recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
            tx.send((n, errno(), start.elapsed())).unwrap();
        });

        let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(40), "returned after {:?}", elapsed);
        iom.stop();
        fd_manager().remove(pair[0]);
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_recv_wakes_on_data() {
        let iom = reactor("hook-wake");
        let mut pair = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
        };
        assert_eq!(rc, 0);

        let (tx, rx) = mpsc::channel();
        let fd = pair[0];
        iom.spawn(move || {
            set_hook_enabled(true);
            fd_manager().get(fd, true);
            let mut buf = [0u8; 16];
            let n = unsafe { recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
            tx.send((n, buf)).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        let n = unsafe { libc::send(pair[1], b"ping".as_ptr() as *const c_void, 4, 0) };
        assert_eq!(n, 4);

        let (n, buf) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
        iom.stop();
        fd_manager().remove(pair[0]);
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_user_nonblock_passes_through() {
        let iom = reactor("hook-nonblock");
        let mut pair = [0 as c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
        };
        assert_eq!(rc, 0);

        let (tx, rx) = mpsc::channel();
        let fd = pair[0];
        iom.spawn(move || {
            set_hook_enabled(true);
            fd_manager().get(fd, true);
            // Explicit user non-blocking: EAGAIN must surface immediately.
            let rc = unsafe { fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK as usize) };
            assert_ne!(rc, -1);
            let mut buf = [0u8; 8];
            let n = unsafe { recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
            tx.send((n, errno())).unwrap();
        });

        let (n, err) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::EAGAIN);
        iom.stop();
        fd_manager().remove(pair[0]);
        unsafe {
            libc::close(pair[0]);
            libc::close(pair[1]);
        }
    }

    #[test]
    fn test_fcntl_getfl_reports_user_view() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        set_hook_enabled(true);
        fd_manager().get(fd, true);

        // Kernel side is forced non-blocking, but the user never asked.
        let flags = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        let rc = unsafe { fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK as usize) };
        assert_ne!(rc, -1);
        let flags = unsafe { fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        set_hook_enabled(false);
        fd_manager().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    #[ignore = "needs an unroutable address and real network stack timing"]
    fn test_connect_times_out() {
        let iom = reactor("hook-connect");
        let (tx, rx) = mpsc::channel();
        iom.spawn(move || {
            set_hook_enabled(true);
            let fd = unsafe { socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            assert!(fd >= 0);
            // RFC 5737 TEST-NET-1, expected to drop SYNs.
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 9999u16.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_be_bytes([192, 0, 2, 1]).to_be(),
                },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                connect_with_timeout(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
                    200,
                )
            };
            tx.send((rc, errno())).unwrap();
            unsafe { close(fd) };
        });
        let (rc, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rc, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        iom.stop();
    }
}
