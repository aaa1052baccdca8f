//! Original libc entry points
//!
//! Every interposed symbol needs a way to reach the real implementation;
//! `dlsym(RTLD_NEXT, ..)` resolves them all once, on first use. The
//! resolved addresses live in atomics so lookups after initialization are
//! a single load.
//!
//! `fcntl` and `ioctl` are genuinely variadic in libc; variadic *function
//! pointers* are expressible in stable Rust, so their table entries keep
//! the real signature.

use std::sync::atomic::Ordering;
use std::sync::Once;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

pub type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
pub type UsleepFn = unsafe extern "C" fn(libc::useconds_t) -> c_int;
pub type NanosleepFn = unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int;
pub type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub type ConnectFn = unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int;
pub type AcceptFn = unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type ReadvFn = unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub type RecvfromFn = unsafe extern "C" fn(
    c_int,
    *mut c_void,
    size_t,
    c_int,
    *mut libc::sockaddr,
    *mut socklen_t,
) -> ssize_t;
pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type WritevFn = unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type SendtoFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    size_t,
    c_int,
    *const libc::sockaddr,
    socklen_t,
) -> ssize_t;
pub type SendmsgFn = unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
pub type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
pub type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

macro_rules! origin_table {
    ($(($getter:ident, $ty:ty, $sym:literal)),+ $(,)?) => {
        #[allow(non_upper_case_globals)]
        mod addrs {
            use std::sync::atomic::AtomicUsize;
            $(pub static $getter: AtomicUsize = AtomicUsize::new(0);)+
        }

        fn resolve_all() {
            $(
                let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, $sym.as_ptr()) } as usize;
                assert!(addr != 0, "dlsym({}) failed", stringify!($getter));
                addrs::$getter.store(addr, Ordering::Release);
            )+
        }

        $(
            #[inline]
            pub fn $getter() -> $ty {
                ensure_resolved();
                let addr = addrs::$getter.load(Ordering::Acquire);
                unsafe { std::mem::transmute::<usize, $ty>(addr) }
            }
        )+
    };
}

origin_table!(
    (real_sleep, SleepFn, c"sleep"),
    (real_usleep, UsleepFn, c"usleep"),
    (real_nanosleep, NanosleepFn, c"nanosleep"),
    (real_socket, SocketFn, c"socket"),
    (real_connect, ConnectFn, c"connect"),
    (real_accept, AcceptFn, c"accept"),
    (real_read, ReadFn, c"read"),
    (real_readv, ReadvFn, c"readv"),
    (real_recv, RecvFn, c"recv"),
    (real_recvfrom, RecvfromFn, c"recvfrom"),
    (real_recvmsg, RecvmsgFn, c"recvmsg"),
    (real_write, WriteFn, c"write"),
    (real_writev, WritevFn, c"writev"),
    (real_send, SendFn, c"send"),
    (real_sendto, SendtoFn, c"sendto"),
    (real_sendmsg, SendmsgFn, c"sendmsg"),
    (real_close, CloseFn, c"close"),
    (real_fcntl, FcntlFn, c"fcntl"),
    (real_ioctl, IoctlFn, c"ioctl"),
    (real_getsockopt, GetsockoptFn, c"getsockopt"),
    (real_setsockopt, SetsockoptFn, c"setsockopt"),
);

static RESOLVE: Once = Once::new();

/// Resolve the whole table once; idempotent and thread-safe.
pub fn ensure_resolved() {
    RESOLVE.call_once(resolve_all);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_symbols_resolve() {
        ensure_resolved();
        // A resolved pointer must actually work.
        let rc = unsafe { real_usleep()(1) };
        assert_eq!(rc, 0);
    }
}
