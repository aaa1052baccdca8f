//! Fiber-hooked TCP echo server
//!
//! Written entirely against the plain blocking libc socket API; linking
//! `spindle-hook` turns every blocking call into a fiber suspension, so
//! one fiber per connection scales to a handful of worker threads.
//!
//! Run with `cargo run -p spindle-echo [port]`, then try
//! `printf 'hello\n' | nc 127.0.0.1 8020`.

use std::sync::Arc;

use libc::{c_int, c_void, socklen_t};

use spindle_core::{log_error, log_info};
use spindle_runtime::IoManager;
use spindle_hook::set_hook_enabled;

fn serve_connection(client: c_int) {
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::recv(client, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n <= 0 {
            break;
        }
        let mut sent = 0isize;
        while sent < n {
            let rc = unsafe {
                libc::send(
                    client,
                    buf.as_ptr().add(sent as usize) as *const c_void,
                    (n - sent) as usize,
                    0,
                )
            };
            if rc <= 0 {
                break;
            }
            sent += rc;
        }
    }
    unsafe { libc::close(client) };
}

fn run_listener(iom: Arc<IoManager>, port: u16) {
    set_hook_enabled(true);

    let listener = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if listener < 0 {
        log_error!("socket failed");
        return;
    }
    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            listener,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as socklen_t,
        );
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
        )
    };
    if rc != 0 {
        log_error!("bind to port {} failed", port);
        unsafe { libc::close(listener) };
        return;
    }
    if unsafe { libc::listen(listener, 128) } != 0 {
        log_error!("listen failed");
        unsafe { libc::close(listener) };
        return;
    }
    log_info!("echo server listening on port {}", port);

    loop {
        // Hooked accept: parks this fiber until a connection arrives.
        let client =
            unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client < 0 {
            log_error!("accept failed");
            break;
        }
        log_info!("connection accepted, fd {}", client);
        iom.spawn(move || {
            set_hook_enabled(true);
            serve_connection(client);
        });
    }
    unsafe { libc::close(listener) };
}

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8020);

    let iom = IoManager::new(4, false, "echo");
    let iom2 = iom.clone();
    iom.spawn(move || run_listener(iom2, port));

    // The listener fiber never exits; park the main thread.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
