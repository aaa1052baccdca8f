//! Basic fiber runtime example
//!
//! Spawns a batch of fibers over a few workers, shows cooperative
//! yielding and one-shot/cyclic timers.
//!
//! # Environment Variables
//!
//! - `SPINDLE_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `SPINDLE_LOG_FLUSH=1` - Flush log output immediately

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spindle_core::log_info;
use spindle_runtime::{Fiber, IoManager};

// SPINDLE_LOG_LEVEL=debug cargo run -p spindle-basic
fn main() {
    println!("=== spindle basic example ===\n");

    let iom = IoManager::new(4, false, "basic");
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=6 {
        let c = completed.clone();
        iom.spawn(move || {
            log_info!("fiber {} started (id={})", i, Fiber::current_id());
            for j in 0..3 {
                log_info!("fiber {} iteration {}", i, j);
                Fiber::yield_to_ready();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let heartbeat = iom.add_timer(
        100,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            println!("heartbeat {}", n);
        },
        true,
    );
    let c = completed.clone();
    iom.add_timer(
        50,
        move || {
            println!("one-shot timer fired, {} fibers done so far", c.load(Ordering::SeqCst));
        },
        false,
    );

    while completed.load(Ordering::SeqCst) < 6 {
        std::thread::sleep(Duration::from_millis(20));
    }
    std::thread::sleep(Duration::from_millis(350));

    // A live cyclic timer keeps the reactor alive; disarm before stopping.
    heartbeat.cancel();
    iom.stop();

    println!(
        "\n{} fibers completed, {} heartbeats",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
    println!("=== done ===");
}
