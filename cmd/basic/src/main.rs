//! Basic svcio example
//!
//! Two services bounce a counter back and forth over a 2-thread reactor,
//! while a repeating timer reports progress.
//!
//! # Environment Variables
//!
//! - `SVCIO_FLUSH_EPRINT=1` - Flush log output immediately
//! - `SVCIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `SVCIO_CONCURRENT_THREADS=N` - Dispatch threads (default 2)
//! - `SVCIO_MONITOR_INTERVAL_MS=N` - Drain-stall monitor tick (default 5000)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use svcio::{kdebug, kinfo, Delivery, ReactorConfig, Runtime, Service};
use svcio::{EVENT_MSG, EVENT_RUN_EVERY, MSG_PING, MSG_PONG};

const ROUNDS: u32 = 10_000;

// SVCIO_LOG_LEVEL=debug cargo run -p svcio-basic
fn main() {
    println!("=== svcio Basic Example ===\n");

    let config = ReactorConfig::from_env();
    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };

    let rounds = Arc::new(AtomicU32::new(0));

    let result = runtime.block_on(|rt| {
        let ping = Service::new(rt);
        let pong = Service::new(rt);

        // pong answers every PING with a PONG carrying the same counter
        let pong_id = pong.start(|svc: &Arc<Service>, ev: Delivery<'_>| {
            if ev.is_msg(MSG_PING) {
                if let Some(peer) = svc.runtime().services().gain(ev.source_id) {
                    peer.send(svc.id(), ev.payload, EVENT_MSG | MSG_PONG, ev.token + 1);
                }
            }
            true
        });

        let r = Arc::clone(&rounds);
        let ping_id = ping.start(move |svc: &Arc<Service>, ev: Delivery<'_>| {
            match ev.kind {
                k if k == EVENT_MSG | MSG_PONG => {
                    r.store(ev.token, Ordering::Release);
                    if ev.token < ROUNDS {
                        if let Some(peer) = svc.runtime().services().gain(ev.source_id) {
                            peer.send(svc.id(), ev.payload, EVENT_MSG | MSG_PING, ev.token);
                        }
                    }
                }
                EVENT_RUN_EVERY => {
                    kdebug!("[ping] {} rounds so far", r.load(Ordering::Acquire));
                }
                _ => {}
            }
            true
        });
        kinfo!("ping={:#x} pong={:#x}", ping_id, pong_id);

        // stalled-drain reports go to ping, at SVCIO_MONITOR_INTERVAL_MS
        rt.start_monitor_default(ping_id);
        let progress = ping.run_every(100, 1);
        pong.send(ping_id, b"ball", EVENT_MSG | MSG_PING, 0);

        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        while rounds.load(Ordering::Acquire) < ROUNDS {
            if start.elapsed() > timeout {
                println!("WARNING: Timeout!");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Some(progress) = progress {
            progress.stop();
        }
        start.elapsed()
    });

    match result {
        Ok(elapsed) => {
            let done = rounds.load(Ordering::Acquire);
            kinfo!("{} round trips in {:?}", done, elapsed);
            println!(
                "{} round trips, {:.0} per second",
                done,
                done as f64 / elapsed.as_secs_f64()
            );
        }
        Err(e) => eprintln!("runtime failed: {}", e),
    }

    println!("\n=== Example Complete ===");
}
