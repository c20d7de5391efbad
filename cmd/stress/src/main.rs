//! Stress test - mailbox throughput and lock contention
//!
//! Phases:
//! 1. push/pop: N producers copy small payloads into one service
//! 2. push/move: same, moving heap buffers instead of copying
//! 3. lock contention: spin, CLH, MCS and RW locks guarding one counter
//!
//! Usage: `stress [messages-per-producer] [producers]`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use svcio::{
    ClhLock, Delivery, McsLock, ReactorConfig, Runtime, RwSpinLock, Service, SpinLock,
};
use svcio::{EVENT_MSG, MSG_SEND};

fn arg(n: usize, default: usize) -> usize {
    std::env::args()
        .nth(n)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn mailbox_phase(runtime: &Runtime, name: &str, messages: usize, producers: usize, moved: bool) {
    let handled = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    let total = (messages * producers) as u64;

    let (pushed, drained) = {
        let rt = runtime.services();
        let sink = Service::new(rt);
        let (h, b) = (Arc::clone(&handled), Arc::clone(&bytes));
        sink.start(move |_: &Arc<Service>, ev: Delivery<'_>| {
            b.fetch_add(ev.payload.len() as u64, Ordering::Relaxed);
            h.fetch_add(1, Ordering::Relaxed);
            true
        });

        let start = Instant::now();
        let workers: Vec<_> = (0..producers)
            .map(|p| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    let payload = [p as u8; 64];
                    for i in 0..messages {
                        let ok = if moved {
                            sink.send_move(p as u32 + 1, payload.to_vec(), EVENT_MSG | MSG_SEND, i as u32)
                        } else {
                            sink.send(p as u32 + 1, &payload, EVENT_MSG | MSG_SEND, i as u32)
                        };
                        if !ok {
                            break;
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            let _ = w.join();
        }
        let pushed = start.elapsed();

        let deadline = Instant::now() + Duration::from_secs(60);
        while handled.load(Ordering::Relaxed) < total && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let drained = start.elapsed();
        sink.stop();
        (pushed, drained)
    };

    let done = handled.load(Ordering::Relaxed);
    println!("--- {} ---", name);
    println!("Messages:    {}/{}", done, total);
    println!("Bytes:       {}", bytes.load(Ordering::Relaxed));
    println!("Push time:   {:?}", pushed);
    println!("Drain time:  {:?}", drained);
    println!("Throughput:  {:.0} msgs/sec\n", done as f64 / drained.as_secs_f64());
}

fn contend<F>(name: &str, threads: usize, iters: usize, f: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                for _ in 0..iters {
                    f();
                }
            })
        })
        .collect();
    for w in workers {
        let _ = w.join();
    }
    let elapsed = start.elapsed();
    println!(
        "{:<8} {:>10.0} ops/sec",
        name,
        (threads * iters) as f64 / elapsed.as_secs_f64()
    );
}

fn main() {
    println!("=== svcio Stress Test ===\n");

    let messages = arg(1, 200_000);
    let producers = arg(2, 4);

    let mut runtime = match Runtime::new(ReactorConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.start() {
        eprintln!("runtime failed to start: {}", e);
        std::process::exit(1);
    }

    mailbox_phase(&runtime, "push/pop", messages, producers, false);
    mailbox_phase(&runtime, "push/move", messages, producers, true);
    runtime.shutdown();

    println!("--- lock contention ({} threads) ---", producers);
    let iters = messages;
    let spin = Arc::new(SpinLock::new(0u64));
    contend("spin", producers, iters, move || *spin.lock() += 1);
    let clh = Arc::new(ClhLock::new(0u64));
    contend("clh", producers, iters, move || *clh.lock() += 1);
    let mcs = Arc::new(McsLock::new(0u64));
    contend("mcs", producers, iters, move || *mcs.lock() += 1);
    let rw = Arc::new(RwSpinLock::new(0u64));
    contend("rw", producers, iters, move || *rw.write() += 1);

    println!("\n=== Stress Test Complete ===");
}
