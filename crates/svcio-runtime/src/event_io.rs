//! The reactor
//!
//! An `EventIo` is shared by a fixed set of dispatch threads. Each of them
//! runs [`EventIo::dispatch`]: block on the wake channel, fire due timers,
//! then drain the posted-job queue.
//!
//! # Post-or-cancel
//!
//! Every job handed to [`EventIo::post_queued`] is consumed exactly once,
//! either by its `work` closure on a dispatch thread or by its `cancel`
//! closure. The running flag is only read and cleared under the job-queue
//! lock, so a post racing with [`EventIo::stop_loop`] either lands in the
//! queue before stop drains it, or sees the reactor stopped and cancels
//! synchronously.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use svcio_core::error::{SvcError, SvcResult};
use svcio_core::{kdebug, ktrace, SpinLock};

use crate::config::ReactorConfig;
use crate::timer::heap::TimerHeap;
use crate::timer::EventTimer;
use crate::wake::{new_wake_channel, WakeChannel};

/// A job sitting in the reactor queue
pub trait QueuedEvent: Send {
    fn run(self: Box<Self>);
    fn cancel(self: Box<Self>);
}

struct Posted<T, W, C> {
    item: T,
    work: W,
    cancel: C,
}

impl<T, W, C> QueuedEvent for Posted<T, W, C>
where
    T: Send,
    W: FnOnce(T) + Send,
    C: FnOnce(T) + Send,
{
    fn run(self: Box<Self>) {
        let Posted { item, work, .. } = *self;
        work(item);
    }

    fn cancel(self: Box<Self>) {
        let Posted { item, cancel, .. } = *self;
        cancel(item);
    }
}

static NEXT_REACTOR_KEY: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// (reactor key, dispatcher index) of the loop running on this thread
    static CURRENT_LOOP: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

pub struct EventIo {
    key: usize,
    config: ReactorConfig,
    running: AtomicBool,
    queue: SpinLock<Vec<Box<dyn QueuedEvent>>>,
    timers: TimerHeap<Arc<EventTimer>>,
    wake: Box<dyn WakeChannel>,
    concurrent_threads: AtomicUsize,
    /// Threads currently inside `dispatch`
    active: AtomicUsize,
    /// Threads blocked in the wake channel
    idle: AtomicUsize,
    /// Next dispatcher index to hand out
    dispatchers: AtomicUsize,
    /// `EventIoThread`s started on this reactor
    attached: AtomicUsize,
    epoch: Instant,
    loop_time: AtomicU64,
}

impl EventIo {
    pub fn new(config: ReactorConfig) -> SvcResult<Arc<Self>> {
        config.validate().map_err(SvcError::InvalidConfig)?;
        let wake = new_wake_channel()?;
        Ok(Self::with_wake_channel(config, wake))
    }

    /// Build on a caller-supplied wake channel. `config` is trusted.
    pub fn with_wake_channel(config: ReactorConfig, wake: Box<dyn WakeChannel>) -> Arc<Self> {
        let key = NEXT_REACTOR_KEY.fetch_add(1, Ordering::Relaxed);
        kdebug!("reactor {} created ({} threads)", key, config.concurrent_threads);
        Arc::new(Self {
            key,
            concurrent_threads: AtomicUsize::new(config.concurrent_threads),
            config,
            running: AtomicBool::new(true),
            queue: SpinLock::new(Vec::new()),
            timers: TimerHeap::new(),
            wake,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            dispatchers: AtomicUsize::new(0),
            attached: AtomicUsize::new(0),
            epoch: Instant::now(),
            loop_time: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_concurrent_threads(&self, n: usize) {
        self.concurrent_threads.store(n, Ordering::Release);
    }

    pub fn concurrent_threads(&self) -> usize {
        self.concurrent_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub fn busy_threads(&self) -> usize {
        self.active
            .load(Ordering::Acquire)
            .saturating_sub(self.idle.load(Ordering::Acquire))
    }

    /// Dispatcher indices handed out so far
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.load(Ordering::Acquire)
    }

    pub(crate) fn attach_thread(&self) -> usize {
        self.attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn attached_threads(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Milliseconds since the reactor was created, as of the current loop
    /// iteration
    #[inline]
    pub fn loop_time(&self) -> u64 {
        self.loop_time.load(Ordering::Relaxed)
    }

    /// Milliseconds since the reactor was created, read now
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn update_loop_time(&self) -> u64 {
        let now = self.now_ms();
        self.loop_time.store(now, Ordering::Relaxed);
        now
    }

    /// True on a thread currently dispatching this reactor
    pub fn is_in_loop_thread(&self) -> bool {
        self.current_dispatcher().is_some()
    }

    /// Index of the calling dispatch thread, if it belongs to this reactor
    pub fn current_dispatcher(&self) -> Option<usize> {
        CURRENT_LOOP.with(|cell| match cell.get() {
            Some((key, index)) if key == self.key => Some(index),
            _ => None,
        })
    }

    /// Queue `item` for `work` on a dispatch thread, or hand it to `cancel`
    /// right away when the reactor is stopped.
    pub fn post_queued<T, W, C>(&self, item: T, work: W, cancel: C)
    where
        T: Send + 'static,
        W: FnOnce(T) + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let job: Box<dyn QueuedEvent> = Box::new(Posted { item, work, cancel });
        let rejected = {
            let mut queue = self.queue.lock();
            if self.running.load(Ordering::Acquire) {
                queue.push(job);
                None
            } else {
                Some(job)
            }
        };
        match rejected {
            None => self.wake.wake(),
            Some(job) => job.cancel(),
        }
    }

    /// Fire-and-forget job with nothing to release on cancel
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_queued((), move |()| work(), |()| {});
    }

    /// Run inline on one of this reactor's dispatch threads, queue otherwise
    pub fn run_in_loop<T, W, C>(&self, item: T, work: W, cancel: C)
    where
        T: Send + 'static,
        W: FnOnce(T) + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        if self.is_in_loop_thread() && self.is_running() {
            work(item);
        } else {
            self.post_queued(item, work, cancel);
        }
    }

    /// Always queue, even from a dispatch thread
    pub fn queue_in_loop<T, W, C>(&self, item: T, work: W, cancel: C)
    where
        T: Send + 'static,
        W: FnOnce(T) + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        self.post_queued(item, work, cancel);
    }

    /// Run queued jobs. Returns how many were taken off the queue.
    pub fn do_events(&self) -> usize {
        let jobs = std::mem::take(&mut *self.queue.lock());
        let n = jobs.len();
        for job in jobs {
            if self.is_running() {
                job.run();
            } else {
                job.cancel();
            }
        }
        n
    }

    pub(crate) fn timers(&self) -> &TimerHeap<Arc<EventTimer>> {
        &self.timers
    }

    fn fire_timers(&self, now: u64) {
        for timer in self.timers.pop_expired(now) {
            timer.fire(self);
        }
    }

    fn next_wait(&self) -> Duration {
        let max_wait = self.config.max_wait;
        match self.timers.next_deadline() {
            Some(deadline) => {
                let now = self.now_ms();
                Duration::from_millis(deadline.saturating_sub(now)).min(max_wait)
            }
            None => max_wait,
        }
    }

    /// Dispatch loop for the calling thread; returns after `stop_loop`.
    pub fn dispatch(&self) {
        let index = self.dispatchers.fetch_add(1, Ordering::AcqRel);
        let prev = CURRENT_LOOP.with(|cell| cell.replace(Some((self.key, index))));
        self.active.fetch_add(1, Ordering::AcqRel);
        self.idle.fetch_add(1, Ordering::AcqRel);
        ktrace!("reactor {} dispatcher {} entered", self.key, index);

        while self.is_running() {
            let timeout = self.next_wait();
            self.wake.wait(Some(timeout));

            self.idle.fetch_sub(1, Ordering::AcqRel);
            let now = self.update_loop_time();
            self.fire_timers(now);
            self.do_events();
            self.idle.fetch_add(1, Ordering::AcqRel);
        }

        self.idle.fetch_sub(1, Ordering::AcqRel);
        self.active.fetch_sub(1, Ordering::AcqRel);
        CURRENT_LOOP.with(|cell| cell.set(prev));
        ktrace!("reactor {} dispatcher {} left", self.key, index);
    }

    /// Stop every dispatcher and cancel all pending work.
    ///
    /// Returns false if the reactor was already stopped.
    pub fn stop_loop(&self) -> bool {
        let pending = {
            let mut queue = self.queue.lock();
            if !self.running.swap(false, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *queue)
        };
        kdebug!("reactor {} stopping, {} jobs cancelled", self.key, pending.len());
        for job in pending {
            job.cancel();
        }
        drop(self.timers.clear());
        self.wake.wake_all();
        true
    }
}

impl Drop for EventIo {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::CondvarWake;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    fn test_config() -> ReactorConfig {
        ReactorConfig::new()
            .concurrent_threads(2)
            .max_wait(Duration::from_millis(20))
    }

    fn spawn_dispatchers(io: &Arc<EventIo>, n: usize) -> Vec<thread::JoinHandle<()>> {
        (0..n)
            .map(|_| {
                let io = Arc::clone(io);
                thread::spawn(move || io.dispatch())
            })
            .collect()
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_post_runs_on_dispatcher() {
        let io = EventIo::new(test_config()).unwrap();
        let handles = spawn_dispatchers(&io, 2);

        let counter = Arc::new(AtomicU32::new(0));
        let in_loop = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let in_loop = Arc::clone(&in_loop);
            let io2 = Arc::clone(&io);
            io.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if io2.is_in_loop_thread() {
                    in_loop.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert!(wait_for(|| counter.load(Ordering::SeqCst) == 100));
        assert_eq!(in_loop.load(Ordering::SeqCst), 100);
        assert!(!io.is_in_loop_thread());

        assert!(io.stop_loop());
        assert!(!io.stop_loop());
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_post_after_stop_cancels() {
        let io = EventIo::new(test_config()).unwrap();
        io.stop_loop();

        let cancelled = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&cancelled);
        io.post_queued(
            7u32,
            |_| panic!("work must not run"),
            move |v| {
                c.fetch_add(v, Ordering::SeqCst);
            },
        );
        assert_eq!(cancelled.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_stop_cancels_queued() {
        // No dispatcher: everything stays queued until stop
        let io = EventIo::with_wake_channel(test_config(), Box::new(CondvarWake::new()));
        let ran = Arc::new(AtomicU32::new(0));
        let cancelled = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let r = Arc::clone(&ran);
            let c = Arc::clone(&cancelled);
            io.post_queued(
                (),
                move |()| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                move |()| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        io.stop_loop();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_post_or_cancel_exactly_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5000;

        let io = EventIo::new(test_config()).unwrap();
        let handles = spawn_dispatchers(&io, 2);

        let ran = Arc::new(AtomicU32::new(0));
        let cancelled = Arc::new(AtomicU32::new(0));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let io = Arc::clone(&io);
                let ran = Arc::clone(&ran);
                let cancelled = Arc::clone(&cancelled);
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let r = Arc::clone(&ran);
                        let c = Arc::clone(&cancelled);
                        io.post_queued(
                            (),
                            move |()| {
                                r.fetch_add(1, Ordering::SeqCst);
                            },
                            move |()| {
                                c.fetch_add(1, Ordering::SeqCst);
                            },
                        );
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(5));
        io.stop_loop();
        for p in producers {
            p.join().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }

        let total = ran.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst);
        assert_eq!(total as usize, PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn test_run_in_loop_inline_on_dispatcher() {
        let io = EventIo::new(test_config()).unwrap();
        let handles = spawn_dispatchers(&io, 1);

        let order = Arc::new(SpinLock::new(Vec::new()));
        let io2 = Arc::clone(&io);
        let o = Arc::clone(&order);
        io.post(move || {
            let o2 = Arc::clone(&o);
            io2.run_in_loop((), move |()| o2.lock().push("inline"), |()| {});
            let o3 = Arc::clone(&o);
            io2.queue_in_loop((), move |()| o3.lock().push("queued"), |()| {});
            o.lock().push("outer");
        });

        assert!(wait_for(|| order.lock().len() == 3));
        assert_eq!(*order.lock(), vec!["inline", "outer", "queued"]);

        io.stop_loop();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_idle_accounting() {
        let io = EventIo::new(test_config()).unwrap();
        let handles = spawn_dispatchers(&io, 2);
        assert!(wait_for(|| io.idle_threads() == 2));
        assert_eq!(io.dispatcher_count(), 2);

        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        io.post(move || {
            while !g.load(Ordering::Acquire) {
                thread::yield_now();
            }
        });
        assert!(wait_for(|| io.busy_threads() == 1));
        gate.store(true, Ordering::Release);
        assert!(wait_for(|| io.idle_threads() == 2));

        io.stop_loop();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(io.idle_threads(), 0);
    }

    #[test]
    fn test_loop_time_advances() {
        let io = EventIo::new(test_config()).unwrap();
        let handles = spawn_dispatchers(&io, 1);
        thread::sleep(Duration::from_millis(60));
        assert!(wait_for(|| io.loop_time() >= 20));
        io.stop_loop();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ReactorConfig::new().registry_initial_capacity(0);
        assert!(matches!(
            EventIo::new(config),
            Err(SvcError::InvalidConfig(_))
        ));
    }
}
