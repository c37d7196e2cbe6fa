//! Fixed-size worker pool used by the asset loader.
//!
//! Jobs are fire-and-forget closures. Results travel back through whatever
//! the closure captured (the loader uses a channel). `wait` is a barrier: it
//! returns once the queue is empty and no worker is running a job.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Result;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Threads are being spawned.
    Starting,
    Running,
    /// Shutdown requested; workers exit on their next wake.
    Closing,
    Closed,
}

struct Queue {
    jobs: VecDeque<Job>,
    /// Jobs popped but not yet finished.
    active: usize,
    state: SchedulerState,
}

impl Queue {
    fn is_drained(&self) -> bool {
        self.jobs.is_empty() && self.active == 0
    }
}

struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns `threads` workers. With zero threads every job runs inline in
    /// `submit`.
    pub fn new(threads: usize) -> Result<Self> {
        let mut scheduler = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    active: 0,
                    state: SchedulerState::Starting,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            workers: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!("nyas-loader-{i}"))
                .spawn(move || worker_loop(&shared))?;
            scheduler.workers.push(handle);
        }

        scheduler.shared.queue.lock().state = SchedulerState::Running;
        debug!("scheduler running with {threads} worker(s)");
        Ok(scheduler)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.queue.lock().state
    }

    /// Jobs queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_boxed(Box::new(job));
    }

    pub fn submit_boxed(&self, job: Job) {
        if self.workers.is_empty() {
            run_job(job);
            return;
        }
        let mut queue = self.shared.queue.lock();
        debug_assert_eq!(queue.state, SchedulerState::Running);
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.work.notify_one();
    }

    /// Blocks until every submitted job has finished.
    pub fn wait(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.is_drained() {
            self.shared.idle.wait(&mut queue);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.state = SchedulerState::Closing;
            if !queue.jobs.is_empty() {
                warn!("scheduler closing with {} unstarted job(s)", queue.jobs.len());
                queue.jobs.clear();
            }
        }
        self.shared.work.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("loader worker exited by panic");
            }
        }
        self.shared.queue.lock().state = SchedulerState::Closed;
    }
}

fn worker_loop(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.state == SchedulerState::Closing {
            break;
        }
        let Some(job) = queue.jobs.pop_front() else {
            shared.work.wait(&mut queue);
            continue;
        };

        queue.active += 1;
        MutexGuard::unlocked(&mut queue, || run_job(job));
        queue.active -= 1;

        if queue.is_drained() {
            shared.idle.notify_all();
        }
    }
}

/// A panicking job is logged and counted as finished so `wait` cannot hang.
fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("loader job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn two_jobs_both_land() {
        let x1 = Arc::new(AtomicUsize::new(0));
        let x2 = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(4).unwrap();
        {
            let x1 = Arc::clone(&x1);
            scheduler.submit(move || x1.store(1, Ordering::SeqCst));
        }
        {
            let x2 = Arc::clone(&x2);
            scheduler.submit(move || x2.store(2, Ordering::SeqCst));
        }
        scheduler.wait();
        assert_eq!(x1.load(Ordering::SeqCst), 1);
        assert_eq!(x2.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn every_job_runs_exactly_once() {
        const N: usize = 500;
        let targets: Arc<Vec<AtomicUsize>> = Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(8).unwrap();
        for i in 0..N {
            let targets = Arc::clone(&targets);
            let runs = Arc::clone(&runs);
            scheduler.submit(move || {
                targets[i].store(i, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.wait();
        assert_eq!(runs.load(Ordering::SeqCst), N);
        for (i, target) in targets.iter().enumerate() {
            assert_eq!(target.load(Ordering::SeqCst), i);
        }
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn zero_threads_runs_inline() {
        let scheduler = Scheduler::new(0).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler.submit(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        scheduler.wait();
        assert_eq!(scheduler.threads(), 0);
    }

    #[test]
    fn panicking_job_does_not_block_wait() {
        let scheduler = Scheduler::new(2).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        scheduler.submit(|| panic!("decode blew up"));
        let flag = Arc::clone(&ran);
        scheduler.submit(move || flag.store(true, Ordering::SeqCst));
        scheduler.wait();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn jobs_execute_without_holding_the_queue() {
        let scheduler = Scheduler::new(2).unwrap();
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let met = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&met);
        scheduler.submit(move || {
            flag.store(rx.recv_timeout(Duration::from_secs(10)).is_ok(), Ordering::SeqCst);
        });
        scheduler.submit(move || {
            let _ = tx.send(());
        });
        scheduler.wait();
        assert!(met.load(Ordering::SeqCst));
    }

    #[test]
    fn scheduler_is_reusable_after_wait() {
        let scheduler = Scheduler::new(3).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for round in 1..=3 {
            for _ in 0..10 {
                let count = Arc::clone(&count);
                scheduler.submit(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
            scheduler.wait();
            assert_eq!(count.load(Ordering::SeqCst), round * 10);
        }
    }

    #[test]
    fn drop_joins_idle_workers() {
        let scheduler = Scheduler::new(4).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        drop(scheduler);
    }
}
