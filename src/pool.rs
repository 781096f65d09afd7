//! Worker Thread Pool
//!
//! Fixed-size pool of normal-priority workers with a separate, grown-on-demand
//! lane of high-priority workers. Jobs are tagged with a [`ThreadGroup`] so a
//! request can fan out and `join` its whole group before returning.
//!
//! ## Queue discipline
//!
//! - `Normal` jobs append to the FIFO served by any free worker.
//! - `High` jobs append to a separate high-priority FIFO.
//! - `Immediate` jobs prepend to the high-priority FIFO.
//!
//! Workers drain the high-priority FIFO before the normal one. If a
//! high-priority job arrives while no normal worker is free and no
//! high-priority worker is idle, a new dedicated high-priority worker is
//! spawned; that lane grows on demand and never shrinks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// Job priority lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
    Immediate,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counting semaphore built on a mutex + condvar pair.
pub struct Semaphore {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn release(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n as isize;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Wait until `n` permits have been consumed.
    pub fn wait_n(&self, n: usize) {
        for _ in 0..n {
            self.wait();
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}

struct GroupInner {
    pending: Mutex<usize>,
    cond: Condvar,
}

/// Counter + semaphore pair tagged onto jobs so the submitter can join the
/// whole fan-out.
#[derive(Clone)]
pub struct ThreadGroup {
    inner: Arc<GroupInner>,
}

impl ThreadGroup {
    pub fn new() -> Self {
        ThreadGroup {
            inner: Arc::new(GroupInner {
                pending: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    fn enter(&self) {
        *self.inner.pending.lock() += 1;
    }

    fn leave(&self) {
        let mut pending = self.inner.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.inner.cond.notify_all();
        }
    }

    /// Block until every job tagged with this group has finished.
    pub fn join(&self) {
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            self.inner.cond.wait(&mut pending);
        }
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        ThreadGroup::new()
    }
}

/// Decrements the group counter on every exit path, including panics.
struct GroupReleaser {
    group: ThreadGroup,
}

impl Drop for GroupReleaser {
    fn drop(&mut self) {
        self.group.leave();
    }
}

struct Queues {
    tasks: VecDeque<(ThreadGroup, Job)>,
    hp_tasks: VecDeque<(ThreadGroup, Job)>,
    free: usize,
    hp_free: usize,
    threads: usize,
    hp_threads: usize,
    stop: bool,
}

struct PoolInner {
    queues: Mutex<Queues>,
    wakeup: Semaphore,
    hp_wakeup: Semaphore,
    stopped: Semaphore,
}

/// Priority worker pool. Process-wide singleton with explicit construction
/// and shutdown; no implicit global.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Pool with `max(16, 2 * hardware concurrency)` normal workers.
    pub fn new() -> Self {
        Self::with_size(Self::default_size())
    }

    pub fn default_size() -> usize {
        (num_cpus::get() * 2).max(16)
    }

    pub fn with_size(init_size: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queues: Mutex::new(Queues {
                tasks: VecDeque::new(),
                hp_tasks: VecDeque::new(),
                free: 0,
                hp_free: 0,
                threads: 0,
                hp_threads: 0,
                stop: false,
            }),
            wakeup: Semaphore::new(),
            hp_wakeup: Semaphore::new(),
            stopped: Semaphore::new(),
        });
        {
            let mut queues = inner.queues.lock();
            queues.threads = init_size;
        }
        for _ in 0..init_size {
            spawn_worker(Arc::clone(&inner), false);
        }
        debug!(workers = init_size, "thread pool started");
        ThreadPool { inner }
    }

    pub fn create_group(&self) -> ThreadGroup {
        ThreadGroup::new()
    }

    /// Submit a job at the given priority, tagged with `group`.
    pub fn add_job<F>(&self, group: &ThreadGroup, priority: Priority, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut use_hp = false;
        {
            let mut queues = self.inner.queues.lock();
            if queues.stop {
                return;
            }
            group.enter();
            match priority {
                Priority::Immediate => queues.hp_tasks.push_front((group.clone(), Box::new(job))),
                Priority::High => queues.hp_tasks.push_back((group.clone(), Box::new(job))),
                Priority::Normal => queues.tasks.push_back((group.clone(), Box::new(job))),
            }
            if priority != Priority::Normal && queues.free == 0 {
                use_hp = true;
                if queues.hp_free == 0 {
                    queues.hp_threads += 1;
                    spawn_worker(Arc::clone(&self.inner), true);
                }
            }
        }
        if use_hp {
            self.inner.hp_wakeup.release(1);
        } else {
            self.inner.wakeup.release(1);
        }
        thread::yield_now();
    }

    /// Block until every job in the group has completed.
    pub fn join(&self, group: &ThreadGroup) {
        group.join();
    }

    /// Stop all workers and wait for them to exit.
    pub fn shutdown(&self) {
        let (threads, hp_threads) = {
            let mut queues = self.inner.queues.lock();
            if queues.stop {
                return;
            }
            queues.stop = true;
            (queues.threads, queues.hp_threads)
        };
        self.inner.hp_wakeup.release(hp_threads.max(1));
        self.inner.wakeup.release(threads);
        self.inner.stopped.wait_n(threads + hp_threads);
        debug!("thread pool stopped");
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        ThreadPool::new()
    }
}

fn spawn_worker(inner: Arc<PoolInner>, hp_only: bool) {
    let result = thread::Builder::new()
        .name(if hp_only {
            "cubist-hp-worker".to_string()
        } else {
            "cubist-worker".to_string()
        })
        .spawn(move || worker_loop(&inner, hp_only));
    if let Err(e) = result {
        error!("failed to spawn pool worker: {e}");
    }
}

fn worker_loop(inner: &PoolInner, hp_only: bool) {
    {
        let mut queues = inner.queues.lock();
        if hp_only {
            queues.hp_free += 1;
        } else {
            queues.free += 1;
        }
    }
    loop {
        if hp_only {
            inner.hp_wakeup.wait();
        } else {
            inner.wakeup.wait();
        }
        let (group, job) = {
            let mut queues = inner.queues.lock();
            if queues.stop {
                break;
            }
            if hp_only {
                queues.hp_free -= 1;
            } else {
                queues.free -= 1;
            }
            let task = if let Some(task) = queues.hp_tasks.pop_front() {
                task
            } else if let Some(task) = queues.tasks.pop_front() {
                task
            } else {
                // spurious wakeup; return to the free set
                if hp_only {
                    queues.hp_free += 1;
                } else {
                    queues.free += 1;
                }
                continue;
            };
            task
        };
        {
            let _releaser = GroupReleaser { group };
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
            if result.is_err() {
                error!("pool job panicked");
            }
        }
        let mut queues = inner.queues.lock();
        if hp_only {
            queues.hp_free += 1;
        } else {
            queues.free += 1;
        }
    }
    inner.stopped.release(1);
}
