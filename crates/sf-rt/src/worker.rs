//! Worker-thread pool for per-period list processing
//!
//! The audio thread plus `threads - 1` workers process one list at a time:
//! every thread takes the items whose index is congruent to its number
//! modulo the thread count.  Workers sleep on their own semaphore between
//! periods and are posted by the audio thread; the audio thread itself
//! never sleeps on a lock while workers are idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore built from a mutex and a condition variable.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until the count is positive, then decrement.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

/// A job is called once per thread with the thread number (0 = the calling
/// thread).
type Job<'a> = dyn Fn(usize) + Sync + 'a;

/// Slot publishing the current job pointer to the workers.
struct JobSlot(std::cell::UnsafeCell<Option<*const Job<'static>>>);

// The pointer is published before the cont-semaphores are posted and read
// only between cont.wait() and done.post(); the posting thread waits for
// all done-semaphores before the pointee can go away.
unsafe impl Send for JobSlot {}
unsafe impl Sync for JobSlot {}

struct WorkerLane {
    cont: Semaphore,
    done: Semaphore,
}

struct PoolShared {
    job: JobSlot,
    lanes: Vec<WorkerLane>,
    stop: AtomicBool,
}

/// Pool of realtime worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    /// Create a pool for `threads` processing threads in total; thread
    /// number 0 is the thread calling [`process`](Self::process).
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared {
            job: JobSlot(std::cell::UnsafeCell::new(None)),
            lanes: (1..threads)
                .map(|_| WorkerLane {
                    cont: Semaphore::new(0),
                    done: Semaphore::new(0),
                })
                .collect(),
            stop: AtomicBool::new(false),
        });

        let handles = (1..threads)
            .map(|number| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("sf-worker-{number}"))
                    .spawn(move || worker_loop(shared, number))
            })
            .collect::<std::io::Result<Vec<_>>>();

        let handles = match handles {
            Ok(handles) => handles,
            Err(e) => {
                // Let already-spawned workers run into the stop flag.
                shared.stop.store(true, Ordering::Release);
                for lane in &shared.lanes {
                    lane.cont.post();
                }
                return Err(e);
            }
        };

        Ok(Self {
            shared,
            handles,
            threads,
        })
    }

    /// Total number of processing threads (including the caller).
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `job` on all threads and wait for completion.
    pub fn process(&self, job: &(impl Fn(usize) + Sync)) {
        if self.handles.is_empty() {
            job(0);
            return;
        }

        let job: &Job = job;
        unsafe {
            // Safety: the 'static cast only widens the pointer's advertised
            // lifetime; the pointee is guaranteed valid until all
            // done-semaphores are posted below, before `process` returns
            // and the real borrow of `job` ends.
            let job: &'static Job<'static> = std::mem::transmute(job);
            *self.shared.job.0.get() = Some(job as *const Job<'static>);
        }

        for lane in &self.shared.lanes {
            lane.cont.post();
        }

        job(0);

        for lane in &self.shared.lanes {
            lane.done.wait();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for lane in &self.shared.lanes {
            lane.cont.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, number: usize) {
    let lane = &shared.lanes[number - 1];
    loop {
        lane.cont.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if let Some(job) = unsafe { *shared.job.0.get() } {
            // Valid for the duration of this round, see JobSlot.
            unsafe { (*job)(number) };
        }
        lane.done.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_single_thread_runs_inline() {
        let pool = WorkerPool::new(1).unwrap();
        let hits = AtomicUsize::new(0);
        pool.process(&|n| {
            assert_eq!(n, 0);
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_threads_participate() {
        let pool = WorkerPool::new(4).unwrap();
        for _ in 0..100 {
            let mask = AtomicUsize::new(0);
            pool.process(&|n| {
                mask.fetch_or(1 << n, Ordering::SeqCst);
            });
            assert_eq!(mask.load(Ordering::SeqCst), 0b1111);
        }
    }

    #[test]
    fn test_pool_shuts_down() {
        let pool = WorkerPool::new(3).unwrap();
        pool.process(&|_| {});
        drop(pool);
    }
}
