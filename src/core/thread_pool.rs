//! Fixed-size worker pool that lives outside any event loop.
//!
//! Startup is synchronised: [`StandaloneThreadPool::new`] returns once every
//! worker has reported in.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::error::CoreError;

/// Unit of work accepted by [`StandaloneThreadPool::enqueue`].
pub type TaskRoutine = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<TaskRoutine>,
    stop: bool,
    /// Number of workers that reached their entrypoint.
    started: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
}

/// Named worker threads fed from a single FIFO queue.
///
/// Construction returns only after every worker thread has started.
/// Dropping the pool stops accepting work, lets the workers finish the tasks
/// that are already queued and joins them.
pub struct StandaloneThreadPool {
    name: String,
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl StandaloneThreadPool {
    /// Spawn `count` workers named `{name}#1`, `{name}#2`, ...
    ///
    /// A `count` of zero means one worker per available CPU.
    pub fn new(name: &str, count: usize) -> Result<Self, CoreError> {
        let count = if count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            count
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                stop: false,
                started: 0,
            }),
            condvar: Condvar::new(),
        });

        debug!(pool = name, concurrency = count, "Creating thread pool");

        let mut threads = Vec::with_capacity(count);
        for number in 1..=count {
            let thread_name = format!("{name}#{number}");
            let worker_shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    trace!(thread = %thread_name, "Worker thread started");
                    lock(&worker_shared).started += 1;
                    worker_shared.condvar.notify_all();
                    worker_entrypoint(&worker_shared);
                });

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    shutdown(&shared);
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(CoreError::ThreadSpawn {
                        name: format!("{name}#{number}"),
                        source,
                    });
                }
            }
        }

        // Wait until all the worker threads are running
        {
            let mut state = lock(&shared);
            while state.started < count {
                state = shared
                    .condvar
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        debug!(pool = name, "Thread pool finished initialization");

        Ok(Self {
            name: name.to_string(),
            shared,
            threads,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.threads.len()
    }

    /// Queue a task for execution on one of the workers.
    pub fn enqueue<F>(&self, routine: F) -> Result<(), CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.shared);
            if state.stop {
                return Err(CoreError::PoolStopped);
            }
            state.tasks.push_back(Box::new(routine));
        }
        self.shared.condvar.notify_one();
        Ok(())
    }

    /// Stop accepting work. Tasks already queued still run.
    pub fn stop(&self) {
        shutdown(&self.shared);
    }
}

impl Drop for StandaloneThreadPool {
    fn drop(&mut self) {
        shutdown(&self.shared);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn lock(shared: &PoolShared) -> std::sync::MutexGuard<'_, PoolState> {
    shared
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn shutdown(shared: &PoolShared) {
    lock(shared).stop = true;
    shared.condvar.notify_all();
}

fn worker_entrypoint(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = lock(shared);
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.stop {
                    return;
                }
                state = shared
                    .condvar
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_threads_are_named() {
        let pool = StandaloneThreadPool::new("TestPool", 2).unwrap();
        assert_eq!(pool.concurrency(), 2);

        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.enqueue(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();
        }

        for _ in 0..8 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(name == "TestPool#1" || name == "TestPool#2", "{name}");
        }
    }

    #[test]
    fn test_drop_runs_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = StandaloneThreadPool::new("Drain", 1).unwrap();
            for _ in 0..16 {
                let counter = counter.clone();
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let pool = StandaloneThreadPool::new("Stopped", 1).unwrap();
        pool.stop();
        let err = pool.enqueue(|| {}).unwrap_err();
        assert!(matches!(err, CoreError::PoolStopped));
        assert_eq!(err.to_string(), "Enqueue on stopped threadpool");
    }

    #[test]
    fn test_zero_count_uses_available_parallelism() {
        let pool = StandaloneThreadPool::new("Auto", 0).unwrap();
        assert!(pool.concurrency() >= 1);
    }
}
