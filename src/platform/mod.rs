//! Task-posting bridge between the JavaScript engine and the host.
//!
//! The engine's own default platform still backs isolate creation and
//! internal jobs; this layer owns everything the host schedules around it:
//! a pool of worker threads, a delayed-task scheduler thread, and one
//! foreground queue per isolate that is drained from the isolate's event
//! loop.

mod delayed_scheduler;
mod per_isolate;
mod worker_pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use crate::core::EventLoop;
use crate::error::CoreError;

pub use per_isolate::{ForegroundTaskRunner, PerIsolateData};

use delayed_scheduler::DelayedTaskScheduler;
use worker_pool::WorkerThreadsPool;

/// Upper bound on worker threads.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

/// Work posted to the worker pool.
pub type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// Work posted to an isolate's thread. It runs inside a handle scope with the
/// isolate's context entered.
pub type ForegroundTask = Box<dyn FnOnce(&mut v8::HandleScope) + Send + 'static>;

pub struct Platform {
    workers: Mutex<Option<WorkerThreadsPool>>,
    worker_count: usize,
    scheduler: Mutex<Option<DelayedTaskScheduler>>,
    isolates: Mutex<HashMap<String, Arc<PerIsolateData>>>,
    started: Instant,
    disposed: AtomicBool,
}

impl Platform {
    /// Start the worker pool and the delayed-task scheduler. A `thread_pool_size`
    /// of zero picks the available parallelism; the result is capped at
    /// [`DEFAULT_THREAD_POOL_SIZE`] and never drops below one.
    pub fn make(thread_pool_size: usize) -> Result<Arc<Self>, CoreError> {
        let requested = if thread_pool_size == 0 {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        } else {
            thread_pool_size
        };
        let size = requested.clamp(1, DEFAULT_THREAD_POOL_SIZE);

        let workers = WorkerThreadsPool::new(size)?;
        let scheduler = DelayedTaskScheduler::new(workers.queue().clone())?;
        info!(workers = size, "Platform started");

        Ok(Arc::new(Self {
            workers: Mutex::new(Some(workers)),
            worker_count: size,
            scheduler: Mutex::new(Some(scheduler)),
            isolates: Mutex::new(HashMap::new()),
            started: Instant::now(),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn number_of_worker_threads(&self) -> usize {
        self.worker_count
    }

    pub fn post_task_on_worker_thread(&self, task: WorkerTask) {
        if let Some(workers) = lock(&self.workers).as_ref() {
            workers.enqueue(task);
        }
    }

    pub fn post_delayed_task_on_worker_thread(&self, task: WorkerTask, delay: Duration) {
        if delay.is_zero() {
            return self.post_task_on_worker_thread(task);
        }
        if let Some(scheduler) = lock(&self.scheduler).as_ref() {
            scheduler.enqueue_delayed_task(task, delay);
        }
    }

    /// Block until every task posted to the worker pool has run.
    pub fn wait_drain_tasks(&self) {
        let queue = lock(&self.workers).as_ref().map(|workers| workers.queue().clone());
        if let Some(queue) = queue {
            queue.wait_drain();
        }
    }

    /// Register an isolate's foreground queue on its event loop. `on_wake`
    /// runs on that loop when foreground tasks are ready to drain.
    pub fn register_isolate<F>(&self, id: &str, lp: &EventLoop, on_wake: F) -> ForegroundTaskRunner
    where
        F: Fn() + 'static,
    {
        let runner = ForegroundTaskRunner::new(id, lp, on_wake);
        if self.disposed.load(Ordering::Acquire) {
            runner.dispose();
            return runner;
        }
        lock(&self.isolates).insert(id.to_string(), runner.data().clone());
        debug!(isolate = id, "Registered isolate on platform");
        runner
    }

    /// Dispose the isolate's queues and forget it.
    pub fn unregister_isolate(&self, runner: &ForegroundTaskRunner) {
        runner.dispose();
        lock(&self.isolates).remove(runner.data().id());
        debug!(isolate = runner.data().id(), "Unregistered isolate from platform");
    }

    pub fn foreground_task_runner(&self, id: &str) -> Option<Arc<PerIsolateData>> {
        lock(&self.isolates).get(id).cloned()
    }

    /// Post `task` to the named isolate. Returns `false` if no such isolate is
    /// registered.
    pub fn post_foreground_task(&self, id: &str, task: ForegroundTask) -> bool {
        match self.foreground_task_runner(id) {
            Some(data) => {
                data.post_task(task);
                true
            }
            None => false,
        }
    }

    /// Run the engine's own pending foreground jobs and then every queued
    /// host task for `runner`. Returns whether anything ran.
    pub fn drain_tasks(&self, scope: &mut v8::HandleScope, runner: &ForegroundTaskRunner) -> bool {
        let mut did_work = false;
        if let Some(engine_platform) = crate::runtime::v8_platform() {
            while v8::Platform::pump_message_loop(engine_platform, scope, false) {
                did_work = true;
            }
        }
        loop {
            let tasks = runner.take_tasks();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let scope = &mut v8::HandleScope::new(scope);
                task(scope);
                did_work = true;
            }
        }
        did_work
    }

    pub fn idle_tasks_enabled(&self) -> bool {
        false
    }

    /// Seconds elapsed since the platform started.
    pub fn monotonically_increasing_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Wall-clock time in milliseconds since the Unix epoch.
    pub fn current_clock_time_millis(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
            .unwrap_or_default()
    }

    /// Log the native stack of the calling thread.
    pub fn print_stack_trace(&self) {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("Native stack trace:\n{backtrace}");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop the scheduler and the worker threads. Registered isolates keep
    /// their runners but posting to them becomes a no-op once they are
    /// disposed by their runtimes. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut scheduler) = lock(&self.scheduler).take() {
            scheduler.dispose();
        }
        if let Some(mut workers) = lock(&self.workers).take() {
            workers.dispose();
        }
        let leaked = lock(&self.isolates).len();
        if leaked > 0 {
            debug!(isolates = leaked, "Platform disposed with isolates still registered");
        }
        info!("Platform disposed");
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KeepInLoop, Timer};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_worker_threads_are_capped() {
        let platform = Platform::make(16).unwrap();
        assert_eq!(platform.number_of_worker_threads(), DEFAULT_THREAD_POOL_SIZE);
        assert!(!platform.idle_tasks_enabled());
        platform.dispose();
    }

    #[test]
    fn test_worker_and_delayed_tasks_run() {
        let platform = Platform::make(2).unwrap();
        let (tx, rx) = mpsc::channel();

        let immediate = tx.clone();
        platform.post_task_on_worker_thread(Box::new(move || {
            let _ = immediate.send("now");
        }));
        platform.post_delayed_task_on_worker_thread(
            Box::new(move || {
                let _ = tx.send("later");
            }),
            Duration::from_millis(20),
        );

        assert_eq!(rx.recv().unwrap(), "now");
        assert_eq!(rx.recv().unwrap(), "later");
        platform.wait_drain_tasks();
        platform.dispose();
    }

    #[test]
    fn test_posting_after_dispose_is_silent() {
        let platform = Platform::make(1).unwrap();
        platform.dispose();
        platform.dispose();

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        platform.post_task_on_worker_thread(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        platform.wait_drain_tasks();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(platform.is_disposed());
    }

    #[test]
    fn test_monotonic_time_advances() {
        let platform = Platform::make(1).unwrap();
        let first = platform.monotonically_increasing_time();
        std::thread::sleep(Duration::from_millis(5));
        assert!(platform.monotonically_increasing_time() > first);
        assert!(platform.current_clock_time_millis() > 0.0);
    }

    #[test]
    fn test_foreground_tasks_drain_on_isolate_thread() {
        crate::runtime::initialize_platform_once(&[]);
        let platform = Platform::make(1).unwrap();
        let lp = EventLoop::new().unwrap();
        let runner = platform.register_isolate("drain", &lp, || {});
        assert!(platform.foreground_task_runner("drain").is_some());

        let (tx, rx) = mpsc::channel();
        assert!(platform.post_foreground_task(
            "drain",
            Box::new(move |scope| {
                let value = v8::Integer::new(scope, 42);
                let _ = tx.send(value.value());
            }),
        ));
        assert!(!platform.post_foreground_task("missing", Box::new(|_| {})));

        let keep = Timer::new(&lp);
        keep.start(Duration::from_millis(5), Duration::ZERO, || KeepInLoop::No);
        lp.run();

        let isolate = &mut v8::Isolate::new(Default::default());
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);
        assert!(platform.drain_tasks(scope, &runner));
        assert_eq!(rx.recv().unwrap(), 42);

        platform.unregister_isolate(&runner);
        assert!(platform.foreground_task_runner("drain").is_none());
        lp.run();
    }
}
