//! Foreground task queues owned by one isolate.
//!
//! [`PerIsolateData`] is the thread-safe half: any thread may post tasks
//! and wake the isolate's loop through it. [`ForegroundTaskRunner`] is the
//! loop-side half holding the wakeup handle and the timers of delayed
//! foreground tasks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::core::{Async, AsyncSender, ConcurrentTaskQueue, EventLoop, KeepInLoop, Timer};
use crate::platform::ForegroundTask;

pub struct PerIsolateData {
    id: String,
    tasks: ConcurrentTaskQueue<ForegroundTask>,
    delayed: ConcurrentTaskQueue<(ForegroundTask, Duration)>,
    notifier: AsyncSender,
    disposed: AtomicBool,
}

impl PerIsolateData {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue `task` for the isolate thread. Ignored once disposed.
    pub fn post_task(&self, task: ForegroundTask) {
        if self.is_disposed() {
            return;
        }
        self.tasks.push(task);
        self.notifier.send();
    }

    /// Queue `task` to run on the isolate thread after `delay`. Ignored once
    /// disposed.
    pub fn post_delayed_task(&self, task: ForegroundTask, delay: Duration) {
        if self.is_disposed() {
            return;
        }
        if delay.is_zero() {
            return self.post_task(task);
        }
        self.delayed.push((task, delay));
        self.notifier.send();
    }

    /// Non-nestable tasks are treated like ordinary ones; the runtime never
    /// drains from within a task.
    pub fn post_non_nestable_task(&self, task: ForegroundTask) {
        self.post_task(task);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl std::fmt::Debug for PerIsolateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerIsolateData")
            .field("id", &self.id)
            .field("pending", &self.tasks.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

type DelayedTimers = Rc<RefCell<HashMap<u64, Timer>>>;

/// Loop-side owner of an isolate's foreground queues.
pub struct ForegroundTaskRunner {
    data: Arc<PerIsolateData>,
    notifier: Async,
    timers: DelayedTimers,
}

impl ForegroundTaskRunner {
    /// Attach a runner to `lp`. `on_wake` runs on the loop thread whenever
    /// foreground tasks become runnable; the runtime is expected to drain
    /// them from there.
    pub(crate) fn new<F>(id: &str, lp: &EventLoop, on_wake: F) -> Self
    where
        F: Fn() + 'static,
    {
        let timers: DelayedTimers = Rc::new(RefCell::new(HashMap::new()));
        let slot: Rc<RefCell<Option<Arc<PerIsolateData>>>> = Rc::new(RefCell::new(None));

        let weak_loop = lp.downgrade();
        let data_slot = slot.clone();
        let wake_timers = timers.clone();
        let notifier = Async::new(lp, move || {
            let Some(data) = data_slot.borrow().clone() else {
                return;
            };
            if data.is_disposed() {
                return;
            }
            if let Some(lp) = EventLoop::from_weak(&weak_loop) {
                for (task, delay) in data.delayed.pop_all() {
                    schedule_delayed(&lp, &wake_timers, &data, task, delay);
                }
            }
            if !data.tasks.is_empty() {
                on_wake();
            }
        });
        // Posting tasks must not keep the loop alive by itself.
        notifier.unref();

        let data = Arc::new(PerIsolateData {
            id: id.to_string(),
            tasks: ConcurrentTaskQueue::new(),
            delayed: ConcurrentTaskQueue::new(),
            notifier: notifier.sender(),
            disposed: AtomicBool::new(false),
        });
        *slot.borrow_mut() = Some(data.clone());

        Self {
            data,
            notifier,
            timers,
        }
    }

    pub fn data(&self) -> &Arc<PerIsolateData> {
        &self.data
    }

    /// Pop every queued foreground task, in posting order.
    pub(crate) fn take_tasks(&self) -> Vec<ForegroundTask> {
        if self.data.is_disposed() {
            return Vec::new();
        }
        self.data.tasks.pop_all().into_iter().collect()
    }

    pub fn pending_delayed_tasks(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Drop all queued and scheduled tasks and close the wakeup handle.
    /// Senders on other threads observe the runner as disposed from now on.
    pub(crate) fn dispose(&self) {
        if self.data.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.data.tasks.pop_all());
        drop(self.data.delayed.pop_all());
        for (_, timer) in self.timers.borrow_mut().drain() {
            timer.close();
        }
        // The async handle may still be referenced by a pending wakeup; keep
        // the shared data alive until it has actually closed.
        let keep_alive = self.data.clone();
        self.notifier.close_with(move || {
            trace!(isolate = keep_alive.id(), "Foreground task runner closed");
            drop(keep_alive);
        });
    }
}

impl Drop for ForegroundTaskRunner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn schedule_delayed(
    lp: &EventLoop,
    timers: &DelayedTimers,
    data: &Arc<PerIsolateData>,
    task: ForegroundTask,
    delay: Duration,
) {
    let timer = Timer::new(lp);
    let timer_id = timer.id();
    let mut task = Some(task);
    let data = Arc::downgrade(data);
    let owner = Rc::downgrade(timers);
    timer.start(delay, Duration::ZERO, move || {
        if let (Some(task), Some(data)) = (task.take(), data.upgrade()) {
            // Expired tasks join the regular queue and run on the next drain.
            data.post_task(task);
        }
        if let Some(timers) = owner.upgrade() {
            if let Some(timer) = timers.borrow_mut().remove(&timer_id) {
                timer.close();
            }
        }
        KeepInLoop::No
    });
    timer.unref();
    timers.borrow_mut().insert(timer_id, timer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn noop_task() -> ForegroundTask {
        Box::new(|_scope| {})
    }

    #[test]
    fn test_post_task_wakes_loop_side() {
        let lp = EventLoop::new().unwrap();
        let woken = Rc::new(Cell::new(0));
        let counter = woken.clone();
        let runner = ForegroundTaskRunner::new("test", &lp, move || counter.set(counter.get() + 1));

        let data = runner.data().clone();
        std::thread::spawn(move || {
            data.post_task(noop_task());
            data.post_task(noop_task());
        })
        .join()
        .unwrap();

        // The notifier is unref'd; keep the loop alive for one iteration.
        let keep = Timer::new(&lp);
        keep.start(Duration::from_millis(20), Duration::ZERO, || KeepInLoop::No);
        lp.run();

        assert!(woken.get() >= 1);
        assert_eq!(runner.take_tasks().len(), 2);
        runner.dispose();
        lp.run();
    }

    #[test]
    fn test_delayed_task_joins_queue_after_expiry() {
        let lp = EventLoop::new().unwrap();
        let runner = ForegroundTaskRunner::new("delayed", &lp, || {});
        runner
            .data()
            .post_delayed_task(noop_task(), Duration::from_millis(10));

        let keep = Timer::new(&lp);
        keep.start(Duration::from_millis(5), Duration::ZERO, || KeepInLoop::No);
        lp.run();
        assert_eq!(runner.pending_delayed_tasks(), 1);
        assert!(runner.take_tasks().is_empty());

        keep.start(Duration::from_millis(30), Duration::ZERO, || KeepInLoop::No);
        lp.run();
        assert_eq!(runner.pending_delayed_tasks(), 0);
        assert_eq!(runner.take_tasks().len(), 1);
        runner.dispose();
    }

    #[test]
    fn test_posting_after_dispose_is_ignored() {
        let lp = EventLoop::new().unwrap();
        let runner = ForegroundTaskRunner::new("disposed", &lp, || {});
        let data = runner.data().clone();
        runner.dispose();
        runner.dispose();

        data.post_task(noop_task());
        data.post_delayed_task(noop_task(), Duration::from_millis(1));
        assert!(data.is_disposed());
        assert_eq!(data.pending_tasks(), 0);
        assert!(runner.take_tasks().is_empty());

        lp.run();
        lp.dispose();
    }
}
