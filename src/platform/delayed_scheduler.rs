//! Dedicated thread that owns the timers for delayed worker tasks.
//!
//! Requests reach the scheduler thread through a concurrent queue plus an
//! async wakeup. Each request arms a timer on the scheduler's private event
//! loop; on expiry the task moves to the worker pool.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::{Async, AsyncSender, ConcurrentTaskQueue, EventLoop, KeepInLoop, Timer};
use crate::error::CoreError;
use crate::platform::WorkerTask;

enum SchedulerMessage {
    Schedule(WorkerTask, Duration),
    Dispose,
}

type PendingTimers = Rc<RefCell<HashMap<u64, (Rc<Timer>, Rc<RefCell<Option<WorkerTask>>>)>>>;

pub(crate) struct DelayedTaskScheduler {
    queue: Arc<ConcurrentTaskQueue<SchedulerMessage>>,
    notifier: AsyncSender,
    thread: Option<JoinHandle<()>>,
}

impl DelayedTaskScheduler {
    pub(crate) fn new(worker_queue: Arc<ConcurrentTaskQueue<WorkerTask>>) -> Result<Self, CoreError> {
        let queue = Arc::new(ConcurrentTaskQueue::new());
        let (ready_tx, ready_rx) = mpsc::channel::<Result<AsyncSender, CoreError>>();

        let thread_queue = queue.clone();
        let thread = std::thread::Builder::new()
            .name("V8TaskScheduler".to_string())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let notifier = scheduler_notifier(&lp, thread_queue, worker_queue);
                let _ = ready_tx.send(Ok(notifier));

                lp.run();
                let mut leftover = 0usize;
                lp.walk(|_| leftover += 1);
                if leftover > 0 {
                    warn!(handles = leftover, "Scheduler loop exited with live handles");
                }
                lp.dispose();
                debug!("Delayed task scheduler exited");
            })
            .map_err(|source| CoreError::ThreadSpawn {
                name: "V8TaskScheduler".to_string(),
                source,
            })?;

        match ready_rx.recv() {
            Ok(Ok(notifier)) => Ok(Self {
                queue,
                notifier,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CoreError::ThreadSpawn {
                    name: "V8TaskScheduler".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "scheduler thread exited during startup",
                    ),
                })
            }
        }
    }

    pub(crate) fn enqueue_delayed_task(&self, task: WorkerTask, delay: Duration) {
        if self.thread.is_none() {
            return;
        }
        self.queue.push(SchedulerMessage::Schedule(task, delay));
        self.notifier.send();
    }

    /// Cancel every armed timer, dropping its task, and join the thread.
    pub(crate) fn dispose(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.queue.push(SchedulerMessage::Dispose);
        self.notifier.send();
        let _ = thread.join();
    }
}

impl Drop for DelayedTaskScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn scheduler_notifier(
    lp: &EventLoop,
    queue: Arc<ConcurrentTaskQueue<SchedulerMessage>>,
    worker_queue: Arc<ConcurrentTaskQueue<WorkerTask>>,
) -> AsyncSender {
    let timers: PendingTimers = Rc::new(RefCell::new(HashMap::new()));
    let self_handle: Rc<RefCell<Option<Async>>> = Rc::new(RefCell::new(None));

    let weak_loop = lp.downgrade();
    let handle_slot = self_handle.clone();
    let notifier = Async::new(lp, move || {
        while let Some(message) = queue.pop() {
            queue.notify_of_completion();
            match message {
                SchedulerMessage::Schedule(task, delay) => {
                    let Some(lp) = EventLoop::from_weak(&weak_loop) else {
                        continue;
                    };
                    arm_timer(&lp, &timers, &worker_queue, task, delay);
                }
                SchedulerMessage::Dispose => {
                    let pending: Vec<_> = timers.borrow_mut().drain().collect();
                    for (_, (timer, task)) in pending {
                        timer.stop();
                        // Unexpired tasks are ours to free.
                        drop(task.borrow_mut().take());
                        timer.close();
                    }
                    if let Some(handle) = handle_slot.borrow_mut().take() {
                        handle.close();
                    }
                }
            }
        }
    });
    let sender = notifier.sender();
    *self_handle.borrow_mut() = Some(notifier);
    sender
}

fn arm_timer(
    lp: &EventLoop,
    timers: &PendingTimers,
    worker_queue: &Arc<ConcurrentTaskQueue<WorkerTask>>,
    task: WorkerTask,
    delay: Duration,
) {
    let timer = Rc::new(Timer::new(lp));
    let timer_id = timer.id();
    let task = Rc::new(RefCell::new(Some(task)));

    let expired_task = task.clone();
    let timers_on_expiry = Rc::downgrade(timers);
    let worker_queue = worker_queue.clone();
    timer.start(delay, Duration::ZERO, move || {
        if let Some(task) = expired_task.borrow_mut().take() {
            trace!("Delayed task expired, forwarding to worker pool");
            if !worker_queue.is_disposed() {
                worker_queue.push(task);
            }
        }
        if let Some(timers) = timers_on_expiry.upgrade() {
            if let Some((timer, _)) = timers.borrow_mut().remove(&timer_id) {
                timer.close();
            }
        }
        KeepInLoop::No
    });
    timers.borrow_mut().insert(timer_id, (timer, task));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_delayed_task_reaches_worker_queue_after_delay() {
        let worker_queue = Arc::new(ConcurrentTaskQueue::<WorkerTask>::new());
        let mut scheduler = DelayedTaskScheduler::new(worker_queue.clone()).unwrap();

        let started = Instant::now();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        scheduler.enqueue_delayed_task(
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );

        let task = worker_queue.wait_pop().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        task();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        scheduler.dispose();
    }

    #[test]
    fn test_dispose_drops_pending_tasks() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let worker_queue = Arc::new(ConcurrentTaskQueue::<WorkerTask>::new());
        let mut scheduler = DelayedTaskScheduler::new(worker_queue.clone()).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let guard = DropCounter(dropped.clone());
            scheduler.enqueue_delayed_task(
                Box::new(move || {
                    let _keep = &guard;
                }),
                Duration::from_secs(3600),
            );
        }

        scheduler.dispose();
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
        assert!(worker_queue.is_empty());

        // Second dispose is a no-op
        scheduler.dispose();
    }
}
