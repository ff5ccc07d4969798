//! Background worker threads for engine jobs.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::core::ConcurrentTaskQueue;
use crate::error::CoreError;
use crate::platform::WorkerTask;

pub(crate) struct WorkerThreadsPool {
    queue: Arc<ConcurrentTaskQueue<WorkerTask>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerThreadsPool {
    pub(crate) fn new(pool_size: usize) -> Result<Self, CoreError> {
        let queue = Arc::new(ConcurrentTaskQueue::<WorkerTask>::new());
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let mut threads = Vec::with_capacity(pool_size);

        for index in 0..pool_size {
            let name = format!("V8Worker#{index}");
            let worker_queue = queue.clone();
            let ready_tx = ready_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _ = ready_tx.send(());
                    drop(ready_tx);
                    while let Some(task) = worker_queue.wait_pop() {
                        trace!(worker = index, "Performing asynchronous task on the worker thread");
                        task();
                        worker_queue.notify_of_completion();
                    }
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    queue.dispose();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(CoreError::ThreadSpawn { name, source });
                }
            }
        }
        drop(ready_tx);

        // Wait until every worker is parked on the queue
        for _ in 0..threads.len() {
            if ready_rx.recv().is_err() {
                break;
            }
        }
        debug!(workers = threads.len(), "Platform worker pool is ready");

        Ok(Self { queue, threads })
    }

    pub(crate) fn queue(&self) -> &Arc<ConcurrentTaskQueue<WorkerTask>> {
        &self.queue
    }

    pub(crate) fn size(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn enqueue(&self, task: WorkerTask) {
        if self.queue.is_disposed() {
            return;
        }
        self.queue.push(task);
    }

    pub(crate) fn wait_drain_tasks(&self) {
        self.queue.wait_drain();
    }

    /// Wake every worker, drop queued tasks and join the threads.
    pub(crate) fn dispose(&mut self) {
        self.queue.dispose();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerThreadsPool {
    fn drop(&mut self) {
        self.dispose();
    }
}
