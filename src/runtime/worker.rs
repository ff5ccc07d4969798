//! Worker threads.
//!
//! Every worker runs its own event loop and [`WorkerRuntime`] on a thread
//! named `JSWorker`. The spawning runtime keeps the parent end of the
//! worker's port and joins the thread before its own loop exits.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::bindings::BindingManager;
use crate::core::EventLoop;
use crate::error::{CoreError, RuntimeError};
use crate::message_port::MessagePort;
use crate::platform::Platform;
use crate::runtime::base::{ExternalCallbackAction, ExternalCallbackType, RuntimeState};
use crate::runtime::config::RuntimeOptions;
use crate::runtime::worker_runtime::WorkerRuntime;

const WORKER_THREAD_NAME: &str = "JSWorker";

static NEXT_WORKER_INDEX: AtomicUsize = AtomicUsize::new(1);

struct WorkerParameters {
    id: String,
    url: String,
    platform: Arc<Platform>,
    bindings: Arc<BindingManager>,
    options: RuntimeOptions,
    port: Arc<MessagePort>,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the worker thread leaves, however it leaves.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type SharedJoinHandle = Rc<RefCell<Option<JoinHandle<()>>>>;

fn join_worker(thread: &SharedJoinHandle) {
    if let Some(thread) = thread.borrow_mut().take() {
        if thread.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
}

/// Start a worker evaluating `url`, connected to the parent through
/// `port`. Returns once the worker runtime has been initialized.
///
/// The caller must already have attached the other end of `port`, so that
/// messages the worker posts during evaluation are not refused.
pub fn spawn(parent: &Rc<RuntimeState>, url: &str, port: Arc<MessagePort>) -> Result<(), RuntimeError> {
    let index = NEXT_WORKER_INDEX.fetch_add(1, Ordering::Relaxed);
    let running = Arc::new(AtomicBool::new(true));

    let mut options = parent.options().clone();
    options.inspector = None;
    let params = WorkerParameters {
        id: format!("Runtime@Worker#{index}"),
        url: url.to_string(),
        platform: parent.platform().clone(),
        bindings: parent.bindings().clone(),
        options,
        port,
        running: running.clone(),
    };

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
    let thread = std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || worker_main(params, ready_tx))
        .map_err(|source| CoreError::ThreadSpawn {
            name: WORKER_THREAD_NAME.to_string(),
            source,
        })?;

    let ready = ready_rx
        .recv()
        .unwrap_or_else(|_| Err("Worker thread exited before initialization".to_string()));
    if let Err(message) = ready {
        let _ = thread.join();
        return Err(RuntimeError::ThreadInit(message));
    }

    // The parent must not outlive the worker thread.
    let thread: SharedJoinHandle = Rc::new(RefCell::new(Some(thread)));
    let exit_thread = thread.clone();
    let exit_callback = parent.add_external_callback(ExternalCallbackType::BeforeSpinRunExit, move || {
        join_worker(&exit_thread);
        ExternalCallbackAction::Remove
    });

    let weak_parent = parent.weak();
    parent.add_external_callback(ExternalCallbackType::AfterTasksCheckpoint, move || {
        if running.load(Ordering::Acquire) {
            return ExternalCallbackAction::OnceMore;
        }
        join_worker(&thread);
        if let Some(parent) = weak_parent.upgrade() {
            parent.remove_external_callback(ExternalCallbackType::BeforeSpinRunExit, exit_callback);
        }
        ExternalCallbackAction::Remove
    });

    debug!(worker = index, url, "Spawned worker");
    Ok(())
}

fn worker_main(params: WorkerParameters, ready: Sender<Result<(), String>>) {
    let WorkerParameters {
        id,
        url,
        platform,
        bindings,
        options,
        port,
        running,
    } = params;
    let _running = RunningGuard(running);

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };

    let runtime = WorkerRuntime::new(id, event_loop.clone(), platform, bindings, options, port)
        .and_then(|runtime| runtime.initialize().map(|()| runtime));
    let mut runtime = match runtime {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            event_loop.dispose();
            return;
        }
    };
    let _ = ready.send(Ok(()));

    if runtime.evaluate_module(&url).is_err() {
        error!("Failed to evaluate module `{}`", url);
    }
    if let Err(err) = runtime.spin_run() {
        warn!(runtime = runtime.base().id(), %err, "Worker runtime stopped");
    }
    runtime.dispose();
    event_loop.dispose();
}
