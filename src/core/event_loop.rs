//! Single-threaded reactor with libuv-style handles and phases.
//!
//! An [`EventLoop`] owns a current-thread Tokio runtime plus a `LocalSet`
//! that are only ever entered while the loop is waiting for I/O. Handle
//! callbacks always run outside of Tokio, so they are free to re-enter the
//! loop (create, stop and close handles, or even spin a nested loop on
//! another thread).
//!
//! One iteration runs, in order: due timers, idle handles, prepare handles,
//! the wait for I/O, async wakeups, poll readiness, thread-pool completions,
//! check handles and finally close callbacks.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::core::thread_pool::StandaloneThreadPool;
use crate::error::CoreError;

/// Number of threads backing [`EventLoop::enqueue_thread_pool_trivial_task`].
const LOOP_THREAD_POOL_SIZE: usize = 4;

static LOOP_THREAD_POOL: Lazy<Result<StandaloneThreadPool, CoreError>> =
    Lazy::new(|| StandaloneThreadPool::new("EventLoopWorker", LOOP_THREAD_POOL_SIZE));

pub(crate) type HandleId = u64;

/// Returned by handle callbacks to tell the loop whether to keep the handle
/// armed. `No` stops the handle; it can be restarted later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepInLoop {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Timer,
    Async,
    Prepare,
    Check,
    Idle,
    Poll,
}

/// Snapshot of a handle passed to [`EventLoop::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub id: u64,
    pub kind: HandleKind,
    pub active: bool,
    pub referenced: bool,
    pub closing: bool,
}

/// Internal callback shape shared by every handle kind. The argument is the
/// poll event mask for poll handles (negative errno on failure) and zero for
/// everything else.
pub(crate) type HandleCallback = Box<dyn FnMut(i32) -> KeepInLoop>;
pub(crate) type CloseCallback = Box<dyn FnOnce()>;

pub(crate) struct HandleSlot {
    kind: HandleKind,
    active: bool,
    referenced: bool,
    closing: bool,
    callback: Option<HandleCallback>,
    on_close: Option<CloseCallback>,
    timer_key: Option<(Instant, u64)>,
    repeat: Duration,
    async_state: Option<Arc<AsyncState>>,
    /// Set when a pending async send must still be delivered while closing.
    deliver_on_close: bool,
    poll_task: Option<tokio::task::JoinHandle<()>>,
    poll_consumed: Option<Rc<Notify>>,
}

impl HandleSlot {
    fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            active: false,
            referenced: true,
            closing: false,
            callback: None,
            on_close: None,
            timer_key: None,
            repeat: Duration::ZERO,
            async_state: None,
            deliver_on_close: false,
            poll_task: None,
            poll_consumed: None,
        }
    }
}

/// State shared with other threads: wakeup notifier plus the ids of async
/// handles and thread-pool jobs that completed since the last iteration.
pub(crate) struct LoopShared {
    notify: Notify,
    asyncs: Mutex<Vec<HandleId>>,
    finished_work: Mutex<Vec<u64>>,
}

impl LoopShared {
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Cross-thread half of an async handle.
pub(crate) struct AsyncState {
    pub(crate) id: HandleId,
    pub(crate) pending: std::sync::atomic::AtomicBool,
    pub(crate) closed: std::sync::atomic::AtomicBool,
    pub(crate) shared: Arc<LoopShared>,
}

impl AsyncState {
    pub(crate) fn send(&self) {
        use std::sync::atomic::Ordering;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Sends coalesce until the loop thread consumes the pending flag.
        if !self.pending.swap(true, Ordering::AcqRel) {
            lock_vec(&self.shared.asyncs).push(self.id);
            self.shared.wake();
        }
    }
}

fn lock_vec<T>(m: &Mutex<Vec<T>>) -> std::sync::MutexGuard<'_, Vec<T>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct LoopInner {
    runtime: tokio::runtime::Runtime,
    local: tokio::task::LocalSet,
    handles: RefCell<BTreeMap<HandleId, HandleSlot>>,
    next_id: Cell<HandleId>,
    timers: RefCell<BTreeMap<(Instant, u64), HandleId>>,
    timer_seq: Cell<u64>,
    closing: RefCell<Vec<HandleId>>,
    poll_events: RefCell<VecDeque<(HandleId, i32)>>,
    work_callbacks: RefCell<HashMap<u64, Box<dyn FnOnce()>>>,
    next_work_id: Cell<u64>,
    shared: Arc<LoopShared>,
    stop_requested: Cell<bool>,
    disposed: Cell<bool>,
}

impl LoopInner {
    pub(crate) fn create_handle(&self, kind: HandleKind) -> HandleId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.handles.borrow_mut().insert(id, HandleSlot::new(kind));
        trace!(handle = id, ?kind, "Handle created");
        id
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    pub(crate) fn with_slot<R>(&self, id: HandleId, f: impl FnOnce(&mut HandleSlot) -> R) -> Option<R> {
        self.handles.borrow_mut().get_mut(&id).map(f)
    }

    pub(crate) fn set_callback(&self, id: HandleId, callback: HandleCallback) {
        self.with_slot(id, |slot| {
            if !slot.closing {
                slot.callback = Some(callback);
            }
        });
    }

    pub(crate) fn set_active(&self, id: HandleId, active: bool) {
        self.with_slot(id, |slot| {
            if !slot.closing {
                slot.active = active;
            }
        });
    }

    pub(crate) fn set_referenced(&self, id: HandleId, referenced: bool) {
        self.with_slot(id, |slot| slot.referenced = referenced);
    }

    pub(crate) fn info(&self, id: HandleId) -> Option<HandleInfo> {
        self.handles.borrow().get(&id).map(|slot| HandleInfo {
            id,
            kind: slot.kind,
            active: slot.active,
            referenced: slot.referenced,
            closing: slot.closing,
        })
    }

    pub(crate) fn attach_async(&self, id: HandleId, state: Arc<AsyncState>) {
        self.with_slot(id, |slot| {
            slot.async_state = Some(state);
            slot.active = true;
        });
    }

    pub(crate) fn timer_start(&self, id: HandleId, timeout: Duration, repeat: Duration) {
        self.timer_unschedule(id);
        let is_open = self
            .with_slot(id, |slot| {
                slot.repeat = repeat;
                slot.active = !slot.closing;
                !slot.closing
            })
            .unwrap_or(false);
        if is_open {
            self.timer_schedule(id, Instant::now() + timeout);
        }
    }

    pub(crate) fn timer_stop(&self, id: HandleId) {
        self.timer_unschedule(id);
        self.with_slot(id, |slot| slot.active = false);
    }

    pub(crate) fn timer_repeat(&self, id: HandleId) -> Duration {
        self.with_slot(id, |slot| slot.repeat).unwrap_or_default()
    }

    fn timer_schedule(&self, id: HandleId, deadline: Instant) {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        let key = (deadline, seq);
        self.timers.borrow_mut().insert(key, id);
        self.with_slot(id, |slot| slot.timer_key = Some(key));
    }

    fn timer_unschedule(&self, id: HandleId) {
        if let Some(Some(key)) = self.with_slot(id, |slot| slot.timer_key.take()) {
            self.timers.borrow_mut().remove(&key);
        }
    }

    pub(crate) fn poll_start(
        self: &Rc<Self>,
        id: HandleId,
        fd: std::os::fd::RawFd,
        interest: tokio::io::Interest,
    ) -> Result<(), CoreError> {
        self.poll_stop(id);

        let async_fd = {
            let _guard = self.runtime.enter();
            tokio::io::unix::AsyncFd::with_interest(RawFdSource(fd), interest)
                .map_err(|source| CoreError::Poll { fd, source })?
        };

        let consumed = Rc::new(Notify::new());
        let weak = Rc::downgrade(self);
        let task_consumed = consumed.clone();
        let task = self.local.spawn_local(async move {
            loop {
                match async_fd.ready(interest).await {
                    Ok(mut guard) => {
                        let ready = guard.ready();
                        let mut events = 0;
                        if ready.is_readable() {
                            events |= crate::core::handles::POLL_READABLE;
                        }
                        if ready.is_writable() {
                            events |= crate::core::handles::POLL_WRITABLE;
                        }
                        match weak.upgrade() {
                            Some(inner) => inner.push_poll_event(id, events),
                            None => return,
                        }
                        task_consumed.notified().await;
                        // Emulate level triggering: only forget readiness once
                        // the callback has drained the descriptor.
                        if !fd_still_ready(fd, interest) {
                            guard.clear_ready();
                        }
                    }
                    Err(err) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.push_poll_event(id, -err.raw_os_error().unwrap_or(libc::EIO));
                        }
                        return;
                    }
                }
            }
        });

        self.with_slot(id, |slot| {
            slot.poll_task = Some(task);
            slot.poll_consumed = Some(consumed);
            slot.active = true;
        });
        Ok(())
    }

    pub(crate) fn poll_stop(&self, id: HandleId) {
        self.with_slot(id, |slot| {
            if let Some(task) = slot.poll_task.take() {
                task.abort();
            }
            slot.poll_consumed = None;
            slot.active = false;
        });
        self.poll_events.borrow_mut().retain(|(handle, _)| *handle != id);
    }

    fn push_poll_event(&self, id: HandleId, events: i32) {
        self.poll_events.borrow_mut().push_back((id, events));
        self.shared.wake();
    }

    pub(crate) fn close_handle(&self, id: HandleId, on_close: Option<CloseCallback>) {
        use std::sync::atomic::Ordering;

        self.timer_unschedule(id);
        let queued = self
            .with_slot(id, |slot| {
                if slot.closing {
                    return false;
                }
                slot.closing = true;
                slot.active = false;
                slot.on_close = on_close;
                if let Some(task) = slot.poll_task.take() {
                    task.abort();
                }
                if let Some(state) = &slot.async_state {
                    state.closed.store(true, Ordering::Release);
                    // A send that raced with close is still delivered once.
                    slot.deliver_on_close = state.pending.swap(false, Ordering::AcqRel);
                }
                true
            })
            .unwrap_or(false);
        if queued {
            self.closing.borrow_mut().push(id);
        }
    }

    /// Take the callback out of the slot, run it, then put it back unless
    /// the callback closed the handle or installed a new callback.
    fn invoke(&self, id: HandleId, arg: i32, require_active: bool) -> Option<KeepInLoop> {
        let mut callback = self.with_slot(id, |slot| {
            if slot.closing || (require_active && !slot.active) {
                None
            } else {
                slot.callback.take()
            }
        })??;

        let keep = callback(arg);

        let replaced = self
            .with_slot(id, |slot| {
                if slot.callback.is_some() {
                    return true;
                }
                if !slot.closing {
                    slot.callback = Some(callback);
                }
                false
            })
            .unwrap_or(false);
        // A callback that re-armed its own handle has the final say.
        if replaced {
            Some(KeepInLoop::Yes)
        } else {
            Some(keep)
        }
    }

    fn has_active_kind(&self, kind: HandleKind) -> bool {
        self.handles
            .borrow()
            .values()
            .any(|slot| slot.kind == kind && slot.active && !slot.closing)
    }

    fn is_alive(&self) -> bool {
        let handles_alive = self
            .handles
            .borrow()
            .values()
            .any(|slot| slot.active && slot.referenced && !slot.closing);
        handles_alive
            || !self.closing.borrow().is_empty()
            || !self.work_callbacks.borrow().is_empty()
    }

    fn run_timers(&self) {
        let now = Instant::now();
        // Timers started by callbacks in this pass wait for the next one.
        let seq_limit = self.timer_seq.get();
        loop {
            let due = self
                .timers
                .borrow()
                .range(..=(now, u64::MAX))
                .find(|((_, seq), _)| *seq < seq_limit)
                .map(|(key, id)| (*key, *id));
            let Some((key, id)) = due else {
                break;
            };
            self.timers.borrow_mut().remove(&key);

            let repeat = self
                .with_slot(id, |slot| {
                    slot.timer_key = None;
                    if slot.repeat.is_zero() {
                        slot.active = false;
                    }
                    slot.repeat
                })
                .unwrap_or_default();
            if !repeat.is_zero() {
                self.timer_schedule(id, now + repeat);
            }

            if self.invoke(id, 0, false) == Some(KeepInLoop::No) {
                self.timer_stop(id);
            }
        }
    }

    fn run_phase(&self, kind: HandleKind) {
        let ids: Vec<HandleId> = self
            .handles
            .borrow()
            .iter()
            .filter(|(_, slot)| slot.kind == kind && slot.active && !slot.closing)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if self.invoke(id, 0, true) == Some(KeepInLoop::No) {
                self.set_active(id, false);
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if self.stop_requested.get()
            || !self.is_alive()
            || self.has_active_kind(HandleKind::Idle)
            || !self.closing.borrow().is_empty()
            || !self.poll_events.borrow().is_empty()
        {
            return Some(Duration::ZERO);
        }
        self.timers
            .borrow()
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn wait(&self, timeout: Option<Duration>) {
        let shared = self.shared.clone();
        let wait = async move {
            // Give poll tasks a tick even when the timeout is zero.
            tokio::task::yield_now().await;
            match timeout {
                Some(duration) => {
                    let _ = tokio::time::timeout(duration, shared.notify.notified()).await;
                }
                None => shared.notify.notified().await,
            }
        };
        self.local.block_on(&self.runtime, wait);
    }

    fn dispatch_asyncs(&self) {
        use std::sync::atomic::Ordering;

        let ids = std::mem::take(&mut *lock_vec(&self.shared.asyncs));
        for id in ids {
            let fire = self
                .with_slot(id, |slot| {
                    !slot.closing
                        && slot
                            .async_state
                            .as_ref()
                            .is_some_and(|state| state.pending.swap(false, Ordering::AcqRel))
                })
                .unwrap_or(false);
            if fire {
                self.invoke(id, 0, false);
            }
        }
    }

    fn dispatch_poll_events(&self) {
        let events: Vec<(HandleId, i32)> = self.poll_events.borrow_mut().drain(..).collect();
        for (id, events) in events {
            let keep = self.invoke(id, events, true);
            if keep == Some(KeepInLoop::No) || events < 0 {
                self.poll_stop(id);
            } else if let Some(Some(consumed)) = self.with_slot(id, |slot| slot.poll_consumed.clone())
            {
                consumed.notify_one();
            }
        }
    }

    fn dispatch_finished_work(&self) {
        let finished = std::mem::take(&mut *lock_vec(&self.shared.finished_work));
        for work_id in finished {
            let callback = self.work_callbacks.borrow_mut().remove(&work_id);
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn run_closing(&self) {
        let ids = std::mem::take(&mut *self.closing.borrow_mut());
        for id in ids {
            let Some(mut slot) = self.handles.borrow_mut().remove(&id) else {
                continue;
            };
            if slot.deliver_on_close {
                if let Some(callback) = slot.callback.as_mut() {
                    callback(0);
                }
            }
            drop(slot.callback.take());
            if let Some(on_close) = slot.on_close.take() {
                on_close();
            }
            trace!(handle = id, kind = ?slot.kind, "Handle closed");
        }
    }

    fn run_once(&self) {
        self.run_timers();
        self.run_phase(HandleKind::Idle);
        self.run_phase(HandleKind::Prepare);
        let timeout = self.poll_timeout();
        self.wait(timeout);
        self.dispatch_asyncs();
        self.dispatch_poll_events();
        self.dispatch_finished_work();
        self.run_phase(HandleKind::Check);
        self.run_closing();
    }
}

/// Descriptor wrapper that lets `AsyncFd` watch a descriptor it does not own.
struct RawFdSource(std::os::fd::RawFd);

impl std::os::fd::AsRawFd for RawFdSource {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0
    }
}

fn fd_still_ready(fd: std::os::fd::RawFd, interest: tokio::io::Interest) -> bool {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: `pollfd` is a valid, initialised array of length one.
    let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
    rc > 0 && (pollfd.revents & events) != 0
}

/// Owning handle to a reactor. Cloning yields another reference to the same
/// loop; the loop is single-threaded and never leaves the thread that
/// created it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Result<Self, CoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CoreError::Reactor)?;

        Ok(Self {
            inner: Rc::new(LoopInner {
                runtime,
                local: tokio::task::LocalSet::new(),
                handles: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
                timers: RefCell::new(BTreeMap::new()),
                timer_seq: Cell::new(0),
                closing: RefCell::new(Vec::new()),
                poll_events: RefCell::new(VecDeque::new()),
                work_callbacks: RefCell::new(HashMap::new()),
                next_work_id: Cell::new(1),
                shared: Arc::new(LoopShared {
                    notify: Notify::new(),
                    asyncs: Mutex::new(Vec::new()),
                    finished_work: Mutex::new(Vec::new()),
                }),
                stop_requested: Cell::new(false),
                disposed: Cell::new(false),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(weak: &Weak<LoopInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Run until no referenced active handles, pending closes or thread-pool
    /// jobs remain, or until [`EventLoop::stop`] is called. Returns whether
    /// the loop is still alive.
    pub fn run(&self) -> bool {
        let inner = &self.inner;
        inner.stop_requested.set(false);
        while !inner.disposed.get() && inner.is_alive() && !inner.stop_requested.get() {
            inner.run_once();
        }
        inner.stop_requested.set(false);
        inner.is_alive()
    }

    /// Run a single iteration, blocking for I/O only if something is alive.
    pub fn run_once(&self) -> bool {
        if !self.inner.disposed.get() {
            self.inner.run_once();
        }
        self.inner.is_alive()
    }

    /// Run until idle, invoke `after_run`, and repeat while the loop is
    /// still alive afterwards.
    pub fn spin<F>(&self, mut after_run: F)
    where
        F: FnMut(),
    {
        loop {
            self.run();
            after_run();
            if self.inner.disposed.get() || !self.inner.is_alive() {
                break;
            }
        }
    }

    /// Ask a running loop to return after the current iteration.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
        self.inner.shared.wake();
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Visit every handle that has not finished closing.
    pub fn walk<F>(&self, mut visitor: F)
    where
        F: FnMut(HandleInfo),
    {
        let infos: Vec<HandleInfo> = self
            .inner
            .handles
            .borrow()
            .keys()
            .filter_map(|id| self.inner.info(*id))
            .collect();
        for info in infos {
            visitor(info);
        }
    }

    /// Run `work` on the shared loop thread pool and `after_work` on this
    /// loop's thread once `work` has returned. The pending job keeps the loop
    /// alive.
    pub fn enqueue_thread_pool_trivial_task<W, A>(
        &self,
        work: W,
        after_work: A,
    ) -> Result<(), CoreError>
    where
        W: FnOnce() + Send + 'static,
        A: FnOnce() + 'static,
    {
        if self.inner.disposed.get() {
            return Err(CoreError::PoolStopped);
        }
        let pool = match &*LOOP_THREAD_POOL {
            Ok(pool) => pool,
            Err(err) => {
                warn!(%err, "Event loop thread pool is unavailable");
                return Err(CoreError::PoolStopped);
            }
        };

        let work_id = self.inner.next_work_id.get();
        self.inner.next_work_id.set(work_id + 1);
        self.inner
            .work_callbacks
            .borrow_mut()
            .insert(work_id, Box::new(after_work));

        let shared = self.inner.shared.clone();
        let enqueued = pool.enqueue(move || {
            work();
            lock_vec(&shared.finished_work).push(work_id);
            shared.wake();
        });
        if let Err(err) = enqueued {
            self.inner.work_callbacks.borrow_mut().remove(&work_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Force-close every live handle, deliver their close callbacks and
    /// release reactor resources. Pending thread-pool completions are
    /// dropped. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.get() {
            return;
        }
        let mut forced = 0usize;
        self.walk(|info| {
            if !info.closing {
                forced += 1;
                self.inner.close_handle(info.id, None);
            }
        });
        if forced > 0 {
            debug!(count = forced, "Force-closed live handles while disposing event loop");
        }
        // Close callbacks may close further handles.
        while !self.inner.closing.borrow().is_empty() {
            self.inner.run_closing();
        }
        self.inner.work_callbacks.borrow_mut().clear();
        self.inner.poll_events.borrow_mut().clear();
        self.inner.disposed.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handles::{Async, Check, Idle, Prepare, Timer};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_empty_loop_returns_immediately() {
        let lp = EventLoop::new().unwrap();
        assert!(!lp.run());
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let slow = Timer::new(&lp);
        let fast = Timer::new(&lp);
        {
            let order = order.clone();
            slow.start(Duration::from_millis(30), Duration::ZERO, move || {
                order.borrow_mut().push("slow");
                KeepInLoop::No
            });
        }
        {
            let order = order.clone();
            fast.start(Duration::from_millis(5), Duration::ZERO, move || {
                order.borrow_mut().push("fast");
                KeepInLoop::No
            });
        }

        assert!(!lp.run());
        assert_eq!(*order.borrow(), vec!["fast", "slow"]);
    }

    #[test]
    fn test_repeating_timer_stops_on_no() {
        let lp = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let timer = Timer::new(&lp);
        {
            let count = count.clone();
            timer.start(Duration::from_millis(1), Duration::from_millis(1), move || {
                count.set(count.get() + 1);
                if count.get() == 3 {
                    KeepInLoop::No
                } else {
                    KeepInLoop::Yes
                }
            });
        }
        lp.run();
        assert_eq!(count.get(), 3);
        assert!(!timer.is_active());
    }

    #[test]
    fn test_async_send_from_other_thread() {
        let lp = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let handle = Rc::new(RefCell::new(None::<Async>));
        let async_handle = {
            let hits = hits.clone();
            let handle = handle.clone();
            Async::new(&lp, move || {
                hits.set(hits.get() + 1);
                if let Some(h) = handle.borrow().as_ref() {
                    h.close();
                }
            })
        };
        let sender = async_handle.sender();
        *handle.borrow_mut() = Some(async_handle);

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.send();
        });
        lp.run();
        thread.join().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_async_send_then_close_fires_once() {
        let lp = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let closed = Rc::new(Cell::new(false));
        let async_handle = {
            let hits = hits.clone();
            Async::new(&lp, move || hits.set(hits.get() + 1))
        };
        async_handle.send();
        async_handle.send();
        {
            let closed = closed.clone();
            async_handle.close_with(move || closed.set(true));
        }
        lp.run();
        assert_eq!(hits.get(), 1);
        assert!(closed.get());
    }

    #[test]
    fn test_phase_order() {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let prepare = Prepare::new(&lp);
        let check = Check::new(&lp);
        let idle = Idle::new(&lp);
        // Phase handles alone never wake the reactor; a timer drives the tick.
        let timer = Timer::new(&lp);
        timer.start(Duration::from_millis(5), Duration::ZERO, || KeepInLoop::No);
        {
            let order = order.clone();
            idle.start(move || {
                order.borrow_mut().push("idle");
                KeepInLoop::No
            });
        }
        {
            let order = order.clone();
            prepare.start(move || {
                order.borrow_mut().push("prepare");
                KeepInLoop::No
            });
        }
        {
            let order = order.clone();
            check.start(move || {
                order.borrow_mut().push("check");
                KeepInLoop::No
            });
        }
        lp.run();
        assert_eq!(*order.borrow(), vec!["idle", "prepare", "check"]);
    }

    #[test]
    fn test_unreferenced_handle_does_not_keep_loop_alive() {
        let lp = EventLoop::new().unwrap();
        let async_handle = Async::new(&lp, || {});
        assert!(lp.is_alive());
        async_handle.unref();
        assert!(!lp.is_alive());
        assert!(!lp.run());
        async_handle.ref_();
        assert!(lp.is_alive());
        lp.dispose();
    }

    #[test]
    fn test_thread_pool_work_runs_after_callback_on_loop_thread() {
        let lp = EventLoop::new().unwrap();
        let loop_thread = std::thread::current().id();
        let result = Arc::new(Mutex::new(None));
        let done = Rc::new(Cell::new(false));

        {
            let result = result.clone();
            let done = done.clone();
            let result_after = result.clone();
            lp.enqueue_thread_pool_trivial_task(
                move || {
                    *result.lock().unwrap() = Some(std::thread::current().id());
                },
                move || {
                    assert_eq!(std::thread::current().id(), loop_thread);
                    assert!(result_after.lock().unwrap().is_some());
                    done.set(true);
                },
            )
            .unwrap();
        }

        assert!(lp.is_alive());
        lp.run();
        assert!(done.get());
        assert_ne!(result.lock().unwrap().unwrap(), loop_thread);
    }

    #[test]
    fn test_walk_and_dispose_force_close() {
        let lp = EventLoop::new().unwrap();
        let closed = Rc::new(Cell::new(0));
        let timer = Timer::new(&lp);
        timer.start(Duration::from_secs(60), Duration::ZERO, || KeepInLoop::No);
        let _async = Async::new(&lp, || {});
        {
            let closed = closed.clone();
            let check = Check::new(&lp);
            check.close_with(move || closed.set(closed.get() + 1));
        }

        let mut kinds = Vec::new();
        lp.walk(|info| kinds.push(info.kind));
        assert!(kinds.contains(&HandleKind::Timer));
        assert!(kinds.contains(&HandleKind::Async));

        lp.dispose();
        assert_eq!(closed.get(), 1);
        let mut remaining = 0;
        lp.walk(|_| remaining += 1);
        assert_eq!(remaining, 0);
        assert!(lp.is_disposed());
        assert!(lp
            .enqueue_thread_pool_trivial_task(|| {}, || {})
            .is_err());
    }

    #[test]
    fn test_spin_repeats_while_alive() {
        let lp = EventLoop::new().unwrap();
        let rounds = Rc::new(Cell::new(0));
        let timer = Rc::new(Timer::new(&lp));
        timer.start(Duration::from_millis(1), Duration::ZERO, || KeepInLoop::No);
        {
            let rounds = rounds.clone();
            let timer = timer.clone();
            lp.spin(move || {
                rounds.set(rounds.get() + 1);
                if rounds.get() < 3 {
                    timer.start(Duration::from_millis(1), Duration::ZERO, || KeepInLoop::No);
                }
            });
        }
        assert_eq!(rounds.get(), 3);
    }
}
