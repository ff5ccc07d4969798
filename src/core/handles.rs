//! Typed wrappers around event loop handles.
//!
//! Wrappers hold a weak reference to the loop, so storing a handle inside
//! one of its own callbacks never leaks the loop. A handle stays registered
//! until [`RawHandle::close`] is called or the loop is disposed; dropping the
//! wrapper alone does not close it.

use std::ops::Deref;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::event_loop::{
    AsyncState, EventLoop, HandleId, HandleInfo, HandleKind, KeepInLoop, LoopInner,
};
use crate::error::CoreError;

pub const POLL_READABLE: i32 = 1;
pub const POLL_WRITABLE: i32 = 2;

/// Operations shared by every handle kind.
pub struct RawHandle {
    lp: Weak<LoopInner>,
    id: HandleId,
    kind: HandleKind,
}

impl RawHandle {
    fn new(lp: &EventLoop, kind: HandleKind) -> Self {
        let id = lp.inner().create_handle(kind);
        Self {
            lp: lp.downgrade(),
            id,
            kind,
        }
    }

    fn with_loop<R>(&self, f: impl FnOnce(&Rc<LoopInner>) -> R) -> Option<R> {
        self.lp.upgrade().map(|inner| f(&inner))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    fn info(&self) -> Option<HandleInfo> {
        self.with_loop(|inner| inner.info(self.id)).flatten()
    }

    pub fn is_active(&self) -> bool {
        self.info().is_some_and(|info| info.active)
    }

    pub fn is_closing(&self) -> bool {
        self.info().map_or(true, |info| info.closing)
    }

    pub fn has_ref(&self) -> bool {
        self.info().is_some_and(|info| info.referenced)
    }

    pub fn ref_(&self) {
        self.with_loop(|inner| inner.set_referenced(self.id, true));
    }

    pub fn unref(&self) {
        self.with_loop(|inner| inner.set_referenced(self.id, false));
    }

    /// Close the handle; its callback will not be invoked again.
    pub fn close(&self) {
        self.with_loop(|inner| inner.close_handle(self.id, None));
    }

    /// Close the handle and run `on_close` from the loop's close phase.
    pub fn close_with<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        self.with_loop(|inner| inner.close_handle(self.id, Some(Box::new(on_close))));
    }
}

/// One-shot or repeating timer.
pub struct Timer(RawHandle);

impl Timer {
    pub fn new(lp: &EventLoop) -> Self {
        Self(RawHandle::new(lp, HandleKind::Timer))
    }

    /// Arm the timer. A non-zero `repeat` re-arms it after every expiry until
    /// the callback returns [`KeepInLoop::No`] or the timer is stopped.
    pub fn start<F>(&self, timeout: Duration, repeat: Duration, mut callback: F)
    where
        F: FnMut() -> KeepInLoop + 'static,
    {
        self.0.with_loop(|inner| {
            inner.set_callback(self.0.id, Box::new(move |_| callback()));
            inner.timer_start(self.0.id, timeout, repeat);
        });
    }

    pub fn stop(&self) {
        self.0.with_loop(|inner| inner.timer_stop(self.0.id));
    }

    pub fn repeat(&self) -> Duration {
        self.0
            .with_loop(|inner| inner.timer_repeat(self.0.id))
            .unwrap_or_default()
    }
}

impl Deref for Timer {
    type Target = RawHandle;

    fn deref(&self) -> &RawHandle {
        &self.0
    }
}

/// Thread-safe wakeup. The callback runs on the loop thread once per batch
/// of [`AsyncSender::send`] calls.
pub struct Async {
    raw: RawHandle,
    state: Arc<AsyncState>,
}

impl Async {
    pub fn new<F>(lp: &EventLoop, mut callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        let raw = RawHandle::new(lp, HandleKind::Async);
        let state = Arc::new(AsyncState {
            id: raw.id,
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared: lp.inner().shared().clone(),
        });
        lp.inner().set_callback(
            raw.id,
            Box::new(move |_| {
                callback();
                KeepInLoop::Yes
            }),
        );
        lp.inner().attach_async(raw.id, state.clone());
        Self { raw, state }
    }

    pub fn send(&self) {
        self.state.send();
    }

    /// A `Send + Sync` handle that can wake this loop from any thread.
    pub fn sender(&self) -> AsyncSender {
        AsyncSender {
            state: self.state.clone(),
        }
    }

    /// Stop delivering wakeups and stop keeping the loop alive.
    pub fn disable(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.raw.unref();
    }
}

impl Deref for Async {
    type Target = RawHandle;

    fn deref(&self) -> &RawHandle {
        &self.raw
    }
}

/// Cross-thread sender half of an [`Async`] handle.
#[derive(Clone)]
pub struct AsyncSender {
    state: Arc<AsyncState>,
}

impl AsyncSender {
    pub fn send(&self) {
        self.state.send();
    }

    /// True once the handle has been closed or disabled.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AsyncSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSender")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

macro_rules! phase_handle {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        pub struct $name(RawHandle);

        impl $name {
            pub fn new(lp: &EventLoop) -> Self {
                Self(RawHandle::new(lp, $kind))
            }

            pub fn start<F>(&self, mut callback: F)
            where
                F: FnMut() -> KeepInLoop + 'static,
            {
                self.0.with_loop(|inner| {
                    inner.set_callback(self.0.id, Box::new(move |_| callback()));
                    inner.set_active(self.0.id, true);
                });
            }

            pub fn stop(&self) {
                self.0.with_loop(|inner| inner.set_active(self.0.id, false));
            }
        }

        impl Deref for $name {
            type Target = RawHandle;

            fn deref(&self) -> &RawHandle {
                &self.0
            }
        }
    };
}

phase_handle!(
    /// Runs right before the loop blocks for I/O.
    Prepare,
    HandleKind::Prepare
);
phase_handle!(
    /// Runs right after the loop returns from waiting for I/O.
    Check,
    HandleKind::Check
);
phase_handle!(
    /// Runs once per iteration and keeps the loop from blocking while active.
    Idle,
    HandleKind::Idle
);

/// Readiness watcher for a file descriptor the caller owns.
pub struct Poll {
    raw: RawHandle,
    fd: RawFd,
}

impl Poll {
    pub fn new(lp: &EventLoop, fd: RawFd) -> Self {
        Self {
            raw: RawHandle::new(lp, HandleKind::Poll),
            fd,
        }
    }

    /// Watch for `events` (a mask of [`POLL_READABLE`] and [`POLL_WRITABLE`]).
    /// The callback receives the ready mask, or the OS error that ended the
    /// watch.
    pub fn start<F>(&self, events: i32, mut callback: F) -> Result<(), CoreError>
    where
        F: FnMut(std::io::Result<i32>) -> KeepInLoop + 'static,
    {
        let interest = match (events & POLL_READABLE != 0, events & POLL_WRITABLE != 0) {
            (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            (false, true) => tokio::io::Interest::WRITABLE,
            _ => tokio::io::Interest::READABLE,
        };
        let Some(inner) = self.raw.lp.upgrade() else {
            return Err(CoreError::Reactor(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "event loop has been dropped",
            )));
        };
        inner.set_callback(
            self.raw.id,
            Box::new(move |mask| {
                if mask < 0 {
                    callback(Err(std::io::Error::from_raw_os_error(-mask)))
                } else {
                    callback(Ok(mask))
                }
            }),
        );
        inner.poll_start(self.raw.id, self.fd, interest)
    }

    pub fn stop(&self) {
        self.raw.with_loop(|inner| inner.poll_stop(self.raw.id));
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Deref for Poll {
    type Target = RawHandle;

    fn deref(&self) -> &RawHandle {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_poll_reports_readable_until_drained() {
        let lp = EventLoop::new().unwrap();
        let (read_fd, write_fd) = pipe();
        let payload = b"ping";
        // SAFETY: writing a valid buffer to a pipe we own.
        unsafe { libc::write(write_fd, payload.as_ptr().cast(), payload.len()) };

        let poll = Rc::new(Poll::new(&lp, read_fd));
        let received = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            let poll_in_cb = poll.clone();
            poll.start(POLL_READABLE, move |result| {
                let mask = result.unwrap();
                assert!(mask & POLL_READABLE != 0);
                let mut buf = [0u8; 2];
                // SAFETY: reading into a valid stack buffer.
                let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
                received.borrow_mut().extend_from_slice(&buf[..n as usize]);
                if received.borrow().len() == payload.len() {
                    poll_in_cb.close();
                }
                KeepInLoop::Yes
            })
            .unwrap();
        }

        lp.run();
        assert_eq!(received.borrow().as_slice(), payload);

        // SAFETY: closing descriptors created above.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_timer_restart_from_own_callback() {
        let lp = EventLoop::new().unwrap();
        let timer = Rc::new(Timer::new(&lp));
        let fired = Rc::new(Cell::new(0));
        let weak = Rc::downgrade(&timer);
        {
            let fired = fired.clone();
            timer.start(Duration::ZERO, Duration::ZERO, move || {
                fired.set(fired.get() + 1);
                if fired.get() < 3 {
                    if let Some(timer) = weak.upgrade() {
                        let fired = fired.clone();
                        timer.start(Duration::ZERO, Duration::ZERO, move || {
                            fired.set(fired.get() + 1);
                            KeepInLoop::No
                        });
                    }
                }
                KeepInLoop::No
            });
        }
        lp.run();
        // The replacement callback takes over after the first expiry.
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn test_closed_handle_reports_closing() {
        let lp = EventLoop::new().unwrap();
        let idle = Idle::new(&lp);
        idle.start(|| KeepInLoop::Yes);
        assert!(idle.is_active());
        idle.close();
        assert!(idle.is_closing());
        assert!(!idle.is_active());
        lp.run();
        assert!(idle.is_closing());
    }

    #[test]
    fn test_disabled_async_ignores_sends() {
        let lp = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let async_handle = {
            let hits = hits.clone();
            Async::new(&lp, move || hits.set(hits.get() + 1))
        };
        let sender = async_handle.sender();
        async_handle.disable();
        sender.send();
        assert!(sender.is_closed());
        assert!(!lp.run());
        assert_eq!(hits.get(), 0);
        lp.dispose();
    }
}
