//! Inspector bridge of the main runtime.
//!
//! The engine session lives on the runtime's thread; the websocket lives on
//! the [`IoThread`]. Frames from the frontend are queued by the I/O thread
//! and dispatched from an [`Async`] callback while the runtime is running.
//! While the debugger holds the VM paused, the event loop is not running,
//! so a nested pump blocks on the queue instead until the engine asks to
//! resume.

pub mod io_thread;

use std::cell::{Cell, RefCell};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use v8::inspector::{
    ChannelBase, ChannelImpl, StringBuffer, StringView, V8Inspector, V8InspectorClientBase,
    V8InspectorClientImpl, V8InspectorClientTrustLevel, V8InspectorSession,
};

use crate::core::{Async, ConcurrentTaskQueue};
use crate::error::{InspectorError, RuntimeError};
use crate::runtime::base::RuntimeState;
use crate::runtime::config::InspectorConfig;

pub use io_thread::{ConnectionBarrier, IoEvent, IoThread, TargetInfo};

const CONTEXT_GROUP_ID: i32 = 1;
const RUN_IF_WAITING_FOR_DEBUGGER: &str = "Runtime.runIfWaitingForDebugger";

#[derive(Deserialize)]
struct FrameHeader {
    method: Option<String>,
}

/// Whether `frame` is a `Runtime.runIfWaitingForDebugger` request. This is
/// the only frame the host looks into.
pub(crate) fn is_run_if_waiting_for_debugger(frame: &str) -> bool {
    if !frame.contains(RUN_IF_WAITING_FOR_DEBUGGER) {
        return false;
    }
    serde_json::from_str::<FrameHeader>(frame)
        .ok()
        .and_then(|header| header.method)
        .is_some_and(|method| method == RUN_IF_WAITING_FOR_DEBUGGER)
}

fn new_box_with<T>(new_fn: impl FnOnce(*mut T) -> T) -> Box<T> {
    let b = Box::new(MaybeUninit::<T>::uninit());
    let p = Box::into_raw(b) as *mut T;
    // SAFETY: `p` comes from a fresh allocation sized and aligned for `T`
    // and is fully initialized before being turned back into a box.
    unsafe {
        std::ptr::write(p, new_fn(p));
        Box::from_raw(p)
    }
}

/// Engine session plus the channel the engine answers through.
struct InspectorSession {
    channel: ChannelBase,
    session: v8::UniqueRef<V8InspectorSession>,
    outbound: mpsc::UnboundedSender<String>,
}

impl InspectorSession {
    fn connect(inspector: &mut V8Inspector, outbound: mpsc::UnboundedSender<String>) -> Box<Self> {
        new_box_with(move |this| {
            let channel = ChannelBase::new::<Self>();
            // SAFETY: the engine keeps `this` as the session's channel. It
            // is the address of the box under construction and never moves.
            let session = inspector.connect(
                CONTEXT_GROUP_ID,
                unsafe { &mut *this },
                StringView::empty(),
                V8InspectorClientTrustLevel::FullyTrusted,
            );
            Self {
                channel,
                session,
                outbound,
            }
        })
    }

    fn dispatch(&mut self, frame: &str) {
        self.session
            .dispatch_protocol_message(StringView::from(frame.as_bytes()));
    }

    fn schedule_pause_on_next_statement(&mut self) {
        self.session.schedule_pause_on_next_statement(
            StringView::from(&b"debugCommand"[..]),
            StringView::empty(),
        );
    }

    fn forward(&mut self, message: v8::UniquePtr<StringBuffer>) {
        if let Some(buffer) = message.as_ref() {
            // The frontend may already be gone; dropped frames are fine.
            let _ = self.outbound.send(buffer.string().to_string());
        }
    }
}

impl ChannelImpl for InspectorSession {
    fn base(&self) -> &ChannelBase {
        &self.channel
    }

    fn base_mut(&mut self) -> &mut ChannelBase {
        &mut self.channel
    }

    unsafe fn base_ptr(this: *const Self) -> *const ChannelBase
    where
        Self: Sized,
    {
        // SAFETY: `this` points at a live session.
        unsafe { std::ptr::addr_of!((*this).channel) }
    }

    fn send_response(&mut self, _call_id: i32, message: v8::UniquePtr<StringBuffer>) {
        self.forward(message);
    }

    fn send_notification(&mut self, message: v8::UniquePtr<StringBuffer>) {
        self.forward(message);
    }

    fn flush_protocol_notifications(&mut self) {}
}

/// Receives the engine's requests to pause, resume and start.
struct InspectorClient {
    base: V8InspectorClientBase,
    inner: Weak<InspectorInner>,
}

impl V8InspectorClientImpl for InspectorClient {
    fn base(&self) -> &V8InspectorClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut V8InspectorClientBase {
        &mut self.base
    }

    unsafe fn base_ptr(this: *const Self) -> *const V8InspectorClientBase
    where
        Self: Sized,
    {
        // SAFETY: `this` points at a live client.
        unsafe { std::ptr::addr_of!((*this).base) }
    }

    fn run_message_loop_on_pause(&mut self, _context_group_id: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run_paused_loop();
        }
    }

    fn quit_message_loop_on_pause(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.should_quit.set(true);
        }
    }

    fn run_if_waiting_for_debugger(&mut self, _context_group_id: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.startup_requested.set(true);
        }
    }
}

type DeferredStartup = Box<dyn FnOnce()>;

struct InspectorInner {
    runtime: Weak<RuntimeState>,
    inbound: Arc<ConcurrentTaskQueue<IoEvent>>,
    // Field order is drop order: the session goes before the engine
    // inspector, which goes before its client.
    session: RefCell<Option<Box<InspectorSession>>>,
    v8_inspector: RefCell<Option<v8::UniqueRef<V8Inspector>>>,
    client: RefCell<Option<Box<InspectorClient>>>,
    notifier: RefCell<Option<Async>>,
    io: RefCell<Option<IoThread>>,
    barrier: RefCell<Option<Arc<ConnectionBarrier>>>,
    address: SocketAddr,
    startup: RefCell<Option<DeferredStartup>>,
    break_on_startup: Cell<bool>,
    startup_requested: Cell<bool>,
    connected: Cell<bool>,
    disconnected: Cell<bool>,
    paused: Cell<bool>,
    should_quit: Cell<bool>,
    dispatch_depth: Cell<usize>,
    torn_down: Cell<bool>,
}

impl InspectorInner {
    fn handle_event(&self, event: IoEvent) {
        match event {
            IoEvent::Connected => {
                self.connected.set(true);
                // A connected frontend keeps the runtime alive.
                if let Some(notifier) = self.notifier.borrow().as_ref() {
                    notifier.ref_();
                }
            }
            IoEvent::Frame(frame) => {
                if is_run_if_waiting_for_debugger(&frame) {
                    self.startup_requested.set(true);
                }
                self.dispatch(&frame);
            }
            IoEvent::Disconnected => {
                self.connected.set(false);
                self.disconnected.set(true);
                self.should_quit.set(true);
                if let Some(notifier) = self.notifier.borrow().as_ref() {
                    notifier.unref();
                }
            }
        }
    }

    fn dispatch(&self, frame: &str) {
        let session = match self.session.borrow_mut().as_deref_mut() {
            Some(session) => session as *mut InspectorSession,
            None => return,
        };
        self.dispatch_depth.set(self.dispatch_depth.get() + 1);
        // SAFETY: the session is only dropped by `teardown`, which waits
        // until no dispatch is on the stack. Nested dispatches from the
        // pause pump re-enter the engine the same way the engine re-enters
        // us.
        unsafe { (*session).dispatch(frame) };
        self.dispatch_depth.set(self.dispatch_depth.get() - 1);
    }

    fn schedule_pause(&self) {
        if let Some(session) = self.session.borrow_mut().as_deref_mut() {
            session.schedule_pause_on_next_statement();
        }
    }

    /// Async callback: drain whatever the I/O thread queued.
    fn on_io_events(&self) {
        // One event at a time: a dispatch that pauses the engine pumps the
        // rest of the queue from `run_paused_loop`.
        let mut handled = false;
        while let Some(event) = self.inbound.pop() {
            handled = true;
            self.handle_event(event);
            self.inbound.notify_of_completion();
        }
        if !handled && !self.disconnected.get() {
            return;
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.enter(|scope| runtime.perform_tasks_checkpoint(scope));
        }
        self.run_pending_startup();
        if self.disconnected.get() {
            self.teardown();
        }
    }

    fn run_pending_startup(&self) {
        if !self.startup_requested.get() {
            return;
        }
        let Some(startup) = self.startup.borrow_mut().take() else {
            return;
        };
        if self.break_on_startup.get() {
            self.schedule_pause();
        }
        debug!("Evaluating startup module on debugger request");
        startup();
    }

    /// Nested pump used while the engine is paused. Returns once the engine
    /// resumes or the frontend goes away.
    fn run_paused_loop(&self) {
        if self.paused.get() {
            return;
        }
        self.paused.set(true);
        self.should_quit.set(self.disconnected.get());
        while !self.should_quit.get() {
            let Some(event) = self.inbound.wait_pop() else {
                break;
            };
            self.handle_event(event);
            self.inbound.notify_of_completion();
        }
        self.paused.set(false);
    }

    fn teardown(&self) {
        if self.dispatch_depth.get() > 0 || self.paused.get() || self.torn_down.get() {
            return;
        }
        self.torn_down.set(true);

        self.session.borrow_mut().take();
        self.v8_inspector.borrow_mut().take();
        self.client.borrow_mut().take();
        self.barrier.borrow_mut().take();
        self.startup.borrow_mut().take();
        self.inbound.dispose();

        // The wakeup handle is closed first; the I/O thread is joined only
        // once the loop has finished closing it.
        let io = self.io.borrow_mut().take();
        match self.notifier.borrow_mut().take() {
            Some(notifier) => notifier.close_with(move || drop(io)),
            None => drop(io),
        }
        debug!(address = %self.address, "Inspector session closed");
    }
}

/// Inspector attached to one runtime.
pub struct Inspector {
    inner: Rc<InspectorInner>,
}

impl Inspector {
    /// Start the I/O thread on `config.address` and connect an engine
    /// session to the runtime's context.
    pub fn start(runtime: &Rc<RuntimeState>, config: &InspectorConfig) -> Result<Inspector, RuntimeError> {
        let inbound = Arc::new(ConcurrentTaskQueue::new());
        let inner = Rc::new(InspectorInner {
            runtime: runtime.weak(),
            inbound: inbound.clone(),
            session: RefCell::new(None),
            v8_inspector: RefCell::new(None),
            client: RefCell::new(None),
            notifier: RefCell::new(None),
            io: RefCell::new(None),
            barrier: RefCell::new(None),
            address: config.address,
            startup: RefCell::new(None),
            break_on_startup: Cell::new(config.break_on_next_statement),
            startup_requested: Cell::new(false),
            connected: Cell::new(false),
            disconnected: Cell::new(false),
            paused: Cell::new(false),
            should_quit: Cell::new(false),
            dispatch_depth: Cell::new(0),
            torn_down: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        let notifier = Async::new(runtime.event_loop(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_io_events();
            }
        });
        notifier.unref();

        let target = TargetInfo {
            id: format!("cocoa-{}-{}", std::process::id(), config.port()),
            title: config
                .display_name
                .clone()
                .unwrap_or_else(|| format!("cocoa[{}]", std::process::id())),
            url: config
                .target_url
                .clone()
                .unwrap_or_else(|| format!("file://{}", runtime.options().startup)),
        };
        let sender = notifier.sender();
        let io = match IoThread::start(config.address, target, inbound, move || sender.send()) {
            Ok(io) => io,
            Err(err) => {
                notifier.close();
                return Err(err.into());
            }
        };
        let Some(outbound) = io.sender() else {
            notifier.close();
            return Err(InspectorError::IoThreadGone.into());
        };

        let mut client = Box::new(InspectorClient {
            base: V8InspectorClientBase::new::<InspectorClient>(),
            inner: Rc::downgrade(&inner),
        });
        let created = runtime.enter(|scope| {
            let mut inspector = V8Inspector::create(scope, &mut *client);
            let context = scope.get_current_context();
            inspector.context_created(
                context,
                CONTEXT_GROUP_ID,
                StringView::from(&b"mainthread"[..]),
                StringView::empty(),
            );
            inspector
        });
        let Some(mut v8_inspector) = created else {
            notifier.close();
            return Err(RuntimeError::Disposed);
        };
        let session = InspectorSession::connect(&mut v8_inspector, outbound);

        let address = io.local_addr();
        *inner.barrier.borrow_mut() = Some(io.barrier());
        *inner.session.borrow_mut() = Some(session);
        *inner.v8_inspector.borrow_mut() = Some(v8_inspector);
        *inner.client.borrow_mut() = Some(client);
        *inner.notifier.borrow_mut() = Some(notifier);
        *inner.io.borrow_mut() = Some(io);

        info!("Started V8 inspector, listening on ws://{}", address);
        Ok(Inspector { inner })
    }

    /// Address the I/O thread is listening on, until the session closes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.io.borrow().as_ref().map(IoThread::local_addr)
    }

    /// Block until a frontend has connected. Only the first call waits;
    /// later calls return immediately.
    pub fn wait_for_connection(&self) {
        let barrier = self.inner.barrier.borrow_mut().take();
        if let Some(barrier) = barrier {
            info!("Waiting for the inspector frontend to connect");
            barrier.wait();
            // The notifier is not referenced yet, so pick up the connection
            // here rather than relying on the loop.
            self.inner.on_io_events();
        }
    }

    /// Run `startup` once the frontend sends
    /// `Runtime.runIfWaitingForDebugger`, pausing on its first statement
    /// when the inspector was configured to.
    pub fn defer_startup<F>(&self, startup: F)
    where
        F: FnOnce() + 'static,
    {
        *self.inner.startup.borrow_mut() = Some(Box::new(startup));
        self.inner.run_pending_startup();
    }

    /// Pause on the next statement the engine executes.
    pub fn break_on_next_statement(&self) {
        self.inner.schedule_pause();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.torn_down.get()
    }

    /// Close the session and stop the I/O thread. Idempotent.
    pub fn dispose(&self) {
        self.inner.teardown();
    }
}

impl Drop for Inspector {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognizes_run_if_waiting() {
        assert!(is_run_if_waiting_for_debugger(
            r#"{"id":7,"method":"Runtime.runIfWaitingForDebugger"}"#
        ));
        assert!(!is_run_if_waiting_for_debugger(r#"{"id":8,"method":"Runtime.enable"}"#));
        // Mentioned inside a parameter, not requested
        assert!(!is_run_if_waiting_for_debugger(
            r#"{"id":9,"method":"Runtime.evaluate","params":{"expression":"'Runtime.runIfWaitingForDebugger'"}}"#
        ));
        assert!(!is_run_if_waiting_for_debugger("Runtime.runIfWaitingForDebugger"));
    }
}
