//! Runtime hosted on a worker thread.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::bindings::binder::new_string;
use crate::bindings::workers::MessagePortWrap;
use crate::bindings::BindingManager;
use crate::core::EventLoop;
use crate::error::{BinderError, RuntimeError};
use crate::message_port::{MessagePort, PortEvent};
use crate::platform::Platform;
use crate::runtime::base::{RuntimeBase, RuntimeDelegate};
use crate::runtime::config::RuntimeOptions;

struct WorkerDelegate {
    pending_port: RefCell<Option<Arc<MessagePort>>>,
    port: RefCell<Option<Rc<MessagePortWrap>>>,
}

impl RuntimeDelegate for WorkerDelegate {
    fn on_initialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        global: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError> {
        let port = self
            .pending_port
            .borrow_mut()
            .take()
            .ok_or_else(|| BinderError::error("Worker port has already been attached"))?;
        let (wrap, object) = MessagePortWrap::new_object(scope, port)?;
        *self.port.borrow_mut() = Some(wrap);

        let key = new_string(scope, "self");
        global.set(scope, key.into(), global.into());
        let key = new_string(scope, "port");
        global.set(scope, key.into(), object.into());
        Ok(())
    }

    fn on_report_uncaught_exception(&self, _scope: &mut v8::HandleScope, text: &str) {
        if let Some(port) = self.port.borrow().as_ref() {
            port.post_event(PortEvent::Error(text.to_string()));
        }
    }

    fn on_pre_dispose(&self, _scope: &mut v8::HandleScope) {
        self.port.borrow_mut().take();
    }
}

/// A runtime whose global scope carries `self` and a `port` connected to
/// the runtime that spawned it.
pub struct WorkerRuntime {
    base: RuntimeBase,
}

impl WorkerRuntime {
    pub fn new(
        id: impl Into<String>,
        event_loop: EventLoop,
        platform: Arc<Platform>,
        bindings: Arc<BindingManager>,
        options: RuntimeOptions,
        port: Arc<MessagePort>,
    ) -> Result<Self, RuntimeError> {
        let delegate = Rc::new(WorkerDelegate {
            pending_port: RefCell::new(Some(port)),
            port: RefCell::new(None),
        });
        let base = RuntimeBase::new(id, event_loop, platform, bindings, options, delegate)?;
        Ok(Self { base })
    }

    pub fn initialize(&self) -> Result<(), RuntimeError> {
        self.base.initialize()?;
        self.base.evaluate_system_module("internal://worker_bootstrap.js")
    }

    pub fn base(&self) -> &RuntimeBase {
        &self.base
    }

    pub fn evaluate_module(&self, url: &str) -> Result<(), RuntimeError> {
        self.base.evaluate_module(url)
    }

    pub fn spin_run(&self) -> Result<(), RuntimeError> {
        self.base.spin_run()
    }

    pub fn dispose(&mut self) {
        self.base.dispose();
    }
}
