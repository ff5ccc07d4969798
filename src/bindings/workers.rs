//! The `workers` synthetic module: message ports and worker threads.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{error, trace};

use crate::bindings::binder::{self, class_constructor, class_template, new_string, unwrap_this, wrap_object};
use crate::bindings::emitter::{self, EventEmitter, HasEmitter};
use crate::bindings::exportable::{downcast, Descriptor, ExportableObject, FlattenedData, ObjectAttributes};
use crate::bindings::{Binding, ClassBuilder};
use crate::error::BinderError;
use crate::message_port::{self, MessagePort, PortEndpoint, PortError, PortEvent};
use crate::runtime::base::RuntimeState;
use crate::runtime::worker;

pub struct WorkersBinding;

impl Binding for WorkersBinding {
    fn name(&self) -> &str {
        "workers"
    }

    fn description(&self) -> &str {
        "Worker threads and message ports"
    }

    fn unique_id(&self) -> &str {
        "org.cocoa.runtime.workers"
    }

    fn exports(&self) -> &[&'static str] {
        &["MessagePort", "Worker"]
    }

    fn on_register_classes(&self, scope: &mut v8::HandleScope) -> Result<(), BinderError> {
        register_classes(scope);
        Ok(())
    }

    fn on_get_module<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        exports: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError> {
        for name in self.exports() {
            let constructor = class_constructor(scope, name)?;
            let key = new_string(scope, name);
            exports.set(scope, key.into(), constructor.into());
        }
        Ok(())
    }
}

/// Register `MessagePort` and `Worker` in the current isolate unless that
/// has already happened.
pub(crate) fn register_classes(scope: &mut v8::HandleScope) {
    if class_template(scope, MESSAGE_PORT.class_name).is_none() {
        let builder = ClassBuilder::new(scope, MESSAGE_PORT.class_name)
            .static_method(scope, "MakeConnectedPair", js_make_connected_pair)
            .method(scope, "postMessage", js_post_message)
            .method(scope, "close", js_close);
        emitter::install_methods::<MessagePortWrap>(builder, scope).register(scope);
    }
    if class_template(scope, WORKER.class_name).is_none() {
        ClassBuilder::new(scope, WORKER.class_name)
            .static_method(scope, "MakeFromURL", js_make_from_url)
            .register(scope);
    }
}

static MESSAGE_PORT: Descriptor = Descriptor {
    class_name: "MessagePort",
    attributes: ObjectAttributes::MESSAGE_PORT.union(ObjectAttributes::TRANSFERABLE),
    transfer: Some(transfer_port),
    clone: None,
};

static WORKER: Descriptor = Descriptor {
    class_name: "Worker",
    attributes: ObjectAttributes::NONE,
    transfer: None,
    clone: None,
};

const MESSAGE_EVENT: &str = "Message";
const ERROR_EVENT: &str = "Error";

/// Script-facing side of a [`MessagePort`] attached to a runtime's loop.
pub struct MessagePortWrap {
    emitter: EventEmitter,
    endpoint: RefCell<Option<PortEndpoint>>,
    runtime: Weak<RuntimeState>,
}

impl MessagePortWrap {
    /// Attach `port` to the loop of `runtime`.
    pub fn attach(runtime: &Rc<RuntimeState>, port: Arc<MessagePort>) -> Result<Rc<MessagePortWrap>, BinderError> {
        let wrap = Rc::new_cyclic(|weak: &Weak<MessagePortWrap>| {
            let emitter = EventEmitter::new();
            let on_first = weak.clone();
            let on_last_gone = weak.clone();
            emitter.define_event_with_hooks(
                MESSAGE_EVENT,
                Some(Box::new(move || {
                    if let Some(wrap) = on_first.upgrade() {
                        wrap.set_receiving(true);
                    }
                    1
                })),
                Some(Box::new(move |_| {
                    if let Some(wrap) = on_last_gone.upgrade() {
                        wrap.set_receiving(false);
                    }
                })),
            );
            emitter.define_event(ERROR_EVENT);
            MessagePortWrap {
                emitter,
                endpoint: RefCell::new(None),
                runtime: runtime.weak(),
            }
        });

        let weak = Rc::downgrade(&wrap);
        let endpoint = PortEndpoint::attach(port, runtime.event_loop(), move || {
            let Some(wrap) = weak.upgrade() else {
                return;
            };
            let Some(runtime) = wrap.runtime.upgrade() else {
                return;
            };
            runtime.enter(|scope| {
                wrap.dispatch(scope);
                runtime.perform_tasks_checkpoint(scope);
            });
        })?;
        *wrap.endpoint.borrow_mut() = Some(endpoint);
        Ok(wrap)
    }

    /// Attach `port` and create its script object.
    pub fn new_object<'s>(
        scope: &mut v8::HandleScope<'s>,
        port: Arc<MessagePort>,
    ) -> Result<(Rc<MessagePortWrap>, v8::Local<'s, v8::Object>), BinderError> {
        let runtime = RuntimeState::from_isolate(scope)
            .ok_or_else(|| BinderError::error("No runtime is associated with the current isolate"))?;
        register_classes(scope);
        let wrap = MessagePortWrap::attach(&runtime, port)?;
        let object = wrap_object(scope, wrap.clone())?;
        Ok((wrap, object))
    }

    /// The underlying port, unless this wrapper has been closed or
    /// transferred.
    pub fn port(&self) -> Option<Arc<MessagePort>> {
        self.endpoint.borrow().as_ref().map(|endpoint| endpoint.port().clone())
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.borrow().is_none()
    }

    fn set_receiving(&self, receiving: bool) {
        if let Some(endpoint) = self.endpoint.borrow().as_ref() {
            endpoint.set_receiving(receiving);
        }
    }

    /// Post `event` to the peer without going through the serializer.
    pub fn post_event(&self, event: PortEvent) -> bool {
        self.port().is_some_and(|port| port.post(event))
    }

    /// Detach from the loop and drop every listener, handing the port back.
    fn detach(&self) -> Result<Arc<MessagePort>, PortError> {
        if self.is_closed() {
            return Err(PortError::Closed);
        }
        self.emitter.dispose();
        let endpoint = self.endpoint.borrow_mut().take().ok_or(PortError::Closed)?;
        Ok(endpoint.detach())
    }

    pub fn close(&self) -> Result<(), PortError> {
        let port = self.detach()?;
        trace!(port = port.id(), "Closed message port");
        Ok(())
    }

    fn dispatch(&self, scope: &mut v8::HandleScope) {
        let Some(port) = self.port() else {
            return;
        };
        for event in port.take_events() {
            if self.is_closed() {
                break;
            }
            let delivered = match event {
                PortEvent::Message(mut message) => {
                    if self.emitter.listener_count(MESSAGE_EVENT) == 0 {
                        continue;
                    }
                    let tc = &mut v8::TryCatch::new(scope);
                    match message_port::deserialize(tc, &mut message) {
                        Some(value) => self.emitter.emit(tc, MESSAGE_EVENT, &[value]),
                        None => {
                            let text = match tc.message() {
                                Some(message) => {
                                    let text = message.get(tc);
                                    text.to_rust_string_lossy(tc)
                                }
                                None => "Failed to deserialize message".to_string(),
                            };
                            error!("Message error: {}", text);
                            self.emit_error(tc, &text)
                        }
                    }
                }
                PortEvent::Error(text) => self.emit_error(scope, &text),
            };
            if let Err(err) = delivered {
                trace!(port = port.id(), %err, "Stopped dispatching port events");
                break;
            }
        }
    }

    fn emit_error(&self, scope: &mut v8::HandleScope, text: &str) -> Result<(), BinderError> {
        if self.emitter.listener_count(ERROR_EVENT) == 0 {
            return Ok(());
        }
        let message = new_string(scope, text);
        let exception = v8::Exception::error(scope, message);
        self.emitter.emit(scope, ERROR_EVENT, &[exception])
    }
}

impl ExportableObject for MessagePortWrap {
    fn descriptor(&self) -> &'static Descriptor {
        &MESSAGE_PORT
    }

    fn dispose(&self) {
        let _ = self.detach();
    }
}

impl Drop for MessagePortWrap {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.get_mut().take() {
            endpoint.detach();
        }
    }
}

impl HasEmitter for MessagePortWrap {
    fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }
}

struct TransferredPort {
    port: Arc<MessagePort>,
}

impl FlattenedData for TransferredPort {
    fn deserialize<'s>(
        self: Box<Self>,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Object>, BinderError> {
        let (_, object) = MessagePortWrap::new_object(scope, self.port)?;
        Ok(object)
    }
}

fn transfer_port(
    object: &Rc<dyn ExportableObject>,
    pretest: bool,
) -> Result<Option<Box<dyn FlattenedData>>, BinderError> {
    let wrap = downcast::<MessagePortWrap>(object.clone()).ok_or_else(|| BinderError::type_error("Not a message port"))?;
    if pretest {
        return if wrap.is_closed() {
            Err(PortError::Closed.into())
        } else {
            Ok(None)
        };
    }
    // The port stays detached until the destination attaches it.
    let port = wrap.detach()?;
    Ok(Some(Box::new(TransferredPort { port })))
}

fn js_make_connected_pair<'s>(
    scope: &mut v8::HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    binder::guard(scope, &mut rv, |scope| {
        let (first, second) = MessagePort::make_connected_pair();
        let (_, first) = MessagePortWrap::new_object(scope, first)?;
        let (_, second) = MessagePortWrap::new_object(scope, second)?;
        let pair = v8::Array::new_with_elements(scope, &[first.into(), second.into()]);
        Ok(Some(pair.into()))
    });
}

fn js_post_message<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<MessagePortWrap>(scope, &args)?;
        let port = this.port().ok_or(PortError::Closed)?;

        let mut transfers = Vec::new();
        match args.length() {
            1 => {}
            2 => {
                let array = v8::Local::<v8::Array>::try_from(args.get(1))
                    .map_err(|_| BinderError::type_error("Argument `transfers` must be an array of values"))?;
                for index in 0..array.length() {
                    let value = array
                        .get_index(scope, index)
                        .ok_or_else(|| BinderError::error("Argument `transfers` is an invalid array"))?;
                    transfers.push(value);
                }
            }
            _ => return Err(BinderError::type_error("Invalid number of arguments, expecting 1 or 2")),
        }

        if !port.is_attached() {
            return Err(BinderError::error("Failed to post message"));
        }
        message_port::check_transfer_list(scope, &transfers, &port)?;
        // The peer is gone; the message is dropped.
        if port.peer().is_none() {
            return Ok(None);
        }
        let Some(message) = message_port::serialize(scope, args.get(0), &transfers, &port)? else {
            return Ok(None);
        };
        if !port.post(PortEvent::Message(message)) {
            return Err(BinderError::error("Failed to post message"));
        }
        Ok(None)
    });
}

fn js_close<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<MessagePortWrap>(scope, &args)?;
        this.close()?;
        Ok(None)
    });
}

/// Script-facing handle of a worker thread. Holds the parent side of the
/// worker's port.
pub struct WorkerWrap {
    port: Rc<MessagePortWrap>,
}

impl WorkerWrap {
    pub fn port(&self) -> &Rc<MessagePortWrap> {
        &self.port
    }
}

impl ExportableObject for WorkerWrap {
    fn descriptor(&self) -> &'static Descriptor {
        &WORKER
    }
}

fn js_make_from_url<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments, expecting 1"));
        }
        let url = binder::string_arg(scope, args.get(0), "url")?;
        let runtime = RuntimeState::from_isolate(scope)
            .ok_or_else(|| BinderError::error("No runtime is associated with the current isolate"))?;

        let (parent_port, child_port) = MessagePort::make_connected_pair();
        let (port, port_object) = MessagePortWrap::new_object(scope, parent_port)?;
        if let Err(err) = worker::spawn(&runtime, &url, child_port) {
            let _ = port.close();
            return Err(BinderError::error(format!("Failed to create thread: {err}")));
        }
        let object = wrap_object(scope, Rc::new(WorkerWrap { port }))?;

        let key = new_string(scope, "port");
        object.define_own_property(scope, key.into(), port_object.into(), v8::PropertyAttribute::READ_ONLY);
        Ok(Some(object.into()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::base::tests::{make_runtime, Fixture};
    use crate::runtime::RuntimeOptions;

    fn run_module(tag: &str, source: &str) -> crate::runtime::RuntimeBase {
        let fixture = Fixture::new(tag);
        let path = fixture.write("main.mjs", source);
        let runtime = make_runtime(RuntimeOptions::default());
        runtime.evaluate_module(&path).unwrap();
        runtime.spin_run().unwrap();
        runtime
    }

    #[test]
    fn test_message_and_array_buffer_delivery() {
        let runtime = run_module(
            "ports-delivery",
            r#"
            import { MessagePort } from 'workers';
            const [a, b] = MessagePort.MakeConnectedPair();
            globalThis.received = [];
            b.addListener('Message', (msg) => {
                received.push(msg);
                if (received.length === 2) b.close();
            });
            a.postMessage({ x: 1 });
            const buf = new Uint8Array([1, 2, 3, 4, 5, 6, 7, 8]).buffer;
            a.postMessage(buf, [buf]);
            globalThis.sourceLength = buf.byteLength;
            "#,
        );
        let result = runtime
            .execute_script(
                "check.js",
                "JSON.stringify([received[0].x, Array.from(new Uint8Array(received[1])), sourceLength])",
            )
            .unwrap();
        assert_eq!(result, "[1,[1,2,3,4,5,6,7,8],0]");
    }

    #[test]
    fn test_port_errors() {
        let runtime = run_module(
            "ports-errors",
            r#"
            import { MessagePort } from 'workers';
            const [a, b] = MessagePort.MakeConnectedPair();
            const errors = [];
            const capture = (f) => { try { f(); errors.push('ok'); } catch (e) { errors.push(e.message); } };
            capture(() => a.postMessage(a, [a]));
            capture(() => a.postMessage(b, [b]));
            capture(() => a.postMessage());
            capture(() => a.postMessage(1, 2));
            capture(() => a.postMessage(1));
            a.close();
            capture(() => a.close());
            capture(() => a.postMessage(1));
            capture(() => a.addListener('Message', () => {}));
            capture(() => b.addListener('Unknown', () => {}));
            b.close();
            globalThis.errors = errors;
            "#,
        );
        let result = runtime.execute_script("check.js", "errors.join('|')").unwrap();
        let errors: Vec<&str> = result.split('|').collect();
        assert_eq!(
            errors,
            [
                "Transfer list contains the source port",
                "Transfer list contains the destination port",
                "Invalid number of arguments, expecting 1 or 2",
                "Argument `transfers` must be an array of values",
                "ok",
                "Message port has been closed or transferred",
                "Message port has been closed or transferred",
                "Event emitter has been disposed (closed)",
                "Undefined event name",
            ]
        );
    }

    #[test]
    fn test_post_after_peer_closed() {
        let runtime = run_module(
            "ports-peer-closed",
            r#"
            import { MessagePort } from 'workers';
            const [a, b] = MessagePort.MakeConnectedPair();
            const [c, d] = MessagePort.MakeConnectedPair();
            b.close();
            const outcomes = [];
            const capture = (f) => { try { f(); outcomes.push('ok'); } catch (e) { outcomes.push(e.message); } };
            capture(() => a.postMessage('dropped'));
            capture(() => a.postMessage(a, [a]));
            const buf = new ArrayBuffer(8);
            capture(() => a.postMessage(buf, [buf, buf]));
            capture(() => a.postMessage(buf, [buf]));
            capture(() => a.postMessage(c, [c]));
            outcomes.push(String(buf.byteLength));
            a.close();
            c.close();
            d.close();
            globalThis.outcomes = outcomes;
            "#,
        );
        let result = runtime.execute_script("check.js", "outcomes.join('|')").unwrap();
        let outcomes: Vec<&str> = result.split('|').collect();
        assert_eq!(
            outcomes,
            [
                "ok",
                "Transfer list contains the source port",
                "Duplicate ArrayBuffer in transfer list",
                "ok",
                "ok",
                // Nothing is detached when the message is dropped.
                "8",
            ]
        );
    }

    #[test]
    fn test_port_transfer() {
        let runtime = run_module(
            "ports-transfer",
            r#"
            import { MessagePort } from 'workers';
            const [a, b] = MessagePort.MakeConnectedPair();
            const [c, d] = MessagePort.MakeConnectedPair();
            b.addOnceListener('Message', (port) => {
                globalThis.isPort = port instanceof MessagePort;
                port.addOnceListener('Message', (text) => {
                    globalThis.relayed = text;
                    port.close();
                });
                d.postMessage('through');
                b.close();
            });
            a.postMessage(c, [c]);
            try { c.close(); } catch (e) { globalThis.sourceClosed = e.message; }
            "#,
        );
        let result = runtime
            .execute_script("check.js", "JSON.stringify([isPort, relayed, sourceClosed])")
            .unwrap();
        assert_eq!(
            result,
            r#"[true,"through","Message port has been closed or transferred"]"#
        );
    }

    #[test]
    fn test_unclonable_message_throws() {
        let runtime = run_module(
            "ports-unclonable",
            r#"
            import { MessagePort } from 'workers';
            const [a, b] = MessagePort.MakeConnectedPair();
            try { a.postMessage({ f() {} }); } catch (e) { globalThis.thrown = e instanceof Error; }
            a.close();
            b.close();
            "#,
        );
        assert_eq!(runtime.execute_script("check.js", "thrown").unwrap(), "true");
    }
}
