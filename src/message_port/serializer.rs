//! Structured clone through the engine's value serializer.
//!
//! Host objects are flattened in two passes. While the value graph is being
//! written only the pretest runs, so a failure leaves every object intact;
//! the real clone or transfer runs once the whole graph has been accepted.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;
use v8::{ValueDeserializerHelper, ValueSerializerHelper};

use crate::bindings::binder::{self, make_exception, new_string};
use crate::bindings::exportable::{downcast, ExportableObject, FlattenFn, FlattenedData};
use crate::bindings::workers::MessagePortWrap;
use crate::error::BinderError;
use crate::message_port::{Message, MessagePort, PortError};

fn same_object(a: &Rc<dyn ExportableObject>, b: &Rc<dyn ExportableObject>) -> bool {
    std::ptr::eq(Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ())
}

/// The port behind a host object, if it is a message port.
fn port_of(object: &Rc<dyn ExportableObject>) -> Option<Arc<MessagePort>> {
    if !object.descriptor().is_message_port() {
        return None;
    }
    downcast::<MessagePortWrap>(object.clone())?.port()
}

struct AcceptedObject {
    object: Rc<dyn ExportableObject>,
    flatten: FlattenFn,
}

#[derive(Default)]
struct SerializerState {
    transfer_objects: Vec<Rc<dyn ExportableObject>>,
    accepted: Vec<AcceptedObject>,
    shared_array_buffers: Vec<v8::SharedRef<v8::BackingStore>>,
    wasm_modules: Vec<v8::CompiledWasmModule>,
}

struct SerializerDelegate {
    state: Rc<RefCell<SerializerState>>,
}

impl SerializerDelegate {
    fn throw(&self, scope: &mut v8::HandleScope, err: BinderError) {
        let exception = make_exception(scope, &err);
        scope.throw_exception(exception);
    }

    fn accept(&self, object: Rc<dyn ExportableObject>) -> Result<u32, BinderError> {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state
            .accepted
            .iter()
            .position(|accepted| same_object(&accepted.object, &object))
        {
            return Ok(index as u32);
        }

        let in_transfer_list = state
            .transfer_objects
            .iter()
            .any(|candidate| same_object(candidate, &object));
        let flatten = object.descriptor().flatten_fn(in_transfer_list)?;
        if flatten(&object, true).is_err() {
            return Err(PortError::PretestFailed.into());
        }
        state.accepted.push(AcceptedObject { object, flatten });
        Ok((state.accepted.len() - 1) as u32)
    }
}

impl v8::ValueSerializerImpl for SerializerDelegate {
    fn throw_data_clone_error<'s>(&self, scope: &mut v8::HandleScope<'s>, message: v8::Local<'s, v8::String>) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }

    fn has_custom_host_object(&self, _isolate: &mut v8::Isolate) -> bool {
        true
    }

    fn is_host_object<'s>(&self, scope: &mut v8::HandleScope<'s>, object: v8::Local<'s, v8::Object>) -> Option<bool> {
        Some(binder::is_host_object(scope, object))
    }

    fn write_host_object<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        value_serializer: &dyn v8::ValueSerializerHelper,
    ) -> Option<bool> {
        let Some(host) = binder::unwrap_host_object(scope, object) else {
            self.throw(scope, PortError::NoDescriptor.into());
            return None;
        };
        match self.accept(host) {
            Ok(index) => {
                value_serializer.write_uint32(index);
                Some(true)
            }
            Err(err) => {
                self.throw(scope, err);
                None
            }
        }
    }

    fn get_shared_array_buffer_id<'s>(
        &self,
        _scope: &mut v8::HandleScope<'s>,
        shared_array_buffer: v8::Local<'s, v8::SharedArrayBuffer>,
    ) -> Option<u32> {
        let store = shared_array_buffer.get_backing_store();
        let mut state = self.state.borrow_mut();
        let existing = state
            .shared_array_buffers
            .iter()
            .position(|candidate| candidate.data() == store.data());
        match existing {
            Some(index) => Some(index as u32),
            None => {
                state.shared_array_buffers.push(store);
                Some((state.shared_array_buffers.len() - 1) as u32)
            }
        }
    }

    fn get_wasm_module_transfer_id(
        &self,
        _scope: &mut v8::HandleScope<'_>,
        module: v8::Local<v8::WasmModuleObject>,
    ) -> Option<u32> {
        let mut state = self.state.borrow_mut();
        state.wasm_modules.push(module.get_compiled_module());
        Some((state.wasm_modules.len() - 1) as u32)
    }
}

/// Reject a transfer list that can never be delivered through `source`.
/// Nothing in the list is detached or moved.
pub fn check_transfer_list<'s>(
    scope: &mut v8::HandleScope<'s>,
    transfers: &[v8::Local<'s, v8::Value>],
    source: &MessagePort,
) -> Result<(), PortError> {
    let mut array_buffers: Vec<v8::Local<v8::ArrayBuffer>> = Vec::new();
    for value in transfers {
        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(*value) {
            if !buffer.is_detachable() {
                return Err(PortError::NotDetachable);
            }
            if array_buffers.iter().any(|seen| seen.strict_equals(buffer.into())) {
                return Err(PortError::DuplicateArrayBuffer);
            }
            array_buffers.push(buffer);
            continue;
        }

        let Ok(object) = v8::Local::<v8::Object>::try_from(*value) else {
            continue;
        };
        let Some(port) = binder::unwrap_host_object(scope, object).and_then(|host| port_of(&host)) else {
            continue;
        };
        if port.id() == source.id() {
            return Err(PortError::SourceInTransferList);
        }
        if source.is_peer_of(&port) {
            return Err(PortError::DestinationInTransferList);
        }
    }
    Ok(())
}

/// Serialize `value` for delivery through `source`.
///
/// `Err` is a host-side failure the caller should throw. `Ok(None)` means
/// the engine has already thrown while writing the value graph and the
/// exception is pending in `scope`.
pub fn serialize<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    transfers: &[v8::Local<'s, v8::Value>],
    source: &MessagePort,
) -> Result<Option<Message>, BinderError> {
    check_transfer_list(scope, transfers, source)?;
    let state = Rc::new(RefCell::new(SerializerState::default()));
    let mut serializer = v8::ValueSerializer::new(
        scope,
        Box::new(SerializerDelegate {
            state: state.clone(),
        }),
    );

    let mut array_buffers: Vec<v8::Local<v8::ArrayBuffer>> = Vec::new();
    for value in transfers {
        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(*value) {
            serializer.transfer_array_buffer(array_buffers.len() as u32, buffer);
            array_buffers.push(buffer);
            continue;
        }

        let Ok(object) = v8::Local::<v8::Object>::try_from(*value) else {
            continue;
        };
        if let Some(host) = binder::unwrap_host_object(scope, object) {
            state.borrow_mut().transfer_objects.push(host);
        }
    }

    let context = scope.get_current_context();
    serializer.write_header();
    if serializer.write_value(context, value) != Some(true) {
        return Ok(None);
    }

    let SerializerState {
        accepted,
        shared_array_buffers,
        wasm_modules,
        ..
    } = std::mem::take(&mut *state.borrow_mut());

    let mut host_objects: Vec<Box<dyn FlattenedData>> = Vec::with_capacity(accepted.len());
    for AcceptedObject { object, flatten } in accepted {
        match flatten(&object, false)? {
            Some(flattened) => host_objects.push(flattened),
            None => return Err(PortError::PretestFailed.into()),
        }
    }

    let payload = serializer.release();
    let mut stores = Vec::with_capacity(array_buffers.len());
    for buffer in array_buffers {
        stores.push(buffer.get_backing_store());
        buffer.detach(None);
    }

    trace!(
        payload = payload.len(),
        array_buffers = stores.len(),
        host_objects = host_objects.len(),
        "Serialized message"
    );
    Ok(Some(Message {
        payload,
        array_buffers: stores,
        shared_array_buffers,
        wasm_modules,
        host_objects,
    }))
}

struct DeserializerState {
    host_objects: Vec<Option<Box<dyn FlattenedData>>>,
    rebuilt: Vec<Option<v8::Global<v8::Object>>>,
    shared_array_buffers: Vec<v8::SharedRef<v8::BackingStore>>,
    wasm_modules: Vec<v8::CompiledWasmModule>,
}

struct DeserializerDelegate {
    state: RefCell<DeserializerState>,
}

impl DeserializerDelegate {
    fn fail<'s, T>(&self, scope: &mut v8::HandleScope<'s>, message: &str) -> Option<T> {
        let message = new_string(scope, message);
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
        None
    }
}

impl v8::ValueDeserializerImpl for DeserializerDelegate {
    fn read_host_object<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        value_deserializer: &dyn v8::ValueDeserializerHelper,
    ) -> Option<v8::Local<'s, v8::Object>> {
        let mut index = 0u32;
        if !value_deserializer.read_uint32(&mut index) {
            return self.fail(scope, "Failed to read host object ID");
        }
        let index = index as usize;

        if let Some(Some(rebuilt)) = self.state.borrow().rebuilt.get(index) {
            return Some(v8::Local::new(scope, rebuilt));
        }
        let flattened = self
            .state
            .borrow_mut()
            .host_objects
            .get_mut(index)
            .and_then(Option::take);
        let Some(flattened) = flattened else {
            return self.fail(scope, "Invalid host object ID");
        };

        match flattened.deserialize(scope) {
            Ok(object) => {
                let global = v8::Global::new(scope, object);
                if let Some(slot) = self.state.borrow_mut().rebuilt.get_mut(index) {
                    *slot = Some(global);
                }
                Some(object)
            }
            Err(err) => {
                binder::throw(scope, &err);
                None
            }
        }
    }

    fn get_shared_array_buffer_from_id<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        transfer_id: u32,
    ) -> Option<v8::Local<'s, v8::SharedArrayBuffer>> {
        let store = self
            .state
            .borrow()
            .shared_array_buffers
            .get(transfer_id as usize)
            .cloned();
        match store {
            Some(store) => Some(v8::SharedArrayBuffer::with_backing_store(scope, &store)),
            None => self.fail(scope, "Invalid SharedArrayBuffer ID"),
        }
    }

    fn get_wasm_module_from_id<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        clone_id: u32,
    ) -> Option<v8::Local<'s, v8::WasmModuleObject>> {
        let state = self.state.borrow();
        let Some(module) = state.wasm_modules.get(clone_id as usize) else {
            return self.fail(scope, &PortError::InvalidWasmModule.to_string());
        };
        match v8::WasmModuleObject::from_compiled_module(scope, module) {
            Some(object) => Some(object),
            None => self.fail(scope, &PortError::InvalidWasmModule.to_string()),
        }
    }
}

/// Rebuild the value carried by `message` in the current context.
///
/// `None` means an exception is pending in `scope`. On success the
/// message's out-of-band resources are released.
pub fn deserialize<'s>(scope: &mut v8::HandleScope<'s>, message: &mut Message) -> Option<v8::Local<'s, v8::Value>> {
    let host_objects: Vec<Option<Box<dyn FlattenedData>>> =
        std::mem::take(&mut message.host_objects).into_iter().map(Some).collect();
    let rebuilt = host_objects.iter().map(|_| None).collect();
    let delegate = DeserializerDelegate {
        state: RefCell::new(DeserializerState {
            host_objects,
            rebuilt,
            shared_array_buffers: message.shared_array_buffers.clone(),
            wasm_modules: std::mem::take(&mut message.wasm_modules),
        }),
    };

    let payload = std::mem::take(&mut message.payload);
    let deserializer = v8::ValueDeserializer::new(scope, Box::new(delegate), &payload);
    for (index, store) in message.array_buffers.iter().enumerate() {
        let buffer = v8::ArrayBuffer::with_backing_store(scope, store);
        deserializer.transfer_array_buffer(index as u32, buffer);
    }

    let context = scope.get_current_context();
    if deserializer.read_header(context) != Some(true) {
        return None;
    }
    let value = deserializer.read_value(context)?;
    drop(deserializer);
    message.clear();
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::exportable::{Descriptor, ObjectAttributes};
    use crate::bindings::ClassBuilder;
    use crate::core::{Async, EventLoop};
    use std::cell::Cell;

    static TOKEN: Descriptor = Descriptor {
        class_name: "Token",
        attributes: ObjectAttributes::TRANSFERABLE.union(ObjectAttributes::CLONEABLE),
        transfer: Some(transfer_token),
        clone: Some(clone_token),
    };

    struct Token {
        value: i32,
        moved: Cell<bool>,
    }

    impl ExportableObject for Token {
        fn descriptor(&self) -> &'static Descriptor {
            &TOKEN
        }
    }

    struct FlatToken {
        value: i32,
        transferred: bool,
    }

    impl FlattenedData for FlatToken {
        fn deserialize<'s>(
            self: Box<Self>,
            scope: &mut v8::HandleScope<'s>,
        ) -> Result<v8::Local<'s, v8::Object>, BinderError> {
            let object = binder::wrap_object(
                scope,
                Rc::new(Token {
                    value: self.value,
                    moved: Cell::new(false),
                }),
            )?;
            let key = new_string(scope, "transferred");
            let flag = v8::Boolean::new(scope, self.transferred);
            object.set(scope, key.into(), flag.into());
            Ok(object)
        }
    }

    fn flatten_token(
        object: &Rc<dyn ExportableObject>,
        pretest: bool,
        transfer: bool,
    ) -> Result<Option<Box<dyn FlattenedData>>, BinderError> {
        let token = downcast::<Token>(object.clone()).ok_or_else(|| BinderError::error("not a token"))?;
        if token.moved.get() {
            return Err(BinderError::error("token moved"));
        }
        if pretest {
            return Ok(None);
        }
        if transfer {
            token.moved.set(true);
        }
        Ok(Some(Box::new(FlatToken {
            value: token.value,
            transferred: transfer,
        })))
    }

    fn transfer_token(
        object: &Rc<dyn ExportableObject>,
        pretest: bool,
    ) -> Result<Option<Box<dyn FlattenedData>>, BinderError> {
        flatten_token(object, pretest, true)
    }

    fn clone_token(
        object: &Rc<dyn ExportableObject>,
        pretest: bool,
    ) -> Result<Option<Box<dyn FlattenedData>>, BinderError> {
        flatten_token(object, pretest, false)
    }

    fn run<'s>(scope: &mut v8::HandleScope<'s>, source: &str) -> v8::Local<'s, v8::Value> {
        let code = new_string(scope, source);
        let script = v8::Script::compile(scope, code, None).unwrap();
        script.run(scope).unwrap()
    }

    fn set_global(scope: &mut v8::HandleScope, name: &str, value: v8::Local<v8::Value>) {
        let context = scope.get_current_context();
        let key = new_string(scope, name);
        context.global(scope).set(scope, key.into(), value);
    }

    fn with_ports(test: impl FnOnce(&mut v8::HandleScope, &Arc<MessagePort>)) {
        crate::runtime::initialize_platform_once(&[]);
        let lp = EventLoop::new().unwrap();
        let (source, _destination) = MessagePort::make_connected_pair();
        let notifier = Async::new(&lp, || {});
        source.attach(notifier.sender());

        let isolate = &mut v8::Isolate::new(Default::default());
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);
        ClassBuilder::new(scope, "Token").register(scope);
        test(scope, &source);

        binder::ObjectRegistry::get(scope).unwrap().delete_all();
        notifier.close();
        lp.run();
    }

    #[test]
    fn test_plain_data_survives() {
        with_ports(|scope, source| {
            let value = run(scope, "({ x: 1, list: [1, 'two', { three: 3 }], when: new Date(0), big: 10n })");
            let mut message = serialize(scope, value, &[], source).unwrap().unwrap();
            assert!(message.payload_len() > 0);

            let copy = deserialize(scope, &mut message).unwrap();
            assert_eq!(message.payload_len(), 0);
            set_global(scope, "copy", copy);
            let check = run(
                scope,
                "copy.x === 1 && copy.list[1] === 'two' && copy.list[2].three === 3 \
                 && copy.when.getTime() === 0 && copy.big === 10n",
            );
            assert!(check.is_true());
        });
    }

    #[test]
    fn test_transferred_array_buffer_is_detached() {
        with_ports(|scope, source| {
            let buffer = run(scope, "globalThis.buf = new Uint8Array([1, 2, 3, 4, 5, 6, 7, 8]).buffer; buf");
            let mut message = serialize(scope, buffer, &[buffer], source).unwrap().unwrap();
            assert!(run(scope, "buf.byteLength === 0").is_true());

            let received = deserialize(scope, &mut message).unwrap();
            set_global(scope, "received", received);
            let check = run(scope, "Array.from(new Uint8Array(received)).join(',')");
            assert_eq!(check.to_rust_string_lossy(scope), "1,2,3,4,5,6,7,8");
        });
    }

    #[test]
    fn test_transfer_list_errors() {
        with_ports(|scope, source| {
            let buffer = run(scope, "new ArrayBuffer(4)");
            let err = serialize(scope, buffer, &[buffer, buffer], source).unwrap_err();
            assert_eq!(err.message, "Duplicate ArrayBuffer in transfer list");
            // The failed post leaves the buffer untouched
            set_global(scope, "kept", buffer);
            assert!(run(scope, "kept.byteLength === 4").is_true());
        });
    }

    #[test]
    fn test_wasm_module_shared_and_missing_id_throws() {
        with_ports(|scope, source| {
            let module = run(scope, "new WebAssembly.Module(new Uint8Array([0, 97, 115, 109, 1, 0, 0, 0]))");
            let mut message = serialize(scope, module, &[], source).unwrap().unwrap();
            let mut stripped = serialize(scope, module, &[], source).unwrap().unwrap();
            assert_eq!(message.wasm_modules.len(), 1);

            let copy = deserialize(scope, &mut message).unwrap();
            set_global(scope, "copy", copy);
            assert!(run(scope, "copy instanceof WebAssembly.Module").is_true());

            stripped.wasm_modules.clear();
            let tc = &mut v8::TryCatch::new(scope);
            assert!(deserialize(tc, &mut stripped).is_none());
            let exception = tc.exception().unwrap();
            assert_eq!(exception.to_rust_string_lossy(tc), "Error: Invalid WebAssembly module ID");
        });
    }

    #[test]
    fn test_transfer_list_checked_without_side_effects() {
        with_ports(|scope, source| {
            let fixed = run(scope, "new WebAssembly.Memory({ initial: 1 }).buffer");
            assert_eq!(
                check_transfer_list(scope, &[fixed], source).unwrap_err(),
                PortError::NotDetachable
            );
            let buffer = run(scope, "globalThis.buf = new ArrayBuffer(8); buf");
            check_transfer_list(scope, &[buffer], source).unwrap();
            assert!(run(scope, "buf.byteLength === 8").is_true());
        });
    }

    #[test]
    fn test_function_is_not_cloneable() {
        with_ports(|scope, source| {
            let value = run(scope, "({ f() {} })");
            let tc = &mut v8::TryCatch::new(scope);
            assert!(serialize(tc, value, &[], source).unwrap().is_none());
            assert!(tc.has_caught());
        });
    }

    #[test]
    fn test_host_object_clone_and_transfer() {
        with_ports(|scope, source| {
            let token = Rc::new(Token {
                value: 7,
                moved: Cell::new(false),
            });
            let wrapped = binder::wrap_object(scope, token.clone()).unwrap();
            set_global(scope, "token", wrapped.into());

            // Cloning leaves the source usable; the same object twice is flattened once
            let value = run(scope, "[token, token]");
            let mut message = serialize(scope, value, &[], source).unwrap().unwrap();
            assert_eq!(message.host_objects.len(), 1);
            assert!(!token.moved.get());
            let copy = deserialize(scope, &mut message).unwrap();
            set_global(scope, "copy", copy);
            assert!(run(scope, "copy[0] === copy[1] && copy[0].transferred === false").is_true());

            // Transferring consumes it
            let mut message = serialize(scope, wrapped.into(), &[wrapped.into()], source)
                .unwrap()
                .unwrap();
            assert!(token.moved.get());
            let moved = deserialize(scope, &mut message).unwrap();
            set_global(scope, "moved", moved);
            assert!(run(scope, "moved.transferred === true").is_true());

            // Further attempts fail in the pretest
            let tc = &mut v8::TryCatch::new(scope);
            assert!(serialize(tc, wrapped.into(), &[], source).unwrap().is_none());
            let exception = tc.exception().unwrap();
            let text = exception.to_rust_string_lossy(tc);
            assert_eq!(
                text,
                "Error: Object cannot be cloned or transferred. Maybe it has been transferred to other contexts."
            );
        });
    }
}
