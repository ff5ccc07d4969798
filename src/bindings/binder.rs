//! Glue between native objects and engine handles.
//!
//! Host instances carry [`INTERNAL_FIELD_COUNT`] internal fields: the first
//! holds the object's id in the per-isolate [`ObjectRegistry`], the second a
//! fixed tag. The registry keeps the native object alive until the engine
//! collects its wrapper or the runtime is disposed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::trace;

use crate::bindings::exportable::{downcast, ExportableObject};
use crate::error::{BinderError, ExceptionKind};

/// Number of internal fields on every host instance.
pub const INTERNAL_FIELD_COUNT: usize = 2;

const HOST_OBJECT_TAG: f64 = 0x636f636f as f64;

struct HostEntry {
    object: Rc<dyn ExportableObject>,
    _wrapper: v8::Weak<v8::Object>,
}

/// Host objects and class templates known to one isolate.
pub struct ObjectRegistry {
    next_id: Cell<u64>,
    objects: RefCell<HashMap<u64, HostEntry>>,
    collected: RefCell<Vec<HostEntry>>,
    classes: RefCell<HashMap<&'static str, v8::Global<v8::FunctionTemplate>>>,
}

impl ObjectRegistry {
    /// Attach a registry to `isolate`, or return the one already attached.
    pub fn install(isolate: &mut v8::Isolate) -> Rc<ObjectRegistry> {
        if let Some(registry) = isolate.get_slot::<Rc<ObjectRegistry>>() {
            return registry.clone();
        }
        let registry = Rc::new(ObjectRegistry {
            next_id: Cell::new(1),
            objects: RefCell::new(HashMap::new()),
            collected: RefCell::new(Vec::new()),
            classes: RefCell::new(HashMap::new()),
        });
        isolate.set_slot(registry.clone());
        registry
    }

    pub fn get(isolate: &v8::Isolate) -> Option<Rc<ObjectRegistry>> {
        isolate.get_slot::<Rc<ObjectRegistry>>().cloned()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.borrow().len()
    }

    fn lookup(&self, id: u64) -> Option<Rc<dyn ExportableObject>> {
        self.objects.borrow().get(&id).map(|entry| entry.object.clone())
    }

    fn on_collected(&self, id: u64) {
        // Entries are released outside of the GC callback.
        if let Some(entry) = self.objects.borrow_mut().remove(&id) {
            self.collected.borrow_mut().push(entry);
        }
    }

    fn sweep(&self) {
        let collected = std::mem::take(&mut *self.collected.borrow_mut());
        if !collected.is_empty() {
            trace!(count = collected.len(), "Releasing collected host objects");
        }
        drop(collected);
    }

    /// Dispose and forget every host object and class template.
    pub fn delete_all(&self) {
        self.sweep();
        let objects: Vec<HostEntry> = self.objects.borrow_mut().drain().map(|(_, e)| e).collect();
        for entry in &objects {
            entry.object.dispose();
        }
        drop(objects);
        self.classes.borrow_mut().clear();
    }

    fn class(&self, name: &str) -> Option<v8::Global<v8::FunctionTemplate>> {
        self.classes.borrow().get(name).cloned()
    }
}

/// Builds the function template of a host class. Calling the resulting
/// constructor from JavaScript throws; instances only come from native code
/// through [`wrap_object`].
pub struct ClassBuilder<'s> {
    name: &'static str,
    template: v8::Local<'s, v8::FunctionTemplate>,
}

impl<'s> ClassBuilder<'s> {
    pub fn new(scope: &mut v8::HandleScope<'s>, name: &'static str) -> Self {
        let template = v8::FunctionTemplate::new(scope, illegal_constructor);
        template.set_class_name(new_string(scope, name));
        template
            .instance_template(scope)
            .set_internal_field_count(INTERNAL_FIELD_COUNT);
        Self { name, template }
    }

    pub fn method(
        self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
        callback: impl v8::MapFnTo<v8::FunctionCallback>,
    ) -> Self {
        let function = v8::FunctionTemplate::new(scope, callback);
        let key = new_string(scope, name);
        self.template
            .prototype_template(scope)
            .set(key.into(), function.into());
        self
    }

    pub fn static_method(
        self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
        callback: impl v8::MapFnTo<v8::FunctionCallback>,
    ) -> Self {
        let function = v8::FunctionTemplate::new(scope, callback);
        let key = new_string(scope, name);
        self.template.set(key.into(), function.into());
        self
    }

    /// Finish the class and remember its template in the isolate's registry.
    pub fn register(self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::FunctionTemplate> {
        let registry = ObjectRegistry::install(scope);
        let global = v8::Global::new(scope, self.template);
        registry.classes.borrow_mut().insert(self.name, global);
        self.template
    }
}

fn illegal_constructor(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    throw(scope, &BinderError::type_error("Illegal constructor"));
}

/// The registered template of `class_name`, if any.
pub fn class_template<'s>(
    scope: &mut v8::HandleScope<'s>,
    class_name: &str,
) -> Option<v8::Local<'s, v8::FunctionTemplate>> {
    let registry = ObjectRegistry::get(scope)?;
    let global = registry.class(class_name)?;
    Some(v8::Local::new(scope, global))
}

/// The constructor function of a registered class.
pub fn class_constructor<'s>(
    scope: &mut v8::HandleScope<'s>,
    class_name: &str,
) -> Result<v8::Local<'s, v8::Function>, BinderError> {
    let template = class_template(scope, class_name)
        .ok_or_else(|| BinderError::reference_error(format!("Class {class_name} has not been registered")))?;
    template
        .get_function(scope)
        .ok_or_else(|| BinderError::error(format!("Failed to instantiate class {class_name}")))
}

/// Create the JavaScript wrapper of `object`. Its class must have been
/// registered with a [`ClassBuilder`].
pub fn wrap_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: Rc<dyn ExportableObject>,
) -> Result<v8::Local<'s, v8::Object>, BinderError> {
    let descriptor = object.descriptor();
    let registry = ObjectRegistry::install(scope);
    registry.sweep();

    let template = class_template(scope, descriptor.class_name).ok_or_else(|| {
        BinderError::reference_error(format!("Class {} has not been registered", descriptor.class_name))
    })?;
    let instance = template
        .instance_template(scope)
        .new_instance(scope)
        .ok_or_else(|| BinderError::error(format!("Failed to create {} instance", descriptor.class_name)))?;

    let id = registry.next_id.get();
    registry.next_id.set(id + 1);

    let id_value: v8::Local<v8::Value> = v8::Number::new(scope, id as f64).into();
    let tag_value: v8::Local<v8::Value> = v8::Number::new(scope, HOST_OBJECT_TAG).into();
    instance.set_internal_field(0, id_value.into());
    instance.set_internal_field(1, tag_value.into());

    let wrapper = v8::Weak::with_finalizer(
        scope,
        instance,
        Box::new(move |isolate: &mut v8::Isolate| {
            if let Some(registry) = ObjectRegistry::get(isolate) {
                registry.on_collected(id);
            }
        }),
    );
    registry.objects.borrow_mut().insert(
        id,
        HostEntry {
            object,
            _wrapper: wrapper,
        },
    );
    Ok(instance)
}

/// Whether `object` looks like a host instance created by [`wrap_object`].
pub fn is_host_object(scope: &mut v8::HandleScope, object: v8::Local<v8::Object>) -> bool {
    host_object_id(scope, object).is_some()
}

fn host_object_id(scope: &mut v8::HandleScope, object: v8::Local<v8::Object>) -> Option<u64> {
    if object.internal_field_count() != INTERNAL_FIELD_COUNT {
        return None;
    }
    let tag = internal_number(scope, object, 1)?;
    if tag != HOST_OBJECT_TAG {
        return None;
    }
    internal_number(scope, object, 0).map(|id| id as u64)
}

fn internal_number(scope: &mut v8::HandleScope, object: v8::Local<v8::Object>, index: usize) -> Option<f64> {
    let data = object.get_internal_field(scope, index)?;
    let value = v8::Local::<v8::Value>::try_from(data).ok()?;
    value.is_number().then(|| value.number_value(scope)).flatten()
}

/// The native object behind a host instance, whatever its class.
pub fn unwrap_host_object(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
) -> Option<Rc<dyn ExportableObject>> {
    let id = host_object_id(scope, object)?;
    ObjectRegistry::get(scope)?.lookup(id)
}

/// The native `T` behind `value`, or `None` if `value` is not a host
/// instance of `T`.
pub fn unwrap_object<T: ExportableObject + 'static>(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Option<Rc<T>> {
    let object = v8::Local::<v8::Object>::try_from(value).ok()?;
    downcast::<T>(unwrap_host_object(scope, object)?)
}

/// Like [`unwrap_object`], for the receiver of a method call.
pub fn unwrap_this<T: ExportableObject + 'static>(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
) -> Result<Rc<T>, BinderError> {
    unwrap_object::<T>(scope, args.this().into())
        .ok_or_else(|| BinderError::type_error("Illegal invocation"))
}

pub fn new_string<'s>(scope: &mut v8::HandleScope<'s>, value: &str) -> v8::Local<'s, v8::String> {
    v8::String::new(scope, value).unwrap_or_else(|| v8::String::empty(scope))
}

/// Build the engine exception matching `err`'s category.
pub fn make_exception<'s>(scope: &mut v8::HandleScope<'s>, err: &BinderError) -> v8::Local<'s, v8::Value> {
    let message = new_string(scope, &err.message);
    match err.kind {
        ExceptionKind::Error => v8::Exception::error(scope, message),
        ExceptionKind::TypeError => v8::Exception::type_error(scope, message),
        ExceptionKind::RangeError => v8::Exception::range_error(scope, message),
        ExceptionKind::ReferenceError => v8::Exception::reference_error(scope, message),
        ExceptionKind::SyntaxError => v8::Exception::syntax_error(scope, message),
        ExceptionKind::WasmCompileError => wasm_exception(scope, "CompileError", message),
        ExceptionKind::WasmLinkError => wasm_exception(scope, "LinkError", message),
        ExceptionKind::WasmRuntimeError => wasm_exception(scope, "RuntimeError", message),
    }
}

fn wasm_exception<'s>(
    scope: &mut v8::HandleScope<'s>,
    constructor: &str,
    message: v8::Local<'s, v8::String>,
) -> v8::Local<'s, v8::Value> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let wasm_key = new_string(scope, "WebAssembly");
    let ctor_key = new_string(scope, constructor);
    global
        .get(scope, wasm_key.into())
        .and_then(|wasm| v8::Local::<v8::Object>::try_from(wasm).ok())
        .and_then(|wasm| wasm.get(scope, ctor_key.into()))
        .and_then(|ctor| v8::Local::<v8::Function>::try_from(ctor).ok())
        .and_then(|ctor| ctor.new_instance(scope, &[message.into()]))
        .map(Into::into)
        .unwrap_or_else(|| v8::Exception::error(scope, message))
}

pub fn throw(scope: &mut v8::HandleScope, err: &BinderError) {
    let exception = make_exception(scope, err);
    scope.throw_exception(exception);
}

/// Run a native callback body and translate its outcome at the engine
/// boundary. `Ok(Some(v))` becomes the return value, `Ok(None)` leaves it
/// untouched (and any exception already pending in the engine propagates),
/// `Err` is thrown as the matching exception.
pub fn guard<'s, F>(scope: &mut v8::HandleScope<'s>, rv: &mut v8::ReturnValue, body: F)
where
    F: FnOnce(&mut v8::HandleScope<'s>) -> Result<Option<v8::Local<'s, v8::Value>>, BinderError>,
{
    match body(scope) {
        Ok(Some(value)) => rv.set(value),
        Ok(None) => {}
        Err(err) => throw(scope, &err),
    }
}

/// Convert a string argument, failing with a `TypeError` otherwise.
pub fn string_arg(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    what: &str,
) -> Result<String, BinderError> {
    if !value.is_string() {
        return Err(BinderError::type_error(format!("Argument `{what}` must be a string")));
    }
    Ok(value.to_rust_string_lossy(scope))
}

/// Resources whose lifetime is bound to a runtime rather than to the
/// engine's garbage collector.
pub trait ExternalValueHolder {
    fn dispose(&mut self);
}

/// Per-runtime registry of [`ExternalValueHolder`]s. Everything still
/// registered is disposed when the runtime goes away.
#[derive(Default)]
pub struct ExternalValueRegistry {
    next_id: u64,
    holders: IndexMap<u64, Box<dyn ExternalValueHolder>>,
}

impl ExternalValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, holder: Box<dyn ExternalValueHolder>) -> u64 {
        self.next_id += 1;
        self.holders.insert(self.next_id, holder);
        self.next_id
    }

    pub fn unregister(&mut self, id: u64) -> Option<Box<dyn ExternalValueHolder>> {
        self.holders.shift_remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.holders.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// Dispose every holder in registration order.
    pub fn delete_all(&mut self) {
        for (_, mut holder) in self.holders.drain(..) {
            holder.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::exportable::{Descriptor, ObjectAttributes};
    use std::cell::Cell;

    static COUNTER: Descriptor = Descriptor {
        class_name: "Counter",
        attributes: ObjectAttributes::NONE,
        transfer: None,
        clone: None,
    };

    struct Counter {
        value: Cell<i32>,
        disposed: Rc<Cell<bool>>,
    }

    impl ExportableObject for Counter {
        fn descriptor(&self) -> &'static Descriptor {
            &COUNTER
        }
        fn dispose(&self) {
            self.disposed.set(true);
        }
    }

    fn counter_increment(
        scope: &mut v8::HandleScope,
        args: v8::FunctionCallbackArguments,
        mut rv: v8::ReturnValue,
    ) {
        guard(scope, &mut rv, |scope| {
            let counter = unwrap_this::<Counter>(scope, &args)?;
            counter.value.set(counter.value.get() + 1);
            Ok(Some(v8::Integer::new(scope, counter.value.get()).into()))
        });
    }

    fn counter_fail(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
        guard(scope, &mut rv, |_scope| Err(BinderError::range_error("out of range")));
    }

    fn run<'s>(scope: &mut v8::HandleScope<'s>, source: &str) -> Option<v8::Local<'s, v8::Value>> {
        let code = new_string(scope, source);
        let script = v8::Script::compile(scope, code, None)?;
        script.run(scope)
    }

    #[test]
    fn test_wrap_and_unwrap() {
        crate::runtime::initialize_platform_once(&[]);
        let isolate = &mut v8::Isolate::new(Default::default());
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);

        let template = ClassBuilder::new(scope, "Counter")
            .method(scope, "increment", counter_increment)
            .method(scope, "fail", counter_fail)
            .register(scope);
        let constructor = template.get_function(scope).unwrap();
        let key = new_string(scope, "Counter");
        context.global(scope).set(scope, key.into(), constructor.into());

        let disposed = Rc::new(Cell::new(false));
        let counter = Rc::new(Counter {
            value: Cell::new(0),
            disposed: disposed.clone(),
        });
        let wrapped = wrap_object(scope, counter.clone()).unwrap();
        let key = new_string(scope, "counter");
        context.global(scope).set(scope, key.into(), wrapped.into());

        let result = run(scope, "counter.increment(); counter.increment()").unwrap();
        assert_eq!(result.int32_value(scope), Some(2));
        assert_eq!(counter.value.get(), 2);

        let unwrapped = unwrap_object::<Counter>(scope, wrapped.into()).unwrap();
        assert!(Rc::ptr_eq(&unwrapped, &counter));

        // Plain objects are not host instances
        let plain = v8::Object::new(scope);
        assert!(!is_host_object(scope, plain));
        assert!(unwrap_object::<Counter>(scope, plain.into()).is_none());

        let caught = run(
            scope,
            "(() => { try { counter.fail(); } catch (e) { return e instanceof RangeError && e.message; } })()",
        )
        .unwrap();
        assert_eq!(caught.to_rust_string_lossy(scope), "out of range");

        let caught = run(
            scope,
            "(() => { try { new Counter(); } catch (e) { return e instanceof TypeError; } })()",
        )
        .unwrap();
        assert!(caught.is_true());

        let registry = ObjectRegistry::get(scope).unwrap();
        assert_eq!(registry.live_objects(), 1);
        registry.delete_all();
        assert!(disposed.get());
        assert_eq!(registry.live_objects(), 0);
    }

    #[test]
    fn test_exception_categories() {
        crate::runtime::initialize_platform_once(&[]);
        let isolate = &mut v8::Isolate::new(Default::default());
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);

        let err = make_exception(scope, &BinderError::new(ExceptionKind::WasmLinkError, "bad link"));
        let key = new_string(scope, "e");
        context.global(scope).set(scope, key.into(), err);
        let is_link = run(scope, "e instanceof WebAssembly.LinkError && e.message === 'bad link'").unwrap();
        assert!(is_link.is_true());

        let err = make_exception(scope, &BinderError::reference_error("missing"));
        context.global(scope).set(scope, key.into(), err);
        let is_ref = run(scope, "e instanceof ReferenceError").unwrap();
        assert!(is_ref.is_true());
    }

    #[test]
    fn test_external_value_registry() {
        struct Holder(Rc<Cell<u32>>);
        impl ExternalValueHolder for Holder {
            fn dispose(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let disposed = Rc::new(Cell::new(0));
        let mut registry = ExternalValueRegistry::new();
        let first = registry.register(Box::new(Holder(disposed.clone())));
        let second = registry.register(Box::new(Holder(disposed.clone())));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        let removed = registry.unregister(first);
        assert!(removed.is_some());
        assert!(!registry.contains(first));

        registry.delete_all();
        assert_eq!(disposed.get(), 1);
        assert!(registry.is_empty());
    }
}
