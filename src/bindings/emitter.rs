//! Named-event registry shared by host classes that emit events.
//!
//! Events must be declared before listeners can be attached. An event may
//! carry a pair of hooks: one invoked when its first listener arrives, and
//! one invoked with the id returned by the first when the last listener
//! leaves. Host classes use them to subscribe to and unsubscribe from an
//! upstream source lazily.
//!
//! Listeners removed while the event is being emitted are only marked, and
//! erased once the outermost emission finishes.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bindings::binder::{self, unwrap_this};
use crate::bindings::exportable::ExportableObject;
use crate::error::BinderError;

type FirstListenerHook = Box<dyn Fn() -> u64>;
type LastListenerGoneHook = Box<dyn Fn(u64)>;

struct Listener {
    func: v8::Global<v8::Function>,
    once: bool,
    removing: bool,
}

struct EventData {
    listeners: Vec<Listener>,
    iterating: u32,
    on_first: Option<Rc<FirstListenerHook>>,
    on_last_gone: Option<Rc<LastListenerGoneHook>>,
    subscription: Option<u64>,
}

impl EventData {
    fn active_count(&self) -> usize {
        self.listeners.iter().filter(|l| !l.removing).count()
    }
}

#[derive(Default)]
struct EmitterInner {
    events: IndexMap<String, EventData>,
    disposed: bool,
}

#[derive(Default)]
pub struct EventEmitter {
    inner: RefCell<EmitterInner>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_event(&self, name: &str) {
        self.define_event_with_hooks(name, None, None);
    }

    pub fn define_event_with_hooks(
        &self,
        name: &str,
        on_first: Option<FirstListenerHook>,
        on_last_gone: Option<LastListenerGoneHook>,
    ) {
        self.inner.borrow_mut().events.insert(
            name.to_string(),
            EventData {
                listeners: Vec::new(),
                iterating: 0,
                on_first: on_first.map(Rc::new),
                on_last_gone: on_last_gone.map(Rc::new),
                subscription: None,
            },
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.borrow().disposed
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .borrow()
            .events
            .get(name)
            .map(EventData::active_count)
            .unwrap_or(0)
    }

    pub fn add_listener(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        func: v8::Local<v8::Function>,
    ) -> Result<(), BinderError> {
        self.insert_listener(scope, name, func, false)
    }

    pub fn add_once_listener(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        func: v8::Local<v8::Function>,
    ) -> Result<(), BinderError> {
        self.insert_listener(scope, name, func, true)
    }

    fn insert_listener(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        func: v8::Local<v8::Function>,
        once: bool,
    ) -> Result<(), BinderError> {
        let on_first = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(disposed_error());
            }
            let event = inner
                .events
                .get_mut(name)
                .ok_or_else(|| BinderError::error("Undefined event name"))?;
            let first = event.active_count() == 0 && event.subscription.is_none();
            event.listeners.push(Listener {
                func: v8::Global::new(scope, func),
                once,
                removing: false,
            });
            if first {
                event.on_first.clone()
            } else {
                None
            }
        };

        if let Some(hook) = on_first {
            let id = hook();
            if let Some(event) = self.inner.borrow_mut().events.get_mut(name) {
                event.subscription = Some(id);
            }
        }
        Ok(())
    }

    /// Remove the first listener registered as `func`. Returns whether one
    /// was found.
    pub fn remove_listener(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        func: v8::Local<v8::Function>,
    ) -> Result<bool, BinderError> {
        let found = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(disposed_error());
            }
            let event = inner
                .events
                .get_mut(name)
                .ok_or_else(|| BinderError::error("Undefined event name"))?;

            let position = event.listeners.iter().position(|listener| {
                !listener.removing && v8::Local::new(scope, &listener.func).strict_equals(func.into())
            });
            match position {
                Some(index) if event.iterating > 0 => {
                    event.listeners[index].removing = true;
                    true
                }
                Some(index) => {
                    event.listeners.remove(index);
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify_if_last_gone(name);
        }
        Ok(found)
    }

    pub fn remove_all_listeners(&self, name: &str) -> Result<(), BinderError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(disposed_error());
            }
            let event = inner
                .events
                .get_mut(name)
                .ok_or_else(|| BinderError::error("Undefined event name"))?;
            if event.iterating > 0 {
                event.listeners.iter_mut().for_each(|l| l.removing = true);
            } else {
                event.listeners.clear();
            }
        }
        self.notify_if_last_gone(name);
        Ok(())
    }

    fn notify_if_last_gone(&self, name: &str) {
        let hook = {
            let mut inner = self.inner.borrow_mut();
            let Some(event) = inner.events.get_mut(name) else {
                return;
            };
            if event.active_count() > 0 {
                return;
            }
            match event.subscription.take() {
                Some(id) => event.on_last_gone.clone().map(|hook| (hook, id)),
                None => None,
            }
        };
        if let Some((hook, id)) = hook {
            hook(id);
        }
    }

    /// Call every listener of `name` with `args`. Exceptions thrown by a
    /// listener are reported as uncaught and do not stop the iteration.
    pub fn emit(
        &self,
        scope: &mut v8::HandleScope,
        name: &str,
        args: &[v8::Local<v8::Value>],
    ) -> Result<(), BinderError> {
        let count = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return Err(disposed_error());
            }
            let event = inner
                .events
                .get_mut(name)
                .ok_or_else(|| BinderError::error("Undefined event name"))?;
            event.iterating += 1;
            event.listeners.len()
        };

        for index in 0..count {
            let func = {
                let mut inner = self.inner.borrow_mut();
                let Some(listener) = inner
                    .events
                    .get_mut(name)
                    .and_then(|event| event.listeners.get_mut(index))
                else {
                    break;
                };
                if listener.removing {
                    continue;
                }
                if listener.once {
                    listener.removing = true;
                }
                listener.func.clone()
            };

            let func = v8::Local::new(scope, func);
            let tc = &mut v8::TryCatch::new(scope);
            let recv = v8::undefined(tc).into();
            if func.call(tc, recv, args).is_none() {
                crate::runtime::guard::report_caught_exception(tc);
            }
        }

        let erased_once = {
            let mut inner = self.inner.borrow_mut();
            match inner.events.get_mut(name) {
                Some(event) => {
                    event.iterating -= 1;
                    if event.iterating == 0 {
                        event.listeners.retain(|listener| !listener.removing);
                    }
                    true
                }
                None => false,
            }
        };
        if erased_once {
            self.notify_if_last_gone(name);
        }
        Ok(())
    }

    /// Drop every listener and refuse further use. Active subscriptions are
    /// cancelled through their hooks.
    pub fn dispose(&self) {
        let hooks: Vec<(Rc<LastListenerGoneHook>, u64)> = {
            let mut inner = self.inner.borrow_mut();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner
                .events
                .values_mut()
                .filter_map(|event| {
                    event.listeners.clear();
                    let id = event.subscription.take()?;
                    event.on_last_gone.clone().map(|hook| (hook, id))
                })
                .collect()
        };
        for (hook, id) in hooks {
            hook(id);
        }
    }
}

fn disposed_error() -> BinderError {
    BinderError::error("Event emitter has been disposed (closed)")
}

/// Host classes that expose an [`EventEmitter`] to scripts.
pub trait HasEmitter: ExportableObject {
    fn emitter(&self) -> &EventEmitter;
}

fn event_and_func<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments<'s>,
) -> Result<(String, v8::Local<'s, v8::Function>), BinderError> {
    if args.length() != 2 {
        return Err(BinderError::error("Invalid number of arguments, expecting 2"));
    }
    let name = binder::string_arg(scope, args.get(0), "name")?;
    let func = v8::Local::<v8::Function>::try_from(args.get(1))
        .map_err(|_| BinderError::type_error("Argument `func` must be a Function"))?;
    Ok((name, func))
}

pub fn js_add_listener<'s, T: HasEmitter + 'static>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<T>(scope, &args)?;
        let (name, func) = event_and_func(scope, &args)?;
        this.emitter().add_listener(scope, &name, func)?;
        Ok(Some(args.this().into()))
    });
}

pub fn js_add_once_listener<'s, T: HasEmitter + 'static>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<T>(scope, &args)?;
        let (name, func) = event_and_func(scope, &args)?;
        this.emitter().add_once_listener(scope, &name, func)?;
        Ok(Some(args.this().into()))
    });
}

pub fn js_remove_listener<'s, T: HasEmitter + 'static>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<T>(scope, &args)?;
        let (name, func) = event_and_func(scope, &args)?;
        let removed = this.emitter().remove_listener(scope, &name, func)?;
        Ok(Some(v8::Boolean::new(scope, removed).into()))
    });
}

pub fn js_remove_all_listeners<'s, T: HasEmitter + 'static>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    binder::guard(scope, &mut rv, |scope| {
        let this = unwrap_this::<T>(scope, &args)?;
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments, expecting 1"));
        }
        let name = binder::string_arg(scope, args.get(0), "name")?;
        this.emitter().remove_all_listeners(&name)?;
        Ok(None)
    });
}

/// Add the listener methods of [`EventEmitter`] to a host class.
pub fn install_methods<'s, T: HasEmitter + 'static>(
    builder: binder::ClassBuilder<'s>,
    scope: &mut v8::HandleScope<'s>,
) -> binder::ClassBuilder<'s> {
    builder
        .method(scope, "addListener", js_add_listener::<T>)
        .method(scope, "addOnceListener", js_add_once_listener::<T>)
        .method(scope, "removeListener", js_remove_listener::<T>)
        .method(scope, "removeAllListeners", js_remove_all_listeners::<T>)
}
