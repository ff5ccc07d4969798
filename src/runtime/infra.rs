//! Globals every runtime installs before its bootstrap script: `global`,
//! `__runtime__`, timers, a monotonic counter and the native log hook used
//! by `console`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::bindings::binder::{self, new_string, string_arg};
use crate::bindings::ExternalValueHolder;
use crate::core::{KeepInLoop, Timer};
use crate::error::BinderError;
use crate::runtime::base::RuntimeState;
use crate::runtime::guard;

pub const IMPLEMENTATION_NAME: &str = "Cocoa";

struct TimerEntry {
    timer: Rc<Timer>,
    holder: u64,
}

/// Live timers of one isolate, keyed by the id handed to scripts.
struct TimerTable {
    next_id: Cell<u32>,
    timers: RefCell<HashMap<u32, TimerEntry>>,
    started: Instant,
}

impl TimerTable {
    fn get(isolate: &v8::Isolate) -> Option<Rc<TimerTable>> {
        isolate.get_slot::<Rc<TimerTable>>().cloned()
    }

    fn allocate_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.checked_add(1).unwrap_or(1));
        id
    }

    /// Stop and close timer `id`. Returns `false` for unknown ids.
    fn clear(&self, runtime: &RuntimeState, id: u32) -> bool {
        let Some(entry) = self.timers.borrow_mut().remove(&id) else {
            return false;
        };
        runtime.unregister_external_value(entry.holder);
        entry.timer.stop();
        entry.timer.close();
        true
    }
}

/// Closes a timer that outlived its runtime.
struct TimerHolder {
    timer: Rc<Timer>,
}

impl ExternalValueHolder for TimerHolder {
    fn dispose(&mut self) {
        self.timer.stop();
        self.timer.close();
    }
}

/// Install the infrastructure globals on `global`.
pub fn install<'s>(
    scope: &mut v8::HandleScope<'s>,
    global: v8::Local<'s, v8::Object>,
    runtime: &Rc<RuntimeState>,
) -> Result<(), BinderError> {
    scope.set_slot(Rc::new(TimerTable {
        next_id: Cell::new(1),
        timers: RefCell::new(HashMap::new()),
        started: Instant::now(),
    }));

    let getter = v8::Function::new(scope, global_getter)
        .ok_or_else(|| BinderError::error("Failed to create the global getter"))?;
    let setter = v8::Function::new(scope, global_setter)
        .ok_or_else(|| BinderError::error("Failed to create the global setter"))?;
    let descriptor = v8::PropertyDescriptor::new_from_get_set(getter.into(), setter.into());
    let key = new_string(scope, "global");
    global
        .define_property(scope, key.into(), &descriptor)
        .ok_or_else(|| BinderError::error("Failed to define `global`"))?;

    let info = v8::Object::new(scope);
    let fields = [
        ("version", env!("CARGO_PKG_VERSION")),
        ("implementation", IMPLEMENTATION_NAME),
        ("platform", std::env::consts::OS),
    ];
    for (key, value) in fields {
        let key = new_string(scope, key);
        let value = new_string(scope, value);
        info.set(scope, key.into(), value.into());
    }
    let key = new_string(scope, "__runtime__");
    global.set(scope, key.into(), info.into());

    set_function(scope, global, "setTimeout", set_timeout)?;
    set_function(scope, global, "setInterval", set_interval)?;
    set_function(scope, global, "clearTimeout", clear_timer)?;
    set_function(scope, global, "clearInterval", clear_timer)?;
    set_function(scope, global, "getMillisecondTimeCounter", millisecond_time_counter)?;
    set_function(scope, global, "__cocoa_log__", native_log)?;
    set_function(scope, global, "__cocoa_engine_wait__", engine_wait)?;

    trace!(runtime = %runtime.id(), "Installed infrastructure globals");
    Ok(())
}

fn set_function(
    scope: &mut v8::HandleScope,
    target: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<(), BinderError> {
    let function =
        v8::Function::new(scope, callback).ok_or_else(|| BinderError::error(format!("Failed to create {name}")))?;
    let key = new_string(scope, name);
    target.set(scope, key.into(), function.into());
    Ok(())
}

fn global_getter(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let global = scope.get_current_context().global(scope);
    rv.set(global.into());
}

fn global_setter(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    binder::throw(scope, &BinderError::error("Reassigning global object is not permitted"));
}

fn set_timeout<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| start_timer(scope, &args, false));
}

fn set_interval<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| start_timer(scope, &args, true));
}

fn start_timer<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments<'s>,
    repeat: bool,
) -> Result<Option<v8::Local<'s, v8::Value>>, BinderError> {
    if args.length() < 2 {
        return Err(BinderError::error("At least 2 arguments required"));
    }
    let callback = v8::Local::<v8::Function>::try_from(args.get(0))
        .map_err(|_| BinderError::type_error("Callback must be a Function"))?;
    if !args.get(1).is_number() {
        return Err(BinderError::type_error("Timeout must be a number"));
    }
    let timeout = args.get(1).integer_value(scope).unwrap_or(0);
    if timeout < 0 {
        return Err(BinderError::range_error("Timeout must be a non-negative integer"));
    }

    let runtime = RuntimeState::from_isolate(scope).ok_or_else(|| BinderError::error("Runtime is not available"))?;
    let table = TimerTable::get(scope).ok_or_else(|| BinderError::error("Timers are not available"))?;

    let callback = v8::Global::new(scope, callback);
    let extra: Vec<v8::Global<v8::Value>> = (2..args.length())
        .map(|index| v8::Global::new(scope, args.get(index)))
        .collect();

    let id = table.allocate_id();
    let timer = Rc::new(Timer::new(runtime.event_loop()));
    let holder = runtime.register_external_value(Box::new(TimerHolder { timer: timer.clone() }));
    table.timers.borrow_mut().insert(id, TimerEntry { timer: timer.clone(), holder });

    let weak = runtime.weak();
    let delay = Duration::from_millis(timeout as u64);
    timer.start(delay, if repeat { delay } else { Duration::ZERO }, move || {
        fire_timer(&weak, id, &callback, &extra, repeat)
    });
    Ok(Some(v8::Integer::new_from_unsigned(scope, id).into()))
}

fn fire_timer(
    weak: &Weak<RuntimeState>,
    id: u32,
    callback: &v8::Global<v8::Function>,
    extra: &[v8::Global<v8::Value>],
    repeat: bool,
) -> KeepInLoop {
    let Some(runtime) = weak.upgrade() else {
        return KeepInLoop::No;
    };
    let keep = runtime.enter(|scope| {
        runtime.perform_tasks_checkpoint(scope);

        let func = v8::Local::new(scope, callback);
        let args: Vec<v8::Local<v8::Value>> = extra.iter().map(|value| v8::Local::new(scope, value)).collect();
        let tc = &mut v8::TryCatch::new(scope);
        let receiver = tc.get_current_context().global(tc);
        let completed = func.call(tc, receiver.into(), &args).is_some();
        if tc.has_caught() {
            guard::report_caught_exception(tc);
        }

        if !completed || !repeat {
            if let Some(table) = TimerTable::get(tc) {
                table.clear(&runtime, id);
            }
            return KeepInLoop::No;
        }
        KeepInLoop::Yes
    });
    keep.unwrap_or(KeepInLoop::No)
}

fn clear_timer<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("1 argument required"));
        }
        if !args.get(0).is_number() {
            return Err(BinderError::type_error("Timer ID must be a number"));
        }
        let id = args.get(0).integer_value(scope).unwrap_or(-1);
        let runtime = RuntimeState::from_isolate(scope).ok_or_else(|| BinderError::error("Runtime is not available"))?;
        let table = TimerTable::get(scope).ok_or_else(|| BinderError::error("Timers are not available"))?;

        let cleared = u32::try_from(id).is_ok_and(|id| table.clear(&runtime, id));
        if !cleared {
            return Err(BinderError::error("Invalid timer ID"));
        }
        Ok(None)
    });
}

fn millisecond_time_counter(scope: &mut v8::HandleScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let elapsed = TimerTable::get(scope)
        .map(|table| table.started.elapsed().as_secs_f64() * 1e3)
        .unwrap_or_default();
    rv.set(v8::Number::new(scope, elapsed).into());
}

/// `__cocoa_log__(level, text)`; the bootstrap script wraps it as
/// `console` and deletes it from the global object.
fn native_log<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        let level = string_arg(scope, args.get(0), "level")?;
        let text = string_arg(scope, args.get(1), "text")?;
        match level.as_str() {
            "debug" => debug!(target: "cocoa::console", "{}", text),
            "warn" => warn!(target: "cocoa::console", "{}", text),
            "error" => error!(target: "cocoa::console", "{}", text),
            _ => info!(target: "cocoa::console", "{}", text),
        }
        Ok(None)
    });
}

/// `__cocoa_engine_wait__(delta)`; the bootstrap script calls it around
/// every timed `Atomics.waitAsync` so the loop stays up until it settles.
fn engine_wait<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if !args.get(0).is_int32() {
            return Err(BinderError::type_error("Delta must be an integer"));
        }
        let delta = args.get(0).int32_value(scope).unwrap_or(0);
        let runtime = RuntimeState::from_isolate(scope).ok_or_else(|| BinderError::error("Runtime is not available"))?;
        runtime.adjust_engine_waits(scope, delta);
        Ok(None)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::base::tests::make_runtime;
    use crate::runtime::config::RuntimeOptions;

    #[test]
    fn test_runtime_info_and_global() {
        let runtime = make_runtime(RuntimeOptions::default());
        assert_eq!(
            runtime.execute_script("<test>", "__runtime__.implementation").unwrap(),
            IMPLEMENTATION_NAME
        );
        assert_eq!(runtime.execute_script("<test>", "String(global === globalThis)").unwrap(), "true");
        let err = runtime.execute_script("<test>", "global = 1").unwrap_err();
        assert!(err.to_string().contains("Reassigning global object is not permitted"), "{err}");
        assert_eq!(runtime.execute_script("<test>", "typeof __cocoa_log__").unwrap(), "undefined");
        assert_eq!(runtime.execute_script("<test>", "typeof console.log").unwrap(), "function");
        assert_eq!(runtime.execute_script("<test>", "typeof __cocoa_engine_wait__").unwrap(), "undefined");
    }

    #[test]
    fn test_wait_async_times_out_after_spin() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "globalThis.result = 'pending';\nconst i32 = new Int32Array(new SharedArrayBuffer(4));\nconst { async, value } = Atomics.waitAsync(i32, 0, 0, 50);\nglobalThis.wasAsync = async;\nvalue.then((v) => { result = v; });",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "String(wasAsync)").unwrap(), "true");
        assert_eq!(runtime.execute_script("<test>", "result").unwrap(), "timed-out");
    }

    #[test]
    fn test_wait_async_woken_by_notify() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "globalThis.result = 'pending';\nconst i32 = new Int32Array(new SharedArrayBuffer(4));\nAtomics.waitAsync(i32, 0, 0, 10000).value.then((v) => { result = v; });\nsetTimeout(() => Atomics.notify(i32, 0), 5);",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "result").unwrap(), "ok");
    }

    #[test]
    fn test_engine_wait_rejects_non_integer() {
        let runtime = make_runtime(RuntimeOptions::default());
        let err = runtime
            .enter(|scope| {
                let global = scope.get_current_context().global(scope);
                set_function(scope, global, "engineWait", engine_wait).unwrap();
            })
            .and_then(|()| runtime.execute_script("<test>", "engineWait('x')"))
            .unwrap_err();
        assert!(err.to_string().contains("TypeError"), "{err}");
    }

    #[test]
    fn test_timeouts_run_in_order() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "globalThis.order = [];\nsetTimeout((tag) => order.push(tag), 20, 'late');\nsetTimeout(() => order.push('early'), 0);\nconst cancelled = setTimeout(() => order.push('never'), 5);\nclearTimeout(cancelled);",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "order.join(',')").unwrap(), "early,late");
    }

    #[test]
    fn test_interval_until_cleared() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "globalThis.ticks = 0;\nconst id = setInterval(() => { if (++ticks === 3) clearInterval(id); }, 1);",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "String(ticks)").unwrap(), "3");
    }

    #[test]
    fn test_timer_argument_errors() {
        let runtime = make_runtime(RuntimeOptions::default());
        let err = runtime.execute_script("<test>", "clearTimeout(12345)").unwrap_err();
        assert!(err.to_string().contains("Invalid timer ID"), "{err}");
        let err = runtime.execute_script("<test>", "setTimeout(() => {}, -1)").unwrap_err();
        assert!(err.to_string().contains("RangeError"), "{err}");
        let err = runtime.execute_script("<test>", "setTimeout(1, 1)").unwrap_err();
        assert!(err.to_string().contains("TypeError"), "{err}");
    }
}
