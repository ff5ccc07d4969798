//! The `introspect` global: hooks for uncaught exceptions, promise
//! bookkeeping and process exit, plus out-of-band evaluation scheduled from
//! scripts.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::bindings::binder::{self, new_string, string_arg};
use crate::error::{BinderError, RuntimeError};
use crate::runtime::base::RuntimeState;
use crate::runtime::config::RuntimeOptions;
use crate::runtime::guard;
use crate::runtime::module_url::ResolvedAs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    UncaughtException,
    BeforeExit,
    UnhandledPromiseRejection,
    PromiseMultipleResolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Script,
    ModuleUrl,
}

struct ScheduledTask {
    kind: TaskKind,
    param: String,
    resolve: Option<v8::Global<v8::Function>>,
    reject: Option<v8::Global<v8::Function>>,
}

fn check_policy(options: &RuntimeOptions, policy: &str) -> Option<bool> {
    match policy {
        "AllowLoadingSharedObject" => Some(options.introspect_allow_loading_shared_object),
        "ForbidLoadingSharedObject" => Some(!options.introspect_allow_loading_shared_object),
        "AllowWritingToJournal" => Some(options.introspect_allow_write_journal),
        "ForbidWritingToJournal" => Some(!options.introspect_allow_write_journal),
        _ => None,
    }
}

/// Script-visible diagnostics attached to one runtime.
#[derive(Default)]
pub struct Introspect {
    slots: RefCell<HashMap<CallbackSlot, v8::Global<v8::Function>>>,
    tasks: RefCell<VecDeque<ScheduledTask>>,
}

impl Introspect {
    /// Create the `introspect` object on `global`.
    pub fn install<'s>(
        scope: &mut v8::HandleScope<'s>,
        global: v8::Local<'s, v8::Object>,
    ) -> Result<Rc<Introspect>, BinderError> {
        let object = v8::Object::new(scope);
        set_method(scope, object, "setUncaughtExceptionHandler", set_uncaught_exception_handler)?;
        set_method(scope, object, "setBeforeExitHandler", set_before_exit_handler)?;
        set_method(scope, object, "setUnhandledPromiseRejectionHandler", set_unhandled_rejection_handler)?;
        set_method(scope, object, "setPromiseMultipleResolveHandler", set_multiple_resolve_handler)?;
        set_method(scope, object, "loadSharedObject", load_shared_object)?;
        set_method(scope, object, "scheduleScriptEvaluate", schedule_script_evaluate)?;
        set_method(scope, object, "scheduleModuleUrlEvaluate", schedule_module_url_evaluate)?;
        set_method(scope, object, "print", print)?;
        set_method(scope, object, "writeToJournal", write_to_journal)?;
        set_method(scope, object, "hasSyntheticModule", has_synthetic_module)?;
        set_method(scope, object, "hasSecurityPolicy", has_security_policy)?;
        set_method(scope, object, "inspectStackTrace", inspect_stack_trace)?;

        let key = new_string(scope, "introspect");
        global
            .set(scope, key.into(), object.into())
            .ok_or_else(|| BinderError::error("Failed to install the introspect object"))?;
        Ok(Rc::new(Introspect::default()))
    }

    pub fn set_callback(&self, slot: CallbackSlot, func: v8::Global<v8::Function>) {
        self.slots.borrow_mut().insert(slot, func);
    }

    pub fn has_callback(&self, slot: CallbackSlot) -> bool {
        self.slots.borrow().contains_key(&slot)
    }

    /// Call the handler of `slot` with the global object as receiver.
    /// Returns `true` only if a handler exists and returned normally.
    fn invoke(&self, scope: &mut v8::HandleScope, slot: CallbackSlot, args: &[v8::Local<v8::Value>]) -> bool {
        let Some(func) = self.slots.borrow().get(&slot).cloned() else {
            return false;
        };
        let func = v8::Local::new(scope, func);
        let tc = &mut v8::TryCatch::new(scope);
        let receiver = tc.get_current_context().global(tc);
        func.call(tc, receiver.into(), args);
        if let Some(exception) = tc.exception() {
            let message = tc.message();
            guard::log_exception(tc, message, exception);
            return false;
        }
        true
    }

    pub fn notify_uncaught_exception(&self, scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> bool {
        self.invoke(scope, CallbackSlot::UncaughtException, &[exception])
    }

    pub fn notify_before_exit(&self, scope: &mut v8::HandleScope) -> bool {
        self.invoke(scope, CallbackSlot::BeforeExit, &[])
    }

    pub fn notify_unhandled_rejection(
        &self,
        scope: &mut v8::HandleScope,
        promise: v8::Local<v8::Promise>,
        value: v8::Local<v8::Value>,
    ) -> bool {
        self.invoke(scope, CallbackSlot::UnhandledPromiseRejection, &[promise.into(), value])
    }

    pub fn notify_multiple_resolve(&self, scope: &mut v8::HandleScope, promise: v8::Local<v8::Promise>, action: &str) -> bool {
        let action = new_string(scope, action);
        self.invoke(scope, CallbackSlot::PromiseMultipleResolve, &[promise.into(), action.into()])
    }

    fn enqueue(&self, task: ScheduledTask) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Run every scheduled evaluation. A failed evaluation without a reject
    /// callback, or a throwing callback, aborts the checkpoint.
    pub fn perform_scheduled_tasks(&self, scope: &mut v8::HandleScope) -> Result<(), RuntimeError> {
        let Some(runtime) = RuntimeState::from_isolate(scope) else {
            return Ok(());
        };
        loop {
            let Some(task) = self.tasks.borrow_mut().pop_front() else {
                break;
            };

            let outcome = {
                let tc = &mut v8::TryCatch::new(scope);
                let value = match task.kind {
                    TaskKind::Script => runtime.execute_script(tc, "<anonymous@scheduled>", &task.param),
                    TaskKind::ModuleUrl => {
                        match runtime.evaluate_module_in_scope(tc, None, &task.param, ResolvedAs::UserExecute) {
                            Ok((namespace, _)) => Some(namespace),
                            Err(err) => {
                                if !tc.has_caught() {
                                    binder::throw(tc, &BinderError::error(err.to_string()));
                                }
                                None
                            }
                        }
                    }
                };
                match (value, tc.exception()) {
                    (Some(value), None) => Ok(value),
                    (_, Some(exception)) => Err(exception),
                    (None, None) => Err(v8::undefined(tc).into()),
                }
            };

            let receiver = scope.get_current_context().global(scope);
            let tc = &mut v8::TryCatch::new(scope);
            match outcome {
                Err(exception) => match &task.reject {
                    Some(reject) => {
                        let reject = v8::Local::new(tc, reject);
                        reject.call(tc, receiver.into(), &[exception]);
                    }
                    None => {
                        let text = guard::exception_text(tc, exception);
                        error!("Uncaught exception from scheduled evaluation: {}", text);
                        return Err(RuntimeError::ScheduledEvaluation);
                    }
                },
                Ok(value) => {
                    if let Some(resolve) = &task.resolve {
                        let resolve = v8::Local::new(tc, resolve);
                        resolve.call(tc, receiver.into(), &[value]);
                    }
                }
            }
            if tc.has_caught() {
                guard::report_caught_exception(tc);
                return Err(RuntimeError::ScheduledEvaluation);
            }
        }
        Ok(())
    }
}

fn set_method(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) -> Result<(), BinderError> {
    let function = v8::Function::new(scope, callback)
        .ok_or_else(|| BinderError::error(format!("Failed to create introspect.{name}")))?;
    let key = new_string(scope, name);
    object.set(scope, key.into(), function.into());
    Ok(())
}

fn current(scope: &mut v8::HandleScope) -> Result<(Rc<RuntimeState>, Rc<Introspect>), BinderError> {
    let runtime = RuntimeState::from_isolate(scope).ok_or_else(|| BinderError::error("Runtime is not available"))?;
    let introspect = runtime
        .introspect()
        .ok_or_else(|| BinderError::error("Introspect is not available"))?;
    Ok((runtime, introspect))
}

fn function_arg<'s>(value: v8::Local<'s, v8::Value>) -> Result<v8::Local<'s, v8::Function>, BinderError> {
    v8::Local::<v8::Function>::try_from(value).map_err(|_| BinderError::type_error("Callback must be a function"))
}

fn set_handler<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
    slot: CallbackSlot,
) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let func = function_arg(args.get(0))?;
        let (_, introspect) = current(scope)?;
        introspect.set_callback(slot, v8::Global::new(scope, func));
        Ok(None)
    });
}

fn set_uncaught_exception_handler<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    set_handler(scope, args, rv, CallbackSlot::UncaughtException);
}

fn set_before_exit_handler<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    set_handler(scope, args, rv, CallbackSlot::BeforeExit);
}

fn set_unhandled_rejection_handler<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    set_handler(scope, args, rv, CallbackSlot::UnhandledPromiseRejection);
}

fn set_multiple_resolve_handler<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    set_handler(scope, args, rv, CallbackSlot::PromiseMultipleResolve);
}

fn load_shared_object<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let path = string_arg(scope, args.get(0), "path")?;
        let (runtime, _) = current(scope)?;
        if !runtime.options().introspect_allow_loading_shared_object {
            warn!(
                "JavaScript is trying to load shared object {}, which is forbidden by current introspect policy",
                path
            );
            return Err(BinderError::error(
                "Loading shared object is forbidden by current introspect policy",
            ));
        }
        let name = runtime.bindings().load_dynamic_object(&path)?;
        Ok(Some(new_string(scope, &name).into()))
    });
}

fn schedule<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
    kind: TaskKind,
) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() < 1 || args.length() > 3 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let param = string_arg(scope, args.get(0), "source")?;
        let resolve = match args.length() >= 2 {
            true => Some(v8::Global::new(scope, function_arg(args.get(1))?)),
            false => None,
        };
        let reject = match args.length() == 3 {
            true => Some(v8::Global::new(scope, function_arg(args.get(2))?)),
            false => None,
        };
        let (_, introspect) = current(scope)?;
        introspect.enqueue(ScheduledTask {
            kind,
            param,
            resolve,
            reject,
        });
        Ok(None)
    });
}

fn schedule_script_evaluate<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, rv: v8::ReturnValue) {
    schedule(scope, args, rv, TaskKind::Script);
}

fn schedule_module_url_evaluate<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    schedule(scope, args, rv, TaskKind::ModuleUrl);
}

fn print<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let text = string_arg(scope, args.get(0), "str")?;
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
        Ok(None)
    });
}

fn write_to_journal<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        let (runtime, _) = current(scope)?;
        if !runtime.options().introspect_allow_write_journal {
            return Err(BinderError::error(
                "Writing to journal is forbidden by current introspect policy",
            ));
        }
        if args.length() != 2 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let level = string_arg(scope, args.get(0), "level")?;
        let content = string_arg(scope, args.get(1), "content")?;
        match level.as_str() {
            "debug" => debug!(target: "cocoa::script", "{}", content),
            "info" => info!(target: "cocoa::script", "{}", content),
            "warning" | "warn" => warn!(target: "cocoa::script", "{}", content),
            "error" | "err" | "exception" | "except" => error!(target: "cocoa::script", "{}", content),
            _ => return Err(BinderError::error("Unrecognized journal level string")),
        }
        Ok(None)
    });
}

fn has_synthetic_module<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let name = string_arg(scope, args.get(0), "specifier")?;
        let (runtime, _) = current(scope)?;
        let found = runtime.bindings().search(&name).is_some();
        Ok(Some(v8::Boolean::new(scope, found).into()))
    });
}

fn has_security_policy<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() != 1 {
            return Err(BinderError::error("Invalid number of arguments"));
        }
        let policy = string_arg(scope, args.get(0), "policy")?;
        let (runtime, _) = current(scope)?;
        let granted = check_policy(runtime.options(), &policy)
            .ok_or_else(|| BinderError::error("Invalid policy name"))?;
        Ok(Some(v8::Boolean::new(scope, granted).into()))
    });
}

fn inspect_stack_trace<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    binder::guard(scope, &mut rv, |scope| {
        if args.length() > 1 {
            return Err(BinderError::error("Too many arguments"));
        }
        let (runtime, _) = current(scope)?;
        let mut limit = runtime.options().introspect_stacktrace_frame_limit as i64;
        if args.length() == 1 {
            let value = args.get(0);
            if !value.is_number() {
                return Err(BinderError::type_error("Frame limitation must be a number"));
            }
            limit = value.integer_value(scope).unwrap_or(-1);
            if limit < 0 {
                return Err(BinderError::range_error("Invalid frame limitation"));
            }
        }

        let trace = v8::StackTrace::current_stack_trace(scope, limit as usize)
            .ok_or_else(|| BinderError::error("Failed to capture stacktrace"))?;
        let frames = v8::Array::new(scope, trace.get_frame_count() as i32);
        for index in 0..trace.get_frame_count() {
            let Some(frame) = trace.get_frame(scope, index) else {
                continue;
            };
            let entry = v8::Object::new(scope);
            let line = match frame.get_line_number() {
                0 => -1,
                line => line as i32,
            };
            let column = match frame.get_column() {
                0 => -1,
                column => column as i32,
            };
            let script_name: v8::Local<v8::Value> = match frame.get_script_name(scope) {
                Some(name) => name.into(),
                None => v8::undefined(scope).into(),
            };
            let function_name: v8::Local<v8::Value> = match frame.get_function_name(scope) {
                Some(name) => name.into(),
                None => v8::undefined(scope).into(),
            };

            let fields: [(&str, v8::Local<v8::Value>); 8] = [
                ("line", v8::Integer::new(scope, line).into()),
                ("column", v8::Integer::new(scope, column).into()),
                ("scriptName", script_name),
                ("functionName", function_name),
                ("isEval", v8::Boolean::new(scope, frame.is_eval()).into()),
                ("isConstructor", v8::Boolean::new(scope, frame.is_constructor()).into()),
                ("isWasm", v8::Boolean::new(scope, frame.is_wasm()).into()),
                ("isUserJavaScript", v8::Boolean::new(scope, frame.is_user_javascript()).into()),
            ];
            for (key, value) in fields {
                let key = new_string(scope, key);
                entry.set(scope, key.into(), value);
            }
            frames.set_index(scope, index as u32, entry.into());
        }
        Ok(Some(frames.into()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::base::tests::make_runtime;

    #[test]
    fn test_policies() {
        let options = RuntimeOptions::default();
        for policy in [
            "AllowLoadingSharedObject",
            "ForbidLoadingSharedObject",
            "AllowWritingToJournal",
            "ForbidWritingToJournal",
        ] {
            assert!(check_policy(&options, policy).is_some());
        }
        assert_eq!(check_policy(&options, "AllowLoadingSharedObject"), Some(true));
        assert_eq!(check_policy(&options, "AllowWritingToJournal"), Some(false));
        assert_eq!(check_policy(&options, "Nope"), None);
    }

    #[test]
    fn test_scheduled_script_resolves() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "introspect.scheduleScriptEvaluate('6 * 7', (v) => { globalThis.result = v; });",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "String(globalThis.result)").unwrap(), "42");
    }

    #[test]
    fn test_scheduled_failure_without_reject_is_fatal() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script("<test>", "introspect.scheduleScriptEvaluate('throw new Error(\"late\")');")
            .unwrap();
        assert!(matches!(runtime.spin_run(), Err(RuntimeError::ScheduledEvaluation)));
    }

    #[test]
    fn test_scheduled_failure_goes_to_reject() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "introspect.scheduleScriptEvaluate('throw new Error(\"late\")', () => {}, (e) => { globalThis.caught = e.message; });",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "globalThis.caught").unwrap(), "late");
    }

    #[test]
    fn test_unhandled_rejection_handler() {
        let runtime = make_runtime(RuntimeOptions::default());
        runtime
            .execute_script(
                "<test>",
                "introspect.setUnhandledPromiseRejectionHandler((p, v) => { globalThis.seen = v; });\nPromise.reject('oops');",
            )
            .unwrap();
        runtime.spin_run().unwrap();
        assert_eq!(runtime.execute_script("<test>", "globalThis.seen").unwrap(), "oops");
    }

    #[test]
    fn test_handler_argument_errors() {
        let runtime = make_runtime(RuntimeOptions::default());
        let err = runtime
            .execute_script("<test>", "introspect.setBeforeExitHandler(1)")
            .unwrap_err();
        assert!(err.to_string().contains("Callback must be a function"), "{err}");
        let err = runtime
            .execute_script("<test>", "introspect.writeToJournal('info', 'x')")
            .unwrap_err();
        assert!(err.to_string().contains("forbidden"), "{err}");
    }

    #[test]
    fn test_stack_trace_frames() {
        let runtime = make_runtime(RuntimeOptions::default());
        let out = runtime
            .execute_script(
                "<test>",
                "function capture() { return introspect.inspectStackTrace(); }\nconst frames = capture();\n`${frames[0].functionName}:${frames[0].line}:${frames.length > 0}`",
            )
            .unwrap();
        assert_eq!(out, "capture:1:true");
        assert_eq!(
            runtime
                .execute_script("<test>", "String(introspect.hasSyntheticModule('workers'))")
                .unwrap(),
            "true"
        );
    }
}
