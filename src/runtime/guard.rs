//! Uncaught exception reporting and promise bookkeeping hooks installed on
//! every isolate.

use std::cell::{Cell, RefCell};

use tracing::error;

use crate::runtime::base::RuntimeState;

thread_local! {
    static SETTLED_PROMISES: Cell<u64> = const { Cell::new(0) };
}

/// Counts resolved promises so that the checkpoint can keep the loop
/// spinning while `.then` chains are still being fed.
pub(crate) extern "C" fn promise_hook(
    kind: v8::PromiseHookType,
    _promise: v8::Local<v8::Promise>,
    _parent: v8::Local<v8::Value>,
) {
    if matches!(kind, v8::PromiseHookType::Resolve) {
        SETTLED_PROMISES.with(|count| count.set(count.get() + 1));
    }
}

/// Read and reset the settlement counter of the current thread.
pub(crate) fn take_settled_promises() -> u64 {
    SETTLED_PROMISES.with(|count| count.replace(0))
}

struct PendingRejection {
    promise: v8::Global<v8::Promise>,
    value: v8::Global<v8::Value>,
}

/// Promises rejected without a handler since the last checkpoint.
#[derive(Default)]
pub(crate) struct RejectionTracker {
    pending: RefCell<Vec<PendingRejection>>,
}

impl RejectionTracker {
    pub(crate) fn push(
        &self,
        scope: &mut v8::HandleScope,
        promise: v8::Local<v8::Promise>,
        value: v8::Local<v8::Value>,
    ) {
        self.pending.borrow_mut().push(PendingRejection {
            promise: v8::Global::new(scope, promise),
            value: v8::Global::new(scope, value),
        });
    }

    pub(crate) fn remove(&self, scope: &mut v8::HandleScope, promise: v8::Local<v8::Promise>) {
        self.pending.borrow_mut().retain(|pending| {
            let candidate = v8::Local::new(scope, &pending.promise);
            !candidate.strict_equals(promise.into())
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }

    pub(crate) fn take<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Vec<(v8::Local<'s, v8::Promise>, v8::Local<'s, v8::Value>)> {
        std::mem::take(&mut *self.pending.borrow_mut())
            .into_iter()
            .map(|pending| {
                (
                    v8::Local::new(scope, pending.promise),
                    v8::Local::new(scope, pending.value),
                )
            })
            .collect()
    }
}

pub(crate) extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
    // SAFETY: the engine invokes this callback on the isolate's thread with
    // a valid message.
    let scope = &mut unsafe { v8::CallbackScope::new(&message) };
    let Some(runtime) = RuntimeState::from_isolate(scope) else {
        return;
    };

    let promise = message.get_promise();
    match message.get_event() {
        v8::PromiseRejectEvent::PromiseRejectWithNoHandler => {
            let value = message
                .get_value()
                .unwrap_or_else(|| v8::undefined(scope).into());
            runtime.rejections().push(scope, promise, value);
        }
        v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => {
            runtime.rejections().remove(scope, promise);
        }
        v8::PromiseRejectEvent::PromiseRejectAfterResolved => {
            runtime.notify_multiple_resolve(scope, promise, "reject");
        }
        v8::PromiseRejectEvent::PromiseResolveAfterResolved => {
            runtime.notify_multiple_resolve(scope, promise, "resolve");
        }
    }
}

/// Receives exceptions that escaped every `TryCatch`.
pub(crate) extern "C" fn message_listener(message: v8::Local<v8::Message>, exception: v8::Local<v8::Value>) {
    // SAFETY: called by the engine on the isolate's thread.
    let scope = &mut unsafe { v8::CallbackScope::new(message) };
    let Some(runtime) = RuntimeState::from_isolate(scope) else {
        return;
    };
    let Some(context) = runtime.context_global() else {
        return;
    };
    let context = v8::Local::new(scope, context);
    let scope = &mut v8::ContextScope::new(scope, context);
    report_uncaught_exception(scope, Some(message), exception);
}

/// Report the exception held by `tc`, if any, as uncaught.
pub(crate) fn report_caught_exception(tc: &mut v8::TryCatch<v8::HandleScope>) {
    let Some(exception) = tc.exception() else {
        return;
    };
    let message = tc.message();
    report_uncaught_exception(tc, message, exception);
}

/// Log `exception` with a traceback and hand it to the runtime's uncaught
/// exception observers.
pub(crate) fn report_uncaught_exception(
    scope: &mut v8::HandleScope,
    message: Option<v8::Local<v8::Message>>,
    exception: v8::Local<v8::Value>,
) {
    let text = log_exception(scope, message, exception);
    if let Some(runtime) = RuntimeState::from_isolate(scope) {
        runtime.on_uncaught_exception(scope, exception, &text);
    }
}

/// Only log `exception`. Used for failures of the observers themselves.
pub(crate) fn log_exception(
    scope: &mut v8::HandleScope,
    message: Option<v8::Local<v8::Message>>,
    exception: v8::Local<v8::Value>,
) -> String {
    let text = exception_text(scope, exception);
    error!("Uncaught exception: {}", text);

    let trace = message
        .and_then(|message| message.get_stack_trace(scope))
        .or_else(|| v8::Exception::get_stack_trace(scope, exception));
    if let Some(trace) = trace {
        error!("  Stack traceback (most recent call last):");
        for line in format_stack_trace(scope, trace) {
            error!("    {}", line);
        }
    }
    text
}

pub(crate) fn exception_text(scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> String {
    exception
        .to_string(scope)
        .map(|text| text.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// One line per frame, with the location column aligned.
pub(crate) fn format_stack_trace(scope: &mut v8::HandleScope, trace: v8::Local<v8::StackTrace>) -> Vec<String> {
    let mut rows = Vec::new();
    for index in 0..trace.get_frame_count() {
        let Some(frame) = trace.get_frame(scope, index) else {
            continue;
        };
        let prefix = if frame.is_constructor() { "new " } else { "" };
        let function = frame
            .get_function_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "<unknown>".to_string());
        let mut location = frame
            .get_script_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "<unknown>".to_string());
        if frame.get_line_number() > 0 {
            location.push_str(&format!(":{}", frame.get_line_number()));
        }
        if frame.get_column() > 0 {
            location.push_str(&format!(":{}", frame.get_column()));
        }
        rows.push((format!("#{index} {prefix}{function}"), location));
    }

    let width = rows.iter().map(|(left, _)| left.len()).max().unwrap_or(0);
    rows.into_iter()
        .map(|(left, location)| format!("{left:<width$} (from {location})"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_counter_resets() {
        SETTLED_PROMISES.with(|count| count.set(3));
        assert_eq!(take_settled_promises(), 3);
        assert_eq!(take_settled_promises(), 0);
    }

    #[test]
    fn test_rejection_tracker() {
        crate::runtime::initialize_platform_once(&[]);
        let isolate = &mut v8::Isolate::new(Default::default());
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);

        let tracker = RejectionTracker::default();
        let first = v8::PromiseResolver::new(scope).unwrap().get_promise(scope);
        let second = v8::PromiseResolver::new(scope).unwrap().get_promise(scope);
        let value = v8::Integer::new(scope, 7).into();

        tracker.push(scope, first, value);
        tracker.push(scope, second, value);
        assert_eq!(tracker.len(), 2);

        tracker.remove(scope, first);
        assert_eq!(tracker.len(), 1);

        let remaining = tracker.take(scope);
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].0.strict_equals(second.into()));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_format_stack_trace() {
        crate::runtime::initialize_platform_once(&[]);
        let isolate = &mut v8::Isolate::new(Default::default());
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
        let scope = &mut v8::HandleScope::new(isolate);
        let context = v8::Context::new(scope, Default::default());
        let scope = &mut v8::ContextScope::new(scope, context);

        let source = v8::String::new(scope, "function thrower() { throw new Error('boom'); }\nthrower();").unwrap();
        let name = v8::String::new(scope, "trace.js").unwrap();
        let origin = v8::ScriptOrigin::new(
            scope,
            name.into(),
            0,
            0,
            false,
            0,
            None,
            false,
            false,
            false,
            None,
        );
        let tc = &mut v8::TryCatch::new(scope);
        let script = v8::Script::compile(tc, source, Some(&origin)).unwrap();
        assert!(script.run(tc).is_none());

        let exception = tc.exception().unwrap();
        assert_eq!(exception_text(tc, exception), "Error: boom");
        let trace = v8::Exception::get_stack_trace(tc, exception).unwrap();
        let lines = format_stack_trace(tc, trace);
        assert!(lines[0].starts_with("#0 thrower"));
        assert!(lines[0].contains("(from trace.js:1:"));
    }
}
