//! State and lifecycle shared by the main runtime and worker runtimes.
//!
//! [`RuntimeBase`] owns the isolate. Everything engine callbacks need to
//! reach lives in [`RuntimeState`], which is stored in an isolate slot and
//! recovered with [`RuntimeState::from_isolate`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroI32;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::bindings::binder::{self, new_string, ObjectRegistry};
use crate::bindings::{BindingManager, ExternalValueHolder, ExternalValueRegistry};
use crate::core::{Check, EventLoop, Idle, KeepInLoop, Timer};
use crate::error::{BinderError, ModuleError, RuntimeError};
use crate::platform::{ForegroundTaskRunner, Platform};
use crate::runtime::config::RuntimeOptions;
use crate::runtime::guard::{self, RejectionTracker};
use crate::runtime::infra;
use crate::runtime::introspect::Introspect;
use crate::runtime::module_url::{ModuleUrl, Protocol, ResolvedAs};
use crate::runtime::synthetic;

/// Points of the runtime lifecycle where external callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalCallbackType {
    BeforeSpinRunExit,
    BeforeRuntimeDispose,
    AfterRuntimeDispose,
    AfterRuntimeInitialize,
    AfterTasksCheckpoint,
}

/// Returned by an external callback to stay registered or go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCallbackAction {
    OnceMore,
    Remove,
}

type ExternalCallback = Box<dyn FnMut() -> ExternalCallbackAction>;

struct ExternalCallbackEntry {
    id: u64,
    kind: ExternalCallbackType,
    callback: ExternalCallback,
}

#[derive(Default)]
struct ExternalCallbacks {
    next_id: u64,
    entries: Vec<ExternalCallbackEntry>,
    running: HashSet<u64>,
    cancelled: HashSet<u64>,
}

/// Hooks through which the main runtime and worker runtimes specialize
/// [`RuntimeBase`].
pub trait RuntimeDelegate {
    /// Install runtime-specific globals. Runs before the bootstrap script.
    fn on_initialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        global: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError>;

    fn on_report_uncaught_exception(&self, _scope: &mut v8::HandleScope, _text: &str) {}

    fn on_post_checkpoint(&self, _scope: &mut v8::HandleScope) {}

    fn on_pre_dispose(&self, _scope: &mut v8::HandleScope) {}

    fn on_post_dispose(&self) {}
}

/// How often the engine's own task queue is polled while it has work that
/// will finish later, such as a timed `Atomics.waitAsync` or a background
/// compile job.
const ENGINE_PUMP_INTERVAL: Duration = Duration::from_millis(2);

struct ModuleCacheEntry {
    module: v8::Global<v8::Module>,
    exports: Option<v8::Global<v8::Object>>,
}

/// Per-isolate host state. Only ever touched on the isolate's thread.
pub struct RuntimeState {
    id: String,
    event_loop: EventLoop,
    platform: Arc<Platform>,
    bindings: Arc<BindingManager>,
    options: RuntimeOptions,
    isolate: Cell<*mut v8::Isolate>,
    context: RefCell<Option<v8::Global<v8::Context>>>,
    modules: RefCell<IndexMap<ModuleUrl, ModuleCacheEntry>>,
    // Identity hashes may collide, so each bucket keeps the handles too.
    module_ids: RefCell<HashMap<NonZeroI32, Vec<(v8::Global<v8::Module>, ModuleUrl)>>>,
    callbacks: RefCell<ExternalCallbacks>,
    external_values: RefCell<ExternalValueRegistry>,
    rejections: RejectionTracker,
    introspect: RefCell<Option<Rc<Introspect>>>,
    delegate: Rc<dyn RuntimeDelegate>,
    runner: RefCell<Option<ForegroundTaskRunner>>,
    check: RefCell<Option<Check>>,
    idle: RefCell<Option<Idle>>,
    engine_pump: RefCell<Option<Timer>>,
    engine_waits: Cell<usize>,
    fatal: RefCell<Option<RuntimeError>>,
    disposed: Cell<bool>,
    weak_self: Weak<RuntimeState>,
}

impl RuntimeState {
    pub fn from_isolate(isolate: &v8::Isolate) -> Option<Rc<RuntimeState>> {
        isolate.get_slot::<Rc<RuntimeState>>().cloned()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn bindings(&self) -> &Arc<BindingManager> {
        &self.bindings
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn weak(&self) -> Weak<RuntimeState> {
        self.weak_self.clone()
    }

    pub(crate) fn context_global(&self) -> Option<v8::Global<v8::Context>> {
        self.context.borrow().clone()
    }

    /// Run `f` inside a handle scope entered into the runtime's context.
    /// Returns `None` once the runtime has been disposed.
    ///
    /// Only called from event loop callbacks and the host's own entry
    /// points, never while another scope of this isolate is open.
    pub fn enter<R>(&self, f: impl FnOnce(&mut v8::HandleScope) -> R) -> Option<R> {
        let isolate = self.isolate.get();
        if isolate.is_null() || self.disposed.get() {
            return None;
        }
        let context = self.context_global()?;
        // SAFETY: the pointer targets the isolate owned by `RuntimeBase`,
        // which clears it before the isolate is dropped. Runtimes are
        // confined to the thread that created them.
        let isolate = unsafe { &mut *isolate };
        let scope = &mut v8::HandleScope::with_context(isolate, &context);
        Some(f(scope))
    }

    /// Evaluate `specifier` as a top-level module, reporting a thrown
    /// exception as uncaught.
    pub(crate) fn evaluate(&self, specifier: &str, mode: ResolvedAs) -> Result<(), RuntimeError> {
        self.enter(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let result = self.evaluate_module_in_scope(tc, None, specifier, mode);
            if result.is_err() && tc.has_caught() {
                guard::report_caught_exception(tc);
            }
            result.map(|_| ()).map_err(RuntimeError::from)
        })
        .ok_or(RuntimeError::Disposed)?
    }

    pub(crate) fn rejections(&self) -> &RejectionTracker {
        &self.rejections
    }

    pub fn introspect(&self) -> Option<Rc<Introspect>> {
        self.introspect.borrow().clone()
    }

    /// Register `callback` to run at every `kind` point until it returns
    /// [`ExternalCallbackAction::Remove`].
    pub fn add_external_callback<F>(&self, kind: ExternalCallbackType, callback: F) -> u64
    where
        F: FnMut() -> ExternalCallbackAction + 'static,
    {
        let mut callbacks = self.callbacks.borrow_mut();
        callbacks.next_id += 1;
        let id = callbacks.next_id;
        callbacks.entries.push(ExternalCallbackEntry {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    pub fn remove_external_callback(&self, kind: ExternalCallbackType, id: u64) -> bool {
        let mut callbacks = self.callbacks.borrow_mut();
        if let Some(pos) = callbacks
            .entries
            .iter()
            .position(|entry| entry.id == id && entry.kind == kind)
        {
            callbacks.entries.remove(pos);
            return true;
        }
        if callbacks.running.contains(&id) {
            callbacks.cancelled.insert(id);
            return true;
        }
        false
    }

    pub(crate) fn run_external_callbacks(&self, kind: ExternalCallbackType) {
        let taken: Vec<ExternalCallbackEntry> = {
            let mut callbacks = self.callbacks.borrow_mut();
            let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut callbacks.entries)
                .into_iter()
                .partition(|entry| entry.kind == kind);
            callbacks.entries = kept;
            callbacks.running.extend(taken.iter().map(|entry| entry.id));
            taken
        };
        if taken.is_empty() {
            return;
        }
        let ids: Vec<u64> = taken.iter().map(|entry| entry.id).collect();

        let mut survivors = Vec::new();
        for mut entry in taken {
            if self.callbacks.borrow().cancelled.contains(&entry.id) {
                continue;
            }
            if (entry.callback)() == ExternalCallbackAction::OnceMore {
                survivors.push(entry);
            }
        }

        let mut callbacks = self.callbacks.borrow_mut();
        let ExternalCallbacks {
            entries,
            running,
            cancelled,
            ..
        } = &mut *callbacks;
        for entry in survivors {
            if !cancelled.contains(&entry.id) {
                entries.push(entry);
            }
        }
        for id in ids {
            running.remove(&id);
            cancelled.remove(&id);
        }
    }

    pub fn register_external_value(&self, holder: Box<dyn ExternalValueHolder>) -> u64 {
        self.external_values.borrow_mut().register(holder)
    }

    /// Forget holder `id` without disposing it.
    pub fn unregister_external_value(&self, id: u64) -> Option<Box<dyn ExternalValueHolder>> {
        self.external_values.borrow_mut().unregister(id)
    }

    pub fn has_external_value(&self, id: u64) -> bool {
        self.external_values.borrow().contains(id)
    }

    /// Record a fatal condition and stop the loop; `spin_run` surfaces it.
    pub(crate) fn set_fatal(&self, err: RuntimeError) {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.event_loop.stop();
    }

    fn take_fatal(&self) -> Option<RuntimeError> {
        self.fatal.borrow_mut().take()
    }

    pub(crate) fn on_uncaught_exception(&self, scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>, text: &str) {
        if let Some(introspect) = self.introspect() {
            introspect.notify_uncaught_exception(scope, exception);
        }
        self.delegate.on_report_uncaught_exception(scope, text);
    }

    pub(crate) fn notify_multiple_resolve(&self, scope: &mut v8::HandleScope, promise: v8::Local<v8::Promise>, action: &str) {
        if let Some(introspect) = self.introspect() {
            introspect.notify_multiple_resolve(scope, promise, action);
        }
    }

    // Module cache

    pub fn resolve_module_url(
        &self,
        referrer: Option<&ModuleUrl>,
        specifier: &str,
        mode: ResolvedAs,
    ) -> Result<ModuleUrl, ModuleError> {
        let url = ModuleUrl::resolve(referrer, specifier, mode, &self.bindings)?;
        match referrer {
            Some(referrer) => debug!("Resolved ES module {} (from {})", url, referrer),
            None => debug!("Resolved ES module {} (from <host>)", url),
        }
        Ok(url)
    }

    pub(crate) fn module_url_of(&self, module: v8::Local<v8::Module>) -> Option<ModuleUrl> {
        let ids = self.module_ids.borrow();
        ids.get(&module.get_identity_hash())?
            .iter()
            .find(|(handle, _)| *handle == module)
            .map(|(_, url)| url.clone())
    }

    /// Drop `url` from the cache so the next import starts from scratch.
    fn evict_module(&self, url: &ModuleUrl) {
        let Some(entry) = self.modules.borrow_mut().shift_remove(url) else {
            return;
        };
        let mut ids = self.module_ids.borrow_mut();
        ids.retain(|_, bucket| {
            bucket.retain(|(handle, _)| *handle != entry.module);
            !bucket.is_empty()
        });
        trace!(runtime = %self.id, url = %url, "Evicted module");
    }

    /// Evict every cached module that never got past instantiation.
    fn evict_uninstantiated(&self, scope: &mut v8::HandleScope) {
        let stale: Vec<ModuleUrl> = self
            .modules
            .borrow()
            .iter()
            .filter(|(_, entry)| {
                let module = v8::Local::new(scope, &entry.module);
                matches!(module.get_status(), v8::ModuleStatus::Uninstantiated)
            })
            .map(|(url, _)| url.clone())
            .collect();
        for url in &stale {
            self.evict_module(url);
        }
    }

    fn cached_url_by_name(&self, name: &str) -> Option<ModuleUrl> {
        self.modules
            .borrow()
            .keys()
            .find(|url| url.to_string() == name)
            .cloned()
    }

    pub fn cached_module_urls(&self) -> Vec<ModuleUrl> {
        self.modules.borrow().keys().cloned().collect()
    }

    pub(crate) fn store_synthetic_exports(&self, scope: &mut v8::HandleScope, url: &ModuleUrl, exports: v8::Local<v8::Object>) {
        if let Some(entry) = self.modules.borrow_mut().get_mut(url) {
            entry.exports = Some(v8::Global::new(scope, exports));
        }
    }

    /// Cached module of `url`, compiling or synthesizing it on a miss.
    pub(crate) fn compile_module<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        url: &ModuleUrl,
    ) -> Result<v8::Local<'s, v8::Module>, ModuleError> {
        if let Some(entry) = self.modules.borrow().get(url) {
            return Ok(v8::Local::new(scope, &entry.module));
        }

        let module = match url.protocol() {
            Protocol::Synthetic => {
                let binding = url
                    .binding()
                    .ok_or_else(|| ModuleError::Synthetic(url.to_string()))?;
                synthetic::create_module(scope, url, binding)?
            }
            Protocol::File | Protocol::Internal => {
                let source = url.load_source().map_err(|source| ModuleError::Read {
                    url: url.to_string(),
                    source,
                })?;
                compile_source_module(scope, url, &source)?
            }
        };

        let handle = v8::Global::new(scope, module);
        self.module_ids
            .borrow_mut()
            .entry(module.get_identity_hash())
            .or_default()
            .push((handle.clone(), url.clone()));
        self.modules.borrow_mut().insert(
            url.clone(),
            ModuleCacheEntry {
                module: handle,
                exports: None,
            },
        );
        trace!(runtime = %self.id, url = %url, "Cached module");
        Ok(module)
    }

    /// Instantiate and evaluate `module`. On failure the exception is left
    /// pending for the caller's `TryCatch`. Returns the evaluation promise
    /// while top-level await is still in flight.
    fn instantiate_and_evaluate<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        url: &ModuleUrl,
        module: v8::Local<'s, v8::Module>,
    ) -> Result<Option<v8::Local<'s, v8::Promise>>, ModuleError> {
        let (rejected, pending) = {
            let tc = &mut v8::TryCatch::new(scope);
            if matches!(module.get_status(), v8::ModuleStatus::Uninstantiated)
                && module.instantiate_module(tc, resolve_module_callback).is_none()
            {
                let message = caught_text(tc);
                self.evict_uninstantiated(tc);
                tc.rethrow();
                return Err(ModuleError::Instantiate {
                    url: url.to_string(),
                    message,
                });
            }

            let mut rejected = None;
            let mut pending = None;
            // An evaluated source module hands back its cached evaluation
            // promise, which may still be waiting on top-level await.
            let evaluate = match module.get_status() {
                v8::ModuleStatus::Instantiated => true,
                v8::ModuleStatus::Evaluated => module.is_source_text_module(),
                _ => false,
            };
            if evaluate {
                let Some(result) = module.evaluate(tc) else {
                    let message = caught_text(tc);
                    tc.rethrow();
                    return Err(ModuleError::Evaluate {
                        url: url.to_string(),
                        message,
                    });
                };
                if let Ok(promise) = v8::Local::<v8::Promise>::try_from(result) {
                    match promise.state() {
                        v8::PromiseState::Rejected => {
                            promise.mark_as_handled();
                            self.rejections.remove(tc, promise);
                            rejected = Some(promise.result(tc));
                        }
                        v8::PromiseState::Pending => pending = Some(promise),
                        v8::PromiseState::Fulfilled => {}
                    }
                }
            }
            if rejected.is_none() && matches!(module.get_status(), v8::ModuleStatus::Errored) {
                rejected = Some(module.get_exception());
                pending = None;
            }
            (rejected, pending)
        };

        match rejected {
            Some(exception) => {
                let message = guard::exception_text(scope, exception);
                scope.throw_exception(exception);
                Err(ModuleError::Evaluate {
                    url: url.to_string(),
                    message,
                })
            }
            None => Ok(pending),
        }
    }

    /// Resolve, load and evaluate a module, returning its namespace object
    /// and the evaluation promise if top-level await has not settled yet.
    pub(crate) fn evaluate_module_in_scope<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        referrer: Option<&ModuleUrl>,
        specifier: &str,
        mode: ResolvedAs,
    ) -> Result<(v8::Local<'s, v8::Value>, Option<v8::Local<'s, v8::Promise>>), ModuleError> {
        let url = self.resolve_module_url(referrer, specifier, mode)?;
        let module = self.compile_module(scope, &url)?;
        let pending = self.instantiate_and_evaluate(scope, &url, module)?;
        let namespace = v8::Local::new(scope, module.get_module_namespace());
        Ok((namespace, pending))
    }

    /// Exports object of the binding `name`, building and caching its
    /// module on first use. Lets one binding depend on another.
    pub fn get_and_cache_synthetic_module<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
    ) -> Result<v8::Local<'s, v8::Object>, ModuleError> {
        let specifier = format!("{}://{}", Protocol::Synthetic.scheme(), name);
        let url = self.resolve_module_url(None, &specifier, ResolvedAs::SysImport)?;
        let module = self.compile_module(scope, &url)?;
        self.instantiate_and_evaluate(scope, &url, module)?;

        let modules = self.modules.borrow();
        let exports = modules
            .get(&url)
            .and_then(|entry| entry.exports.as_ref())
            .ok_or_else(|| ModuleError::Synthetic(url.to_string()))?;
        Ok(v8::Local::new(scope, exports))
    }

    fn import_dynamically<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        referrer_name: &str,
        specifier: &str,
    ) -> Result<(v8::Local<'s, v8::Value>, Option<v8::Local<'s, v8::Promise>>), ModuleError> {
        let referrer = self.cached_url_by_name(referrer_name);
        let mode = import_mode(referrer.as_ref());
        self.evaluate_module_in_scope(scope, referrer.as_ref(), specifier, mode)
    }

    /// Compile and run a classic script. `None` leaves the exception pending.
    pub(crate) fn execute_script<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
        source: &str,
    ) -> Option<v8::Local<'s, v8::Value>> {
        let code = new_string(scope, source);
        let name = new_string(scope, name);
        let origin = script_origin(scope, name.into(), false);
        let script = v8::Script::compile(scope, code, Some(&origin))?;
        script.run(scope)
    }

    // Task checkpoint

    pub(crate) fn drain_foreground_tasks(&self, scope: &mut v8::HandleScope) {
        if let Some(runner) = self.runner.borrow().as_ref() {
            self.platform.drain_tasks(scope, runner);
        }
        self.update_engine_pump(scope);
    }

    /// Track one more (or one fewer) engine-side wait that settles through
    /// the engine's delayed tasks.
    pub(crate) fn adjust_engine_waits(&self, isolate: &v8::Isolate, delta: i32) {
        let waits = self.engine_waits.get();
        let waits = if delta >= 0 {
            waits.saturating_add(delta as usize)
        } else {
            waits.saturating_sub(delta.unsigned_abs() as usize)
        };
        self.engine_waits.set(waits);
        self.update_engine_pump(isolate);
    }

    fn engine_busy(&self, isolate: &v8::Isolate) -> bool {
        self.engine_waits.get() > 0 || isolate.has_pending_background_tasks()
    }

    /// The engine posts delayed and background-completion tasks to its own
    /// queue, which never wakes the event loop. While such work is
    /// outstanding a referenced timer polls that queue and keeps the loop
    /// alive.
    fn update_engine_pump(&self, isolate: &v8::Isolate) {
        let pump = self.engine_pump.borrow();
        let Some(pump) = pump.as_ref() else {
            return;
        };
        if !self.engine_busy(isolate) {
            if pump.is_active() {
                trace!(runtime = %self.id, "Engine pump stopped");
                pump.stop();
            }
            return;
        }
        if pump.is_active() {
            return;
        }

        trace!(runtime = %self.id, "Engine pump started");
        let weak = self.weak();
        pump.start(ENGINE_PUMP_INTERVAL, ENGINE_PUMP_INTERVAL, move || {
            let Some(state) = weak.upgrade() else {
                return KeepInLoop::No;
            };
            let busy = state.enter(|scope| {
                if let Some(runner) = state.runner.borrow().as_ref() {
                    state.platform.drain_tasks(scope, runner);
                }
                state.perform_tasks_checkpoint(scope);
                state.engine_busy(scope)
            });
            match busy {
                Some(true) => KeepInLoop::Yes,
                _ => KeepInLoop::No,
            }
        });
    }

    /// Run microtasks and everything that must follow them.
    pub fn perform_tasks_checkpoint(&self, scope: &mut v8::HandleScope) {
        guard::take_settled_promises();
        scope.perform_microtask_checkpoint();

        self.check_unhandled_rejections(scope);
        if let Some(introspect) = self.introspect() {
            if let Err(err) = introspect.perform_scheduled_tasks(scope) {
                self.set_fatal(err);
            }
        }
        self.run_external_callbacks(ExternalCallbackType::AfterTasksCheckpoint);
        self.delegate.on_post_checkpoint(scope);

        let settled = guard::take_settled_promises();
        if let Some(idle) = self.idle.borrow().as_ref() {
            if settled > 0 {
                idle.start(|| KeepInLoop::No);
            } else {
                idle.stop();
            }
        }
    }

    fn check_unhandled_rejections(&self, scope: &mut v8::HandleScope) {
        let pending = self.rejections.len();
        if pending == 0 {
            return;
        }
        let Some(introspect) = self.introspect() else {
            warn!(
                "{} promise(s) was rejected but not handled (introspect not available)",
                pending
            );
            self.rejections.clear();
            return;
        };

        for (promise, value) in self.rejections.take(scope) {
            if !introspect.notify_unhandled_rejection(scope, promise, value) {
                guard::log_exception(scope, None, value);
                self.set_fatal(RuntimeError::UnhandledRejection);
            }
        }
    }
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("id", &self.id)
            .field("modules", &self.modules.borrow().len())
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

fn import_mode(referrer: Option<&ModuleUrl>) -> ResolvedAs {
    match referrer.map(ModuleUrl::protocol) {
        Some(Protocol::Internal) => ResolvedAs::SysImport,
        _ => ResolvedAs::UserImport,
    }
}

fn caught_text(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    match tc.exception() {
        Some(exception) => guard::exception_text(tc, exception),
        None => "<unknown>".to_string(),
    }
}

fn script_origin<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: v8::Local<'s, v8::Value>,
    is_module: bool,
) -> v8::ScriptOrigin<'s> {
    v8::ScriptOrigin::new(scope, name, 0, 0, false, 0, None, false, false, is_module, None)
}

fn compile_source_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    url: &ModuleUrl,
    source: &str,
) -> Result<v8::Local<'s, v8::Module>, ModuleError> {
    let name = new_string(scope, &url.to_string());
    let code = new_string(scope, source);
    let origin = script_origin(scope, name.into(), true);
    let mut source = v8::script_compiler::Source::new(code, Some(&origin));

    let tc = &mut v8::TryCatch::new(scope);
    match v8::script_compiler::compile_module(tc, &mut source) {
        Some(module) => Ok(module),
        None => Err(ModuleError::Compile {
            url: url.to_string(),
            message: caught_text(tc),
        }),
    }
}

fn resolve_module_callback<'s>(
    context: v8::Local<'s, v8::Context>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
    referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
    // SAFETY: invoked by the engine on the isolate's thread during
    // instantiation.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let runtime = RuntimeState::from_isolate(scope)?;
    let specifier = specifier.to_rust_string_lossy(scope);
    let referrer = runtime.module_url_of(referrer);

    let result = runtime
        .resolve_module_url(referrer.as_ref(), &specifier, import_mode(referrer.as_ref()))
        .and_then(|url| runtime.compile_module(scope, &url));
    match result {
        Ok(module) => Some(module),
        Err(err) => {
            binder::throw(scope, &BinderError::error(err.to_string()));
            None
        }
    }
}

fn dynamic_import_callback<'s>(
    scope: &mut v8::HandleScope<'s>,
    _host_defined_options: v8::Local<'s, v8::Data>,
    resource_name: v8::Local<'s, v8::Value>,
    specifier: v8::Local<'s, v8::String>,
    _import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let resolver = v8::PromiseResolver::new(scope)?;
    let promise = resolver.get_promise(scope);
    let runtime = RuntimeState::from_isolate(scope)?;

    let referrer = resource_name.to_rust_string_lossy(scope);
    let specifier = specifier.to_rust_string_lossy(scope);
    let tc = &mut v8::TryCatch::new(scope);
    match runtime.import_dynamically(tc, &referrer, &specifier) {
        Ok((namespace, None)) => {
            resolver.resolve(tc, namespace);
        }
        Ok((namespace, Some(evaluation))) => {
            // Settles with the namespace once top-level await finishes and
            // carries a rejected evaluation through unchanged.
            let settled = v8::Function::builder(namespace_after_evaluation)
                .data(namespace)
                .build(tc)
                .and_then(|on_fulfilled| evaluation.then(tc, on_fulfilled));
            match settled {
                Some(settled) => return Some(settled),
                None => {
                    tc.reset();
                    let exception = binder::make_exception(tc, &BinderError::error("Failed to await module evaluation"));
                    resolver.reject(tc, exception);
                }
            }
        }
        Err(err) => {
            let exception = match tc.exception() {
                Some(exception) => exception,
                None => binder::make_exception(tc, &BinderError::error(err.to_string())),
            };
            tc.reset();
            resolver.reject(tc, exception);
        }
    }
    Some(promise)
}

fn namespace_after_evaluation(_scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    rv.set(args.data());
}

extern "C" fn initialize_import_meta(
    context: v8::Local<v8::Context>,
    module: v8::Local<v8::Module>,
    meta: v8::Local<v8::Object>,
) {
    // SAFETY: invoked by the engine on the isolate's thread.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let Some(runtime) = RuntimeState::from_isolate(scope) else {
        return;
    };
    let Some(url) = runtime.module_url_of(module) else {
        return;
    };

    let url = new_string(scope, &url.to_string());
    let key = new_string(scope, "url");
    meta.create_data_property(scope, key.into(), url.into());

    if let Some(resolve) = v8::Function::builder(import_meta_resolve)
        .data(url.into())
        .build(scope)
    {
        let key = new_string(scope, "resolve");
        meta.create_data_property(scope, key.into(), resolve.into());
    }
}

fn import_meta_resolve(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    rv.set_null();
    let Some(runtime) = RuntimeState::from_isolate(scope) else {
        return;
    };
    if args.length() != 1 || !args.get(0).is_string() {
        return;
    }
    let referrer = args.data().to_rust_string_lossy(scope);
    let referrer = runtime.cached_url_by_name(&referrer);
    let specifier = args.get(0).to_rust_string_lossy(scope);

    if let Ok(url) = runtime.resolve_module_url(referrer.as_ref(), &specifier, import_mode(referrer.as_ref())) {
        rv.set(new_string(scope, &url.to_string()).into());
    }
}

/// Owner of one isolate, its context and its host state.
pub struct RuntimeBase {
    state: Rc<RuntimeState>,
    isolate: Option<v8::OwnedIsolate>,
}

impl RuntimeBase {
    pub fn new(
        id: impl Into<String>,
        event_loop: EventLoop,
        platform: Arc<Platform>,
        bindings: Arc<BindingManager>,
        options: RuntimeOptions,
        delegate: Rc<dyn RuntimeDelegate>,
    ) -> Result<Self, RuntimeError> {
        if event_loop.is_disposed() || platform.is_disposed() {
            return Err(RuntimeError::Disposed);
        }
        super::initialize_platform_once(&options.v8_options);
        let id = id.into();

        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(
            true,
            options.introspect_stacktrace_frame_limit as i32,
        );
        isolate.set_promise_hook(guard::promise_hook);
        isolate.set_promise_reject_callback(guard::promise_reject_callback);
        isolate.add_message_listener(guard::message_listener);
        isolate.set_host_import_module_dynamically_callback(dynamic_import_callback);
        isolate.set_host_initialize_import_meta_object_callback(initialize_import_meta);
        ObjectRegistry::install(&mut isolate);

        let isolate_ptr: *mut v8::Isolate = &mut *isolate;
        let context = {
            let scope = &mut v8::HandleScope::new(&mut *isolate);
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        };

        let state = Rc::new_cyclic(|weak| RuntimeState {
            id: id.clone(),
            event_loop: event_loop.clone(),
            platform: platform.clone(),
            bindings,
            options,
            isolate: Cell::new(isolate_ptr),
            context: RefCell::new(Some(context)),
            modules: RefCell::new(IndexMap::new()),
            module_ids: RefCell::new(HashMap::new()),
            callbacks: RefCell::new(ExternalCallbacks::default()),
            external_values: RefCell::new(ExternalValueRegistry::new()),
            rejections: RejectionTracker::default(),
            introspect: RefCell::new(None),
            delegate,
            runner: RefCell::new(None),
            check: RefCell::new(None),
            idle: RefCell::new(None),
            engine_pump: RefCell::new(None),
            engine_waits: Cell::new(0),
            fatal: RefCell::new(None),
            disposed: Cell::new(false),
            weak_self: weak.clone(),
        });
        isolate.set_slot(state.clone());

        let weak = Rc::downgrade(&state);
        let runner = platform.register_isolate(&id, &event_loop, move || {
            if let Some(state) = weak.upgrade() {
                state.enter(|scope| {
                    state.drain_foreground_tasks(scope);
                    state.perform_tasks_checkpoint(scope);
                });
            }
        });
        *state.runner.borrow_mut() = Some(runner);

        let check = Check::new(&event_loop);
        check.unref();
        let weak = Rc::downgrade(&state);
        check.start(move || {
            if let Some(state) = weak.upgrade() {
                state.enter(|scope| state.perform_tasks_checkpoint(scope));
            }
            KeepInLoop::Yes
        });
        *state.check.borrow_mut() = Some(check);
        *state.idle.borrow_mut() = Some(Idle::new(&event_loop));
        *state.engine_pump.borrow_mut() = Some(Timer::new(&event_loop));

        debug!(runtime = %id, "Created runtime");
        Ok(Self {
            state,
            isolate: Some(isolate),
        })
    }

    /// Install the host globals and run the bootstrap script.
    pub fn initialize(&self) -> Result<(), RuntimeError> {
        let state = &self.state;
        state
            .enter(|scope| -> Result<(), RuntimeError> {
                let context = scope.get_current_context();
                let global = context.global(scope);

                infra::install(scope, global, state)?;
                if state.options.rt_expose_introspect {
                    let introspect = Introspect::install(scope, global)?;
                    *state.introspect.borrow_mut() = Some(introspect);
                }
                state.delegate.on_initialize(scope, global)?;
                Ok(())
            })
            .ok_or(RuntimeError::Disposed)??;

        self.evaluate_system_module("internal://bootstrap.js")?;
        state.run_external_callbacks(ExternalCallbackType::AfterRuntimeInitialize);
        Ok(())
    }

    pub fn state(&self) -> &Rc<RuntimeState> {
        &self.state
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn event_loop(&self) -> &EventLoop {
        self.state.event_loop()
    }

    pub fn enter<R>(&self, f: impl FnOnce(&mut v8::HandleScope) -> R) -> Result<R, RuntimeError> {
        self.state.enter(f).ok_or(RuntimeError::Disposed)
    }

    pub fn add_external_callback<F>(&self, kind: ExternalCallbackType, callback: F) -> u64
    where
        F: FnMut() -> ExternalCallbackAction + 'static,
    {
        self.state.add_external_callback(kind, callback)
    }

    /// Evaluate a user module. Failures are reported as uncaught exceptions
    /// and returned.
    pub fn evaluate_module(&self, specifier: &str) -> Result<(), RuntimeError> {
        self.evaluate_with_mode(specifier, ResolvedAs::UserExecute)
    }

    pub(crate) fn evaluate_system_module(&self, specifier: &str) -> Result<(), RuntimeError> {
        self.evaluate_with_mode(specifier, ResolvedAs::SysExecute)
    }

    fn evaluate_with_mode(&self, specifier: &str, mode: ResolvedAs) -> Result<(), RuntimeError> {
        self.state.evaluate(specifier, mode)
    }

    /// Run a classic script and return the string form of its completion
    /// value.
    pub fn execute_script(&self, name: &str, source: &str) -> Result<String, RuntimeError> {
        let state = &self.state;
        self.enter(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            match state.execute_script(tc, name, source) {
                Some(value) => Ok(guard::exception_text(tc, value)),
                None => {
                    let message = caught_text(tc);
                    guard::report_caught_exception(tc);
                    Err(RuntimeError::Module(ModuleError::Evaluate {
                        url: name.to_string(),
                        message,
                    }))
                }
            }
        })?
    }

    /// Drive the event loop until nothing keeps it alive, running a task
    /// checkpoint after every pass.
    pub fn spin_run(&self) -> Result<(), RuntimeError> {
        let state = &self.state;
        if state.is_disposed() {
            return Err(RuntimeError::Disposed);
        }

        let mut outcome = Ok(());
        loop {
            state.event_loop.run();
            state.enter(|scope| {
                state.drain_foreground_tasks(scope);
                state.perform_tasks_checkpoint(scope);
            });
            if let Some(err) = state.take_fatal() {
                debug!(runtime = %state.id, %err, "Leaving spin run on fatal error");
                outcome = Err(err);
                break;
            }
            if !state.event_loop.is_alive() {
                break;
            }
        }

        state.run_external_callbacks(ExternalCallbackType::BeforeSpinRunExit);
        outcome
    }

    /// Tear the runtime down. Idempotent.
    pub fn dispose(&mut self) {
        let state = self.state.clone();
        if state.disposed.get() {
            return;
        }
        state.run_external_callbacks(ExternalCallbackType::BeforeRuntimeDispose);

        state.enter(|scope| {
            state.delegate.on_pre_dispose(scope);

            let urls = state.cached_module_urls();
            if !urls.is_empty() {
                debug!("Imported modules (URL):");
                for url in &urls {
                    debug!("  {}", url);
                }
            }
            state.modules.borrow_mut().clear();
            state.module_ids.borrow_mut().clear();

            let mut values = std::mem::take(&mut *state.external_values.borrow_mut());
            values.delete_all();
            if let Some(registry) = ObjectRegistry::get(scope) {
                registry.delete_all();
            }
            state.rejections.clear();
        });

        state.disposed.set(true);
        state.introspect.borrow_mut().take();
        state.context.borrow_mut().take();
        if let Some(check) = state.check.borrow_mut().take() {
            check.close();
        }
        if let Some(idle) = state.idle.borrow_mut().take() {
            idle.close();
        }
        if let Some(pump) = state.engine_pump.borrow_mut().take() {
            pump.stop();
            pump.close();
        }
        if let Some(runner) = state.runner.borrow_mut().take() {
            state.platform.unregister_isolate(&runner);
        }

        state.isolate.set(std::ptr::null_mut());
        if let Some(mut isolate) = self.isolate.take() {
            isolate.remove_slot::<Rc<RuntimeState>>();
            isolate.remove_slot::<Rc<ObjectRegistry>>();
            drop(isolate);
        }

        state.delegate.on_post_dispose();
        state.run_external_callbacks(ExternalCallbackType::AfterRuntimeDispose);
        debug!(runtime = %state.id, "Disposed runtime");
    }
}

impl Drop for RuntimeBase {
    fn drop(&mut self) {
        self.dispose();
    }
}
