//! Runtime of the process's main thread.
//!
//! The main runtime is the only one that may carry an inspector, and the
//! only one that gives scripts a chance to react before the process exits.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bindings::binder::new_string;
use crate::bindings::BindingManager;
use crate::core::EventLoop;
use crate::error::{BinderError, RuntimeError};
use crate::inspector::Inspector;
use crate::platform::Platform;
use crate::runtime::base::{RuntimeBase, RuntimeDelegate};
use crate::runtime::config::RuntimeOptions;
use crate::runtime::module_url::ResolvedAs;

pub const MAIN_RUNTIME_ID: &str = "Runtime@Main";

struct MainDelegate {
    pass_args: Vec<String>,
}

impl RuntimeDelegate for MainDelegate {
    fn on_initialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        global: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError> {
        let key = new_string(scope, "__runtime__");
        let info = global
            .get(scope, key.into())
            .and_then(|value| value.to_object(scope))
            .ok_or_else(|| BinderError::error("Runtime information object is missing"))?;

        let args: Vec<v8::Local<v8::Value>> = self
            .pass_args
            .iter()
            .map(|arg| new_string(scope, arg).into())
            .collect();
        let args = v8::Array::new_with_elements(scope, &args);
        let key = new_string(scope, "args");
        info.set(scope, key.into(), args.into());
        Ok(())
    }
}

/// The runtime driving the process.
pub struct MainRuntime {
    base: RuntimeBase,
    inspector: RefCell<Option<Inspector>>,
}

impl MainRuntime {
    /// Load the preloaded dynamic bindings into `bindings`, then create the
    /// runtime.
    pub fn new(
        event_loop: EventLoop,
        platform: Arc<Platform>,
        bindings: Arc<BindingManager>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        for library in &options.preload {
            let name = bindings.load_dynamic_object(library)?;
            debug!(library = %library, binding = %name, "Preloaded dynamic binding");
        }

        let delegate = Rc::new(MainDelegate {
            pass_args: options.pass_args.clone(),
        });
        let base = RuntimeBase::new(MAIN_RUNTIME_ID, event_loop, platform, bindings, options, delegate)?;
        Ok(Self {
            base,
            inspector: RefCell::new(None),
        })
    }

    pub fn initialize(&self) -> Result<(), RuntimeError> {
        self.base.initialize()
    }

    pub fn base(&self) -> &RuntimeBase {
        &self.base
    }

    pub fn evaluate_module(&self, url: &str) -> Result<(), RuntimeError> {
        self.base.evaluate_module(url)
    }

    pub fn execute_script(&self, name: &str, source: &str) -> Result<String, RuntimeError> {
        self.base.execute_script(name, source)
    }

    /// Whether an inspector session is currently open.
    pub fn has_inspector(&self) -> bool {
        self.inspector
            .borrow()
            .as_ref()
            .is_some_and(|inspector| !inspector.is_closed())
    }

    /// Evaluate the startup module and drive the loop until the program is
    /// done. With an inspector configured, evaluation may first wait for a
    /// frontend or be deferred until the frontend asks the runtime to run.
    pub fn run(&self) -> Result<(), RuntimeError> {
        let state = self.base.state();
        let startup = state.options().startup.clone();

        match state.options().inspector.clone() {
            Some(config) => {
                let inspector = Inspector::start(state, &config)?;
                if config.no_script || config.wait_for_connection || config.break_on_next_statement {
                    inspector.wait_for_connection();
                }
                if config.no_script {
                    let weak = state.weak();
                    inspector.defer_startup(move || {
                        if let Some(state) = weak.upgrade() {
                            if let Err(err) = state.evaluate(&startup, ResolvedAs::UserExecute) {
                                state.set_fatal(err);
                            }
                        }
                    });
                    *self.inspector.borrow_mut() = Some(inspector);
                } else {
                    if config.break_on_next_statement {
                        inspector.break_on_next_statement();
                    }
                    *self.inspector.borrow_mut() = Some(inspector);
                    self.base.evaluate_module(&startup)?;
                }
            }
            None => self.base.evaluate_module(&startup)?,
        }

        self.spin()
    }

    /// Run the loop dry, give scripts their before-exit notification and
    /// keep running if that scheduled more work.
    pub fn spin(&self) -> Result<(), RuntimeError> {
        self.base.spin_run()?;

        let state = self.base.state();
        if let Some(introspect) = state.introspect() {
            state.enter(|scope| {
                introspect.notify_before_exit(scope);
                state.perform_tasks_checkpoint(scope);
            });
        }
        if state.event_loop().is_alive() {
            info!("Runtime continues after the before-exit notification");
            self.base.spin_run()?;
        }
        Ok(())
    }

    /// Close the inspector and dispose the runtime. Idempotent.
    pub fn dispose(&mut self) {
        if let Some(inspector) = self.inspector.borrow_mut().take() {
            inspector.dispose();
        }
        self.base.dispose();
    }
}

impl Drop for MainRuntime {
    fn drop(&mut self) {
        self.dispose();
    }
}
