//! Per-thread JavaScript runtime host.
//!
//! Each runtime owns one V8 isolate and one context, driven by the
//! [`EventLoop`](crate::core::EventLoop) of the thread it was created on.
//! The main runtime and worker runtimes share [`RuntimeBase`] and differ in
//! the globals they install and in how their lifetime ends.

pub mod base;
pub mod config;
pub(crate) mod guard;
pub mod infra;
pub mod internals;
pub mod introspect;
pub mod main_runtime;
pub mod module_url;
mod synthetic;
pub mod worker;
pub mod worker_runtime;

use once_cell::sync::OnceCell;

/// Process-wide V8 platform.
///
/// V8 accepts exactly one platform per process, and engine flags must be set
/// before it is initialized.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Initialize the V8 platform exactly once, passing `flags` to the engine
/// first. Later calls are no-ops and ignore their flags.
pub fn initialize_platform_once(flags: &[String]) {
    V8_PLATFORM.get_or_init(|| {
        let joined = flags
            .iter()
            .map(|flag| {
                if flag.starts_with("--") {
                    flag.clone()
                } else {
                    format!("--{flag}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        if !joined.is_empty() {
            v8::V8::set_flags_from_string(&joined);
        }

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        tracing::debug!(flags = %joined, "V8 platform initialized");

        platform
    });
}

/// Check if the V8 platform has been initialized.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

/// The engine's default platform, once initialized. Its message loop is
/// pumped alongside the host's own foreground tasks.
pub(crate) fn v8_platform() -> Option<&'static v8::SharedRef<v8::Platform>> {
    V8_PLATFORM.get()
}

pub use base::{ExternalCallbackType, ExternalCallbackAction, RuntimeBase};
pub use config::{InspectorConfig, RuntimeOptions};
pub use main_runtime::MainRuntime;
pub use module_url::{ModuleUrl, Protocol, ResolvedAs};
pub use worker_runtime::WorkerRuntime;
