//! Native ("synthetic") modules and the glue that exposes host objects to
//! scripts.

pub mod binder;
pub mod emitter;
pub mod exportable;
pub mod manager;
pub mod workers;

pub use binder::{ClassBuilder, ExternalValueHolder, ExternalValueRegistry};
pub use emitter::{EventEmitter, HasEmitter};
pub use exportable::{Descriptor, ExportableObject, FlattenedData, ObjectAttributes};
pub use manager::{BindingManager, DYNAMIC_BINDING_HOOK};

use crate::error::BinderError;

/// Export names every synthetic module carries in addition to its own.
pub const STABLE_EXPORTS: [&str; 3] = ["__name__", "__desc__", "__unique_id__"];

/// A native module addressable as `synthetic://<name>` or by its bare name.
///
/// Bindings are shared by every runtime of the process, so they hold no
/// engine state themselves: per-isolate data belongs in the module's
/// exports object or in the binder's object registry.
pub trait Binding: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Process-wide unique identifier, conventionally reverse-DNS.
    fn unique_id(&self) -> &str;

    /// Names this binding exports, excluding [`STABLE_EXPORTS`].
    fn exports(&self) -> &[&'static str];

    /// Register host classes before the module is evaluated. Classes used as
    /// a base of another class must be registered first.
    fn on_register_classes(&self, _scope: &mut v8::HandleScope) -> Result<(), BinderError> {
        Ok(())
    }

    /// Populate `exports` with every name listed by [`Binding::exports`].
    fn on_get_module<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        exports: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError>;

    /// Last chance to adjust the exports object once the stable names have
    /// been written.
    fn on_set_instance_properties<'s>(
        &self,
        _scope: &mut v8::HandleScope<'s>,
        _exports: v8::Local<'s, v8::Object>,
    ) -> Result<(), BinderError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name())
            .field("unique_id", &self.unique_id())
            .finish()
    }
}
