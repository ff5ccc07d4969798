//! Engine modules backed by a [`Binding`].

use std::sync::Arc;

use tracing::trace;

use crate::bindings::binder::{self, new_string};
use crate::bindings::{Binding, STABLE_EXPORTS};
use crate::error::{BinderError, ModuleError};
use crate::runtime::base::RuntimeState;
use crate::runtime::module_url::ModuleUrl;

/// Build the synthetic module of `url`. Classes of the binding are
/// registered first, so that evaluating the module can wrap instances.
pub(crate) fn create_module<'s>(
    scope: &mut v8::HandleScope<'s>,
    url: &ModuleUrl,
    binding: &Arc<dyn Binding>,
) -> Result<v8::Local<'s, v8::Module>, ModuleError> {
    let url_string = url.to_string();
    binding
        .on_register_classes(scope)
        .map_err(|_| ModuleError::Synthetic(url_string.clone()))?;

    let export_names: Vec<v8::Local<v8::String>> = STABLE_EXPORTS
        .iter()
        .chain(binding.exports().iter())
        .map(|name| new_string(scope, name))
        .collect();
    let module_name = new_string(scope, &url_string);

    let module = v8::Module::create_synthetic_module(scope, module_name, &export_names, evaluation_steps);
    trace!(url = %url_string, exports = export_names.len(), "Created synthetic module");
    Ok(module)
}

fn evaluation_steps<'s>(
    context: v8::Local<'s, v8::Context>,
    module: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Value>> {
    // SAFETY: the engine calls the evaluation steps on the isolate's thread.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let runtime = RuntimeState::from_isolate(scope)?;

    match populate_exports(scope, &runtime, module) {
        Ok(()) => {
            let resolver = v8::PromiseResolver::new(scope)?;
            let undefined = v8::undefined(scope);
            resolver.resolve(scope, undefined.into());
            Some(resolver.get_promise(scope).into())
        }
        Err(err) => {
            binder::throw(scope, &err);
            None
        }
    }
}

fn populate_exports<'s>(
    scope: &mut v8::HandleScope<'s>,
    runtime: &RuntimeState,
    module: v8::Local<'s, v8::Module>,
) -> Result<(), BinderError> {
    let url = runtime
        .module_url_of(module)
        .ok_or_else(|| BinderError::error("Synthetic module is not in the module cache"))?;
    let binding = url
        .binding()
        .cloned()
        .ok_or_else(|| BinderError::error(format!("Module {url} is not backed by a binding")))?;

    let exports = v8::Object::new(scope);
    binding.on_get_module(scope, exports)?;

    let stable = [binding.name(), binding.description(), binding.unique_id()];
    for (key, value) in STABLE_EXPORTS.iter().zip(stable) {
        let key = new_string(scope, key);
        let value = new_string(scope, value);
        exports.set(scope, key.into(), value.into());
    }
    binding.on_set_instance_properties(scope, exports)?;
    runtime.store_synthetic_exports(scope, &url, exports);

    let names = exports
        .get_own_property_names(scope, Default::default())
        .ok_or_else(|| BinderError::error("Failed to enumerate synthetic module exports"))?;
    for index in 0..names.length() {
        let Some(name) = names.get_index(scope, index) else {
            continue;
        };
        let Ok(name) = v8::Local::<v8::String>::try_from(name) else {
            continue;
        };
        let key = name.to_rust_string_lossy(scope);
        let declared = STABLE_EXPORTS.contains(&key.as_str()) || binding.exports().contains(&key.as_str());
        if !declared {
            trace!(url = %url, export = %key, "Skipping undeclared synthetic export");
            continue;
        }
        let value = exports
            .get(scope, name.into())
            .unwrap_or_else(|| v8::undefined(scope).into());
        module
            .set_synthetic_module_export(scope, name, value)
            .ok_or_else(|| BinderError::error(format!("Failed to export `{key}` from {url}")))?;
    }
    Ok(())
}
