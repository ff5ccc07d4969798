//! Process-wide catalog of synthetic (native) modules.
//!
//! This module implements the registry every runtime consults when a
//! specifier names a binding. Built-in bindings are appended at startup;
//! external ones are loaded from shared objects exporting
//! [`DYNAMIC_BINDING_HOOK`].

use std::collections::HashSet;
use std::ffi::{c_void, CStr, CString};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::bindings::Binding;
use crate::error::BindingError;

/// Symbol looked up in shared objects passed to
/// [`BindingManager::load_dynamic_object`].
pub const DYNAMIC_BINDING_HOOK: &str = "__g_cocoa_dynamic_binding_hook";

/// Signature of [`DYNAMIC_BINDING_HOOK`]. The returned box is owned by the
/// manager from then on. Both sides must be built by the same compiler.
pub type DynamicBindingHook = unsafe extern "C" fn() -> *mut Box<dyn Binding>;

/// Define [`DYNAMIC_BINDING_HOOK`] in a `cdylib` so that the runtime can
/// load the binding produced by `$ctor`.
#[macro_export]
macro_rules! export_dynamic_binding {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn __g_cocoa_dynamic_binding_hook(
        ) -> *mut ::std::boxed::Box<dyn $crate::bindings::Binding> {
            let binding: ::std::boxed::Box<dyn $crate::bindings::Binding> =
                ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(binding))
        }
    };
}

/// A library handle that is never closed. Descriptors obtained from it may
/// be referenced by engine objects until the process exits.
struct LibraryHandle {
    path: String,
    _handle: *mut c_void,
}

// SAFETY: the handle is only stored, never dereferenced or closed.
unsafe impl Send for LibraryHandle {}

pub struct BindingManager {
    bindings: RwLock<IndexMap<String, Arc<dyn Binding>>>,
    blacklist: HashSet<String>,
    allow_override: bool,
    libraries: Mutex<Vec<LibraryHandle>>,
}

impl BindingManager {
    pub fn new<I, S>(blacklist: I, allow_override: bool) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            bindings: RwLock::new(IndexMap::new()),
            blacklist: blacklist.into_iter().map(Into::into).collect(),
            allow_override,
            libraries: Mutex::new(Vec::new()),
        })
    }

    /// A manager holding the bindings every runtime ships with.
    pub fn with_builtins<I, S>(blacklist: I, allow_override: bool) -> Result<Arc<Self>, BindingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let manager = Self::new(blacklist, allow_override);
        let builtin: Arc<dyn Binding> = Arc::new(crate::bindings::workers::WorkersBinding);
        if !manager.is_blacklisted(builtin.name()) {
            manager.append_binding(builtin)?;
        }
        Ok(manager)
    }

    pub fn search(&self, name: &str) -> Option<Arc<dyn Binding>> {
        self.read().get(name).cloned()
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.contains(name)
    }

    pub fn allow_override(&self) -> bool {
        self.allow_override
    }

    /// Names of every registered binding, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Register `binding`.
    ///
    /// Returns an error if its name is blacklisted, or if the name is taken
    /// and overriding is not allowed.
    pub fn append_binding(&self, binding: Arc<dyn Binding>) -> Result<(), BindingError> {
        let name = binding.name().to_string();
        if self.is_blacklisted(&name) {
            return Err(BindingError::Blacklisted(name));
        }

        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if bindings.contains_key(&name) {
            if !self.allow_override {
                return Err(BindingError::Conflict {
                    name,
                    from: binding.unique_id().to_string(),
                });
            }
            warn!("{} is overridden by {}", name, binding.unique_id());
        }
        bindings.insert(name, binding);
        Ok(())
    }

    /// Load a shared object exporting [`DYNAMIC_BINDING_HOOK`] and register
    /// the binding it returns. Returns the binding's name.
    pub fn load_dynamic_object(&self, path: &str) -> Result<String, BindingError> {
        let load_error = |message: String| BindingError::Load {
            path: path.to_string(),
            message,
        };
        let c_path = CString::new(path).map_err(|err| load_error(err.to_string()))?;

        // SAFETY: `c_path` is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(load_error(last_dl_error()));
        }

        let symbol = CString::new(DYNAMIC_BINDING_HOOK).map_err(|err| load_error(err.to_string()))?;
        // SAFETY: `handle` was returned by a successful dlopen.
        let hook = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        if hook.is_null() {
            return Err(BindingError::MissingHook {
                path: path.to_string(),
                symbol: DYNAMIC_BINDING_HOOK.to_string(),
            });
        }

        // SAFETY: the symbol is defined by `export_dynamic_binding!` with the
        // `DynamicBindingHook` signature.
        let hook: DynamicBindingHook = unsafe { std::mem::transmute(hook) };
        let raw = unsafe { hook() };
        if raw.is_null() {
            return Err(BindingError::NullDescriptor(path.to_string()));
        }
        // SAFETY: the hook hands over a pointer produced by `Box::into_raw`.
        let binding: Arc<dyn Binding> = Arc::from(*unsafe { Box::from_raw(raw) });

        self.libraries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LibraryHandle {
                path: path.to_string(),
                _handle: handle,
            });

        let name = binding.name().to_string();
        info!(
            binding = %name,
            unique_id = binding.unique_id(),
            "Loaded dynamic binding from {}",
            path
        );
        self.append_binding(binding)?;
        Ok(name)
    }

    /// Paths of every shared object loaded so far.
    pub fn loaded_libraries(&self) -> Vec<String> {
        self.libraries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|library| library.path.clone())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Arc<dyn Binding>>> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns either null or a valid C string owned by libc.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dlopen error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BinderError;

    struct TestBinding {
        name: &'static str,
        unique_id: &'static str,
    }

    impl Binding for TestBinding {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Test binding"
        }
        fn unique_id(&self) -> &str {
            self.unique_id
        }
        fn exports(&self) -> &[&'static str] {
            &["value"]
        }
        fn on_get_module<'s>(
            &self,
            _scope: &mut v8::HandleScope<'s>,
            _exports: v8::Local<'s, v8::Object>,
        ) -> Result<(), BinderError> {
            Ok(())
        }
    }

    fn binding(name: &'static str, unique_id: &'static str) -> Arc<dyn Binding> {
        Arc::new(TestBinding { name, unique_id })
    }

    #[test]
    fn test_append_and_search() {
        let manager = BindingManager::new(Vec::<String>::new(), false);
        assert!(manager.is_empty());

        manager.append_binding(binding("alpha", "org.test.alpha")).unwrap();
        manager.append_binding(binding("beta", "org.test.beta")).unwrap();

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.names(), vec!["alpha", "beta"]);
        assert_eq!(manager.search("alpha").unwrap().unique_id(), "org.test.alpha");
        assert!(manager.search("gamma").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let manager = BindingManager::new(Vec::<String>::new(), false);
        manager.append_binding(binding("alpha", "org.test.alpha")).unwrap();

        let err = manager
            .append_binding(binding("alpha", "org.test.alpha2"))
            .unwrap_err();
        assert!(matches!(err, BindingError::Conflict { .. }));
        assert_eq!(manager.search("alpha").unwrap().unique_id(), "org.test.alpha");
    }

    #[test]
    fn test_override_allowed() {
        let manager = BindingManager::new(Vec::<String>::new(), true);
        manager.append_binding(binding("alpha", "org.test.alpha")).unwrap();
        manager.append_binding(binding("alpha", "org.test.replacement")).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.search("alpha").unwrap().unique_id(),
            "org.test.replacement"
        );
    }

    #[test]
    fn test_blacklist() {
        let manager = BindingManager::new(["alpha"], false);
        let err = manager
            .append_binding(binding("alpha", "org.test.alpha"))
            .unwrap_err();
        assert!(matches!(err, BindingError::Blacklisted(name) if name == "alpha"));
        assert!(manager.search("alpha").is_none());
    }

    #[test]
    fn test_builtins_respect_blacklist() {
        let manager = BindingManager::with_builtins(Vec::<String>::new(), false).unwrap();
        assert!(manager.search("workers").is_some());

        let manager = BindingManager::with_builtins(["workers"], false).unwrap();
        assert!(manager.search("workers").is_none());
    }

    #[test]
    fn test_load_missing_library() {
        let manager = BindingManager::new(Vec::<String>::new(), false);
        let err = manager
            .load_dynamic_object("/nonexistent/libbinding.so")
            .unwrap_err();
        assert!(matches!(err, BindingError::Load { .. }));
        assert!(manager.loaded_libraries().is_empty());
    }
}
