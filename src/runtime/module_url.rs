//! Module specifier resolution.
//!
//! A specifier resolves into one of three kinds of module: a file on disk, an
//! embedded internal script or a synthetic module backed by a native
//! binding. Resolution itself caches nothing; the runtime's module cache is
//! keyed by the resulting [`ModuleUrl`].

use std::cmp::Ordering;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::bindings::{Binding, BindingManager};
use crate::error::ResolveError;
use crate::runtime::internals::{self, InternalScript};

/// Extensions tried, in order, when looking a file module up on disk.
const FILE_EXTENSIONS: [&str; 3] = ["", ".js", ".mjs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    File,
    Internal,
    Synthetic,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Internal => "internal",
            Protocol::Synthetic => "synthetic",
        }
    }

    fn strip_scheme(specifier: &str) -> Option<(Protocol, &str)> {
        [Protocol::File, Protocol::Internal, Protocol::Synthetic]
            .into_iter()
            .find_map(|protocol| {
                specifier
                    .strip_prefix(protocol.scheme())
                    .and_then(|rest| rest.strip_prefix("://"))
                    .map(|rest| (protocol, rest))
            })
    }
}

/// How a module is being reached. Internal scripts restrict which of these
/// modes may load them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAs {
    UserExecute,
    UserImport,
    SysExecute,
    SysImport,
}

impl ResolvedAs {
    pub fn new(from_import: bool, sys_invoke: bool) -> Self {
        match (from_import, sys_invoke) {
            (true, true) => ResolvedAs::SysImport,
            (true, false) => ResolvedAs::UserImport,
            (false, true) => ResolvedAs::SysExecute,
            (false, false) => ResolvedAs::UserExecute,
        }
    }

    pub fn scope_name(&self) -> &'static str {
        match self {
            ResolvedAs::UserExecute => "UserExecute",
            ResolvedAs::UserImport => "UserImport",
            ResolvedAs::SysExecute => "SysExecute",
            ResolvedAs::SysImport => "SysImport",
        }
    }
}

/// A resolved module location.
#[derive(Clone)]
pub struct ModuleUrl {
    protocol: Protocol,
    path: String,
    binding: Option<Arc<dyn Binding>>,
    internal: Option<&'static InternalScript>,
}

impl ModuleUrl {
    /// Resolve `specifier` as seen from `referrer`.
    pub fn resolve(
        referrer: Option<&ModuleUrl>,
        specifier: &str,
        mode: ResolvedAs,
        bindings: &BindingManager,
    ) -> Result<ModuleUrl, ResolveError> {
        if let Some(referrer) = referrer {
            if referrer.protocol == Protocol::Synthetic {
                return Err(ResolveError::SyntheticReferrer(referrer.to_string()));
            }
        }

        match Protocol::strip_scheme(specifier) {
            Some((Protocol::File, path)) => Self::resolve_file(referrer, path),
            Some((Protocol::Internal, path)) => Self::resolve_internal(path, mode),
            Some((Protocol::Synthetic, name)) => Self::resolve_synthetic(name, bindings)
                .ok_or_else(|| ResolveError::SyntheticNotFound(name.to_string())),
            None => match Self::resolve_synthetic(specifier, bindings) {
                Some(url) => Ok(url),
                None => Self::resolve_file(referrer, specifier),
            },
        }
    }

    fn resolve_synthetic(name: &str, bindings: &BindingManager) -> Option<ModuleUrl> {
        let binding = bindings.search(name)?;
        Some(ModuleUrl {
            protocol: Protocol::Synthetic,
            path: name.to_string(),
            binding: Some(binding),
            internal: None,
        })
    }

    fn resolve_internal(path: &str, mode: ResolvedAs) -> Result<ModuleUrl, ResolveError> {
        let script = internals::lookup(path, mode)?;
        Ok(ModuleUrl {
            protocol: Protocol::Internal,
            path: script.name.to_string(),
            binding: None,
            internal: Some(script),
        })
    }

    fn resolve_file(referrer: Option<&ModuleUrl>, path: &str) -> Result<ModuleUrl, ResolveError> {
        let requested = Path::new(path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            let base = match referrer {
                Some(referrer) if referrer.protocol == Protocol::File => {
                    Path::new(&referrer.path).parent().map(Path::to_path_buf)
                }
                _ => std::env::current_dir().ok(),
            };
            base.unwrap_or_default().join(requested)
        };
        let normalized = normalize_path(&joined);

        for extension in FILE_EXTENSIONS {
            let mut candidate = OsString::from(normalized.as_os_str());
            candidate.push(extension);
            let candidate = PathBuf::from(candidate);
            if !is_readable_file(&candidate) {
                continue;
            }
            let canonical = std::fs::canonicalize(&candidate)
                .map_err(|_| ResolveError::FileNotFound(path.to_string()))?;
            return Ok(ModuleUrl {
                protocol: Protocol::File,
                path: canonical.to_string_lossy().into_owned(),
                binding: None,
                internal: None,
            });
        }
        Err(ResolveError::FileNotFound(path.to_string()))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn binding(&self) -> Option<&Arc<dyn Binding>> {
        self.binding.as_ref()
    }

    pub fn internal_script(&self) -> Option<&'static InternalScript> {
        self.internal
    }

    /// Source text of a file or internal module.
    pub fn load_source(&self) -> std::io::Result<String> {
        match self.protocol {
            Protocol::File => std::fs::read_to_string(&self.path),
            Protocol::Internal => Ok(self.internal.map(|s| s.source).unwrap_or_default().to_string()),
            Protocol::Synthetic => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "synthetic modules have no source text",
            )),
        }
    }
}

impl fmt::Display for ModuleUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.scheme(), self.path)
    }
}

impl fmt::Debug for ModuleUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleUrl({self})")
    }
}

impl PartialEq for ModuleUrl {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.path == other.path
    }
}

impl Eq for ModuleUrl {}

impl Hash for ModuleUrl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.path.hash(state);
    }
}

impl PartialOrd for ModuleUrl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleUrl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

fn is_readable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => File::open(path).is_ok(),
        _ => false,
    }
}

/// Remove `.` and `..` components without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BinderError;

    struct NamedBinding;

    impl Binding for NamedBinding {
        fn name(&self) -> &str {
            "fixture"
        }
        fn description(&self) -> &str {
            "Binding used by resolver tests"
        }
        fn unique_id(&self) -> &str {
            "org.cocoa.test.fixture"
        }
        fn exports(&self) -> &[&'static str] {
            &[]
        }
        fn on_get_module<'s>(
            &self,
            _scope: &mut v8::HandleScope<'s>,
            _exports: v8::Local<'s, v8::Object>,
        ) -> Result<(), BinderError> {
            Ok(())
        }
    }

    fn manager() -> Arc<BindingManager> {
        let manager = BindingManager::new(Vec::<String>::new(), false);
        manager.append_binding(Arc::new(NamedBinding)).unwrap();
        manager
    }

    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cocoa-module-url-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join("main.js"), "import './lib/util';").unwrap();
        std::fs::write(dir.join("lib/util.mjs"), "export const x = 1;").unwrap();
        dir
    }

    #[test]
    fn test_resolves_file_relative_to_referrer() {
        let dir = fixture_dir("relative");
        let bindings = manager();
        let main = ModuleUrl::resolve(
            None,
            dir.join("main.js").to_str().unwrap(),
            ResolvedAs::UserExecute,
            &bindings,
        )
        .unwrap();
        assert_eq!(main.protocol(), Protocol::File);

        let util = ModuleUrl::resolve(Some(&main), "./lib/../lib/util", ResolvedAs::UserImport, &bindings)
            .unwrap();
        let expected = std::fs::canonicalize(dir.join("lib/util.mjs")).unwrap();
        assert_eq!(util.path(), expected.to_str().unwrap());
        assert_eq!(util.to_string(), format!("file://{}", expected.display()));

        // The URL string form resolves back to itself
        let again = ModuleUrl::resolve(Some(&main), &util.to_string(), ResolvedAs::UserImport, &bindings)
            .unwrap();
        assert_eq!(again, util);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let bindings = manager();
        let err = ModuleUrl::resolve(None, "/definitely/not/here.js", ResolvedAs::UserExecute, &bindings)
            .unwrap_err();
        assert_eq!(err, ResolveError::FileNotFound("/definitely/not/here.js".to_string()));
    }

    #[test]
    fn test_bare_specifier_prefers_bindings() {
        let bindings = manager();
        let url = ModuleUrl::resolve(None, "fixture", ResolvedAs::UserImport, &bindings).unwrap();
        assert_eq!(url.protocol(), Protocol::Synthetic);
        assert_eq!(url.to_string(), "synthetic://fixture");
        assert!(url.binding().is_some());

        let explicit = ModuleUrl::resolve(None, "synthetic://fixture", ResolvedAs::UserImport, &bindings)
            .unwrap();
        assert_eq!(explicit, url);

        assert_eq!(
            ModuleUrl::resolve(None, "synthetic://other", ResolvedAs::UserImport, &bindings).unwrap_err(),
            ResolveError::SyntheticNotFound("other".to_string())
        );
    }

    #[test]
    fn test_synthetic_modules_cannot_import() {
        let bindings = manager();
        let synthetic = ModuleUrl::resolve(None, "fixture", ResolvedAs::UserImport, &bindings).unwrap();
        let err = ModuleUrl::resolve(Some(&synthetic), "fixture", ResolvedAs::UserImport, &bindings)
            .unwrap_err();
        assert!(matches!(err, ResolveError::SyntheticReferrer(_)));
    }

    #[test]
    fn test_internal_scope_is_enforced() {
        let bindings = manager();
        let err = ModuleUrl::resolve(None, "internal://bootstrap.js", ResolvedAs::UserImport, &bindings)
            .unwrap_err();
        assert_eq!(err, ResolveError::OutOfScope("bootstrap.js".to_string()));

        let url = ModuleUrl::resolve(None, "internal:///bootstrap.js", ResolvedAs::SysExecute, &bindings)
            .unwrap();
        assert_eq!(url.to_string(), "internal://bootstrap.js");
        assert!(url.load_source().unwrap().contains("%scope"));
    }

    #[test]
    fn test_ordering_follows_string_form() {
        let bindings = manager();
        let internal = ModuleUrl::resolve(None, "internal://bootstrap.js", ResolvedAs::SysImport, &bindings)
            .unwrap();
        let synthetic = ModuleUrl::resolve(None, "fixture", ResolvedAs::SysImport, &bindings).unwrap();
        assert!(internal < synthetic);
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(ResolvedAs::new(true, false), ResolvedAs::UserImport);
        assert_eq!(ResolvedAs::new(false, true).scope_name(), "SysExecute");
    }
}
