//! Scripts embedded in the binary and addressed as `internal://<name>`.
//!
//! The first line of a script may restrict how it can be reached:
//!
//! ```text
//! // %scope UserExecute:forbidden UserImport:allowed SysExecute:allowed
//! ```
//!
//! Keys missing from a header are forbidden. A script without a header is
//! reachable in every mode.

use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::ResolveError;
use crate::runtime::module_url::ResolvedAs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeValue {
    Allowed,
    Forbidden,
    /// Allowed, but logged as a warning.
    Informal,
}

impl ScopeValue {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "allowed" => Some(ScopeValue::Allowed),
            "forbidden" => Some(ScopeValue::Forbidden),
            "informal" => Some(ScopeValue::Informal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptScope {
    pub user_execute: ScopeValue,
    pub user_import: ScopeValue,
    pub sys_execute: ScopeValue,
    pub sys_import: ScopeValue,
}

impl ScriptScope {
    const ALL_ALLOWED: ScriptScope = ScriptScope {
        user_execute: ScopeValue::Allowed,
        user_import: ScopeValue::Allowed,
        sys_execute: ScopeValue::Allowed,
        sys_import: ScopeValue::Allowed,
    };

    const ALL_FORBIDDEN: ScriptScope = ScriptScope {
        user_execute: ScopeValue::Forbidden,
        user_import: ScopeValue::Forbidden,
        sys_execute: ScopeValue::Forbidden,
        sys_import: ScopeValue::Forbidden,
    };

    /// Parse a `// %scope ...` header line. Returns `None` if `line` is not a
    /// scope header or any attribute in it is malformed.
    pub fn parse_header(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "//" || tokens.next()? != "%scope" {
            return None;
        }

        let mut scope = Self::ALL_FORBIDDEN;
        for token in tokens {
            let (key, value) = token.split_once(':')?;
            let value = ScopeValue::parse(value)?;
            match key {
                "UserExecute" => scope.user_execute = value,
                "UserImport" => scope.user_import = value,
                "SysExecute" => scope.sys_execute = value,
                "SysImport" => scope.sys_import = value,
                _ => return None,
            }
        }
        Some(scope)
    }

    pub fn get(&self, mode: ResolvedAs) -> ScopeValue {
        match mode {
            ResolvedAs::UserExecute => self.user_execute,
            ResolvedAs::UserImport => self.user_import,
            ResolvedAs::SysExecute => self.sys_execute,
            ResolvedAs::SysImport => self.sys_import,
        }
    }
}

#[derive(Debug)]
pub struct InternalScript {
    pub name: &'static str,
    pub source: &'static str,
    pub scope: ScriptScope,
}

impl InternalScript {
    fn new(name: &'static str, source: &'static str) -> Self {
        let scope = source
            .lines()
            .next()
            .and_then(ScriptScope::parse_header)
            .unwrap_or(ScriptScope::ALL_ALLOWED);
        Self { name, source, scope }
    }

    fn permits(&self, mode: ResolvedAs) -> bool {
        match self.scope.get(mode) {
            ScopeValue::Allowed => true,
            ScopeValue::Forbidden => false,
            ScopeValue::Informal => {
                warn!(
                    "Referring internal script {} for {} is informal",
                    self.name,
                    mode.scope_name()
                );
                true
            }
        }
    }
}

static INTERNAL_SCRIPTS: Lazy<Vec<InternalScript>> = Lazy::new(|| {
    vec![
        InternalScript::new("bootstrap.js", include_str!("js/bootstrap.js")),
        InternalScript::new("worker_bootstrap.js", include_str!("js/worker_bootstrap.js")),
    ]
});

/// Look up an embedded script by name (a leading `/` is ignored) and check
/// that `mode` may reach it.
pub fn lookup(name: &str, mode: ResolvedAs) -> Result<&'static InternalScript, ResolveError> {
    let name = name.trim_start_matches('/');
    let script = INTERNAL_SCRIPTS
        .iter()
        .find(|script| script.name == name)
        .ok_or_else(|| ResolveError::InternalNotFound(name.to_string()))?;

    if !script.permits(mode) {
        return Err(ResolveError::OutOfScope(name.to_string()));
    }
    Ok(script)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    INTERNAL_SCRIPTS.iter().map(|script| script.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope_header() {
        let scope = ScriptScope::parse_header(
            "// %scope UserExecute:forbidden UserImport:informal SysExecute:allowed",
        )
        .unwrap();
        assert_eq!(scope.user_execute, ScopeValue::Forbidden);
        assert_eq!(scope.user_import, ScopeValue::Informal);
        assert_eq!(scope.sys_execute, ScopeValue::Allowed);
        // Absent keys are forbidden
        assert_eq!(scope.sys_import, ScopeValue::Forbidden);
    }

    #[test]
    fn test_parse_rejects_malformed_header() {
        assert!(ScriptScope::parse_header("import * as std from 'core';").is_none());
        assert!(ScriptScope::parse_header("// %scope UserExecute").is_none());
        assert!(ScriptScope::parse_header("// %scope Everything:allowed").is_none());
        assert!(ScriptScope::parse_header("// %scope UserExecute:maybe").is_none());
    }

    #[test]
    fn test_script_without_header_is_unrestricted() {
        let script = InternalScript::new("plain.js", "export default 1;\n");
        assert_eq!(script.scope, ScriptScope::ALL_ALLOWED);
        assert!(script.permits(ResolvedAs::UserImport));
    }

    #[test]
    fn test_bootstrap_is_system_only() {
        assert!(lookup("bootstrap.js", ResolvedAs::SysExecute).is_ok());
        assert!(lookup("/bootstrap.js", ResolvedAs::SysImport).is_ok());
        assert_eq!(
            lookup("bootstrap.js", ResolvedAs::UserExecute).unwrap_err(),
            ResolveError::OutOfScope("bootstrap.js".to_string())
        );
        assert_eq!(
            lookup("bootstrap.js", ResolvedAs::UserImport).unwrap_err(),
            ResolveError::OutOfScope("bootstrap.js".to_string())
        );
    }

    #[test]
    fn test_missing_script() {
        assert_eq!(
            lookup("nope.js", ResolvedAs::SysExecute).unwrap_err(),
            ResolveError::InternalNotFound("nope.js".to_string())
        );
        assert!(names().any(|name| name == "worker_bootstrap.js"));
    }
}
