//! Runtime configuration shared by the main and worker runtimes.
//!
//! This module defines the options consumed when building a runtime,
//! including the optional inspector endpoint and introspect policies.

use std::net::SocketAddr;

use crate::error::RuntimeError;

/// Port the inspector listens on when none is given.
pub const DEFAULT_INSPECTOR_PORT: u16 = 9005;

pub(crate) fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, RuntimeError> {
    if host.trim().is_empty() {
        return Err(RuntimeError::Config("Inspector host cannot be empty".to_string()));
    }
    if port == 0 {
        return Err(RuntimeError::Config(
            "Inspector port must be a positive integer".to_string(),
        ));
    }

    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    candidate.parse::<SocketAddr>().map_err(|err| {
        RuntimeError::Config(format!("Invalid inspector address '{candidate}': {err}"))
    })
}

/// Inspector endpoint and startup behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorConfig {
    pub address: SocketAddr,
    /// Block before the startup module until a frontend attaches.
    pub wait_for_connection: bool,
    /// Pause on the first statement of the startup module.
    pub break_on_next_statement: bool,
    /// Hold the startup module until `Runtime.runIfWaitingForDebugger`.
    pub no_script: bool,
    pub target_url: Option<String>,
    pub display_name: Option<String>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_INSPECTOR_PORT)),
            wait_for_connection: false,
            break_on_next_statement: false,
            no_script: false,
            target_url: None,
            display_name: None,
        }
    }
}

impl InspectorConfig {
    pub fn new(host: &str, port: u16) -> Result<Self, RuntimeError> {
        Ok(Self {
            address: parse_socket_addr(host, port)?,
            ..Self::default()
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn endpoint(&self) -> String {
        self.address.to_string()
    }

    pub fn with_wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }

    pub fn with_break_on_next_statement(mut self, should_break: bool) -> Self {
        self.break_on_next_statement = should_break;
        self
    }

    pub fn with_no_script(mut self, no_script: bool) -> Self {
        self.no_script = no_script;
        self
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Options for one runtime host.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Module evaluated after the runtime has started.
    pub startup: String,

    /// Size of the platform worker pool (0 = hardware concurrency).
    pub v8_platform_thread_pool: usize,

    /// Flags handed to the engine before initialization.
    pub v8_options: Vec<String>,

    /// Synthetic bindings that must never be registered.
    pub bindings_blacklist: Vec<String>,

    /// Let a dynamically loaded binding replace one with the same name.
    pub rt_allow_override: bool,

    /// Expose the `introspect` global object.
    pub rt_expose_introspect: bool,

    pub introspect_allow_loading_shared_object: bool,
    pub introspect_allow_write_journal: bool,

    /// Frames captured for uncaught exceptions and `inspectStackTrace`.
    pub introspect_stacktrace_frame_limit: usize,

    /// Shared objects loaded before the startup module.
    pub preload: Vec<String>,

    /// Arguments forwarded to scripts.
    pub pass_args: Vec<String>,
    pub pass_delimiter: char,

    /// Optional inspector configuration.
    pub inspector: Option<InspectorConfig>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            startup: "index.js".to_string(),
            v8_platform_thread_pool: 0,
            v8_options: Vec::new(),
            bindings_blacklist: Vec::new(),
            rt_allow_override: false,
            rt_expose_introspect: true,
            introspect_allow_loading_shared_object: true,
            introspect_allow_write_journal: false,
            introspect_stacktrace_frame_limit: 10,
            preload: Vec::new(),
            pass_args: Vec::new(),
            pass_delimiter: ',',
            inspector: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_startup(mut self, startup: impl Into<String>) -> Self {
        self.startup = startup.into();
        self
    }

    pub fn with_thread_pool(mut self, size: usize) -> Self {
        self.v8_platform_thread_pool = size;
        self
    }

    pub fn with_v8_options<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.v8_options = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bindings_blacklist = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_override(mut self, allow: bool) -> Self {
        self.rt_allow_override = allow;
        self
    }

    pub fn with_introspect(mut self, expose: bool) -> Self {
        self.rt_expose_introspect = expose;
        self
    }

    pub fn with_preload(mut self, path: impl Into<String>) -> Self {
        self.preload.push(path.into());
        self
    }

    pub fn with_inspector(mut self, inspector: InspectorConfig) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Split `pass_args` joined by the delimiter, the way scripts see them.
    pub fn with_pass_args(mut self, joined: &str, delimiter: char) -> Self {
        self.pass_delimiter = delimiter;
        self.pass_args = joined
            .split(delimiter)
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Engine flags as a single space separated string.
    pub fn v8_flags_string(&self) -> String {
        self.v8_options
            .iter()
            .map(|flag| {
                if flag.starts_with("--") {
                    flag.clone()
                } else {
                    format!("--{flag}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RuntimeOptions::default();
        assert_eq!(options.startup, "index.js");
        assert_eq!(options.v8_platform_thread_pool, 0);
        assert!(options.rt_expose_introspect);
        assert!(options.introspect_allow_loading_shared_object);
        assert!(!options.introspect_allow_write_journal);
        assert_eq!(options.introspect_stacktrace_frame_limit, 10);
        assert!(options.inspector.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = RuntimeOptions::default()
            .with_startup("main.mjs")
            .with_thread_pool(2)
            .with_v8_options(["expose-gc", "--harmony"])
            .with_blacklist(["workers"])
            .with_pass_args("a,b,,c", ',');

        assert_eq!(options.startup, "main.mjs");
        assert_eq!(options.v8_platform_thread_pool, 2);
        assert_eq!(options.v8_flags_string(), "--expose-gc --harmony");
        assert_eq!(options.bindings_blacklist, vec!["workers".to_string()]);
        assert_eq!(options.pass_args, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_inspector_config_defaults() {
        let inspector = InspectorConfig::default();
        assert_eq!(inspector.host(), "127.0.0.1");
        assert_eq!(inspector.port(), DEFAULT_INSPECTOR_PORT);
        assert!(!inspector.wait_for_connection);
        assert!(!inspector.break_on_next_statement);
        assert!(!inspector.no_script);
        assert!(inspector.target_url.is_none());
    }

    #[test]
    fn test_inspector_address_validation() {
        assert!(InspectorConfig::new("", 9005).is_err());
        assert!(InspectorConfig::new("127.0.0.1", 0).is_err());
        assert!(InspectorConfig::new("not an address", 80).is_err());

        let v6 = InspectorConfig::new("::1", 9229).unwrap();
        assert_eq!(v6.endpoint(), "[::1]:9229");

        let configured = InspectorConfig::new("0.0.0.0", 9005)
            .unwrap()
            .with_no_script(true)
            .with_target_url("file:///index.js");
        assert!(configured.no_script);
        assert_eq!(configured.target_url.as_deref(), Some("file:///index.js"));
    }
}
