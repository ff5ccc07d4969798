//! Error types shared across the runtime host.
//!
//! Each concern owns a small `thiserror` enum; [`RuntimeError`] wraps all of
//! them for callers that only need to propagate.

use thiserror::Error;

/// Errors raised by the reactor and the thread pools.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Enqueue on stopped threadpool")]
    PoolStopped,
    #[error("Failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to build reactor: {0}")]
    Reactor(#[source] std::io::Error),
    #[error("Failed to register file descriptor {fd}: {source}")]
    Poll {
        fd: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a module specifier could not be turned into a module URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Synthetic module {0} is not allowed to import other modules")]
    SyntheticReferrer(String),
    #[error("Reference to internal script {0} is out of scope")]
    OutOfScope(String),
    #[error("Internal script {0} not found")]
    InternalNotFound(String),
    #[error("No synthetic module named {0}")]
    SyntheticNotFound(String),
    #[error("Failed to resolve module path \"{0}\"")]
    FileNotFound(String),
}

/// Errors from compiling, instantiating or evaluating an ES module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Failed to read module source {url}: {source}")]
    Read {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to compile ES6 module \"{url}\": {message}")]
    Compile { url: String, message: String },
    #[error("Failed to create synthetic module \"{0}\"")]
    Synthetic(String),
    #[error("Could not instantiate ES6 module {url}: {message}")]
    Instantiate { url: String, message: String },
    #[error("Error evaluating module {url}: {message}")]
    Evaluate { url: String, message: String },
    #[error("Runtime has been disposed")]
    Disposed,
}

/// Errors from the process-wide binding catalog.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Binding {0} is blocked because of blacklist")]
    Blacklisted(String),
    #[error("Binding {name} from {from} conflicts with an existing binding")]
    Conflict { name: String, from: String },
    #[error("Failed to load shared object {path}: {message}")]
    Load { path: String, message: String },
    #[error("Shared object {path} does not export {symbol}")]
    MissingHook { path: String, symbol: String },
    #[error("Dynamic binding hook in {0} returned a null descriptor")]
    NullDescriptor(String),
}

/// Categories of exceptions that native callbacks can throw into JavaScript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    WasmCompileError,
    WasmLinkError,
    WasmRuntimeError,
}

/// A host-side throw carrying the category of the engine exception it
/// should become once it crosses the native boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct BinderError {
    pub kind: ExceptionKind,
    pub message: String,
}

impl BinderError {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Error, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::TypeError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::RangeError, message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::ReferenceError, message)
    }
}

impl From<ModuleError> for BinderError {
    fn from(err: ModuleError) -> Self {
        BinderError::error(err.to_string())
    }
}

impl From<BindingError> for BinderError {
    fn from(err: BindingError) -> Self {
        BinderError::error(err.to_string())
    }
}

/// Errors from the inspector bridge.
#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("Failed to bind inspector socket {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Inspector I/O thread terminated unexpectedly")]
    IoThreadGone,
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Umbrella error for runtime construction and execution.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Inspector(#[from] InspectorError),
    #[error(transparent)]
    Binder(#[from] BinderError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Uncaught and unhandled promise rejection")]
    UnhandledRejection,
    #[error("Uncaught exception from scheduled evaluation")]
    ScheduledEvaluation,
    #[error("Runtime thread initialization failed: {0}")]
    ThreadInit(String),
    #[error("Runtime has been disposed")]
    Disposed,
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
