//! Cocoa runtime host
//!
//! Runs ES modules on V8 with one runtime per thread. Each runtime is driven
//! by its thread's [`core::EventLoop`], resolves modules against the file
//! system, internal scripts and native synthetic bindings, and can be debugged
//! through an inspector websocket. Workers run on their own threads and talk
//! to their parent through message ports.

pub mod bindings;
pub mod cli;
pub mod core;
pub mod error;
pub mod inspector;
pub mod logging;
pub mod message_port;
pub mod platform;
pub mod runtime;

pub use error::RuntimeError;
pub use runtime::{InspectorConfig, MainRuntime, RuntimeOptions};
