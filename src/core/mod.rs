//! Reactor and threading primitives shared by every runtime.

pub mod concurrent_queue;
pub mod event_loop;
pub mod handles;
pub mod thread_pool;

pub use concurrent_queue::ConcurrentTaskQueue;
pub use event_loop::{EventLoop, HandleInfo, HandleKind, KeepInLoop};
pub use handles::{Async, AsyncSender, Check, Idle, Poll, Prepare, Timer};
pub use thread_pool::StandaloneThreadPool;
