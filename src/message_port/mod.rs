//! Cross-thread message ports.
//!
//! A port is one end of a connected pair. Posting on a port serializes the
//! value on the sender's thread and pushes it onto the peer's inbox; the
//! peer's event loop is then woken through an [`AsyncSender`]. The inbox is
//! only ever drained on the thread whose loop the port is attached to.
//!
//! [`MessagePort`] itself holds no engine or loop state and can move between
//! threads, which is how a port crosses a transfer list. The loop-local half
//! lives in [`PortEndpoint`].

pub mod serializer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::trace;

use crate::bindings::exportable::FlattenedData;
use crate::core::{Async, AsyncSender, EventLoop};
use crate::error::BinderError;

pub use serializer::{check_transfer_list, deserialize, serialize};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised while flattening a value for a port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("Transfer list contains the source port")]
    SourceInTransferList,
    #[error("Transfer list contains the destination port")]
    DestinationInTransferList,
    #[error("ArrayBuffer in transfer list is not detachable")]
    NotDetachable,
    #[error("Duplicate ArrayBuffer in transfer list")]
    DuplicateArrayBuffer,
    #[error("Failed to get the descriptor of host object")]
    NoDescriptor,
    #[error("Object cannot be cloned or transferred. Maybe it has been transferred to other contexts.")]
    PretestFailed,
    #[error("Message port has been closed or transferred")]
    Closed,
    #[error("Invalid WebAssembly module ID")]
    InvalidWasmModule,
}

impl From<PortError> for BinderError {
    fn from(err: PortError) -> Self {
        BinderError::error(err.to_string())
    }
}

/// A serialized value together with everything it references out of band.
pub struct Message {
    pub(crate) payload: Vec<u8>,
    pub(crate) array_buffers: Vec<v8::SharedRef<v8::BackingStore>>,
    pub(crate) shared_array_buffers: Vec<v8::SharedRef<v8::BackingStore>>,
    pub(crate) wasm_modules: Vec<v8::CompiledWasmModule>,
    pub(crate) host_objects: Vec<Box<dyn FlattenedData>>,
}

impl Message {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Release out-of-band resources once the value has been rebuilt.
    pub(crate) fn clear(&mut self) {
        self.payload.clear();
        self.array_buffers.clear();
        self.shared_array_buffers.clear();
        self.wasm_modules.clear();
        self.host_objects.clear();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload.len())
            .field("array_buffers", &self.array_buffers.len())
            .field("shared_array_buffers", &self.shared_array_buffers.len())
            .field("wasm_modules", &self.wasm_modules.len())
            .field("host_objects", &self.host_objects.len())
            .finish()
    }
}

/// What a port's inbox can hold.
#[derive(Debug)]
pub enum PortEvent {
    Message(Message),
    /// An error raised on the other side, delivered as text.
    Error(String),
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<PortEvent>,
    notifier: Option<AsyncSender>,
    attached: bool,
}

/// One end of a connected pair.
pub struct MessagePort {
    id: u64,
    peer: OnceCell<Weak<MessagePort>>,
    inbox: Mutex<Inbox>,
}

impl MessagePort {
    fn new() -> Arc<MessagePort> {
        Arc::new(MessagePort {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            peer: OnceCell::new(),
            inbox: Mutex::new(Inbox::default()),
        })
    }

    /// Create two ports entangled with each other. Neither is attached to an
    /// event loop yet.
    pub fn make_connected_pair() -> (Arc<MessagePort>, Arc<MessagePort>) {
        let first = MessagePort::new();
        let second = MessagePort::new();
        let _ = first.peer.set(Arc::downgrade(&second));
        let _ = second.peer.set(Arc::downgrade(&first));
        trace!(first = first.id, second = second.id, "Created connected message ports");
        (first, second)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        // A panic while holding the lock leaves the queue intact.
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The other end, unless it has been dropped.
    pub fn peer(&self) -> Option<Arc<MessagePort>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    pub fn is_peer_of(&self, other: &MessagePort) -> bool {
        self.peer().is_some_and(|peer| peer.id == other.id)
    }

    pub fn is_attached(&self) -> bool {
        self.inbox().attached
    }

    /// Deliver `event` to the peer. Returns `false` if this port is detached
    /// or the peer is not accepting messages; a peer that no longer exists
    /// silently swallows the event.
    pub fn post(&self, event: PortEvent) -> bool {
        if !self.is_attached() {
            return false;
        }
        match self.peer() {
            Some(peer) => peer.deliver(event),
            None => true,
        }
    }

    fn deliver(&self, event: PortEvent) -> bool {
        let notifier = {
            let mut inbox = self.inbox();
            if !inbox.attached {
                return false;
            }
            inbox.queue.push_back(event);
            inbox.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.send();
        }
        true
    }

    /// Drain the inbox in arrival order.
    pub fn take_events(&self) -> Vec<PortEvent> {
        self.inbox().queue.drain(..).collect()
    }

    /// Start accepting events, waking `notifier` whenever one arrives.
    /// Fails on a port that is already attached.
    pub fn attach(&self, notifier: AsyncSender) -> bool {
        let mut inbox = self.inbox();
        if inbox.attached {
            return false;
        }
        inbox.attached = true;
        let pending = !inbox.queue.is_empty();
        inbox.notifier = Some(notifier.clone());
        drop(inbox);
        if pending {
            notifier.send();
        }
        true
    }

    /// Stop accepting events and drop whatever is queued. The peer is not
    /// affected.
    pub fn detach(&self) {
        let mut inbox = self.inbox();
        inbox.attached = false;
        inbox.notifier = None;
        let dropped = inbox.queue.len();
        inbox.queue.clear();
        if dropped > 0 {
            trace!(port = self.id, dropped, "Dropped queued events of detached port");
        }
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The loop-local half of an attached port: the wakeup handle whose callback
/// drains the inbox.
///
/// The endpoint does not keep its loop alive until [`set_receiving`] is
/// turned on.
///
/// [`set_receiving`]: PortEndpoint::set_receiving
pub struct PortEndpoint {
    port: Arc<MessagePort>,
    notifier: Async,
}

impl PortEndpoint {
    /// Attach `port` to `lp`. `on_ready` runs on the loop thread whenever
    /// events may be waiting in the inbox.
    pub fn attach<F>(port: Arc<MessagePort>, lp: &EventLoop, on_ready: F) -> Result<PortEndpoint, PortError>
    where
        F: FnMut() + 'static,
    {
        let notifier = Async::new(lp, on_ready);
        notifier.unref();
        if !port.attach(notifier.sender()) {
            notifier.close();
            return Err(PortError::Closed);
        }
        Ok(PortEndpoint { port, notifier })
    }

    pub fn port(&self) -> &Arc<MessagePort> {
        &self.port
    }

    pub fn set_receiving(&self, receiving: bool) {
        if receiving {
            self.notifier.ref_();
        } else {
            self.notifier.unref();
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.notifier.has_ref()
    }

    /// Detach the port and close the wakeup handle, handing the port back so
    /// that it can be attached elsewhere.
    pub fn detach(self) -> Arc<MessagePort> {
        self.port.detach();
        self.notifier.close();
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn text_of(event: &PortEvent) -> Option<&str> {
        match event {
            PortEvent::Error(text) => Some(text),
            PortEvent::Message(_) => None,
        }
    }

    #[test]
    fn test_post_requires_attached_ends() {
        let lp = EventLoop::new().unwrap();
        let (first, second) = MessagePort::make_connected_pair();
        assert!(first.is_peer_of(&second));
        assert!(second.is_peer_of(&first));

        // Detached source refuses to post
        assert!(!first.post(PortEvent::Error("lost".into())));

        let a = Async::new(&lp, || {});
        let b = Async::new(&lp, || {});
        assert!(first.attach(a.sender()));
        assert!(!first.attach(a.sender()));

        // Peer not attached yet
        assert!(!first.post(PortEvent::Error("early".into())));

        assert!(second.attach(b.sender()));
        assert!(first.post(PortEvent::Error("one".into())));
        assert!(first.post(PortEvent::Error("two".into())));

        let events = second.take_events();
        let texts: Vec<_> = events.iter().filter_map(text_of).collect();
        assert_eq!(texts, ["one", "two"]);
        assert!(second.take_events().is_empty());

        a.close();
        b.close();
        lp.run();
    }

    #[test]
    fn test_dropped_peer_swallows_posts() {
        let lp = EventLoop::new().unwrap();
        let (first, second) = MessagePort::make_connected_pair();
        let notifier = Async::new(&lp, || {});
        first.attach(notifier.sender());
        drop(second);

        assert!(first.peer().is_none());
        assert!(first.post(PortEvent::Error("nobody".into())));
        notifier.close();
        lp.run();
    }

    #[test]
    fn test_detach_drops_queue() {
        let lp = EventLoop::new().unwrap();
        let (first, second) = MessagePort::make_connected_pair();
        let a = Async::new(&lp, || {});
        let b = Async::new(&lp, || {});
        first.attach(a.sender());
        second.attach(b.sender());

        first.post(PortEvent::Error("queued".into()));
        second.detach();
        assert!(!second.is_attached());
        assert!(second.take_events().is_empty());
        assert!(!first.post(PortEvent::Error("refused".into())));

        // Re-attaching is allowed once detached
        assert!(second.attach(b.sender()));
        assert!(first.post(PortEvent::Error("again".into())));
        assert_eq!(second.take_events().len(), 1);

        a.close();
        b.close();
        lp.run();
    }

    #[test]
    fn test_endpoint_wakes_across_threads() {
        let lp = EventLoop::new().unwrap();
        let (local, remote) = MessagePort::make_connected_pair();

        let received = Rc::new(Cell::new(0));
        let counter = received.clone();
        let drained = local.clone();
        let endpoint = PortEndpoint::attach(local, &lp, move || {
            let count = drained.take_events().len();
            counter.set(counter.get() + count);
        })
        .unwrap();
        assert!(!endpoint.is_receiving());
        endpoint.set_receiving(true);
        assert!(endpoint.is_receiving());

        let other = std::thread::spawn(move || {
            let remote_loop = EventLoop::new().unwrap();
            let notifier = Async::new(&remote_loop, || {});
            remote.attach(notifier.sender());
            for index in 0..3 {
                assert!(remote.post(PortEvent::Error(format!("message {index}"))));
            }
            notifier.close();
            remote_loop.run();
        });
        other.join().unwrap();

        while received.get() < 3 {
            lp.run_once();
        }
        assert_eq!(received.get(), 3);

        let port = endpoint.detach();
        assert!(!port.is_attached());
        lp.run();
    }
}
