//! Inspector I/O thread.
//!
//! The thread runs a private tokio reactor with a TCP listener. It answers
//! the DevTools discovery requests (`/json`, `/json/list`, `/json/version`)
//! and accepts exactly one websocket frontend. It never touches engine
//! state: inbound frames are pushed onto a [`ConcurrentTaskQueue`] followed
//! by a call to the owner's waker, and outbound frames arrive through an
//! unbounded send queue.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::core::ConcurrentTaskQueue;
use crate::error::{CoreError, InspectorError};

const IO_THREAD_NAME: &str = "Inspector I/O";
const PROTOCOL_VERSION: &str = "1.3";
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// What the I/O thread reports to the owner of the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    Connected,
    Frame(String),
    Disconnected,
}

/// One-shot meeting point between the owner and the I/O thread, met when
/// the first frontend connects or the thread exits.
pub struct ConnectionBarrier {
    met: Mutex<bool>,
    cond: Condvar,
}

impl ConnectionBarrier {
    fn new() -> Self {
        Self {
            met: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn arrive(&self) {
        *self.met.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.cond.notify_all();
    }

    /// Block until the barrier is met. Returns at once if it already was.
    pub fn wait(&self) {
        let mut met = self.met.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*met {
            met = self
                .cond
                .wait(met)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_met(&self) -> bool {
        *self.met.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The debuggee as advertised by `/json/list`.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetListEntry<'a> {
    description: &'a str,
    devtools_frontend_url: String,
    id: &'a str,
    title: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    url: &'a str,
    web_socket_debugger_url: String,
}

#[derive(Serialize)]
struct VersionInfo<'a> {
    #[serde(rename = "Browser")]
    browser: String,
    #[serde(rename = "Protocol-Version")]
    protocol_version: &'a str,
}

type SharedReceiver = Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>;

struct IoContext {
    address: SocketAddr,
    target: TargetInfo,
    inbound: Arc<ConcurrentTaskQueue<IoEvent>>,
    waker: Box<dyn Fn() + Send + Sync>,
    barrier: Arc<ConnectionBarrier>,
    session_active: AtomicBool,
    session_finished: Notify,
    outbound: SharedReceiver,
}

impl IoContext {
    fn deliver(&self, event: IoEvent) {
        self.inbound.push(event);
        (self.waker)();
    }

    fn target_entry(&self) -> TargetListEntry<'_> {
        let endpoint = format!("{}/{}", self.address, self.target.id);
        TargetListEntry {
            description: "cocoa instance",
            devtools_frontend_url: format!(
                "devtools://devtools/bundled/js_app.html?experiments=true&v8only=true&ws={endpoint}"
            ),
            id: &self.target.id,
            title: &self.target.title,
            kind: "node",
            url: &self.target.url,
            web_socket_debugger_url: format!("ws://{endpoint}"),
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Owner side of the I/O thread. Dropping it stops the thread and joins it.
pub struct IoThread {
    address: SocketAddr,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Arc<Notify>,
    barrier: Arc<ConnectionBarrier>,
    thread: Option<JoinHandle<()>>,
}

impl IoThread {
    /// Bind `address` and start serving on a new thread. Inbound events are
    /// pushed onto `inbound`, after which `waker` is called from the I/O
    /// thread.
    pub fn start<W>(
        address: SocketAddr,
        target: TargetInfo,
        inbound: Arc<ConcurrentTaskQueue<IoEvent>>,
        waker: W,
    ) -> Result<IoThread, InspectorError>
    where
        W: Fn() + Send + Sync + 'static,
    {
        let bind_error = |source| InspectorError::Bind { addr: address, source };
        let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let barrier = Arc::new(ConnectionBarrier::new());
        let context = Arc::new(IoContext {
            address,
            target,
            inbound,
            waker: Box::new(waker),
            barrier: barrier.clone(),
            session_active: AtomicBool::new(false),
            session_finished: Notify::new(),
            outbound: Arc::new(Mutex::new(Some(outbound_rx))),
        });

        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(IO_THREAD_NAME.to_string())
            .spawn(move || io_thread_main(listener, context, thread_shutdown))
            .map_err(|source| CoreError::ThreadSpawn {
                name: IO_THREAD_NAME.to_string(),
                source,
            })?;

        Ok(IoThread {
            address,
            outbound: Some(outbound_tx),
            shutdown,
            barrier,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn barrier(&self) -> Arc<ConnectionBarrier> {
        self.barrier.clone()
    }

    /// A handle to the send queue.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.outbound.clone()
    }

    /// Queue `frame` for the frontend. Frames queued before a frontend
    /// connects are delivered to it once it does.
    pub fn send(&self, frame: String) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok())
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        // Closing the send queue ends an active session.
        self.outbound.take();
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Inspector I/O thread panicked");
            }
        }
    }
}

fn io_thread_main(listener: std::net::TcpListener, context: Arc<IoContext>, shutdown: Arc<Notify>) {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(serve(listener, context.clone(), shutdown)),
        Err(err) => warn!(%err, "Failed to build inspector reactor"),
    }
    // Nobody may stay parked on a barrier the thread can no longer meet.
    context.barrier.arrive();
    info!("Inspector I/O thread has been exited");
}

async fn serve(listener: std::net::TcpListener, context: Arc<IoContext>, shutdown: Arc<Notify>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(%err, "Failed to register inspector listener");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = context.session_finished.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, context.clone()));
                }
                Err(err) => warn!(%err, "Failed to accept inspector connection"),
            },
        }
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
            && self.header("sec-websocket-key").is_some()
    }
}

async fn read_request_head(reader: &mut BufReader<TcpStream>) -> io::Result<Option<HttpRequest>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Malformed request line"));
    };
    let mut request = HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers: HashMap::new(),
    };

    let mut total = line.len();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        total += read;
        if total > MAX_REQUEST_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Request head too large"));
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            request
                .headers
                .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(Some(request))
}

async fn write_response(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: Arc<IoContext>) {
    let mut reader = BufReader::new(stream);
    let request = match read_request_head(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
            debug!(%peer, %err, "Dropped malformed inspector request");
            return;
        }
    };
    let pipelined = !reader.buffer().is_empty();
    let mut stream = reader.into_inner();

    let result = if request.is_websocket_upgrade() && !pipelined {
        accept_frontend(stream, peer, &request, &context).await
    } else {
        respond_discovery(&mut stream, &request, &context).await
    };
    if let Err(err) = result {
        debug!(%peer, %err, "Inspector connection failed");
    }
}

async fn respond_discovery(stream: &mut TcpStream, request: &HttpRequest, context: &IoContext) -> io::Result<()> {
    let path = request.path.split('?').next().unwrap_or_default();
    let body = match (request.method.as_str(), path.trim_end_matches('/')) {
        ("GET", "/json") | ("GET", "/json/list") => serde_json::to_string(&[context.target_entry()]),
        ("GET", "/json/version") => serde_json::to_string(&VersionInfo {
            browser: format!("Cocoa/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION,
        }),
        _ => return write_response(stream, "404 Not Found", "text/plain", "Not Found").await,
    };
    match body {
        Ok(body) => write_response(stream, "200 OK", "application/json; charset=UTF-8", &body).await,
        Err(err) => {
            warn!(%err, "Failed to serialize inspector discovery response");
            write_response(stream, "500 Internal Server Error", "text/plain", "").await
        }
    }
}

async fn accept_frontend(
    mut stream: TcpStream,
    peer: SocketAddr,
    request: &HttpRequest,
    context: &IoContext,
) -> io::Result<()> {
    let receiver = match context
        .session_active
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => context.take_receiver(),
        Err(_) => None,
    };
    let Some(mut receiver) = receiver else {
        warn!(%peer, "Refused inspector frontend, another one is already connected");
        return write_response(&mut stream, "409 Conflict", "text/plain", "Inspector is busy").await;
    };

    let key = request.header("sec-websocket-key").unwrap_or_default();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        context.deliver(IoEvent::Disconnected);
        context.session_finished.notify_one();
        return Err(err);
    }

    let websocket = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    info!(%peer, "Inspector frontend connected");
    context.deliver(IoEvent::Connected);
    context.barrier.arrive();

    run_session(websocket, context, &mut receiver).await;

    info!(%peer, "Inspector frontend disconnected");
    context.deliver(IoEvent::Disconnected);
    context.session_finished.notify_one();
    Ok(())
}

async fn run_session(
    websocket: WebSocketStream<TcpStream>,
    context: &IoContext,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) {
    let (mut write, mut read) = websocket.split();
    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => context.deliver(IoEvent::Frame(text.as_str().to_owned())),
                Some(Ok(WsMessage::Binary(bytes))) => {
                    context.deliver(IoEvent::Frame(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "Inspector websocket error");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = write.send(WsMessage::text(frame)).await {
                        warn!(%err, "Failed to send message to the inspector frontend");
                        break;
                    }
                }
                None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::client_async;

    fn target() -> TargetInfo {
        TargetInfo {
            id: "test-target".to_string(),
            title: "cocoa test".to_string(),
            url: "file:///index.js".to_string(),
        }
    }

    fn start() -> (IoThread, Arc<ConcurrentTaskQueue<IoEvent>>) {
        let inbound = Arc::new(ConcurrentTaskQueue::new());
        let address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let io = IoThread::start(address, target(), inbound.clone(), || {}).unwrap();
        (io, inbound)
    }

    async fn next_event(queue: &ConcurrentTaskQueue<IoEvent>) -> IoEvent {
        for _ in 0..500 {
            if let Some(event) = queue.pop() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no inspector event within 5s");
    }

    async fn http_get(address: SocketAddr, path: &str) -> (String, String) {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {address}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        (head.to_string(), body.to_string())
    }

    #[tokio::test]
    async fn test_discovery_endpoints() {
        let (io, _inbound) = start();
        let address = io.local_addr();

        let (head, body) = http_get(address, "/json/version").await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        let version: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(version["Protocol-Version"], "1.3");
        assert!(version["Browser"].as_str().unwrap().starts_with("Cocoa/"));

        for path in ["/json", "/json/list"] {
            let (_, body) = http_get(address, path).await;
            let targets: serde_json::Value = serde_json::from_str(&body).unwrap();
            let targets = targets.as_array().unwrap();
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0]["type"], "node");
            assert_eq!(targets[0]["id"], "test-target");
            assert_eq!(
                targets[0]["webSocketDebuggerUrl"],
                format!("ws://{address}/test-target")
            );
        }

        let (head, _) = http_get(address, "/nothing").await;
        assert!(head.starts_with("HTTP/1.1 404"), "{head}");
        assert!(!io.barrier().is_met());
    }

    #[tokio::test]
    async fn test_single_frontend_session() {
        let (io, inbound) = start();
        let address = io.local_addr();
        let url = format!("ws://{address}/test-target");

        let stream = TcpStream::connect(address).await.unwrap();
        let (mut frontend, _) = client_async(url.as_str(), stream).await.unwrap();
        assert_eq!(next_event(&inbound).await, IoEvent::Connected);
        assert!(io.barrier().is_met());
        // A met barrier lets every later waiter through
        io.barrier().wait();

        frontend
            .send(WsMessage::text(r#"{"id":1,"method":"Runtime.enable"}"#))
            .await
            .unwrap();
        assert_eq!(
            next_event(&inbound).await,
            IoEvent::Frame(r#"{"id":1,"method":"Runtime.enable"}"#.to_string())
        );

        assert!(io.send(r#"{"id":1,"result":{}}"#.to_string()));
        match frontend.next().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text.as_str(), r#"{"id":1,"result":{}}"#),
            other => panic!("unexpected frame {other:?}"),
        }

        // A second frontend is refused while the first is connected
        let stream = TcpStream::connect(address).await.unwrap();
        assert!(client_async(url.as_str(), stream).await.is_err());

        frontend.close(None).await.unwrap();
        assert_eq!(next_event(&inbound).await, IoEvent::Disconnected);
        drop(io);
    }

    #[tokio::test]
    async fn test_drop_without_frontend_releases_barrier() {
        let (io, inbound) = start();
        let barrier = io.barrier();
        drop(io);
        assert!(barrier.is_met());
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let inbound = Arc::new(ConcurrentTaskQueue::new());
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap();
        match IoThread::start(address, target(), inbound, || {}) {
            Err(InspectorError::Bind { addr, .. }) => assert_eq!(addr, address),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("bound an address already in use"),
        }
    }
}
