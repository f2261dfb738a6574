//! End-to-end shutdown behaviour against real sockets.
//!
//! Each test serves on `127.0.0.1:0` and talks to the server through hyper's
//! low-level client connection API, so every request goes over a connection
//! the test controls.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gracedown::handler::{handler_fn, HttpResponse, ResponseBody};
use gracedown::{
    Accept, ClosableListener, ConnState, ConnectionHandle, ConnectionId, Handler, Server, ServerError,
    ShutdownState,
};
use gracedown_telemetry::{init_logging, LogConfig};
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn init_test_logging() {
    let _ = init_logging(&LogConfig::development().with_level("gracedown=debug"));
}

/// Handler that answers `/slow` after `delay` and everything else at once.
///
/// Each `/slow` request announces itself on the returned channel before
/// sleeping.
fn slow_handler(delay: Duration) -> (Handler, mpsc::UnboundedReceiver<()>) {
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |req: Request<hyper::body::Incoming>| {
        let started_tx = started_tx.clone();
        async move {
            if req.uri().path() == "/slow" {
                let _ = started_tx.send(());
                tokio::time::sleep(delay).await;
            }
            HttpResponse::new(ResponseBody::new(Bytes::from_static(b"ok")))
        }
    });
    (handler, started_rx)
}

async fn start(server: &Server) -> (SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let before = server.active_listeners();

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve(listener).await });

    wait_until(|| server.active_listeners() > before).await;
    (addr, task)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Client {
    sender: SendRequest<Empty<Bytes>>,
    conn: JoinHandle<Result<(), hyper::Error>>,
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    Client {
        sender,
        conn: tokio::spawn(conn),
    }
}

fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::get(path)
        .header(HOST, "localhost")
        .body(Empty::new())
        .unwrap()
}

impl Client {
    async fn request(&mut self, path: &str) -> Result<Response<Bytes>, hyper::Error> {
        self.sender.ready().await?;
        let response = self.sender.send_request(get(path)).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }

    fn disconnect(self) {
        self.conn.abort();
    }

    async fn closed_by_server(self) {
        let _ = tokio::time::timeout(WAIT, self.conn)
            .await
            .expect("server should close the connection");
    }
}

async fn finished(task: JoinHandle<Result<(), ServerError>>) -> Result<(), ServerError> {
    tokio::time::timeout(WAIT, task)
        .await
        .expect("serve should return")
        .expect("serve task panicked")
}

#[tokio::test]
async fn test_keep_alive_reuse_then_refused_after_close() {
    init_test_logging();
    let server = Server::builder().grace_period(Duration::ZERO).build();
    let (addr, serving) = start(&server).await;

    let mut client = connect(addr).await;
    let first = client.request("/").await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get(CONNECTION).is_none());

    let second = client.request("/").await.unwrap();
    assert_eq!(second.body().as_ref(), b"ok");
    assert_eq!(server.open_connections(), 1);

    wait_until(|| server.idle_connections() == 1).await;
    assert!(server.close());
    wait_until(|| server.open_connections() == 0).await;

    let third = tokio::time::timeout(WAIT, client.request("/"))
        .await
        .expect("request should fail promptly");
    assert!(third.is_err());

    assert!(finished(serving).await.is_ok());
    assert!(server.is_closed());
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn test_zero_grace_closes_idle_connection_promptly() {
    init_test_logging();
    let server = Server::builder().grace_period(Duration::ZERO).build();
    let (addr, serving) = start(&server).await;

    let mut client = connect(addr).await;
    client.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 1).await;

    let closed_at = Instant::now();
    server.close();
    client.closed_by_server().await;
    assert!(closed_at.elapsed() < Duration::from_secs(1));

    assert!(finished(serving).await.is_ok());
}

#[tokio::test]
async fn test_grace_period_lets_in_flight_finish_and_reaps_idle_after() {
    init_test_logging();
    let grace = Duration::from_millis(300);
    let (handler, mut started) = slow_handler(Duration::from_millis(100));
    let server = Server::builder().grace_period(grace).handler(handler).build();
    let (addr, serving) = start(&server).await;

    let mut idle = connect(addr).await;
    idle.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 1).await;

    let mut busy = connect(addr).await;
    let in_flight = tokio::spawn(async move { busy.request("/slow").await });
    started.recv().await.unwrap();

    let closed_at = Instant::now();
    assert!(server.close());

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");

    idle.closed_by_server().await;
    assert!(closed_at.elapsed() >= grace);

    assert!(finished(serving).await.is_ok());
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_serve_waits_for_active_request_beyond_grace() {
    init_test_logging();
    let (handler, mut started) = slow_handler(Duration::from_millis(400));
    let server = Server::builder()
        .grace_period(Duration::from_millis(20))
        .handler(handler)
        .build();
    let (addr, serving) = start(&server).await;

    let mut client = connect(addr).await;
    let in_flight = tokio::spawn(async move { client.request("/slow").await });
    started.recv().await.unwrap();

    server.close();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!serving.is_finished());
    assert_eq!(server.shutdown_state(), ShutdownState::Closing);
    assert_eq!(server.open_connections(), 1);

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.body().as_ref(), b"ok");

    assert!(finished(serving).await.is_ok());
    assert_eq!(server.shutdown_state(), ShutdownState::Closed);
}

#[tokio::test]
async fn test_new_connections_refused_while_request_completes() {
    init_test_logging();
    let (handler, mut started) = slow_handler(Duration::from_millis(200));
    let server = Server::builder()
        .grace_period(Duration::ZERO)
        .handler(handler)
        .build();
    let (addr, serving) = start(&server).await;

    let mut client = connect(addr).await;
    let in_flight = tokio::spawn(async move { client.request("/slow").await });
    started.recv().await.unwrap();

    server.close();
    wait_until(|| server.active_listeners() == 0).await;

    assert!(TcpStream::connect(addr).await.is_err());

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(finished(serving).await.is_ok());
}

#[tokio::test]
async fn test_idle_connection_gets_one_more_request_during_grace() {
    init_test_logging();
    let server = Server::builder()
        .grace_period(Duration::from_secs(30))
        .build();
    let (addr, serving) = start(&server).await;

    let mut client = connect(addr).await;
    client.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 1).await;

    server.close();

    let last = client.request("/").await.unwrap();
    assert_eq!(last.status(), StatusCode::OK);
    assert_eq!(last.headers().get(CONNECTION).unwrap(), "close");

    client.closed_by_server().await;
    assert!(finished(serving).await.is_ok());
}

#[tokio::test]
async fn test_close_before_listen_and_serve() {
    let server = Server::builder().addr("127.0.0.1:0").build();
    assert!(server.close());

    let result = tokio::time::timeout(WAIT, server.listen_and_serve())
        .await
        .expect("listen_and_serve should return");
    assert!(result.is_ok());
    assert!(!server.close());
}

/// Serves `listener` on its own task, returning its close handle.
async fn start_closable<L: Accept>(
    server: &Server,
    listener: L,
) -> (gracedown::ListenerHandle, JoinHandle<Result<(), ServerError>>) {
    let listener = ClosableListener::new(listener);
    let handle = listener.handle();
    let before = server.active_listeners();

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve_listener(listener).await });

    wait_until(|| server.active_listeners() > before).await;
    (handle, task)
}

#[tokio::test]
async fn test_external_listener_close_is_an_error() {
    init_test_logging();
    let server = Server::builder().build();
    let (handle, serving) =
        start_closable(&server, TcpListener::bind("127.0.0.1:0").await.unwrap()).await;

    assert!(handle.close());
    let result = finished(serving).await;
    assert!(matches!(result, Err(ServerError::ListenerClosed)));
    assert_eq!(server.shutdown_state(), ShutdownState::Running);
    assert_eq!(server.active_listeners(), 0);
}

#[tokio::test]
async fn test_external_listener_close_reaps_idle_after_grace() {
    init_test_logging();
    let grace = Duration::from_millis(200);
    let server = Server::builder().grace_period(grace).build();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handle, serving) = start_closable(&server, listener).await;

    let mut client = connect(addr).await;
    client.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 1).await;

    let closed_at = Instant::now();
    assert!(handle.close());
    wait_until(|| server.active_listeners() == 0).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!serving.is_finished());
    assert_eq!(server.open_connections(), 1);

    client.closed_by_server().await;
    let result = finished(serving).await;
    assert!(closed_at.elapsed() >= grace);
    assert!(matches!(result, Err(ServerError::ListenerClosed)));
    assert_eq!(server.open_connections(), 0);
    assert_eq!(server.shutdown_state(), ShutdownState::Running);
}

#[tokio::test]
async fn test_external_listener_close_waits_for_peer_disconnect() {
    init_test_logging();
    let server = Server::builder()
        .grace_period(Duration::from_secs(30))
        .build();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handle, serving) = start_closable(&server, listener).await;

    let mut client = connect(addr).await;
    client.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 1).await;

    assert!(handle.close());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!serving.is_finished());

    client.disconnect();
    let result = finished(serving).await;
    assert!(matches!(result, Err(ServerError::ListenerClosed)));
    assert_eq!(server.open_connections(), 0);
}

enum Step {
    Accept,
    Fail(io::ErrorKind),
}

/// Listener that plays back a fixed sequence of accept outcomes, then
/// blocks forever.
struct ScriptedListener {
    inner: TcpListener,
    steps: VecDeque<Step>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedListener {
    async fn bind(steps: impl IntoIterator<Item = Step>) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = Self {
            inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            steps: steps.into_iter().collect(),
            attempts: Arc::clone(&attempts),
        };
        (listener, attempts)
    }
}

impl Accept for ScriptedListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.pop_front();
        let inner = &self.inner;
        async move {
            match step {
                Some(Step::Accept) => TcpListener::accept(inner).await,
                Some(Step::Fail(kind)) => Err(io::Error::from(kind)),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[tokio::test]
async fn test_transient_accept_error_retried_then_fatal_error_returned() {
    init_test_logging();
    let server = Server::builder().build();
    let (listener, attempts) = ScriptedListener::bind([
        Step::Fail(io::ErrorKind::ConnectionAborted),
        Step::Fail(io::ErrorKind::PermissionDenied),
    ])
    .await;

    let result = tokio::time::timeout(WAIT, server.serve(listener))
        .await
        .expect("serve should return");

    match result {
        Err(ServerError::Accept(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("expected accept error, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(server.shutdown_state(), ShutdownState::Running);
    assert_eq!(server.active_listeners(), 0);
}

#[tokio::test]
async fn test_accept_error_still_returned_when_close_follows() {
    init_test_logging();
    let server = Server::builder()
        .grace_period(Duration::from_secs(30))
        .build();
    let (listener, attempts) = ScriptedListener::bind([
        Step::Accept,
        Step::Fail(io::ErrorKind::ConnectionAborted),
        Step::Fail(io::ErrorKind::PermissionDenied),
    ])
    .await;
    let addr = listener.local_addr().unwrap();
    let (_handle, serving) = start_closable(&server, listener).await;

    // The accept loop dies right after taking this connection, and serve
    // keeps waiting on it.
    let client = connect(addr).await;
    wait_until(|| server.active_listeners() == 0).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(server.open_connections(), 1);
    assert!(!serving.is_finished());

    assert!(server.close());
    client.disconnect();

    match finished(serving).await {
        Err(ServerError::Accept(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("expected accept error, got {other:?}"),
    }
    assert!(server.is_closed());
}

#[tokio::test]
async fn test_multiple_listeners_and_chained_observer() {
    init_test_logging();
    let seen: Arc<Mutex<Vec<(ConnectionId, ConnState)>>> = Arc::default();
    let sink = Arc::clone(&seen);

    let server = Server::builder()
        .grace_period(Duration::ZERO)
        .on_conn_state(Arc::new(move |conn: &ConnectionHandle, state: ConnState| {
            sink.lock().push((conn.id(), state));
        }))
        .build();

    let (first_addr, first_serving) = start(&server).await;
    let (second_addr, second_serving) = start(&server).await;
    assert_eq!(server.active_listeners(), 2);

    let mut first = connect(first_addr).await;
    let mut second = connect(second_addr).await;
    first.request("/").await.unwrap();
    second.request("/").await.unwrap();
    wait_until(|| server.idle_connections() == 2).await;

    assert!(server.close());
    assert!(finished(first_serving).await.is_ok());
    assert!(finished(second_serving).await.is_ok());

    let seen = seen.lock();
    let mut ids: Vec<ConnectionId> = seen.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 2);

    for id in ids {
        let states: Vec<ConnState> = seen
            .iter()
            .filter(|(seen_id, _)| *seen_id == id)
            .map(|(_, state)| *state)
            .collect();
        assert_eq!(
            states,
            vec![
                ConnState::New,
                ConnState::Active,
                ConnState::Idle,
                ConnState::Closed
            ]
        );
    }
}

fn upgrade_handler() -> Handler {
    handler_fn(|mut req: Request<hyper::body::Incoming>| async move {
        if let Some(conn) = req.extensions().get::<ConnectionHandle>() {
            conn.hijack();
        }
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = on_upgrade.await {
                let mut io = TokioIo::new(upgraded);
                let _ = io.write_all(b"hijacked").await;
                let _ = io.shutdown().await;
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "echo")
            .header(CONNECTION, "upgrade")
            .body(Full::new(Bytes::new()))
            .unwrap()
    })
}

#[tokio::test]
async fn test_upgraded_connection_is_hijacked() {
    init_test_logging();
    let last_state: Arc<Mutex<Option<ConnState>>> = Arc::default();
    let sink = Arc::clone(&last_state);

    let server = Server::builder()
        .grace_period(Duration::ZERO)
        .handler(upgrade_handler())
        .on_conn_state(Arc::new(move |_conn: &ConnectionHandle, state: ConnState| {
            *sink.lock() = Some(state);
        }))
        .build();
    let (addr, serving) = start(&server).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());

    let request = Request::get("/")
        .header(HOST, "localhost")
        .header(UPGRADE, "echo")
        .header(CONNECTION, "upgrade")
        .body(Empty::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let upgraded = hyper::upgrade::on(response).await.unwrap();
    let mut io = TokioIo::new(upgraded);
    let mut received = Vec::new();
    io.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hijacked");

    wait_until(|| server.open_connections() == 0).await;
    assert_eq!(*last_state.lock(), Some(ConnState::Hijacked));

    server.close();
    assert!(finished(serving).await.is_ok());
}
