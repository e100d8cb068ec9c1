use std::{
    future::IntoFuture,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::sync::{CodeView, RenderedEntry};

/// How long `start` waits for the server thread to report a bound listener.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);
/// How long in-flight requests get to finish once a stop is requested.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("Could not listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Could not start the server runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("The server did not come up within {0:?}")]
    Timeout(Duration),
    #[error("The server thread exited before binding")]
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running { port: u16 },
}

/// Cleans up a server thread whose start failed.
///
/// After a timeout the thread may still be stuck building the runtime or
/// binding, so it is left to exit on its own once it sees the closed ready
/// channel.
fn abandon(thread: thread::JoinHandle<()>, error: &BindError) {
    if matches!(error, BindError::Timeout(_)) {
        debug!("detaching code server thread after start timeout");
        return;
    }
    let _ = thread.join();
}

/// One live binding.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Binds `127.0.0.1:port` and serves `view` until stopped.
    ///
    /// Port `0` picks any free port; [`ServerHandle::addr`] reports it.
    pub fn start(view: Arc<CodeView>, port: u16) -> Result<Self, BindError> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let thread = thread::Builder::new()
            .name(format!("code-server-{port}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BindError::Runtime(e)));
                        return;
                    }
                };

                let listener = match rt.block_on(tokio::net::TcpListener::bind(bind_addr)) {
                    Ok(listener) => listener,
                    Err(source) => {
                        let _ = ready_tx.send(Err(BindError::Bind { port, source }));
                        return;
                    }
                };
                let local_addr = match listener.local_addr() {
                    Ok(addr) => addr,
                    Err(source) => {
                        let _ = ready_tx.send(Err(BindError::Bind { port, source }));
                        return;
                    }
                };
                if ready_tx.send(Ok(local_addr)).is_err() {
                    // Nobody is waiting any more; do not serve.
                    return;
                }

                if let Err(e) = rt.block_on(serve_until_stopped(listener, router(view), shutdown_rx))
                {
                    error!(addr = %local_addr, "code server error: {e}");
                }
                debug!(addr = %local_addr, "code server thread finished");
            })
            .map_err(BindError::Runtime)?;

        let outcome = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(BindError::Timeout(START_TIMEOUT)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BindError::Exited),
        };

        match outcome {
            Ok(addr) => {
                info!(addr = %addr, "code server listening");
                Ok(Self {
                    addr,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                })
            }
            Err(e) => {
                // Make sure a late bind never ends up accepting connections.
                drop(ready_rx);
                let _ = shutdown_tx.send(());
                abandon(thread, &e);
                warn!(port, "code server failed to start: {e}");
                Err(e)
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stops accepting connections and waits for the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(addr = %self.addr, "code server thread panicked");
            }
            info!(addr = %self.addr, "code server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_until_stopped(
    listener: tokio::net::TcpListener,
    app: Router,
    stop: oneshot::Receiver<()>,
) -> io::Result<()> {
    let (graceful_tx, graceful_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = stop => {}
    }

    let _ = graceful_tx.send(());
    match tokio::time::timeout(STOP_GRACE, server).await {
        Ok(result) => result,
        Err(_) => {
            warn!("code server did not drain within {STOP_GRACE:?}, dropping connections");
            Ok(())
        }
    }
}

pub(crate) fn router(view: Arc<CodeView>) -> Router {
    Router::new()
        .route("/", get(list_codes))
        .route("/codes/{label}", get(single_code))
        .with_state(view)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CodePayload {
    label: String,
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    remaining_seconds: u64,
}

impl CodePayload {
    fn new(entry: &RenderedEntry, remaining_seconds: u64) -> Self {
        let (code, error) = match &entry.code {
            Ok(code) => (Some(code.to_string()), None),
            Err(e) => (None, Some(e.to_string())),
        };

        Self {
            label: entry.label.clone(),
            code,
            error,
            remaining_seconds,
        }
    }
}

async fn list_codes(
    State(view): State<Arc<CodeView>>,
    RawQuery(query): RawQuery,
) -> Json<Vec<CodePayload>> {
    let wanted: Vec<String> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(key, _)| key == "label")
                .map(|(_, value)| value.into_owned())
                .collect()
        })
        .unwrap_or_default();

    let snapshot = view.snapshot();
    let remaining = snapshot.window.seconds_remaining;

    let payload = snapshot
        .entries
        .iter()
        .filter(|entry| wanted.is_empty() || wanted.contains(&entry.label))
        .map(|entry| CodePayload::new(entry, remaining))
        .collect();

    Json(payload)
}

async fn single_code(State(view): State<Arc<CodeView>>, Path(label): Path<String>) -> Response {
    let snapshot = view.snapshot();

    match snapshot.code_for(&label) {
        Some(Ok(code)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            code.to_string(),
        )
            .into_response(),
        Some(Err(e)) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
        None => (StatusCode::NOT_FOUND, format!("No key labelled {label:?}")).into_response(),
    }
}

/// Owns at most one [`ServerHandle`] and handles restarts.
pub struct CodeServer {
    view: Arc<CodeView>,
    handle: Option<ServerHandle>,
}

impl CodeServer {
    pub fn new(view: Arc<CodeView>) -> Self {
        Self { view, handle: None }
    }

    pub fn state(&self) -> ServerState {
        match &self.handle {
            Some(handle) => ServerState::Running {
                port: handle.port(),
            },
            None => ServerState::Stopped,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(ServerHandle::addr)
    }

    /// Stops any current binding, then binds `port`.
    ///
    /// On failure the server stays stopped; the old binding is not restored.
    pub fn start(&mut self, port: u16) -> Result<SocketAddr, BindError> {
        self.stop();

        let handle = ServerHandle::start(self.view.clone(), port)?;
        let addr = handle.addr();
        self.handle = Some(handle);

        Ok(addr)
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
    }
}

impl Drop for CodeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        clock::ManualClock,
        store::{MemoryStore, SecretEntry, SecretStore},
    };

    const T: u64 = 1_700_000_010;

    fn fixture() -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<CodeView>) {
        let clock = Arc::new(ManualClock::new(T + 5));
        let store = Arc::new(MemoryStore::with_entries([
            SecretEntry::new("github", "SECRETA"),
            SecretEntry::new("broken", "not base32!"),
        ]));
        let view = Arc::new(CodeView::new(store.clone(), clock.clone()));

        (clock, store, view)
    }

    fn get(addr: SocketAddr, path: &str) -> reqwest::Result<reqwest::blocking::Response> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?
            .get(format!("http://{addr}{path}"))
            .send()
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    #[test]
    fn timed_out_start_does_not_wait_for_the_thread() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let stuck = thread::spawn(move || {
            let _ = release_rx.recv();
        });

        let begun = std::time::Instant::now();
        abandon(stuck, &BindError::Timeout(START_TIMEOUT));
        assert!(begun.elapsed() < Duration::from_secs(1));

        drop(release_tx);
    }

    #[test]
    fn failed_start_joins_the_thread() {
        let (done_tx, done_rx) = mpsc::channel();
        let finished = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = done_tx.send(());
        });

        abandon(finished, &BindError::Exited);
        assert!(done_rx.try_recv().is_ok());
    }

    #[test]
    fn serves_every_code() {
        let (_clock, _store, view) = fixture();
        let handle = ServerHandle::start(view, 0).unwrap();

        let body: Value = get(handle.addr(), "/").unwrap().json().unwrap();
        assert_eq!(
            json!([
                {"label": "github", "code": "366875", "remaining_seconds": 25},
                {
                    "label": "broken",
                    "code": null,
                    "error": body[1]["error"].clone(),
                    "remaining_seconds": 25
                },
            ]),
            body
        );
        assert!(body[1]["error"].as_str().unwrap().contains("Invalid secret"));
    }

    #[test]
    fn filters_by_label() {
        let (_clock, store, view) = fixture();
        store.add("aws", "SECRETB").unwrap();
        let handle = ServerHandle::start(view, 0).unwrap();

        let body: Value = get(handle.addr(), "/?label=aws&label=github&label=missing")
            .unwrap()
            .json()
            .unwrap();
        let labels: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["label"].as_str().unwrap())
            .collect();

        assert_eq!(vec!["github", "aws"], labels);
    }

    #[test]
    fn single_code_statuses() {
        let (clock, _store, view) = fixture();
        let handle = ServerHandle::start(view, 0).unwrap();

        let ok = get(handle.addr(), "/codes/github").unwrap();
        assert_eq!(reqwest::StatusCode::OK, ok.status());
        assert_eq!("366875", ok.text().unwrap());

        clock.set(T + 31);
        assert_eq!("728474", get(handle.addr(), "/codes/github").unwrap().text().unwrap());

        assert_eq!(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            get(handle.addr(), "/codes/broken").unwrap().status()
        );
        assert_eq!(
            reqwest::StatusCode::NOT_FOUND,
            get(handle.addr(), "/codes/nope").unwrap().status()
        );
    }

    #[test]
    fn stop_is_idempotent_and_closes_the_port() {
        let (_clock, _store, view) = fixture();
        let mut handle = ServerHandle::start(view, 0).unwrap();
        let addr = handle.addr();

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        assert!(get(addr, "/").is_err());
    }

    #[test]
    fn stopping_a_never_started_server_is_a_noop() {
        let (_clock, _store, view) = fixture();
        let mut server = CodeServer::new(view);

        server.stop();
        assert_eq!(ServerState::Stopped, server.state());
    }

    #[test]
    fn restart_moves_to_the_new_port() {
        let (_clock, _store, view) = fixture();
        let mut server = CodeServer::new(view);
        let first = server.start(free_port()).unwrap();
        assert!(get(first, "/").is_ok());

        let second = server.start(free_port()).unwrap();
        assert_eq!(
            ServerState::Running {
                port: second.port()
            },
            server.state()
        );
        assert!(get(first, "/").is_err());

        let body: Value = get(second, "/").unwrap().json().unwrap();
        assert_eq!("366875", body[0]["code"]);
    }

    #[test]
    fn failed_restart_leaves_server_stopped() {
        let (_clock, _store, view) = fixture();
        let mut server = CodeServer::new(view);
        let first = server.start(0).unwrap();

        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        assert!(matches!(
            server.start(taken),
            Err(BindError::Bind { port, .. }) if port == taken
        ));
        assert_eq!(ServerState::Stopped, server.state());
        assert!(get(first, "/").is_err());
    }
}
