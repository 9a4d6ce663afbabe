//! WebSocket-to-TCP tunnel engine.
//!
//! Clients connect over WebSocket (optionally TLS) on the configured paths.
//! The backend speaks the 16-byte-header framing from `linegate_wire`:
//! - client to backend: every message is written to the backend verbatim
//! - backend to client: each whole frame (header and body) becomes one message
//!
//! Line selection happens before the upgrade so a client with no usable line
//! gets a plain 404. The backend is dialed on the first client message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use linegate_wire::{FrameReader, WireError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, info_span, warn, Instrument};

use super::line::BackendLine;
use super::listener::{PeerAddr, TlsListener, TunedListener};
use super::pool::{LinePool, LineSelector};
use super::session::{
    dial_backend, log_session_over, run_isolated, CloseSignal, SessionBytes, SessionTracker,
};
use super::socket::SocketTuning;
use crate::config::CertConfig;
use crate::context::GateContext;
use crate::error::GateError;
use crate::tls;

/// Upgrade path when none is configured.
pub const DEFAULT_WS_PATH: &str = "/gate/ws";

/// Upgrade path when none is configured and TLS is on.
pub const DEFAULT_WSS_PATH: &str = "/gate/wss";

struct WsShared {
    name: String,
    listen: String,
    paths: Vec<String>,
    certs: Option<Vec<CertConfig>>,
    pool: LinePool,
    tuning: SocketTuning,
    ctx: GateContext,
    sessions: Arc<SessionTracker>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
}

/// WebSocket tunnel engine: `Stopped -> Listening -> Stopped`.
pub struct WsTunnel {
    shared: Arc<WsShared>,
    state: Mutex<Option<Running>>,
}

impl WsTunnel {
    /// Plain WebSocket engine. `paths` empty means the default path.
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        paths: Vec<String>,
        tuning: SocketTuning,
        ctx: GateContext,
    ) -> Self {
        Self::build(name.into(), listen.into(), paths, None, tuning, ctx)
    }

    /// TLS WebSocket engine presenting `certs`.
    pub fn with_tls(
        name: impl Into<String>,
        listen: impl Into<String>,
        paths: Vec<String>,
        certs: Vec<CertConfig>,
        tuning: SocketTuning,
        ctx: GateContext,
    ) -> Self {
        Self::build(name.into(), listen.into(), paths, Some(certs), tuning, ctx)
    }

    fn build(
        name: String,
        listen: String,
        mut paths: Vec<String>,
        certs: Option<Vec<CertConfig>>,
        tuning: SocketTuning,
        ctx: GateContext,
    ) -> Self {
        if paths.is_empty() {
            let default = if certs.is_some() {
                DEFAULT_WSS_PATH
            } else {
                DEFAULT_WS_PATH
            };
            paths.push(default.to_string());
        }
        paths.sort();
        paths.dedup();

        let pool = LinePool::new(name.clone(), ctx.started_at());
        Self {
            shared: Arc::new(WsShared {
                name,
                listen,
                paths,
                certs,
                pool,
                tuning,
                ctx,
                sessions: Arc::new(SessionTracker::default()),
            }),
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn listen(&self) -> &str {
        &self.shared.listen
    }

    /// Upgrade paths served by this engine.
    pub fn paths(&self) -> &[String] {
        &self.shared.paths
    }

    pub fn is_tls(&self) -> bool {
        self.shared.certs.is_some()
    }

    pub fn pool(&self) -> &LinePool {
        &self.shared.pool
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.active()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Load certificates, bind, start probing and spawn the HTTP server.
    pub async fn start(&self) -> Result<SocketAddr, GateError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            return Ok(running.local_addr);
        }

        let shared = &self.shared;
        if shared.pool.is_empty().await {
            error!(proxy = %shared.name, "WebSocket tunnel has no lines");
            return Err(GateError::NoLines {
                name: shared.name.clone(),
            });
        }
        if let Some(path) = shared.paths.iter().find(|p| !p.starts_with('/')) {
            return Err(GateError::InvalidConfig(format!(
                "proxy {}: path {path:?} must start with '/'",
                shared.name
            )));
        }

        let acceptor = match &shared.certs {
            Some(certs) if certs.is_empty() => {
                error!(proxy = %shared.name, "TLS enabled without certificates");
                return Err(GateError::MissingCertificates {
                    name: shared.name.clone(),
                });
            }
            Some(certs) => {
                let config = tls::server_config(certs).map_err(|source| GateError::Tls {
                    name: shared.name.clone(),
                    source,
                })?;
                Some(TlsAcceptor::from(config))
            }
            None => None,
        };

        let bind_err = |source| GateError::Bind {
            name: shared.name.clone(),
            addr: shared.listen.clone(),
            source,
        };
        let listener = TcpListener::bind(shared.listen.as_str())
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        shared.pool.start_probing().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(
            Arc::clone(shared),
            listener,
            acceptor,
            shutdown_rx,
        ));

        let lines = shared.pool.len().await;
        info!(
            proxy = %shared.name,
            bind_addr = %local_addr,
            tls = shared.certs.is_some(),
            paths = ?shared.paths,
            lines,
            "WebSocket tunnel listening"
        );

        *state = Some(Running {
            local_addr,
            shutdown,
            server,
        });
        Ok(local_addr)
    }

    /// Stop serving, stop probing and wait up to `grace` for sessions to drain.
    pub async fn stop(&self, grace: Duration) -> Result<(), GateError> {
        let Some(running) = self.state.lock().await.take() else {
            return Ok(());
        };
        let shared = &self.shared;
        let deadline = Instant::now() + grace;

        running.shutdown.send_replace(true);
        shared.pool.stop_probing().await;

        let server_stopped = timeout(grace, running.server).await.is_ok();
        let drained = shared
            .sessions
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;

        if server_stopped && drained {
            info!(proxy = %shared.name, "WebSocket tunnel stopped");
            Ok(())
        } else {
            let sessions = shared.sessions.active();
            warn!(proxy = %shared.name, sessions, "WebSocket tunnel stop timed out");
            Err(GateError::StopTimeout {
                name: shared.name.clone(),
                sessions,
            })
        }
    }
}

#[async_trait]
impl LineSelector for WsTunnel {
    async fn select_best(&self) -> Option<Arc<BackendLine>> {
        self.shared.pool.select_best().await
    }
}

fn router(shared: Arc<WsShared>) -> Router {
    let mut router = Router::new();
    for path in &shared.paths {
        router = router.route(path, get(upgrade));
    }
    router.fallback(not_found).with_state(shared)
}

async fn serve(
    shared: Arc<WsShared>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = shared.name.clone();
    let tuning = shared.tuning;
    let app = router(shared).into_make_service_with_connect_info::<PeerAddr>();
    let signal = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };

    let result = match acceptor {
        Some(acceptor) => match TlsListener::new(listener, acceptor, tuning) {
            Ok(listener) => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(signal)
                    .await
            }
            Err(e) => Err(e),
        },
        None => {
            axum::serve(TunedListener::new(listener, tuning), app)
                .with_graceful_shutdown(signal)
                .await
        }
    };

    match result {
        Ok(()) => info!(proxy = %name, "WebSocket server stopped"),
        Err(e) => error!(proxy = %name, error = %e, "WebSocket server failed"),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn upgrade(
    State(shared): State<Arc<WsShared>>,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(line) = shared.pool.select_best().await else {
        info!(proxy = %shared.name, client = %peer, "Session failed, no line available");
        shared.ctx.stats().update_failed_num(1);
        return StatusCode::NOT_FOUND.into_response();
    };

    let session = shared.sessions.enter();
    let span = info_span!("session", proxy = %shared.name, peer = %peer);
    ws.on_upgrade(move |socket| {
        async move {
            run_isolated(peer, shared.run_session(socket, peer, line)).await;
            drop(session);
        }
        .instrument(span)
    })
}

type ClientSink = SplitSink<WebSocket, Message>;

impl WsShared {
    async fn run_session(self: Arc<Self>, socket: WebSocket, peer: SocketAddr, line: Arc<BackendLine>) {
        let stats = self.ctx.stats();
        let _client_gauge = stats.client_opened();

        let (sink, mut client_rx) = socket.split();
        let mut sink = Some(sink);

        let close = CloseSignal::new();
        let mut closed = close.clone();
        let mut c2s = SessionBytes::default();
        let mut backend: Option<OwnedWriteHalf> = None;
        let mut reverse: Option<JoinHandle<SessionBytes>> = None;
        let mut _link_guard = None;

        loop {
            let received = tokio::select! {
                _ = closed.closed() => break,
                received = timeout(self.tuning.read_deadline, client_rx.next()) => received,
            };
            let payload: Bytes = match received {
                Ok(Some(Ok(Message::Binary(data)))) => data,
                Ok(Some(Ok(Message::Text(text)))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                    info!(client = %peer, remote = %line.remote(), "Session closed by client");
                    break;
                }
                Ok(Some(Err(e))) => {
                    info!(client = %peer, remote = %line.remote(), error = %e, "Session closed, client read error");
                    break;
                }
                Err(_) => {
                    info!(client = %peer, remote = %line.remote(), "Session closed, client read deadline");
                    break;
                }
            };

            if backend.is_none() {
                let Some(link) = dial_backend(&line, &self.tuning, &self.ctx, peer).await else {
                    break;
                };
                let (server_rd, server_wr, guard) = link.into_split();
                if let Some(sink) = sink.take() {
                    reverse = Some(tokio::spawn(
                        relay_frames_to_client(Arc::clone(&self), server_rd, sink, close.clone())
                            .in_current_span(),
                    ));
                }
                backend = Some(server_wr);
                _link_guard = Some(guard);
            }

            let n = payload.len() as u64;
            c2s.client_in += n;
            stats.update_client_in_size(n);

            let Some(server_wr) = backend.as_mut() else {
                break;
            };
            let written = tokio::select! {
                _ = closed.closed() => break,
                written = self.tuning.write_all(server_wr, &payload) => written,
            };
            if let Err(e) = written {
                info!(client = %peer, remote = %line.remote(), error = %e, "Session closed, backend write error");
                break;
            }

            c2s.client_out += n;
            stats.update_client_out_size(n);
        }

        close.close();
        drop(backend);

        // Never dialed: close the client here since no reverse relay owns it.
        if let Some(mut sink) = sink.take() {
            let _ = timeout(self.tuning.write_deadline, sink.close()).await;
        }

        let s2c = match reverse {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(client = %peer, error = %e, "Reverse relay failed");
                SessionBytes::default()
            }),
            None => SessionBytes::default(),
        };

        log_session_over(peer, line.remote(), c2s.merge(s2c));
    }
}

/// One WebSocket message for a backend frame: text when the span is valid
/// UTF-8, binary otherwise.
///
/// This deliberately departs from gateways that send every frame as a text
/// message. A text message must be UTF-8 and the span has to reach the
/// client byte for byte, so spans that are not valid UTF-8 go out as binary.
fn frame_message(span: &[u8]) -> Message {
    match std::str::from_utf8(span) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(Bytes::copy_from_slice(span)),
    }
}

/// Backend-to-client half of a WebSocket session.
async fn relay_frames_to_client(
    shared: Arc<WsShared>,
    mut server_rd: OwnedReadHalf,
    mut sink: ClientSink,
    close: CloseSignal,
) -> SessionBytes {
    let stats = shared.ctx.stats();
    let tuning = &shared.tuning;
    let mut closed = close.clone();
    let mut reader = FrameReader::new(tuning.relay_buffer_len());
    let mut bytes = SessionBytes::default();

    loop {
        let frame = tokio::select! {
            _ = closed.closed() => break,
            frame = reader.read_frame(&mut server_rd, tuning.read_deadline) => frame,
        };
        let (message, n) = match frame {
            Ok(span) => {
                let n = span.len() as u64;
                bytes.server_in += n;
                stats.update_server_in_size(n);
                (frame_message(span), n)
            }
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Session closed by backend");
                break;
            }
            Err(e) => {
                info!(error = %e, "Session closed, backend read error");
                break;
            }
        };

        let sent = tokio::select! {
            _ = closed.closed() => break,
            sent = timeout(tuning.write_deadline, sink.send(message)) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!(error = %e, "Session closed, client write error");
                break;
            }
            Err(_) => {
                info!("Session closed, client write deadline");
                break;
            }
        }

        bytes.server_out += n;
        stats.update_server_out_size(n);
    }

    close.close();
    let _ = timeout(tuning.write_deadline, sink.close()).await;
    bytes
}
