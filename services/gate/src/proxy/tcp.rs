//! Raw TCP tunnel engine.
//!
//! Each accepted client gets one session:
//! 1. select the best line; none available closes the client and counts a
//!    failed tunnel
//! 2. tune the client socket
//! 3. relay client to backend, dialing the backend only after the first
//!    successful client read
//! 4. relay backend to client from a second task
//! 5. any read/write error or deadline on either side closes both sides

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use super::line::BackendLine;
use super::pool::{LinePool, LineSelector};
use super::session::{
    dial_backend, log_session_over, run_isolated, CloseSignal, SessionBytes, SessionTracker,
};
use super::socket::SocketTuning;
use crate::context::GateContext;
use crate::error::GateError;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct TcpShared {
    name: String,
    listen: String,
    pool: LinePool,
    tuning: SocketTuning,
    ctx: GateContext,
    sessions: Arc<SessionTracker>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// TCP tunnel engine: `Stopped -> Listening -> Stopped`.
pub struct TcpTunnel {
    shared: Arc<TcpShared>,
    state: Mutex<Option<Running>>,
}

impl TcpTunnel {
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        tuning: SocketTuning,
        ctx: GateContext,
    ) -> Self {
        let name = name.into();
        let pool = LinePool::new(name.clone(), ctx.started_at());
        Self {
            shared: Arc::new(TcpShared {
                name,
                listen: listen.into(),
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

    /// Configured listen address.
    pub fn listen(&self) -> &str {
        &self.shared.listen
    }

    pub fn pool(&self) -> &LinePool {
        &self.shared.pool
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.active()
    }

    /// Bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind, start probing and spawn the accept loop.
    ///
    /// Returns the bound address; calling it again while listening returns
    /// the same address.
    pub async fn start(&self) -> Result<SocketAddr, GateError> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            return Ok(running.local_addr);
        }

        let shared = &self.shared;
        if shared.pool.is_empty().await {
            error!(proxy = %shared.name, "Tcp tunnel has no lines");
            return Err(GateError::NoLines {
                name: shared.name.clone(),
            });
        }

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
        let accept = tokio::spawn(Arc::clone(shared).accept_loop(listener, shutdown_rx));

        let lines = shared.pool.len().await;
        info!(
            proxy = %shared.name,
            bind_addr = %local_addr,
            lines,
            "Tcp tunnel listening"
        );

        *state = Some(Running {
            local_addr,
            shutdown,
            accept,
        });
        Ok(local_addr)
    }

    /// Close the listener, stop probing and wait up to `grace` for in-flight
    /// sessions to drain. No-op when not listening.
    pub async fn stop(&self, grace: Duration) -> Result<(), GateError> {
        let Some(running) = self.state.lock().await.take() else {
            return Ok(());
        };
        let shared = &self.shared;
        let deadline = Instant::now() + grace;

        running.shutdown.send_replace(true);
        shared.pool.stop_probing().await;

        let accept_stopped = timeout(grace, running.accept).await.is_ok();
        let drained = shared
            .sessions
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;

        if accept_stopped && drained {
            info!(proxy = %shared.name, "Tcp tunnel stopped");
            Ok(())
        } else {
            let sessions = shared.sessions.active();
            warn!(proxy = %shared.name, sessions, "Tcp tunnel stop timed out");
            Err(GateError::StopTimeout {
                name: shared.name.clone(),
                sessions,
            })
        }
    }
}

#[async_trait]
impl LineSelector for TcpTunnel {
    async fn select_best(&self) -> Option<Arc<BackendLine>> {
        self.shared.pool.select_best().await
    }
}

impl TcpShared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = self.sessions.enter();
                        let shared = Arc::clone(&self);
                        tokio::spawn(
                            async move {
                                run_isolated(peer, shared.run_session(stream, peer)).await;
                                drop(session);
                            }
                            .instrument(info_span!("session", proxy = %self.name, peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(proxy = %self.name, error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(proxy = %self.name, "Tcp accept loop stopped");
    }

    async fn run_session(self: Arc<Self>, client: TcpStream, peer: SocketAddr) {
        let stats = self.ctx.stats();
        let _client_gauge = stats.client_opened();

        let Some(line) = self.pool.select_best().await else {
            info!(client = %peer, "Session failed, no line available");
            stats.update_failed_num(1);
            return;
        };

        self.tuning.apply(&client);
        let (mut client_rd, client_wr) = client.into_split();
        let mut client_wr = Some(client_wr);

        let close = CloseSignal::new();
        let mut closed = close.clone();
        let mut buf = vec![0u8; self.tuning.relay_buffer_len()];
        let mut c2s = SessionBytes::default();
        let mut backend: Option<OwnedWriteHalf> = None;
        let mut reverse: Option<JoinHandle<SessionBytes>> = None;
        let mut _link_guard = None;

        loop {
            let n = tokio::select! {
                _ = closed.closed() => break,
                read = self.tuning.read(&mut client_rd, &mut buf) => match read {
                    Ok(0) => {
                        info!(client = %peer, remote = %line.remote(), "Session closed by client");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        info!(client = %peer, remote = %line.remote(), error = %e, "Session closed, client read error");
                        break;
                    }
                },
            };

            if backend.is_none() {
                let Some(link) = dial_backend(&line, &self.tuning, &self.ctx, peer).await else {
                    break;
                };
                let (server_rd, server_wr, guard) = link.into_split();
                if let Some(writer) = client_wr.take() {
                    reverse = Some(tokio::spawn(
                        relay_to_client(Arc::clone(&self), server_rd, writer, close.clone())
                            .in_current_span(),
                    ));
                }
                backend = Some(server_wr);
                _link_guard = Some(guard);
            }

            c2s.client_in += n as u64;
            stats.update_client_in_size(n as u64);

            let Some(server_wr) = backend.as_mut() else {
                break;
            };
            let written = tokio::select! {
                _ = closed.closed() => break,
                written = self.tuning.write_all(server_wr, &buf[..n]) => written,
            };
            if let Err(e) = written {
                info!(client = %peer, remote = %line.remote(), error = %e, "Session closed, backend write error");
                break;
            }

            c2s.client_out += n as u64;
            stats.update_client_out_size(n as u64);
        }

        close.close();
        drop(backend);
        drop(client_wr);

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

/// Backend-to-client half of a TCP session.
async fn relay_to_client(
    shared: Arc<TcpShared>,
    mut server_rd: OwnedReadHalf,
    mut client_wr: OwnedWriteHalf,
    close: CloseSignal,
) -> SessionBytes {
    let stats = shared.ctx.stats();
    let tuning = &shared.tuning;
    let mut closed = close.clone();
    let mut buf = vec![0u8; tuning.relay_buffer_len()];
    let mut bytes = SessionBytes::default();

    loop {
        let n = tokio::select! {
            _ = closed.closed() => break,
            read = tuning.read(&mut server_rd, &mut buf) => match read {
                Ok(0) => {
                    info!("Session closed by backend");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    info!(error = %e, "Session closed, backend read error");
                    break;
                }
            },
        };

        bytes.server_in += n as u64;
        stats.update_server_in_size(n as u64);

        let written = tokio::select! {
            _ = closed.closed() => break,
            written = tuning.write_all(&mut client_wr, &buf[..n]) => written,
        };
        if let Err(e) = written {
            info!(error = %e, "Session closed, client write error");
            break;
        }

        bytes.server_out += n as u64;
        stats.update_server_out_size(n as u64);
    }

    close.close();
    bytes
}
