//! Pieces shared by TCP and WebSocket sessions: lazy backend dialing with its
//! accounting, byte tallies, panic isolation and live-session tracking.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{error, info};

use super::line::{BackendLine, LoadGuard};
use super::socket::SocketTuning;
use crate::context::GateContext;
use crate::stats::GaugeGuard;

/// Bytes moved by one session, from the relay's point of view.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionBytes {
    /// Read from the client.
    pub client_in: u64,
    /// Written to the backend.
    pub client_out: u64,
    /// Read from the backend.
    pub server_in: u64,
    /// Written to the client.
    pub server_out: u64,
}

impl SessionBytes {
    /// Combine the client-to-backend tally with the backend-to-client one.
    pub fn merge(self, other: SessionBytes) -> SessionBytes {
        SessionBytes {
            client_in: self.client_in + other.client_in,
            client_out: self.client_out + other.client_out,
            server_in: self.server_in + other.server_in,
            server_out: self.server_out + other.server_out,
        }
    }
}

/// Log the end-of-session summary.
pub(crate) fn log_session_over(client: SocketAddr, remote: &str, bytes: SessionBytes) {
    info!(
        client = %client,
        remote = %remote,
        client_read = bytes.client_in,
        client_write = bytes.client_out,
        server_read = bytes.server_in,
        server_write = bytes.server_out,
        "Session over"
    );
}

/// An established backend connection plus the accounting held while it lives.
#[derive(Debug)]
pub(crate) struct BackendLink {
    stream: TcpStream,
    guard: LinkGuard,
}

impl BackendLink {
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf, LinkGuard) {
        let (read, write) = self.stream.into_split();
        (read, write, self.guard)
    }
}

/// Line load and backend gauge of one established session.
#[derive(Debug)]
pub(crate) struct LinkGuard {
    _load: LoadGuard,
    _gauge: GaugeGuard,
}

/// Dial the chosen line for a session that just produced its first bytes.
///
/// On failure the line is marked unreachable, one dial failure is recorded on
/// the line and globally, and `None` is returned. On success the line load,
/// backend gauge and success counter are taken, the backend socket is tuned
/// and the redirect preamble (if enabled) is written before returning.
pub(crate) async fn dial_backend(
    line: &Arc<BackendLine>,
    tuning: &SocketTuning,
    ctx: &GateContext,
    client: SocketAddr,
) -> Option<BackendLink> {
    let stats = ctx.stats();
    let started = Instant::now();

    let stream = match timeout(line.timeout(), TcpStream::connect(line.remote())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!(client = %client, remote = %line.remote(), error = %e, "Session dial failed");
            dial_failed(line, ctx);
            return None;
        }
        Err(_) => {
            info!(client = %client, remote = %line.remote(), "Session dial timed out");
            dial_failed(line, ctx);
            return None;
        }
    };

    line.update_delay(Some(started.elapsed()));
    let load = line.acquire_load();
    let gauge = stats.server_opened();
    stats.update_success_num(1);
    info!(client = %client, remote = %line.remote(), "Session established");

    tuning.apply(&stream);

    let mut link = BackendLink {
        stream,
        guard: LinkGuard {
            _load: load,
            _gauge: gauge,
        },
    };
    if let Err(e) = line.inject_redirect(&mut link.stream, client).await {
        info!(client = %client, remote = %line.remote(), error = %e, "Redirect preamble failed");
        return None;
    }

    Some(link)
}

fn dial_failed(line: &BackendLine, ctx: &GateContext) {
    line.update_delay(None);
    line.record_failure();
    ctx.stats().update_failed_num(1);
}

/// Per-session close signal. Either relay direction can fire it; both watch it.
#[derive(Debug, Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Run a session future, containing any panic to that session.
pub(crate) async fn run_isolated<F>(peer: SocketAddr, session: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(session).catch_unwind().await {
        error!(peer = %peer, panic = %panic_message(panic.as_ref()), "Session panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Counts live sessions of one engine so `stop` can wait for them to drain.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    pub fn enter(self: &Arc<Self>) -> SessionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait up to `grace` for every session to finish. Returns `true` if idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        timeout(grace, drained).await.is_ok()
    }
}

/// Marks one live session; dropping it leaves the tracker.
#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_line(remote: &str, redirect: bool) -> Arc<BackendLine> {
        Arc::new(BackendLine::new(
            remote,
            Duration::from_millis(500),
            Duration::from_secs(60),
            10,
            redirect,
            Instant::now(),
        ))
    }

    #[test]
    fn test_session_bytes_merge() {
        let c2s = SessionBytes {
            client_in: 5,
            client_out: 5,
            ..Default::default()
        };
        let s2c = SessionBytes {
            server_in: 7,
            server_out: 7,
            ..Default::default()
        };
        assert_eq!(
            c2s.merge(s2c),
            SessionBytes {
                client_in: 5,
                client_out: 5,
                server_in: 7,
                server_out: 7,
            }
        );
    }

    #[tokio::test]
    async fn test_dial_failure_accounting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let ctx = GateContext::new();
        let line = test_line(&dead.to_string(), false);
        let client: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let link = dial_backend(&line, &SocketTuning::default(), &ctx, client).await;
        assert!(link.is_none());
        assert_eq!(line.failures_in_last_minutes(1), Some(1));
        assert_eq!(line.current_load(), 0);

        let s = ctx.stats().snapshot();
        assert_eq!(s.failed_num, 1);
        assert_eq!(s.success_num, 0);
        assert_eq!(s.out_num, 0);
    }

    #[tokio::test]
    async fn test_dial_success_holds_load_until_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ctx = GateContext::new();
        let line = test_line(&listener.local_addr().unwrap().to_string(), false);
        let client: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let link = dial_backend(&line, &SocketTuning::default(), &ctx, client)
            .await
            .unwrap();
        assert_eq!(line.current_load(), 1);
        assert_eq!(ctx.stats().snapshot().out_num, 1);
        assert_eq!(ctx.stats().snapshot().success_num, 1);

        drop(link);
        assert_eq!(line.current_load(), 0);
        assert_eq!(ctx.stats().snapshot().out_num, 0);
    }

    #[tokio::test]
    async fn test_close_signal_wakes_all_clones() {
        let signal = CloseSignal::new();
        let mut a = signal.clone();
        let mut b = signal.clone();

        let waiter = tokio::spawn(async move {
            a.closed().await;
            b.closed().await;
        });
        signal.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_isolated_contains_panic() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        run_isolated(peer, async { panic!("boom") }).await;
    }

    #[tokio::test]
    async fn test_tracker_waits_for_sessions() {
        let tracker = Arc::new(SessionTracker::default());
        assert!(tracker.wait_idle(Duration::from_millis(10)).await);

        let guard = tracker.enter();
        assert_eq!(tracker.active(), 1);
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(tracker.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(tracker.active(), 0);
    }
}
