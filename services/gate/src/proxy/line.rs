//! Health-checked backend lines.
//!
//! A line is one backend address. It owns:
//! - a probe loop that periodically connects to the backend and records the
//!   connect latency (or marks the line unreachable)
//! - a load counter paired by [`LoadGuard`]
//! - a pause flag that removes the line from selection without stopping probes
//! - a per-minute ring of dial failures reported by live tunnels
//!
//! Every field is synchronized on its own, so any number of sessions can
//! score and update lines concurrently.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use linegate_wire::real_ip_frame;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::failures::FailureRing;

/// Delay value meaning "unreachable".
const UNREACHABLE: u64 = u64::MAX;

/// Capacity of the external delay update queue.
pub const DELAY_QUEUE_CAPACITY: usize = 1024;

/// Write deadline for the real-IP preamble.
pub const REDIRECT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One health-checked backend target.
#[derive(Debug)]
pub struct BackendLine {
    remote: String,
    timeout: Duration,
    interval: Duration,
    max_load: i64,
    redirect: bool,
    /// Last latency in nanoseconds, or `UNREACHABLE`.
    delay_nanos: AtomicU64,
    current_load: AtomicI64,
    paused: AtomicBool,
    failures: Mutex<FailureRing>,
    /// Sender side of the delay update queue while the probe loop runs.
    updates: Mutex<Option<mpsc::Sender<Option<Duration>>>>,
}

impl BackendLine {
    /// Create a line. It starts unreachable until the first probe.
    ///
    /// `origin` anchors the failure ring's minute buckets.
    pub fn new(
        remote: impl Into<String>,
        timeout: Duration,
        interval: Duration,
        max_load: i64,
        redirect: bool,
        origin: Instant,
    ) -> Self {
        Self {
            remote: remote.into(),
            timeout,
            interval,
            max_load,
            redirect,
            delay_nanos: AtomicU64::new(UNREACHABLE),
            current_load: AtomicI64::new(0),
            paused: AtomicBool::new(false),
            failures: Mutex::new(FailureRing::new(origin, Instant::now())),
            updates: Mutex::new(None),
        }
    }

    /// Backend address.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Probe timeout, also used as the tunnel dial timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_load(&self) -> i64 {
        self.max_load
    }

    pub fn redirect(&self) -> bool {
        self.redirect
    }

    /// Whether the probe loop is active.
    pub fn is_running(&self) -> bool {
        lock(&self.updates).is_some()
    }

    /// Last measured latency; `None` when unreachable.
    pub fn delay(&self) -> Option<Duration> {
        match self.delay_nanos.load(Ordering::Relaxed) {
            UNREACHABLE => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    fn store_delay(&self, delay: Option<Duration>) {
        let nanos = match delay {
            Some(d) => u64::try_from(d.as_nanos()).unwrap_or(UNREACHABLE - 1),
            None => UNREACHABLE,
        };
        self.delay_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Start the probe loop. No-op when already running.
    ///
    /// Probes once before returning so a freshly started line is scored on
    /// real data.
    pub async fn start(self: &Arc<Self>) {
        let updates = {
            let mut sender = lock(&self.updates);
            if sender.is_some() {
                return;
            }
            let (tx, rx) = mpsc::channel(DELAY_QUEUE_CAPACITY);
            *sender = Some(tx);
            rx
        };

        self.probe().await;
        tokio::spawn(Arc::clone(self).probe_loop(updates));
    }

    /// Stop the probe loop. No-op when not running.
    pub fn stop(&self) {
        // Dropping the sender closes the queue, which ends the loop.
        if lock(&self.updates).take().is_some() {
            debug!(remote = %self.remote, "Line probing stopped");
        }
    }

    async fn probe_loop(self: Arc<Self>, mut updates: mpsc::Receiver<Option<Duration>>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.probe().await,
                update = updates.recv() => match update {
                    Some(delay) => self.store_delay(delay),
                    None => break,
                },
            }
        }
    }

    /// Connect to the backend within the probe timeout and record the latency.
    ///
    /// Probe failures only mark the line unreachable; the failure ring counts
    /// tunnel dial failures alone.
    pub async fn probe(&self) {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(self.remote.as_str())).await {
            Ok(Ok(_stream)) => {
                let delay = started.elapsed();
                self.store_delay(Some(delay));
                info!(remote = %self.remote, delay = ?delay, "Line probe ok");
            }
            Ok(Err(e)) => {
                self.store_delay(None);
                error!(remote = %self.remote, error = %e, "Line probe failed");
            }
            Err(_) => {
                self.store_delay(None);
                error!(remote = %self.remote, timeout = ?self.timeout, "Line probe timed out");
            }
        }
    }

    /// Push a delay measured by a live tunnel (`None` = unreachable).
    ///
    /// Never blocks: the update is dropped when the line is not running or the
    /// queue is full. An accepted update re-arms the probe timer.
    pub fn update_delay(&self, delay: Option<Duration>) {
        if let Some(sender) = lock(&self.updates).as_ref() {
            let _ = sender.try_send(delay);
        }
    }

    /// Current concurrent sessions on this line.
    pub fn current_load(&self) -> i64 {
        self.current_load.load(Ordering::Relaxed)
    }

    /// Adjust the session counter. Prefer [`BackendLine::acquire_load`].
    pub fn update_load(&self, delta: i64) {
        self.current_load.fetch_add(delta, Ordering::Relaxed);
    }

    /// Count one session until the returned guard drops.
    pub fn acquire_load(self: &Arc<Self>) -> LoadGuard {
        self.update_load(1);
        LoadGuard {
            line: Arc::clone(self),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Exclude the line from selection. Probing continues.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Re-enable the line, probing first so it is not chosen on stale data.
    pub async fn unpause(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.probe().await;
    }

    /// Remaining capacity, or -1 when the line is unusable.
    pub fn score(&self) -> i64 {
        let load = self.current_load();
        if !self.is_paused() && self.delay().is_some() && load < self.max_load {
            self.max_load - load
        } else {
            -1
        }
    }

    /// Record one tunnel dial failure in the current minute.
    pub fn record_failure(&self) {
        lock(&self.failures).record_at(Instant::now());
    }

    /// Dial failures in the last `minutes` minutes; `None` unless 1..=60.
    pub fn failures_in_last_minutes(&self, minutes: usize) -> Option<u64> {
        lock(&self.failures).failures_in_last_at(minutes, Instant::now())
    }

    /// Write the real-IP preamble when this line has redirect enabled.
    ///
    /// Must run right after dialing, before any relayed byte. Returns whether
    /// a preamble was written.
    pub async fn inject_redirect<W>(&self, backend: &mut W, client: SocketAddr) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.redirect {
            return Ok(false);
        }

        let frame = real_ip_frame(client.ip());
        match timeout(REDIRECT_WRITE_TIMEOUT, backend.write_all(&frame)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "redirect preamble write timeout",
                ))
            }
        }

        debug!(remote = %self.remote, client = %client.ip(), "Redirect preamble sent");
        Ok(true)
    }
}

/// Holds one unit of line load; releases it on drop, including during unwinding.
#[derive(Debug)]
pub struct LoadGuard {
    line: Arc<BackendLine>,
}

impl LoadGuard {
    pub fn line(&self) -> &Arc<BackendLine> {
        &self.line
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.line.update_load(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linegate_wire::parse_real_ip;
    use rstest::rstest;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use tokio::net::TcpListener;

    const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

    fn line(remote: &str, max_load: i64, redirect: bool) -> Arc<BackendLine> {
        Arc::new(BackendLine::new(
            remote,
            PROBE_TIMEOUT,
            Duration::from_secs(60),
            max_load,
            redirect,
            Instant::now(),
        ))
    }

    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_new_line_is_unreachable() {
        let line = line("127.0.0.1:1", 10, false);
        assert_eq!(line.delay(), None);
        assert_eq!(line.score(), -1);
        assert!(!line.is_running());
    }

    #[rstest]
    #[case::usable(false, true, 2, 10, 8)]
    #[case::idle(false, true, 0, 3, 3)]
    #[case::paused(true, true, 0, 10, -1)]
    #[case::unreachable(false, false, 0, 10, -1)]
    #[case::at_capacity(false, true, 10, 10, -1)]
    #[case::over_capacity(false, true, 11, 10, -1)]
    fn test_score(
        #[case] paused: bool,
        #[case] reachable: bool,
        #[case] load: i64,
        #[case] max_load: i64,
        #[case] expected: i64,
    ) {
        let line = line("127.0.0.1:1", max_load, false);
        if reachable {
            line.store_delay(Some(Duration::from_millis(3)));
        }
        if paused {
            line.pause();
        }
        line.update_load(load);

        assert_eq!(line.score(), expected);
    }

    #[test]
    fn test_load_guard_released_on_panic() {
        let line = line("127.0.0.1:1", 10, false);
        let held = Arc::clone(&line);

        let result = catch_unwind(AssertUnwindSafe(move || {
            let _guard = held.acquire_load();
            assert_eq!(held.current_load(), 1);
            panic!("session blew up");
        }));

        assert!(result.is_err());
        assert_eq!(line.current_load(), 0);
    }

    #[test]
    fn test_update_load_pairs() {
        let line = line("127.0.0.1:1", 10, false);
        line.update_load(1);
        line.update_load(-1);
        assert_eq!(line.current_load(), 0);
    }

    #[test]
    fn test_record_failure_same_minute() {
        let line = line("127.0.0.1:1", 10, false);
        for _ in 0..3 {
            line.record_failure();
        }
        assert_eq!(line.failures_in_last_minutes(1), Some(3));
        assert_eq!(line.failures_in_last_minutes(0), None);
        assert_eq!(line.failures_in_last_minutes(61), None);
    }

    #[test]
    fn test_update_delay_dropped_when_not_running() {
        let line = line("127.0.0.1:1", 10, false);
        line.update_delay(Some(Duration::from_millis(1)));
        assert_eq!(line.delay(), None);
    }

    #[tokio::test]
    async fn test_start_probes_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let line = line(&listener.local_addr().unwrap().to_string(), 10, false);

        line.start().await;
        assert!(line.is_running());
        assert!(line.delay().is_some());
        assert_eq!(line.score(), 10);

        // Second start is a no-op.
        line.start().await;
        assert!(line.is_running());

        line.stop();
        line.stop();
        assert!(!line.is_running());
    }

    #[tokio::test]
    async fn test_update_delay_applied_by_probe_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let line = line(&listener.local_addr().unwrap().to_string(), 10, false);
        line.start().await;

        line.update_delay(None);
        let mut applied = false;
        for _ in 0..50 {
            if line.delay().is_none() {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied, "queued delay update should reach the line");

        line.stop();
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_count_as_dial_failure() {
        let addr = dead_addr().await;
        let line = line(&addr.to_string(), 10, false);

        line.probe().await;
        assert_eq!(line.delay(), None);
        assert_eq!(line.failures_in_last_minutes(60), Some(0));
    }

    #[tokio::test]
    async fn test_unpause_reprobes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let line = line(&listener.local_addr().unwrap().to_string(), 10, false);

        line.pause();
        assert_eq!(line.score(), -1);

        line.unpause().await;
        assert!(!line.is_paused());
        assert!(line.delay().is_some());
        assert_eq!(line.score(), 10);
    }

    #[tokio::test]
    async fn test_inject_redirect() {
        let client: SocketAddr = "10.1.2.3:4567".parse().unwrap();

        let enabled = line("127.0.0.1:1", 10, true);
        let mut sink = Vec::new();
        assert!(enabled.inject_redirect(&mut sink, client).await.unwrap());
        assert_eq!(
            parse_real_ip(&sink).unwrap(),
            "10.1.2.3".parse::<std::net::IpAddr>().unwrap()
        );

        let disabled = line("127.0.0.1:1", 10, false);
        let mut sink = Vec::new();
        assert!(!disabled.inject_redirect(&mut sink, client).await.unwrap());
        assert!(sink.is_empty());
    }
}
