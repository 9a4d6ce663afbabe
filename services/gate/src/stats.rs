//! Connection and traffic accounting.
//!
//! All counters are independent atomics; there is no cross-field consistency.
//! Naming follows the relay's point of view:
//! - `client_in`: bytes read from clients
//! - `client_out`: bytes written to backends on behalf of clients
//! - `server_in`: bytes read from backends
//! - `server_out`: bytes written to clients on behalf of backends

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::info;

/// Gateway-wide traffic counters.
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Client connections currently open.
    in_num: AtomicI64,
    /// Backend connections currently open.
    out_num: AtomicI64,
    /// Tunnels established since start.
    success_num: AtomicU64,
    /// Tunnels that failed (no line or dial error) since start.
    failed_num: AtomicU64,
    client_in_size: AtomicU64,
    client_out_size: AtomicU64,
    server_in_size: AtomicU64,
    server_out_size: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub in_num: i64,
    pub out_num: i64,
    pub success_num: u64,
    pub failed_num: u64,
    pub client_in_size: u64,
    pub client_out_size: u64,
    pub server_in_size: u64,
    pub server_out_size: u64,
}

impl TrafficStats {
    pub fn update_in_num(&self, delta: i64) {
        self.in_num.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_out_num(&self, delta: i64) {
        self.out_num.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_success_num(&self, delta: u64) {
        self.success_num.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_failed_num(&self, delta: u64) {
        self.failed_num.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_client_in_size(&self, delta: u64) {
        self.client_in_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_client_out_size(&self, delta: u64) {
        self.client_out_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_server_in_size(&self, delta: u64) {
        self.server_in_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn update_server_out_size(&self, delta: u64) {
        self.server_out_size.fetch_add(delta, Ordering::Relaxed);
    }

    /// Count a client connection until the guard drops.
    pub fn client_opened(self: &Arc<Self>) -> GaugeGuard {
        GaugeGuard::new(Arc::clone(self), Gauge::Client)
    }

    /// Count a backend connection until the guard drops.
    pub fn server_opened(self: &Arc<Self>) -> GaugeGuard {
        GaugeGuard::new(Arc::clone(self), Gauge::Server)
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_num: self.in_num.load(Ordering::Relaxed),
            out_num: self.out_num.load(Ordering::Relaxed),
            success_num: self.success_num.load(Ordering::Relaxed),
            failed_num: self.failed_num.load(Ordering::Relaxed),
            client_in_size: self.client_in_size.load(Ordering::Relaxed),
            client_out_size: self.client_out_size.load(Ordering::Relaxed),
            server_in_size: self.server_in_size.load(Ordering::Relaxed),
            server_out_size: self.server_out_size.load(Ordering::Relaxed),
        }
    }

    /// Log the current counters.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            clients = s.in_num,
            servers = s.out_num,
            tunnels_ok = s.success_num,
            tunnels_failed = s.failed_num,
            client_read_bytes = s.client_in_size,
            client_write_bytes = s.client_out_size,
            server_read_bytes = s.server_in_size,
            server_write_bytes = s.server_out_size,
            "Traffic summary"
        );
    }

    /// Log a summary every `period` until shutdown.
    pub async fn run_reporter(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_summary(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.log_summary();
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Gauge {
    Client,
    Server,
}

/// Decrements its connection gauge on drop.
#[derive(Debug)]
pub struct GaugeGuard {
    stats: Arc<TrafficStats>,
    gauge: Gauge,
}

impl GaugeGuard {
    fn new(stats: Arc<TrafficStats>, gauge: Gauge) -> Self {
        match gauge {
            Gauge::Client => stats.update_in_num(1),
            Gauge::Server => stats.update_out_num(1),
        }
        Self { stats, gauge }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        match self.gauge {
            Gauge::Client => self.stats.update_in_num(-1),
            Gauge::Server => self.stats.update_out_num(-1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TrafficStats::default();
        stats.update_success_num(2);
        stats.update_failed_num(1);
        stats.update_client_in_size(5);
        stats.update_client_in_size(7);
        stats.update_server_out_size(3);

        let s = stats.snapshot();
        assert_eq!(s.success_num, 2);
        assert_eq!(s.failed_num, 1);
        assert_eq!(s.client_in_size, 12);
        assert_eq!(s.server_out_size, 3);
        assert_eq!(s.client_out_size, 0);
    }

    #[test]
    fn test_gauges_release_on_drop() {
        let stats = Arc::new(TrafficStats::default());
        let client = stats.client_opened();
        let server = stats.server_opened();
        assert_eq!(stats.snapshot().in_num, 1);
        assert_eq!(stats.snapshot().out_num, 1);

        drop(client);
        assert_eq!(stats.snapshot().in_num, 0);
        assert_eq!(stats.snapshot().out_num, 1);

        drop(server);
        assert_eq!(stats.snapshot().out_num, 0);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let stats = Arc::new(TrafficStats::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&stats).run_reporter(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should exit")
            .unwrap();
    }
}
