//! Line pool and best-line selection.
//!
//! Selection picks the line with the highest score (remaining capacity).
//! Ties go to the earliest line in configuration order. A pool whose best
//! score is negative has no usable line.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::line::BackendLine;

/// Anything that can hand out the best line for a new session.
#[async_trait]
pub trait LineSelector: Send + Sync {
    /// Best usable line, or `None` when every line scores negative.
    async fn select_best(&self) -> Option<Arc<BackendLine>>;
}

/// Ordered set of lines owned by one engine.
#[derive(Debug)]
pub struct LinePool {
    name: String,
    origin: Instant,
    lines: RwLock<Vec<Arc<BackendLine>>>,
}

impl LinePool {
    /// Create an empty pool. `origin` anchors every line's failure ring.
    pub fn new(name: impl Into<String>, origin: Instant) -> Self {
        Self {
            name: name.into(),
            origin,
            lines: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a line. Configuration time only.
    pub async fn add_line(
        &self,
        remote: impl Into<String>,
        timeout: Duration,
        interval: Duration,
        max_load: i64,
        redirect: bool,
    ) -> Arc<BackendLine> {
        let line = Arc::new(BackendLine::new(
            remote,
            timeout,
            interval,
            max_load,
            redirect,
            self.origin,
        ));

        let mut lines = self.lines.write().await;
        lines.push(Arc::clone(&line));
        debug!(
            pool = %self.name,
            remote = %line.remote(),
            max_load,
            line_count = lines.len(),
            "Line added"
        );

        line
    }

    /// Snapshot of the lines in configuration order.
    pub async fn lines(&self) -> Vec<Arc<BackendLine>> {
        self.lines.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.lines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lines.read().await.is_empty()
    }

    /// Start every line's probe loop. Initial probes run concurrently.
    pub async fn start_probing(&self) {
        let lines = self.lines().await;
        join_all(lines.iter().map(|line| line.start())).await;

        let reachable = lines.iter().filter(|l| l.delay().is_some()).count();
        if reachable == 0 && !lines.is_empty() {
            warn!(pool = %self.name, line_count = lines.len(), "No line reachable after initial probe");
        } else {
            debug!(pool = %self.name, reachable, line_count = lines.len(), "Probing started");
        }
    }

    /// Stop every line's probe loop.
    pub async fn stop_probing(&self) {
        for line in self.lines.read().await.iter() {
            line.stop();
        }
    }

    /// Line with the highest non-negative score.
    pub async fn select_best(&self) -> Option<Arc<BackendLine>> {
        let lines = self.lines.read().await;

        let mut best: Option<&Arc<BackendLine>> = None;
        let mut best_score = -1;
        for line in lines.iter() {
            let score = line.score();
            if best.is_none() || score > best_score {
                best = Some(line);
                best_score = score;
            }
        }

        if best_score < 0 {
            return None;
        }
        best.cloned()
    }
}

#[async_trait]
impl LineSelector for LinePool {
    async fn select_best(&self) -> Option<Arc<BackendLine>> {
        LinePool::select_best(self).await
    }
}
