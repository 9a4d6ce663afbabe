//! Process-wide state passed explicitly to every engine.

use std::sync::Arc;
use std::time::Instant;

use crate::stats::TrafficStats;

/// Shared gateway context.
///
/// Cloning is cheap; all clones share the same counters.
#[derive(Debug, Clone)]
pub struct GateContext {
    stats: Arc<TrafficStats>,
    started_at: Instant,
}

impl GateContext {
    /// Create a fresh context starting now.
    pub fn new() -> Self {
        Self {
            stats: Arc::new(TrafficStats::default()),
            started_at: Instant::now(),
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Process start, the origin of failure-ring minute buckets.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Default for GateContext {
    fn default() -> Self {
        Self::new()
    }
}
