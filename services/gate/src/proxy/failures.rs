//! Per-minute dial failure history.
//!
//! A fixed ring of 60 one-minute buckets. The bucket for an instant is the
//! number of whole minutes since `origin`, modulo 60. Stale buckets are
//! overwritten on the next failure that lands in them, so no eviction pass
//! is needed.

use std::time::{Duration, Instant};

/// Number of one-minute buckets.
pub const FAILURE_MINUTES: usize = 60;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    at: Instant,
    count: u64,
}

/// Ring buffer of dial failures over the trailing hour.
#[derive(Debug)]
pub struct FailureRing {
    origin: Instant,
    head: usize,
    buckets: [Bucket; FAILURE_MINUTES],
}

impl FailureRing {
    /// Create an empty ring. Every bucket is stamped `created`.
    pub fn new(origin: Instant, created: Instant) -> Self {
        Self {
            origin,
            head: 0,
            buckets: [Bucket {
                at: created,
                count: 0,
            }; FAILURE_MINUTES],
        }
    }

    fn bucket_index(&self, now: Instant) -> usize {
        let minutes = now.saturating_duration_since(self.origin).as_secs() / 60;
        (minutes % FAILURE_MINUTES as u64) as usize
    }

    /// Record one failure at `now`.
    pub fn record_at(&mut self, now: Instant) {
        let idx = self.bucket_index(now);
        let head_age = now.saturating_duration_since(self.buckets[self.head].at);

        if idx != self.head || head_age >= MINUTE {
            self.head = idx;
            self.buckets[idx] = Bucket { at: now, count: 1 };
        } else {
            self.buckets[idx].count += 1;
        }
    }

    /// Failures recorded within the last `minutes` minutes as seen from `now`.
    ///
    /// Walks backwards from the newest bucket and stops at the first bucket
    /// older than the window: a gap in activity means everything before it is
    /// stale as well. Returns `None` unless `1 <= minutes <= 60`.
    pub fn failures_in_last_at(&self, minutes: usize, now: Instant) -> Option<u64> {
        if minutes == 0 || minutes > FAILURE_MINUTES {
            return None;
        }

        let window = MINUTE * minutes as u32;
        let mut total = 0;
        for i in 0..minutes {
            let bucket = &self.buckets[(self.head + FAILURE_MINUTES - i) % FAILURE_MINUTES];
            if now.saturating_duration_since(bucket.at) >= window {
                break;
            }
            total += bucket.count;
        }
        Some(total)
    }
}
