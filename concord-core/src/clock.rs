use std::time::{Duration, Instant};

use rand::Rng;

/// C1 — monotonic time and randomised timer deadlines.
///
/// Mirrors `original_source/Raft/raft_nodes.py`'s `self._now = time.monotonic`
/// plus `_reset_election_deadline` (`base + uniform(0, jitter)`), and the
/// `min_election_timeout`/`max_election_timeout` fields on
/// `josefine-raft`'s `raft::State`.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTimer {
    base: Duration,
    jitter: Duration,
}

impl ElectionTimer {
    /// `base` ~= 1.5-3.0s and `jitter` ~= base/2 for a four-node local
    /// cluster, per spec.md §4.1.
    pub fn new(base: Duration, jitter: Duration) -> Self {
        ElectionTimer { base, jitter }
    }

    pub fn default_for_cluster() -> Self {
        ElectionTimer::new(Duration::from_millis(2000), Duration::from_millis(1000))
    }

    /// Draws a fresh absolute deadline from `now`.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        now + self.base + Duration::from_millis(extra)
    }
}

/// Draws a uniform retry backoff for Paxos lock-conflict retries, per
/// spec.md §4.2 (`uniform(100ms, 500ms)`).
pub fn paxos_retry_backoff(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..=span);
    min + Duration::from_millis(extra)
}

/// A coarse periodic interval on the order of `base / 4`, for Raft
/// heartbeats (spec.md §5).
pub fn heartbeat_interval(election_base: Duration) -> Duration {
    election_base / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_within_base_plus_jitter() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(50));
        let now = Instant::now();
        for _ in 0..100 {
            let deadline = timer.next_deadline(now);
            assert!(deadline >= now + Duration::from_millis(100));
            assert!(deadline <= now + Duration::from_millis(150));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(0));
        let now = Instant::now();
        assert_eq!(timer.next_deadline(now), now + Duration::from_millis(100));
    }

    #[test]
    fn retry_backoff_is_within_range() {
        let (min, max) = (Duration::from_millis(100), Duration::from_millis(500));
        for _ in 0..100 {
            let d = paxos_retry_backoff(min, max);
            assert!(d >= min && d <= max);
        }
    }
}
