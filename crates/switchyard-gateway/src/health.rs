//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while at least one healthy Worker is connected, else `"degraded"`.
    pub status: String,
    pub uptime_secs: u64,
    pub bots: usize,
    pub workers: usize,
    pub healthy_workers: usize,
    pub pending_correlations: usize,
    pub cached_events: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounts {
    pub bots: usize,
    pub workers: usize,
    pub healthy_workers: usize,
    pub pending_correlations: usize,
    pub cached_events: usize,
}

pub fn health_check(start_time: Instant, counts: HealthCounts) -> HealthResponse {
    let status = if counts.healthy_workers > 0 { "ok" } else { "degraded" };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        bots: counts.bots,
        workers: counts.workers,
        healthy_workers: counts.healthy_workers,
        pending_correlations: counts.pending_correlations,
        cached_events: counts.cached_events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_without_workers() {
        let resp = health_check(Instant::now(), HealthCounts::default());
        assert_eq!(resp.status, "degraded");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn counts_serialize() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(
            start,
            HealthCounts {
                bots: 2,
                workers: 3,
                healthy_workers: 1,
                pending_correlations: 4,
                cached_events: 5,
            },
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["bots"], 2);
        assert_eq!(json["healthy_workers"], 1);
        assert_eq!(json["cached_events"], 5);
        assert!(json["uptime_secs"].as_u64().unwrap() >= 59);
    }
}
