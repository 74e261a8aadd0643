use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Serialize, Deserialize)]
pub struct ViewHealth {
    pub uptime_seconds: u64,
    pub started_at: String,
    pub connections_live: usize,
    pub connections_configured: usize,
    pub evictions: u64,
    pub status: String,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn get_health(&self, pool: &Pool) -> ViewHealth {
        let live = pool.len();
        let configured = pool.configured();
        // "degraded" = au moins une instance perdue ou jamais jointe
        let status = match live {
            0 => "disconnected",
            n if n < configured => "degraded",
            _ => "connected",
        };

        ViewHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            started_at: self.started_at.format(&Rfc3339).unwrap_or_default(),
            connections_live: live,
            connections_configured: configured,
            evictions: pool.evictions(),
            status: status.to_string(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
