use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one poll-classify-persist cycle. Persisted at cycle end and
/// emitted as the CycleCompleted event. An empty batch still produces one of
/// these with emails_scanned = 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub emails_scanned: usize,
    pub enqueued_new: usize,
    pub duplicates_skipped: usize,
    pub classified: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub needs_review: usize,
    pub swept_stale: usize,
    pub queue_depth_start: usize,
    pub queue_depth_end: usize,
    pub duration_ms: i64,
}
