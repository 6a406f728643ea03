use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::model::CycleReport;

use super::format_table;

#[derive(Default)]
struct TrackerInner {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    emails_scanned: AtomicU64,
    classified: AtomicU64,
    failed: AtomicU64,
    quarantined: AtomicU64,
    needs_review: AtomicU64,
    swept_stale: AtomicU64,
    last_cycle: RwLock<Option<CycleReport>>,
}

/// Lifetime counters plus the most recent cycle report. Shared between the
/// scheduler (writer) and the status watch task (reader).
#[derive(Clone, Default)]
pub struct CycleTracker {
    inner: Arc<TrackerInner>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, report: &CycleReport) {
        let i = &self.inner;
        i.cycles_completed.fetch_add(1, Ordering::Relaxed);
        i.emails_scanned
            .fetch_add(report.emails_scanned as u64, Ordering::Relaxed);
        i.classified
            .fetch_add(report.classified as u64, Ordering::Relaxed);
        i.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        i.quarantined
            .fetch_add(report.quarantined as u64, Ordering::Relaxed);
        i.needs_review
            .fetch_add(report.needs_review as u64, Ordering::Relaxed);
        i.swept_stale
            .fetch_add(report.swept_stale as u64, Ordering::Relaxed);
        *i.last_cycle.write().unwrap() = Some(report.clone());
    }

    pub fn record_cycle_error(&self) {
        self.inner.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A tick arrived while the previous cycle was still running.
    pub fn record_skipped_tick(&self) {
        self.inner.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.inner.ticks_skipped.load(Ordering::Relaxed)
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.inner.last_cycle.read().unwrap().clone()
    }

    /// Formatted status table for the periodic log line. None until the first
    /// cycle has completed.
    pub fn get_status_table(&self) -> Option<String> {
        let i = &self.inner;
        let last = i.last_cycle.read().unwrap().clone()?;

        let totals_row = vec![
            "total".to_string(),
            i.emails_scanned.load(Ordering::Relaxed).to_string(),
            i.classified.load(Ordering::Relaxed).to_string(),
            i.failed.load(Ordering::Relaxed).to_string(),
            i.quarantined.load(Ordering::Relaxed).to_string(),
            i.needs_review.load(Ordering::Relaxed).to_string(),
            i.swept_stale.load(Ordering::Relaxed).to_string(),
            "-".to_string(),
        ];
        let last_row = vec![
            "last cycle".to_string(),
            last.emails_scanned.to_string(),
            last.classified.to_string(),
            last.failed.to_string(),
            last.quarantined.to_string(),
            last.needs_review.to_string(),
            last.swept_stale.to_string(),
            format!("{}ms", last.duration_ms),
        ];

        let table = format_table(
            &[
                "Window",
                "Scanned",
                "Classified",
                "Failed",
                "Quarantined",
                "Review",
                "Swept",
                "Duration",
            ],
            &[totals_row, last_row],
        );

        Some(format!(
            "Cycles: {} completed, {} failed, {} ticks skipped (queue depth {})\n{}",
            i.cycles_completed.load(Ordering::Relaxed),
            i.cycles_failed.load(Ordering::Relaxed),
            i.ticks_skipped.load(Ordering::Relaxed),
            last.queue_depth_end,
            table,
        ))
    }
}
