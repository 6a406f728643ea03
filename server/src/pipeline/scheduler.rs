//! Cycle scheduling with overlap protection. Ticks arrive on a fixed
//! interval; if the previous cycle is still running the tick is dropped and
//! counted, never queued. Cycle errors are logged and absorbed so the loop
//! survives feed outages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::Orchestrator;

/// Cursor position and timing of the polling loop. Owned by the scheduler and
/// handed to each cycle; the cursor is additionally persisted through the
/// store so a restart resumes where it left off.
#[derive(Debug, Clone, Default)]
pub struct ScheduleState {
    pub last_cursor: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CycleScheduler {
    orchestrator: Orchestrator,
    state: Arc<Mutex<ScheduleState>>,
}

impl CycleScheduler {
    pub fn new(orchestrator: Orchestrator, initial: ScheduleState) -> Self {
        Self {
            orchestrator,
            state: Arc::new(Mutex::new(initial)),
        }
    }

    /// Run one cycle unless one is already in flight. Holding the state lock
    /// for the whole cycle is what makes ticks single-flight.
    pub async fn tick(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            self.orchestrator.tracker().record_skipped_tick();
            tracing::warn!("Previous cycle still running, skipping tick");
            return;
        };

        match self.orchestrator.run_cycle(&mut state).await {
            Ok(report) => {
                tracing::info!(
                    "Cycle {} done in {}ms: {} scanned, {} new, {} classified, {} failed, {} quarantined",
                    report.cycle_id,
                    report.duration_ms,
                    report.emails_scanned,
                    report.enqueued_new,
                    report.classified,
                    report.failed,
                    report.quarantined,
                );
            }
            Err(e) => {
                self.orchestrator.tracker().record_cycle_error();
                tracing::error!("Classification cycle failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        model::SourceRecord,
        notify::NotifierService,
        observability::CycleTracker,
        prompt::generation::GenerationClient,
        queue::IdempotentQueue,
        resilience::{CircuitBreaker, RetryPolicy},
        retrieval::{ContextRetriever, MemoryIndex},
        store::MemoryStore,
        testing::common::{payload_json, RecordingSink, ScriptedEmbedder, ScriptedGeneration, ScriptedSource},
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn breaker(name: &str) -> CircuitBreaker {
        CircuitBreaker::new(
            name,
            5,
            Duration::from_secs(60),
            RetryPolicy {
                max_attempts: 1,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
            },
        )
    }

    fn scheduler_with(
        source: Arc<ScriptedSource>,
        embedder: Arc<ScriptedEmbedder>,
    ) -> (CycleScheduler, CycleTracker, CancellationToken) {
        let store = Arc::new(MemoryStore::new());
        let queue = IdempotentQueue::new(store, 5, chrono::Duration::seconds(900));
        let retriever = ContextRetriever::new(
            embedder,
            Arc::new(MemoryIndex::new()),
            breaker("embedding"),
            3,
            0.6,
            Duration::from_millis(500),
        );
        let classifier = GenerationClient::new(
            Arc::new(ScriptedGeneration::repeating(payload_json(
                "academic.exams",
                0.9,
            ))),
            breaker("generation"),
        );
        let shutdown = CancellationToken::new();
        let (notifier, _task) =
            NotifierService::start(Arc::new(RecordingSink::new()), shutdown.clone());
        let tracker = CycleTracker::new();

        let orchestrator = Orchestrator::new(
            source,
            queue,
            retriever,
            classifier,
            notifier,
            tracker.clone(),
            2,
            0.6,
        );
        (
            CycleScheduler::new(orchestrator, ScheduleState::default()),
            tracker,
            shutdown,
        )
    }

    fn record(id: &str) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            subject: "Subject".to_string(),
            sender: "sender@uni.edu".to_string(),
            body: "Body".to_string(),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped_not_queued() {
        let source = Arc::new(ScriptedSource::new());
        // A slow embedder keeps the first cycle busy while the second tick
        // arrives.
        source.push_batch(vec![record("m1")], None);
        let (scheduler, tracker, shutdown) =
            scheduler_with(source, Arc::new(ScriptedEmbedder::slow(vec![1.0], 200)));

        let slow = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.tick().await;
        slow.await.unwrap();

        assert_eq!(tracker.cycles_completed(), 1);
        assert_eq!(tracker.ticks_skipped(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cycle_error_does_not_poison_the_scheduler() {
        let source = Arc::new(ScriptedSource::new());
        source.push_error(AppError::Transient("feed down".to_string()));
        source.push_batch(vec![record("m1")], None);
        let (scheduler, tracker, shutdown) =
            scheduler_with(source, Arc::new(ScriptedEmbedder::fixed(vec![1.0])));

        scheduler.tick().await;
        assert_eq!(tracker.cycles_completed(), 0);

        scheduler.tick().await;
        assert_eq!(tracker.cycles_completed(), 1);
        assert_eq!(tracker.last_cycle().unwrap().classified, 1);
        shutdown.cancel();
    }
}
