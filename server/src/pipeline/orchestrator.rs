//! One poll-classify-persist cycle, end to end.
//!
//! Cycle-level failures (the feed is down) abort the cycle and surface to the
//! scheduler; item-level failures are contained to the item and recorded
//! through the queue's retry accounting.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use chrono::Utc;
use futures::StreamExt;

use crate::{
    error::AppResult,
    model::{ClassificationRecord, CycleReport, Item, ItemState},
    notify::{NotifierHandle, PipelineEvent},
    observability::CycleTracker,
    prompt::generation::GenerationClient,
    queue::IdempotentQueue,
    retrieval::ContextRetriever,
    server_config::cfg,
    store::ItemStore,
};

use super::{scheduler::ScheduleState, source::MailSource};

#[derive(Default)]
struct CycleCounts {
    classified: AtomicUsize,
    failed: AtomicUsize,
    quarantined: AtomicUsize,
    needs_review: AtomicUsize,
}

#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn MailSource>,
    queue: IdempotentQueue,
    retriever: ContextRetriever,
    classifier: GenerationClient,
    notifier: NotifierHandle,
    tracker: CycleTracker,
    concurrency: usize,
    review_threshold: f32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn MailSource>,
        queue: IdempotentQueue,
        retriever: ContextRetriever,
        classifier: GenerationClient,
        notifier: NotifierHandle,
        tracker: CycleTracker,
        concurrency: usize,
        review_threshold: f32,
    ) -> Self {
        Self {
            source,
            queue,
            retriever,
            classifier,
            notifier,
            tracker,
            concurrency: concurrency.max(1),
            review_threshold,
        }
    }

    pub fn from_config(
        source: Arc<dyn MailSource>,
        queue: IdempotentQueue,
        retriever: ContextRetriever,
        classifier: GenerationClient,
        notifier: NotifierHandle,
        tracker: CycleTracker,
    ) -> Self {
        Self::new(
            source,
            queue,
            retriever,
            classifier,
            notifier,
            tracker,
            cfg.settings.classify_concurrency,
            cfg.settings.review_threshold,
        )
    }

    pub fn tracker(&self) -> &CycleTracker {
        &self.tracker
    }

    /// Resume the schedule from the persisted cursor, e.g. after a restart.
    pub async fn load_schedule_state(&self) -> AppResult<ScheduleState> {
        Ok(ScheduleState {
            last_cursor: self.queue.store().load_cursor().await?,
            last_run_at: None,
        })
    }

    /// Run one full cycle. An empty batch is a normal cycle and still produces
    /// a persisted report.
    pub async fn run_cycle(&self, schedule: &mut ScheduleState) -> AppResult<CycleReport> {
        let started_at = Utc::now();
        let cycle_id = format!("cycle-{}", started_at.timestamp_millis());
        let store = self.queue.store().clone();

        let queue_depth_start = store.count_in_state(ItemState::Pending).await?;

        let released = self.queue.release_failed().await?;
        if released > 0 {
            tracing::info!("Released {released} failed items back to pending");
        }
        let swept_stale = self.queue.sweep_stale().await?.len();

        let batch = self
            .source
            .fetch_since(schedule.last_cursor.as_deref())
            .await?;
        let emails_scanned = batch.records.len();

        // Bodies are not persisted on items; carry this batch's bodies to the
        // workers keyed by idempotency key. Retried items from earlier batches
        // fall back to fetch-by-id.
        let mut bodies: HashMap<String, String> = HashMap::new();
        let mut enqueued_new = 0;
        let mut duplicates_skipped = 0;
        for record in &batch.records {
            let (item, is_new) = self.queue.enqueue(record).await?;
            bodies.insert(item.idempotency_key.clone(), record.body.clone());
            if is_new {
                enqueued_new += 1;
            } else {
                duplicates_skipped += 1;
            }
        }

        // Advance the cursor only after every record of the batch is durably
        // enqueued, so a crash in between re-reads the batch instead of
        // losing it.
        if let Some(next_cursor) = &batch.next_cursor {
            store.save_cursor(next_cursor).await?;
            schedule.last_cursor = Some(next_cursor.clone());
        }
        schedule.last_run_at = Some(started_at);

        let pending = store.items_in_state(ItemState::Pending).await?;
        let counts = CycleCounts::default();
        futures::stream::iter(pending)
            .for_each_concurrent(self.concurrency, |item| {
                let bodies = &bodies;
                let counts = &counts;
                async move {
                    self.process_item(item, bodies, counts).await;
                }
            })
            .await;

        let queue_depth_end = store.count_in_state(ItemState::Pending).await?;
        let finished_at = Utc::now();
        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at,
            emails_scanned,
            enqueued_new,
            duplicates_skipped,
            classified: counts.classified.load(Ordering::Relaxed),
            failed: counts.failed.load(Ordering::Relaxed),
            quarantined: counts.quarantined.load(Ordering::Relaxed),
            needs_review: counts.needs_review.load(Ordering::Relaxed),
            swept_stale,
            queue_depth_start,
            queue_depth_end,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        };

        store.insert_cycle(report.clone()).await?;
        store.record_circuit(self.classifier.breaker().snapshot()).await?;
        store.record_circuit(self.retriever.breaker().snapshot()).await?;
        self.tracker.record_cycle(&report);
        self.notifier.send(PipelineEvent::CycleCompleted {
            report: report.clone(),
        });

        Ok(report)
    }

    /// Process one pending item. Never lets an error escape to the cycle; a
    /// failure here is the item's failure, not the cycle's.
    async fn process_item(&self, item: Item, bodies: &HashMap<String, String>, counts: &CycleCounts) {
        match self.classify_item(&item, bodies).await {
            Ok(Some(needs_review)) => {
                counts.classified.fetch_add(1, Ordering::Relaxed);
                if needs_review {
                    counts.needs_review.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Lost the claim; whoever holds it reports the outcome.
            Ok(None) => {}
            Err(e) => match self.queue.fail(&item, &e.to_string()).await {
                Ok(ItemState::Quarantined) => {
                    counts.quarantined.fetch_add(1, Ordering::Relaxed);
                    let refreshed = self
                        .queue
                        .store()
                        .get_item(&item.idempotency_key)
                        .await
                        .ok()
                        .flatten();
                    self.notifier.send(PipelineEvent::ItemQuarantined {
                        item_id: item.id.clone(),
                        attempt_count: refreshed
                            .as_ref()
                            .map(|i| i.attempt_count)
                            .unwrap_or(item.attempt_count + 1),
                        last_error: Some(e.to_string()),
                    });
                }
                Ok(_) => {
                    counts.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(fail_err) => {
                    counts.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Could not record failure for item {}: {fail_err} (original error: {e})",
                        item.id
                    );
                }
            },
        }
    }

    /// Claim, retrieve context, classify, persist. Returns the review flag of
    /// the stored classification, or `None` if the claim was lost.
    async fn classify_item(
        &self,
        item: &Item,
        bodies: &HashMap<String, String>,
    ) -> AppResult<Option<bool>> {
        if !self.queue.claim(item).await? {
            tracing::debug!("Item {} already claimed, skipping", item.id);
            return Ok(None);
        }

        let body = match bodies.get(&item.idempotency_key) {
            Some(body) => body.clone(),
            None => match self.source.fetch(&item.id).await? {
                Some(record) => record.body,
                None => {
                    return Err(crate::error::AppError::NotFound(format!(
                        "source no longer has item {}",
                        item.id
                    )))
                }
            },
        };

        let query = format!("{}\n{}", item.subject, body);
        let context = self.retriever.retrieve(&query).await;

        let classified = self.classifier.classify(item, &body, &context).await?;
        let record = ClassificationRecord::new(
            &item.idempotency_key,
            classified.payload,
            classified.retrieved_context_ids,
            self.review_threshold,
        );
        let needs_review = record.needs_review;
        let primary_category = record.payload.primary_category.clone();
        let confidence = record.payload.confidence;
        let summary = record
            .payload
            .rationale
            .clone()
            .unwrap_or_else(|| item.subject.clone());

        self.queue.complete(item, record).await?;

        // Feed the outcome back into the retrieval index so later emails see
        // it as context. Index growth is best-effort.
        if let Err(e) = self
            .retriever
            .remember(&item.idempotency_key, &summary, Some(&primary_category))
            .await
        {
            tracing::warn!("Could not index classification for item {}: {e}", item.id);
        }

        self.notifier.send(PipelineEvent::ItemClassified {
            item_id: item.id.clone(),
            primary_category,
            confidence,
            needs_review,
        });
        Ok(Some(needs_review))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        model::SourceRecord,
        notify::NotifierService,
        resilience::{CircuitBreaker, RetryPolicy},
        retrieval::MemoryIndex,
        store::MemoryStore,
        testing::common::{payload_json, RecordingSink, ScriptedEmbedder, ScriptedGeneration, ScriptedSource},
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct TestPipeline {
        orchestrator: Orchestrator,
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        shutdown: CancellationToken,
    }

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

    fn pipeline_with(generation: Arc<ScriptedGeneration>, max_retries: u32) -> TestPipeline {
        let source = Arc::new(ScriptedSource::new());
        let store = Arc::new(MemoryStore::new());
        let queue = IdempotentQueue::new(store.clone(), max_retries, chrono::Duration::seconds(900));
        let retriever = ContextRetriever::new(
            Arc::new(ScriptedEmbedder::fixed(vec![1.0, 0.0])),
            Arc::new(MemoryIndex::new()),
            breaker("embedding"),
            3,
            0.6,
            Duration::from_millis(250),
        );
        let classifier = GenerationClient::new(generation, breaker("generation"));
        let sink = Arc::new(RecordingSink::new());
        let shutdown = CancellationToken::new();
        let (notifier, _task) = NotifierService::start(sink.clone(), shutdown.clone());

        let orchestrator = Orchestrator::new(
            source.clone(),
            queue,
            retriever,
            classifier,
            notifier,
            CycleTracker::new(),
            2,
            0.6,
        );
        TestPipeline {
            orchestrator,
            source,
            store,
            sink,
            shutdown,
        }
    }

    fn record(id: &str, subject: &str) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            subject: subject.to_string(),
            sender: "sender@uni.edu".to_string(),
            body: format!("Body of {subject}"),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_one_malformed_item_does_not_poison_the_batch() {
        let generation = Arc::new(ScriptedGeneration::poisoned_by(
            "Broken email",
            payload_json("academic.exams", 0.9),
        ));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        let mut records: Vec<SourceRecord> =
            (0..9).map(|i| record(&format!("m{i}"), "Exam info")).collect();
        records.push(record("bad", "Broken email"));
        p.source.push_batch(records, None);

        let report = p.orchestrator.run_cycle(&mut schedule).await.unwrap();

        assert_eq!(report.emails_scanned, 10);
        assert_eq!(report.enqueued_new, 10);
        assert_eq!(report.classified, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(report.quarantined, 0);

        assert_eq!(p.store.count_in_state(ItemState::Classified).await.unwrap(), 9);
        assert_eq!(p.store.count_in_state(ItemState::Failed).await.unwrap(), 1);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_empty_batch_still_records_a_cycle() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        let report = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(report.emails_scanned, 0);
        assert_eq!(report.classified, 0);
        assert_eq!(p.store.cycle_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = p.sink.delivered();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PipelineEvent::CycleCompleted { .. }));
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped_across_cycles() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        p.source
            .push_batch(vec![record("m1", "First"), record("m2", "Second")], Some("c1"));
        let first = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(first.enqueued_new, 2);
        assert_eq!(first.duplicates_skipped, 0);

        // The feed re-sends m1 alongside a new message.
        p.source
            .push_batch(vec![record("m1", "First"), record("m3", "Third")], Some("c2"));
        let second = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(second.enqueued_new, 1);
        assert_eq!(second.duplicates_skipped, 1);
        assert_eq!(second.classified, 1);

        // m1 stayed classified; exactly 3 items total.
        assert_eq!(p.store.count_in_state(ItemState::Classified).await.unwrap(), 3);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cursor_advances_and_is_replayed() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        p.source.push_batch(vec![record("m1", "First")], Some("cursor-1"));
        p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(p.store.load_cursor().await.unwrap().as_deref(), Some("cursor-1"));

        p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        let cursors = p.source.cursors_seen();
        assert_eq!(cursors, vec![None, Some("cursor-1".to_string())]);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_feed_outage_aborts_cycle_but_not_the_queue() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        p.source.push_batch(vec![record("m1", "First")], None);
        p.orchestrator.run_cycle(&mut schedule).await.unwrap();

        p.source.push_error(AppError::Transient("feed down".to_string()));
        let err = p.orchestrator.run_cycle(&mut schedule).await.unwrap_err();
        assert!(err.is_transient());

        // The earlier work is untouched and the next cycle runs normally.
        assert_eq!(p.store.count_in_state(ItemState::Classified).await.unwrap(), 1);
        p.source.push_batch(vec![record("m2", "Second")], None);
        let report = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(report.classified, 1);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_low_confidence_classifies_with_review_flag() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.45,
        )));
        let p = pipeline_with(generation, 5);
        let mut schedule = ScheduleState::default();

        p.source.push_batch(vec![record("m1", "Ambiguous")], None);
        let report = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(report.classified, 1);
        assert_eq!(report.needs_review, 1);

        let key = crate::model::idempotency_key("m1");
        let item = p.store.get_item(&key).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Classified);
        assert!(item.needs_review);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_persistent_failure_quarantines_and_notifies() {
        let generation = Arc::new(ScriptedGeneration::poisoned_by(
            "Broken email",
            payload_json("academic.exams", 0.9),
        ));
        let p = pipeline_with(generation, 2);
        let mut schedule = ScheduleState::default();

        p.source.push_batch(vec![record("bad", "Broken email")], None);
        let first = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(first.failed, 1);

        // Failed items are released and retried next cycle; the second miss
        // exhausts the budget.
        let second = p.orchestrator.run_cycle(&mut schedule).await.unwrap();
        assert_eq!(second.quarantined, 1);
        assert_eq!(p.store.count_in_state(ItemState::Quarantined).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p
            .sink
            .delivered()
            .iter()
            .any(|e| matches!(e, PipelineEvent::ItemQuarantined { attempt_count: 2, .. })));
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_lost_claim_is_not_tallied() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation, 5);

        // Another worker already holds the claim when this one arrives.
        let (item, _) = p
            .orchestrator
            .queue
            .enqueue(&record("m1", "First"))
            .await
            .unwrap();
        assert!(p.orchestrator.queue.claim(&item).await.unwrap());

        let counts = CycleCounts::default();
        p.orchestrator
            .process_item(item.clone(), &HashMap::new(), &counts)
            .await;

        assert_eq!(counts.classified.load(Ordering::Relaxed), 0);
        assert_eq!(counts.failed.load(Ordering::Relaxed), 0);
        assert_eq!(counts.quarantined.load(Ordering::Relaxed), 0);
        let stored = p.store.get_item(&item.idempotency_key).await.unwrap().unwrap();
        assert_eq!(stored.state, ItemState::Classifying);
        p.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_classification_outcome_enters_retrieval_index() {
        let generation = Arc::new(ScriptedGeneration::repeating(payload_json(
            "academic.exams",
            0.9,
        )));
        let p = pipeline_with(generation.clone(), 5);
        let mut schedule = ScheduleState::default();

        p.source.push_batch(vec![record("m1", "Exam schedule")], None);
        p.orchestrator.run_cycle(&mut schedule).await.unwrap();

        p.source.push_batch(vec![record("m2", "Another exam email")], None);
        p.orchestrator.run_cycle(&mut schedule).await.unwrap();

        // The second classification prompt carries the first item's outcome
        // as retrieved context.
        let prompts = generation.prompts();
        assert!(prompts.last().unwrap().contains("[academic.exams]"));
        p.shutdown.cancel();
    }
}
