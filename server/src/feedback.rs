//! Operator feedback incorporation.
//!
//! A correction does two things: it appends a chunk carrying the corrected
//! label to the context index, and it reclassifies the corrected item with
//! that chunk available. The old classification is superseded, not deleted.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    contract,
    error::{AppError, AppResult},
    model::{ClassificationRecord, Item, ItemState, UserFeedback},
    pipeline::source::MailSource,
    prompt::generation::GenerationClient,
    queue::IdempotentQueue,
    retrieval::ContextRetriever,
    server_config::cfg,
    store::ItemStore,
};

#[derive(Clone)]
pub struct FeedbackService {
    source: Arc<dyn MailSource>,
    queue: IdempotentQueue,
    retriever: ContextRetriever,
    classifier: GenerationClient,
    review_threshold: f32,
}

impl FeedbackService {
    pub fn new(
        source: Arc<dyn MailSource>,
        queue: IdempotentQueue,
        retriever: ContextRetriever,
        classifier: GenerationClient,
        review_threshold: f32,
    ) -> Self {
        Self {
            source,
            queue,
            retriever,
            classifier,
            review_threshold,
        }
    }

    pub fn from_config(
        source: Arc<dyn MailSource>,
        queue: IdempotentQueue,
        retriever: ContextRetriever,
        classifier: GenerationClient,
    ) -> Self {
        Self::new(
            source,
            queue,
            retriever,
            classifier,
            cfg.settings.review_threshold,
        )
    }

    /// Record a correction for a classified item. Incorporation happens on
    /// the next feedback pass, not inline.
    pub async fn record_correction(
        &self,
        item_key: &str,
        corrected_category: &str,
        note: Option<&str>,
    ) -> AppResult<UserFeedback> {
        if !contract::category_is_known(corrected_category) {
            return Err(AppError::Contract(format!(
                "corrected category '{corrected_category}' is not in the taxonomy"
            )));
        }
        let item = self
            .queue
            .store()
            .get_item(item_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no item with key {item_key}")))?;
        if item.state != ItemState::Classified {
            return Err(AppError::Conflict(format!(
                "item {} is {}, only classified items accept corrections",
                item.id, item.state
            )));
        }

        let created_at = Utc::now();
        let feedback = UserFeedback {
            id: format!("fb-{}-{}", created_at.timestamp_millis(), &item_key[..8]),
            item_key: item_key.to_string(),
            corrected_category: corrected_category.to_string(),
            note: note.map(str::to_string),
            incorporated: false,
            created_at,
        };
        self.queue.store().insert_feedback(feedback.clone()).await?;
        tracing::info!(
            "Recorded correction for item {}: {}",
            item.id,
            corrected_category
        );
        Ok(feedback)
    }

    /// Incorporate all pending corrections. Each failure leaves that feedback
    /// pending for the next pass; the rest still go through.
    pub async fn incorporate_pending(&self) -> AppResult<usize> {
        let pending = self.queue.store().unincorporated_feedback().await?;
        let mut incorporated = 0;
        for feedback in pending {
            match self.incorporate_one(&feedback).await {
                Ok(()) => {
                    self.queue
                        .store()
                        .mark_feedback_incorporated(&feedback.id)
                        .await?;
                    incorporated += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Could not incorporate feedback {} for item {}: {e}",
                        feedback.id,
                        feedback.item_key
                    );
                }
            }
        }
        Ok(incorporated)
    }

    async fn incorporate_one(&self, feedback: &UserFeedback) -> AppResult<()> {
        let store = self.queue.store().clone();
        let item = store
            .get_item(&feedback.item_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no item with key {}", feedback.item_key)))?;

        let summary = feedback
            .note
            .clone()
            .unwrap_or_else(|| item.subject.clone());
        self.retriever
            .remember(
                &format!("chunk-{}", feedback.id),
                &summary,
                Some(&feedback.corrected_category),
            )
            .await?;

        if !self.queue.reopen(&item).await? {
            return Err(AppError::Conflict(format!(
                "item {} is not classified, cannot reclassify",
                item.id
            )));
        }

        match self.reclassify(&item).await {
            Ok(record) => {
                store.supersede_classification(&feedback.item_key).await?;
                let needs_review = record.needs_review;
                store.insert_classification(record).await?;
                store
                    .compare_and_set_state(
                        &feedback.item_key,
                        ItemState::Classifying,
                        ItemState::Classified,
                    )
                    .await?;
                store
                    .set_review_flag(&feedback.item_key, needs_review)
                    .await?;
                Ok(())
            }
            Err(e) => {
                // Restore the previous classification rather than stranding
                // the item in classifying.
                store
                    .compare_and_set_state(
                        &feedback.item_key,
                        ItemState::Classifying,
                        ItemState::Classified,
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn reclassify(&self, item: &Item) -> AppResult<ClassificationRecord> {
        let body = self
            .source
            .fetch(&item.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source no longer has item {}", item.id)))?
            .body;

        let query = format!("{}\n{}", item.subject, body);
        let context = self.retriever.retrieve(&query).await;
        let classified = self.classifier.classify(item, &body, &context).await?;

        Ok(ClassificationRecord::new(
            &item.idempotency_key,
            classified.payload,
            classified.retrieved_context_ids,
            self.review_threshold,
        ))
    }
}
