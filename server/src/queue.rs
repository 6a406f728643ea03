//! Idempotent work queue over the item store.
//!
//! Guarantees exactly-once logical enqueue (one item per idempotency key) and
//! at-most-one concurrent processing attempt per item (claim is a single
//! compare-and-swap on the state field).

use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    model::{ClassificationRecord, Item, ItemState, SourceRecord},
    server_config::cfg,
    store::ItemStore,
};

#[derive(Clone)]
pub struct IdempotentQueue {
    store: Arc<dyn ItemStore>,
    max_retries: u32,
    stale_after: chrono::Duration,
}

impl IdempotentQueue {
    pub fn new(store: Arc<dyn ItemStore>, max_retries: u32, stale_after: chrono::Duration) -> Self {
        Self {
            store,
            max_retries,
            stale_after,
        }
    }

    pub fn from_config(store: Arc<dyn ItemStore>) -> Self {
        Self::new(
            store,
            cfg.settings.max_retries,
            chrono::Duration::seconds(cfg.settings.stale_after_secs),
        )
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    /// Enqueue one source record. Re-observing the same logical record returns
    /// the existing item with `is_new = false` and changes nothing.
    pub async fn enqueue(&self, record: &SourceRecord) -> AppResult<(Item, bool)> {
        let item = Item::from_source(record);
        let key = item.idempotency_key.clone();

        if self.store.insert_item(item.clone()).await? {
            tracing::debug!("Enqueued item {} ({})", item.id, key);
            return Ok((item, true));
        }

        let existing = self
            .store
            .get_item(&key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("item {key} vanished during enqueue")))?;
        Ok((existing, false))
    }

    /// Claim an item for processing: pending -> classifying, atomically.
    /// Returns false if another claim already succeeded.
    pub async fn claim(&self, item: &Item) -> AppResult<bool> {
        self.store
            .compare_and_set_state(
                &item.idempotency_key,
                ItemState::Pending,
                ItemState::Classifying,
            )
            .await
    }

    /// Record a successful classification: classifying -> classified.
    ///
    /// The state moves before the record is inserted; an attempt that lost its
    /// claim in the meantime (swept, quarantined) must not leave its result
    /// behind as the item's current classification.
    pub async fn complete(&self, item: &Item, record: ClassificationRecord) -> AppResult<()> {
        let moved = self
            .store
            .compare_and_set_state(
                &item.idempotency_key,
                ItemState::Classifying,
                ItemState::Classified,
            )
            .await?;
        if !moved {
            return Err(AppError::Conflict(format!(
                "item {} was not classifying at completion",
                item.id
            )));
        }

        let needs_review = record.needs_review;
        self.store.insert_classification(record).await?;
        self.store
            .set_review_flag(&item.idempotency_key, needs_review)
            .await?;
        self.store.clear_last_error(&item.idempotency_key).await?;
        Ok(())
    }

    /// Record a failed attempt: classifying -> failed, cascading to
    /// quarantined once the retry budget is spent. Returns the resulting state.
    pub async fn fail(&self, item: &Item, error: &str) -> AppResult<ItemState> {
        let attempts = self
            .store
            .increment_attempt(&item.idempotency_key, Some(error))
            .await?;

        let target = if attempts >= self.max_retries {
            ItemState::Quarantined
        } else {
            ItemState::Failed
        };

        let moved = self
            .store
            .compare_and_set_state(&item.idempotency_key, ItemState::Classifying, target)
            .await?;
        if !moved {
            return Err(AppError::Conflict(format!(
                "item {} was not classifying at failure",
                item.id
            )));
        }

        if target == ItemState::Quarantined {
            tracing::warn!(
                "Item {} quarantined after {} attempts: {}",
                item.id,
                attempts,
                error
            );
        }
        Ok(target)
    }

    /// Force an item out of automatic processing. Accepted from either
    /// in-flight or failed states.
    pub async fn quarantine(&self, item: &Item) -> AppResult<()> {
        for from in [ItemState::Classifying, ItemState::Failed] {
            if self
                .store
                .compare_and_set_state(&item.idempotency_key, from, ItemState::Quarantined)
                .await?
            {
                return Ok(());
            }
        }
        Err(AppError::Conflict(format!(
            "item {} cannot be quarantined from state {}",
            item.id, item.state
        )))
    }

    /// Return failed items with remaining retry budget to pending.
    pub async fn release_failed(&self) -> AppResult<usize> {
        let failed = self.store.items_in_state(ItemState::Failed).await?;
        let mut released = 0;
        for item in failed {
            if item.attempt_count >= self.max_retries {
                continue;
            }
            if self
                .store
                .compare_and_set_state(&item.idempotency_key, ItemState::Failed, ItemState::Pending)
                .await?
            {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Recover items stuck in `classifying` past the staleness threshold,
    /// e.g. after a worker crash mid-processing. Each swept item returns to
    /// pending with its attempt count bumped exactly once.
    pub async fn sweep_stale(&self) -> AppResult<Vec<Item>> {
        let stale = self.store.stale_classifying(self.stale_after).await?;
        let mut swept = Vec::new();
        for item in stale {
            let moved = self
                .store
                .compare_and_set_state(
                    &item.idempotency_key,
                    ItemState::Classifying,
                    ItemState::Pending,
                )
                .await?;
            if !moved {
                continue;
            }
            self.store
                .increment_attempt(
                    &item.idempotency_key,
                    Some("stale classifying attempt swept"),
                )
                .await?;
            tracing::warn!(
                "Swept stale item {} back to pending (attempt {})",
                item.id,
                item.attempt_count + 1
            );
            if let Some(refreshed) = self.store.get_item(&item.idempotency_key).await? {
                swept.push(refreshed);
            }
        }
        Ok(swept)
    }

    /// Reopen a classified item for feedback-triggered reclassification.
    pub async fn reopen(&self, item: &Item) -> AppResult<bool> {
        self.store
            .compare_and_set_state(
                &item.idempotency_key,
                ItemState::Classified,
                ItemState::Classifying,
            )
            .await
    }
}
