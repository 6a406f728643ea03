//! Persistence seam for items, classifications, cursor, cycles, feedback, and
//! circuit snapshots. Engine internals are behind this trait; the pipeline
//! only relies on CRUD plus the atomic compare-and-set claim primitive.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::{
    error::AppResult,
    model::{ClassificationRecord, CycleReport, Item, ItemState, UserFeedback},
    resilience::CircuitSnapshot,
};

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert a new item keyed by idempotency key. Returns false (and leaves
    /// the stored item untouched) when the key already exists.
    async fn insert_item(&self, item: Item) -> AppResult<bool>;

    async fn get_item(&self, idempotency_key: &str) -> AppResult<Option<Item>>;

    /// The one mandatory transactional operation in the pipeline: transition
    /// `from -> to` only if the item is currently in `from`. Returns false if
    /// another caller won the race.
    async fn compare_and_set_state(
        &self,
        idempotency_key: &str,
        from: ItemState,
        to: ItemState,
    ) -> AppResult<bool>;

    /// Bump the attempt counter and record the failure reason.
    /// Returns the new attempt count.
    async fn increment_attempt(
        &self,
        idempotency_key: &str,
        error: Option<&str>,
    ) -> AppResult<u32>;

    async fn set_review_flag(&self, idempotency_key: &str, needs_review: bool) -> AppResult<()>;

    async fn clear_last_error(&self, idempotency_key: &str) -> AppResult<()>;

    async fn items_in_state(&self, state: ItemState) -> AppResult<Vec<Item>>;

    async fn count_in_state(&self, state: ItemState) -> AppResult<usize>;

    /// Items stuck in `classifying` longer than the threshold.
    async fn stale_classifying(&self, older_than: chrono::Duration) -> AppResult<Vec<Item>>;

    async fn insert_classification(&self, record: ClassificationRecord) -> AppResult<()>;

    /// The current (non-superseded) classification for an item, if any.
    async fn current_classification(
        &self,
        item_key: &str,
    ) -> AppResult<Option<ClassificationRecord>>;

    /// Mark the current classification superseded, keeping it for audit.
    async fn supersede_classification(&self, item_key: &str) -> AppResult<()>;

    async fn load_cursor(&self) -> AppResult<Option<String>>;
    async fn save_cursor(&self, cursor: &str) -> AppResult<()>;

    async fn insert_cycle(&self, report: CycleReport) -> AppResult<()>;

    async fn insert_feedback(&self, feedback: UserFeedback) -> AppResult<()>;
    async fn unincorporated_feedback(&self) -> AppResult<Vec<UserFeedback>>;
    async fn mark_feedback_incorporated(&self, feedback_id: &str) -> AppResult<()>;

    async fn record_circuit(&self, snapshot: CircuitSnapshot) -> AppResult<()>;
}
