//! In-memory ItemStore. One RwLock guards all tables, so compare-and-set is
//! trivially atomic with respect to every other mutation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    error::{AppError, AppResult},
    model::{ClassificationRecord, CycleReport, Item, ItemState, UserFeedback},
    resilience::CircuitSnapshot,
};

use super::ItemStore;

#[derive(Default)]
struct Tables {
    items: HashMap<String, Item>,
    classifications: HashMap<String, Vec<ClassificationRecord>>,
    cursor: Option<String>,
    cycles: Vec<CycleReport>,
    feedback: HashMap<String, UserFeedback>,
    circuits: Vec<CircuitSnapshot>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_count(&self) -> usize {
        self.tables.read().unwrap().cycles.len()
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.tables.read().unwrap().cycles.last().cloned()
    }

    pub fn classification_history(&self, item_key: &str) -> Vec<ClassificationRecord> {
        self.tables
            .read()
            .unwrap()
            .classifications
            .get(item_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.tables.read().unwrap().circuits.clone()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn insert_item(&self, item: Item) -> AppResult<bool> {
        let mut tables = self.tables.write().unwrap();
        if tables.items.contains_key(&item.idempotency_key) {
            return Ok(false);
        }
        tables.items.insert(item.idempotency_key.clone(), item);
        Ok(true)
    }

    async fn get_item(&self, idempotency_key: &str) -> AppResult<Option<Item>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .items
            .get(idempotency_key)
            .cloned())
    }

    async fn compare_and_set_state(
        &self,
        idempotency_key: &str,
        from: ItemState,
        to: ItemState,
    ) -> AppResult<bool> {
        let mut tables = self.tables.write().unwrap();
        let item = tables
            .items
            .get_mut(idempotency_key)
            .ok_or_else(|| AppError::NotFound(format!("item {idempotency_key}")))?;
        if item.state != from {
            return Ok(false);
        }
        item.state = to;
        item.state_changed_at = Utc::now();
        Ok(true)
    }

    async fn increment_attempt(
        &self,
        idempotency_key: &str,
        error: Option<&str>,
    ) -> AppResult<u32> {
        let mut tables = self.tables.write().unwrap();
        let item = tables
            .items
            .get_mut(idempotency_key)
            .ok_or_else(|| AppError::NotFound(format!("item {idempotency_key}")))?;
        item.attempt_count += 1;
        if let Some(error) = error {
            item.last_error = Some(error.to_string());
        }
        Ok(item.attempt_count)
    }

    async fn set_review_flag(&self, idempotency_key: &str, needs_review: bool) -> AppResult<()> {
        let mut tables = self.tables.write().unwrap();
        let item = tables
            .items
            .get_mut(idempotency_key)
            .ok_or_else(|| AppError::NotFound(format!("item {idempotency_key}")))?;
        item.needs_review = needs_review;
        Ok(())
    }

    async fn clear_last_error(&self, idempotency_key: &str) -> AppResult<()> {
        let mut tables = self.tables.write().unwrap();
        let item = tables
            .items
            .get_mut(idempotency_key)
            .ok_or_else(|| AppError::NotFound(format!("item {idempotency_key}")))?;
        item.last_error = None;
        Ok(())
    }

    async fn items_in_state(&self, state: ItemState) -> AppResult<Vec<Item>> {
        let tables = self.tables.read().unwrap();
        let mut items: Vec<Item> = tables
            .items
            .values()
            .filter(|i| i.state == state)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(items)
    }

    async fn count_in_state(&self, state: ItemState) -> AppResult<usize> {
        let tables = self.tables.read().unwrap();
        Ok(tables.items.values().filter(|i| i.state == state).count())
    }

    async fn stale_classifying(&self, older_than: chrono::Duration) -> AppResult<Vec<Item>> {
        let cutoff = Utc::now() - older_than;
        let tables = self.tables.read().unwrap();
        let mut items: Vec<Item> = tables
            .items
            .values()
            .filter(|i| i.state == ItemState::Classifying && i.state_changed_at <= cutoff)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.state_changed_at.cmp(&b.state_changed_at));
        Ok(items)
    }

    async fn insert_classification(&self, record: ClassificationRecord) -> AppResult<()> {
        let mut tables = self.tables.write().unwrap();
        tables
            .classifications
            .entry(record.item_key.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn current_classification(
        &self,
        item_key: &str,
    ) -> AppResult<Option<ClassificationRecord>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .classifications
            .get(item_key)
            .and_then(|records| records.iter().rev().find(|r| !r.superseded))
            .cloned())
    }

    async fn supersede_classification(&self, item_key: &str) -> AppResult<()> {
        let mut tables = self.tables.write().unwrap();
        if let Some(records) = tables.classifications.get_mut(item_key) {
            for record in records.iter_mut() {
                record.superseded = true;
            }
        }
        Ok(())
    }

    async fn load_cursor(&self) -> AppResult<Option<String>> {
        Ok(self.tables.read().unwrap().cursor.clone())
    }

    async fn save_cursor(&self, cursor: &str) -> AppResult<()> {
        self.tables.write().unwrap().cursor = Some(cursor.to_string());
        Ok(())
    }

    async fn insert_cycle(&self, report: CycleReport) -> AppResult<()> {
        self.tables.write().unwrap().cycles.push(report);
        Ok(())
    }

    async fn insert_feedback(&self, feedback: UserFeedback) -> AppResult<()> {
        self.tables
            .write()
            .unwrap()
            .feedback
            .insert(feedback.id.clone(), feedback);
        Ok(())
    }

    async fn unincorporated_feedback(&self) -> AppResult<Vec<UserFeedback>> {
        let tables = self.tables.read().unwrap();
        let mut rows: Vec<UserFeedback> = tables
            .feedback
            .values()
            .filter(|f| !f.incorporated)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn mark_feedback_incorporated(&self, feedback_id: &str) -> AppResult<()> {
        let mut tables = self.tables.write().unwrap();
        let row = tables
            .feedback
            .get_mut(feedback_id)
            .ok_or_else(|| AppError::NotFound(format!("feedback {feedback_id}")))?;
        row.incorporated = true;
        Ok(())
    }

    async fn record_circuit(&self, snapshot: CircuitSnapshot) -> AppResult<()> {
        self.tables.write().unwrap().circuits.push(snapshot);
        Ok(())
    }
}
