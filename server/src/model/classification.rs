use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::ClassificationPayload;

/// Output of one successful generation + validation cycle for an item.
/// Created only by the contract validator accepting a generated payload; a
/// rejected generation never produces one of these. Reclassification
/// supersedes the previous record but keeps it for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    /// Idempotency key of the owning item.
    pub item_key: String,
    pub payload: ClassificationPayload,
    /// Context chunk ids actually fed into the prompt, in retrieval order.
    pub retrieved_context_ids: Vec<String>,
    pub needs_review: bool,
    pub superseded: bool,
    pub produced_at: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn new(
        item_key: &str,
        payload: ClassificationPayload,
        retrieved_context_ids: Vec<String>,
        review_threshold: f32,
    ) -> Self {
        let needs_review = payload.confidence < review_threshold;
        Self {
            item_key: item_key.to_string(),
            payload,
            retrieved_context_ids,
            needs_review,
            superseded: false,
            produced_at: Utc::now(),
        }
    }
}
