use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{contract, util};

use super::SourceRecord;

/// Per-item lifecycle state.
///
/// pending -> classifying -> { classified | failed | quarantined }
/// failed -> pending on retry release; classified -> classifying on
/// feedback-triggered reclassification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Classifying,
    Classified,
    Failed,
    Quarantined,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Classified | ItemState::Quarantined)
    }
}

/// One unit of classification work. Raw bodies are never stored here, only the
/// normalized content digest; retries re-fetch content from the source by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub idempotency_key: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub content_digest: String,
    pub state: ItemState,
    pub attempt_count: u32,
    pub needs_review: bool,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

impl Item {
    pub fn from_source(record: &SourceRecord) -> Self {
        let digest = util::content_digest(&record.subject, &record.sender, &record.body);
        let id = if record.id.is_empty() {
            format!("digest:{}", digest)
        } else {
            record.id.clone()
        };
        let now = Utc::now();

        Self {
            idempotency_key: idempotency_key(&id),
            id,
            subject: record.subject.clone(),
            sender: record.sender.clone(),
            received_at: record.received_at,
            content_digest: digest,
            state: ItemState::Pending,
            attempt_count: 0,
            needs_review: false,
            last_error: None,
            enqueued_at: now,
            state_changed_at: now,
        }
    }
}

/// Deterministic key preventing duplicate processing of the same logical
/// record under the current contract version.
pub fn idempotency_key(item_id: &str) -> String {
    util::sha256_hex(&format!("{}:{}", item_id, contract::SCHEMA_VERSION))
}
