use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An operator correction awaiting incorporation. The feedback task appends a
/// corrected chunk to the context index, reclassifies the item, and flips
/// `incorporated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: String,
    pub item_key: String,
    pub corrected_category: String,
    pub note: Option<String>,
    pub incorporated: bool,
    pub created_at: DateTime<Utc>,
}
