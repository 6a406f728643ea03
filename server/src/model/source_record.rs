use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw message as delivered by the mailbox feed. The feed is at-least-once:
/// the same record may show up in consecutive batches and is collapsed by the
/// queue's idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable message id from the source. May be empty for malformed senders,
    /// in which case the item id falls back to the content digest.
    #[serde(default)]
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// One page of the feed plus the cursor to resume from next cycle. The final
/// page carries no cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBatch {
    pub records: Vec<SourceRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_page_without_cursor_deserializes() {
        let batch: SourceBatch = serde_json::from_str(
            r#"{
                "records": [{
                    "id": "m1",
                    "subject": "Subject",
                    "sender": "sender@uni.edu",
                    "body": "Body",
                    "received_at": "2026-08-30T12:00:00Z"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.next_cursor.is_none());

        let batch: SourceBatch =
            serde_json::from_str(r#"{"records": [], "next_cursor": "page-2"}"#).unwrap();
        assert_eq!(batch.next_cursor.as_deref(), Some("page-2"));
    }
}
