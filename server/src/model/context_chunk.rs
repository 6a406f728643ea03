use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One retrievable unit in the similarity index. Appended from the hot path on
/// successful classification and from the feedback task on corrections; never
/// mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub embedding: Vec<f32>,
    pub text_summary: String,
    pub label_association: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl ContextChunk {
    pub fn new(id: &str, embedding: Vec<f32>, text_summary: &str, label: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            embedding,
            text_summary: text_summary.to_string(),
            label_association: label.map(|l| l.to_string()),
            inserted_at: Utc::now(),
        }
    }

    /// Rendering used inside prompts.
    pub fn prompt_line(&self) -> String {
        match &self.label_association {
            Some(label) => format!("[{}] {}", label, self.text_summary),
            None => self.text_summary.clone(),
        }
    }
}
