//! Scripted doubles for the external dependencies: mailbox feed, embedding
//! and generation endpoints, and the notification sink. Each records what it
//! was asked so tests can assert on interactions, not just outcomes.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;

use crate::{
    error::{AppError, AppResult},
    model::{SourceBatch, SourceRecord},
    notify::{EventSink, PipelineEvent},
    pipeline::source::MailSource,
    prompt::{generation::GenerationService, ChatMessage},
    retrieval::Embedder,
};

/// A syntactically and semantically valid v2 classification payload.
pub fn payload_json(category: &str, confidence: f64) -> String {
    json!({
        "primary_category": category,
        "secondary_categories": [],
        "confidence": confidence,
        "rationale": "scripted",
        "priority": "normal",
        "deadline_utc": null,
        "deadline_confidence": "none",
        "sentiment": null,
        "suggested_folder": null,
        "schema_version": "v2",
    })
    .to_string()
}

pub struct ScriptedEmbedder {
    vector: Vec<f32>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn fixed(vector: Vec<f32>) -> Self {
        Self {
            vector,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(vector: Vec<f32>, delay_ms: u64) -> Self {
        Self {
            vector,
            delay: Some(Duration::from_millis(delay_ms)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, _text: &str) -> AppResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.vector.clone())
    }
}

enum GenerationScript {
    Sequence(Mutex<VecDeque<AppResult<String>>>),
    Repeat(String),
    /// Valid output, except prompts containing the marker get garbage.
    PoisonedBy { marker: String, good: String },
}

pub struct ScriptedGeneration {
    script: GenerationScript,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGeneration {
    fn with_script(script: GenerationScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Plays back the given results in order, then errors.
    pub fn returning(responses: Vec<AppResult<String>>) -> Self {
        Self::with_script(GenerationScript::Sequence(Mutex::new(responses.into())))
    }

    /// Returns the same output on every call.
    pub fn repeating(output: String) -> Self {
        Self::with_script(GenerationScript::Repeat(output))
    }

    /// Returns `good` except for prompts containing `marker`, which get a
    /// malformed response. Deterministic under concurrent processing.
    pub fn poisoned_by(marker: &str, good: String) -> Self {
        Self::with_script(GenerationScript::PoisonedBy {
            marker: marker.to_string(),
            good,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User-message content of every prompt seen, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _response_format: &serde_json::Value,
    ) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user_content = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(user_content.clone());

        match &self.script {
            GenerationScript::Sequence(responses) => {
                responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                    Err(AppError::Internal(anyhow::anyhow!(
                        "scripted generation exhausted"
                    )))
                })
            }
            GenerationScript::Repeat(output) => Ok(output.clone()),
            GenerationScript::PoisonedBy { marker, good } => {
                if user_content.contains(marker) {
                    Ok("this is not a json object".to_string())
                } else {
                    Ok(good.clone())
                }
            }
        }
    }
}

/// Scripted mailbox feed: batches play back in order, fetch-by-id serves any
/// record ever pushed.
#[derive(Default)]
pub struct ScriptedSource {
    batches: Mutex<VecDeque<AppResult<SourceBatch>>>,
    by_id: Mutex<HashMap<String, SourceRecord>>,
    cursors_seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, records: Vec<SourceRecord>, next_cursor: Option<&str>) {
        let mut by_id = self.by_id.lock().unwrap();
        for record in &records {
            if !record.id.is_empty() {
                by_id.insert(record.id.clone(), record.clone());
            }
        }
        self.batches.lock().unwrap().push_back(Ok(SourceBatch {
            records,
            next_cursor: next_cursor.map(str::to_string),
        }));
    }

    pub fn push_error(&self, error: AppError) {
        self.batches.lock().unwrap().push_back(Err(error));
    }

    /// Cursor argument of every fetch_since call, in order.
    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.cursors_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSource for ScriptedSource {
    async fn fetch_since(&self, cursor: Option<&str>) -> AppResult<SourceBatch> {
        self.cursors_seen
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SourceBatch {
                records: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn fetch(&self, id: &str) -> AppResult<Option<SourceRecord>> {
        Ok(self.by_id.lock().unwrap().get(id).cloned())
    }
}

/// Event sink that records deliveries, optionally failing the first few.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<PipelineEvent>>,
    failures_left: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(failures),
        }
    }

    pub fn delivered(&self) -> Vec<PipelineEvent> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: &PipelineEvent) -> AppResult<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AppError::Transient("sink unavailable".to_string()));
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}
