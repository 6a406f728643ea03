//! Classification output contract (schema v2).
//!
//! Generated payloads are validated fail-closed: unknown fields, out-of-range
//! confidence, oversized label sets, and taxonomy-foreign categories are all
//! rejected before a ClassificationRecord can exist.

use std::sync::LazyLock;

use jsonschema::JSONSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};

use crate::{
    error::{AppError, AppResult},
    server_config::cfg,
};

pub const SCHEMA_VERSION: &str = "v2";

pub const MAX_SECONDARY_CATEGORIES: usize = 3;
pub const MAX_RATIONALE_CHARS: usize = 200;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeadlineConfidence {
    Extracted,
    Inferred,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// The validated shape of one generated classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationPayload {
    pub primary_category: String,
    #[serde(default)]
    pub secondary_categories: Vec<String>,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline_utc: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub deadline_confidence: DeadlineConfidence,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub suggested_folder: Option<String>,
    pub schema_version: String,
}

static CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_]+\.[a-z_]+$").unwrap());

pub static CONTRACT_SCHEMA: LazyLock<serde_json::Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "properties": {
            "primary_category": { "type": "string" },
            "secondary_categories": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": MAX_SECONDARY_CATEGORIES
            },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "rationale": { "type": ["string", "null"], "maxLength": MAX_RATIONALE_CHARS },
            "priority": { "enum": ["low", "normal", "high", "urgent"] },
            "deadline_utc": { "type": ["string", "null"] },
            "deadline_confidence": { "enum": ["extracted", "inferred", "none"] },
            "sentiment": { "enum": ["positive", "neutral", "negative", null] },
            "suggested_folder": { "type": ["string", "null"] },
            "schema_version": { "const": SCHEMA_VERSION }
        },
        "required": ["primary_category", "confidence", "schema_version"],
        "additionalProperties": false
    })
});

pub fn category_is_known(category: &str) -> bool {
    if !CATEGORY_RE.is_match(category) {
        return false;
    }
    let parent = category.split('.').next().unwrap_or_default();
    cfg.categories.iter().any(|c| c.parent == parent)
}

/// Validate one raw generated output against the v2 contract.
///
/// Secondary categories are deduplicated and sorted by name so repeated
/// classification of unchanged input yields a byte-identical label set even
/// when the model emits ties in a different order.
pub fn validate(raw: &str) -> AppResult<ClassificationPayload> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| AppError::Contract(format!("output is not valid JSON: {e}")))?;

    let compiled = JSONSchema::compile(&CONTRACT_SCHEMA)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("contract schema failed to compile: {e}")))?;
    if let Err(errors) = compiled.validate(&value) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(AppError::Contract(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }

    let mut payload: ClassificationPayload = serde_json::from_value(value)
        .map_err(|e| AppError::Contract(format!("payload shape mismatch: {e}")))?;

    if !payload.confidence.is_finite() || !(0.0..=1.0).contains(&payload.confidence) {
        return Err(AppError::Contract(format!(
            "confidence {} outside [0, 1]",
            payload.confidence
        )));
    }
    if !category_is_known(&payload.primary_category) {
        return Err(AppError::Contract(format!(
            "primary_category '{}' is not in the taxonomy",
            payload.primary_category
        )));
    }
    for category in &payload.secondary_categories {
        if !category_is_known(category) {
            return Err(AppError::Contract(format!(
                "secondary category '{}' is not in the taxonomy",
                category
            )));
        }
    }
    if let Some(rationale) = &payload.rationale {
        if rationale.chars().count() > MAX_RATIONALE_CHARS {
            return Err(AppError::Contract(format!(
                "rationale exceeds {} chars",
                MAX_RATIONALE_CHARS
            )));
        }
    }

    payload.secondary_categories.sort();
    payload.secondary_categories.dedup();
    payload
        .secondary_categories
        .retain(|c| c != &payload.primary_category);
    if payload.secondary_categories.len() > MAX_SECONDARY_CATEGORIES {
        return Err(AppError::Contract(format!(
            "more than {} secondary categories",
            MAX_SECONDARY_CATEGORIES
        )));
    }

    Ok(payload)
}
