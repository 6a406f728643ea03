//! Prompt templates and chat wire types for the classification model.

pub mod generation;

use std::sync::LazyLock;

use indexmap::IndexMap;
use indoc::{formatdoc, indoc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{model::ContextChunk, server_config::cfg};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: String) -> Self {
        Self {
            role: "system".to_string(),
            content,
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<PromptUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

/// Response-format hint sent alongside the prompt.
pub static RESPONSE_FORMAT: LazyLock<serde_json::Value> =
    LazyLock::new(|| json!({ "type": "json_object" }));

/// Authoritative taxonomy rendered for the system prompt. IndexMap keeps the
/// config order so repeated runs build byte-identical prompts.
static TAXONOMY: LazyLock<String> = LazyLock::new(|| {
    let mut category_map: IndexMap<String, Vec<String>> = IndexMap::new();
    for category in &cfg.categories {
        let entry = category_map.entry(category.parent.clone()).or_default();
        for kind in &category.kinds {
            entry.push(format!("{}.{}", category.parent, kind));
        }
    }

    category_map
        .iter()
        .map(|(parent, values)| {
            let value_lines = values
                .iter()
                .map(|v| format!("  • \"{}\"", v))
                .collect::<Vec<_>>()
                .join("\n");
            format!("• \"{}\"\n{}", parent, value_lines)
        })
        .collect::<Vec<_>>()
        .join("\n")
});

const CLASSIFICATION_INSTRUCTIONS: &str = indoc! {r#"
    Read the email content carefully (subject, sender, body).
    Determine the sender's intent, not the reader's reaction.
    Choose the single best primary category from the taxonomy.
    List up to three secondary categories only when they clearly also apply.
    Do not invent categories outside the taxonomy.
    Extract a deadline only when the email states or strongly implies one."#
};

const OUTPUT_CONTRACT: &str = indoc! {r#"
    You will only respond with a JSON object with the keys primary_category,
    secondary_categories, confidence, rationale, priority, deadline_utc,
    deadline_confidence, sentiment, suggested_folder, and schema_version.
    "confidence" is a float between 0 and 1 representing classification certainty.
    "rationale" is at most 200 characters.
    "priority" is one of "low", "normal", "high", "urgent".
    "deadline_confidence" is one of "extracted", "inferred", "none".
    "sentiment" is one of "positive", "neutral", "negative", or null.
    "schema_version" is always "v2".
    Do not add any other keys or any prose outside the JSON object."#
};

pub fn system_prompt() -> String {
    formatdoc! {r#"
        You are an email triage engine.
        Your task is to classify the given email into categories from the predefined taxonomy below.

        Instructions:
        {CLASSIFICATION_INSTRUCTIONS}

        Taxonomy (authoritative):

        {taxonomy}

        {OUTPUT_CONTRACT}"#,
        taxonomy = &*TAXONOMY,
    }
}

fn render_context(context: &[ContextChunk]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let lines = context
        .iter()
        .map(|c| format!("- {}", c.prompt_line()))
        .collect::<Vec<_>>()
        .join("\n");
    formatdoc! {r#"
        Previously classified similar emails, for reference only:
        {lines}

        "#}
}

pub fn classification_user_prompt(
    subject: &str,
    sender: &str,
    body: &str,
    context: &[ContextChunk],
) -> String {
    formatdoc! {r#"
        {context}Classify the following email based on subject, sender, and body.
        Make a reasonable choice based on the intent, formatting, tone, and typical conventions.

        <subject>{subject}</subject>
        <sender>{sender}</sender>
        <body>{body}</body>"#,
        context = render_context(context),
    }
}

/// Stricter retry prompt used after a malformed response: no retrieved
/// context, truncated body, and the format reminder repeated last.
pub fn simplified_user_prompt(subject: &str, sender: &str, body: &str) -> String {
    let body = crate::util::truncate_chars(body, 1000);
    formatdoc! {r#"
        Classify the following email.

        <subject>{subject}</subject>
        <sender>{sender}</sender>
        <body>{body}</body>

        Respond with ONLY the JSON object described in your instructions.
        No markdown fences, no commentary, no extra keys."#
    }
}

pub fn classification_messages(
    subject: &str,
    sender: &str,
    body: &str,
    context: &[ContextChunk],
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt()),
        ChatMessage::user(classification_user_prompt(subject, sender, body, context)),
    ]
}

pub fn simplified_messages(subject: &str, sender: &str, body: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt()),
        ChatMessage::user(simplified_user_prompt(subject, sender, body)),
    ]
}
