//! Generation client: builds the prompt, invokes the model through the
//! retry/circuit-breaker wrapper, and validates the output against the
//! classification contract. A malformed response gets exactly one retry with
//! the simplified prompt before the attempt is reported failed.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::json;

use crate::{
    contract::{self, ClassificationPayload},
    error::{AppError, AppResult},
    model::{ContextChunk, Item},
    rate_limiters::RateLimiters,
    resilience::CircuitBreaker,
    server_config::{api_key, cfg},
    util, HttpClient,
};

use super::{
    classification_messages, simplified_messages, ChatApiResponseOrError, ChatMessage,
    RESPONSE_FORMAT,
};

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        response_format: &serde_json::Value,
    ) -> AppResult<String>;
}

/// Chat-completions client with deterministic settings (temperature from
/// config, 0.0 by default) so unchanged input classifies identically.
pub struct HttpGenerationService {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    endpoint: String,
    model_id: String,
    temperature: f64,
}

impl HttpGenerationService {
    pub fn new(http_client: HttpClient, rate_limiters: RateLimiters) -> Self {
        Self {
            http_client,
            rate_limiters,
            endpoint: cfg.api.generation_endpoint.clone(),
            model_id: cfg.model.id.clone(),
            temperature: cfg.model.temperature,
        }
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        response_format: &serde_json::Value,
    ) -> AppResult<String> {
        self.rate_limiters.acquire_generation().await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key())
            .json(&json!({
                "model": &self.model_id,
                "temperature": self.temperature,
                "messages": messages,
                "response_format": response_format,
            }))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .context(format!("Could not parse chat response: {}", resp))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                if error.message.contains("rate limit") {
                    self.rate_limiters.trigger_backoff();
                    return Err(AppError::TooManyRequests);
                }
                return Err(AppError::Transient(format!("Chat API error: {:?}", error)));
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| anyhow!("No choices in response"))?;
        Ok(choice.message.content.clone())
    }
}

/// A validated classification plus the context ids that informed it.
#[derive(Debug, Clone)]
pub struct Classified {
    pub payload: ClassificationPayload,
    pub retrieved_context_ids: Vec<String>,
}

#[derive(Clone)]
pub struct GenerationClient {
    service: Arc<dyn GenerationService>,
    breaker: CircuitBreaker,
}

impl GenerationClient {
    pub fn new(service: Arc<dyn GenerationService>, breaker: CircuitBreaker) -> Self {
        Self { service, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn classify(
        &self,
        item: &Item,
        body: &str,
        context: &[ContextChunk],
    ) -> AppResult<Classified> {
        let context_ids: Vec<String> = context.iter().map(|c| c.id.clone()).collect();

        let messages = classification_messages(&item.subject, &item.sender, body, context);
        let raw = self.generate(&messages).await?;

        match contract::validate(&raw) {
            Ok(payload) => Ok(Classified {
                payload,
                retrieved_context_ids: context_ids,
            }),
            Err(err) if err.is_contract_violation() => {
                tracing::warn!(
                    "Malformed output for item {} ({}), retrying with simplified prompt. Raw: {}",
                    item.id,
                    err,
                    util::truncate_chars(&raw, 400)
                );
                self.classify_simplified(item, body).await
            }
            Err(err) => Err(err),
        }
    }

    async fn classify_simplified(&self, item: &Item, body: &str) -> AppResult<Classified> {
        let messages = simplified_messages(&item.subject, &item.sender, body);
        let raw = self.generate(&messages).await?;

        contract::validate(&raw)
            .map(|payload| Classified {
                payload,
                // The simplified prompt carries no retrieved context.
                retrieved_context_ids: Vec::new(),
            })
            .map_err(|err| {
                // Keep the raw output with the error for forensic inspection.
                AppError::Contract(format!(
                    "{} (raw output: {})",
                    err,
                    util::truncate_chars(&raw, 400)
                ))
            })
    }

    async fn generate(&self, messages: &[ChatMessage]) -> AppResult<String> {
        let service = self.service.clone();
        let messages = messages.to_vec();
        self.breaker
            .call(|| {
                let service = service.clone();
                let messages = messages.clone();
                async move { service.generate(&messages, &RESPONSE_FORMAT).await }
            })
            .await
    }
}
