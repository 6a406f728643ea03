use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use crate::{
    error::AppResult,
    rate_limiters::RateLimiters,
    server_config::{api_key, cfg},
    HttpClient,
};

use super::Embedder;

/// Embedding client against an OpenAI-style /v1/embeddings endpoint.
pub struct HttpEmbedder {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    endpoint: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(http_client: HttpClient, rate_limiters: RateLimiters) -> Self {
        Self {
            http_client,
            rate_limiters,
            endpoint: cfg.api.embedding_endpoint.clone(),
            model: cfg.model.embedding_id.clone(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        self.rate_limiters.acquire_embedding().await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key())
            .json(&json!({
                "model": &self.model,
                "input": text,
            }))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let data = resp["data"].as_array().context("No data array")?;
        let first = data.first().context("No first element")?;
        let embedding_value = &first["embedding"];
        let embedding: Vec<f32> = serde_json::from_value(embedding_value.clone())
            .context("Failed to parse embedding as Vec<f32>")?;
        Ok(embedding)
    }
}
