//! Mailbox feed access. The feed exposes a cursor-paged listing of new
//! messages plus fetch-by-id for retried items whose bodies are no longer in
//! the current page.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{
    error::{AppError, AppResult},
    model::{SourceBatch, SourceRecord},
    server_config::{cfg, MailboxConfig},
    HttpClient,
};

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Fetch records newer than the cursor. `None` starts from the beginning.
    async fn fetch_since(&self, cursor: Option<&str>) -> AppResult<SourceBatch>;

    /// Fetch a single record by source id. `Ok(None)` means the source no
    /// longer has it.
    async fn fetch(&self, id: &str) -> AppResult<Option<SourceRecord>>;
}

pub struct HttpMailSource {
    http_client: HttpClient,
    feed_url: String,
    username: String,
    password: String,
}

impl HttpMailSource {
    pub fn from_config(http_client: HttpClient) -> AppResult<Self> {
        Ok(Self {
            http_client,
            feed_url: cfg.mailbox.feed_url.clone(),
            username: cfg.mailbox.username.clone(),
            password: MailboxConfig::password()
                .ok_or_else(|| AppError::Config("MAILBOX_PASSWORD is not set".to_string()))?,
        })
    }
}

#[async_trait]
impl MailSource for HttpMailSource {
    async fn fetch_since(&self, cursor: Option<&str>) -> AppResult<SourceBatch> {
        let mut request = self
            .http_client
            .get(&self.feed_url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let resp = request.send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AppError::Config(
                "Mailbox feed rejected credentials".to_string(),
            ));
        }
        let batch = resp
            .error_for_status()
            .map_err(AppError::from)?
            .json::<SourceBatch>()
            .await?;
        Ok(batch)
    }

    async fn fetch(&self, id: &str) -> AppResult<Option<SourceRecord>> {
        let url = format!("{}/{}", self.feed_url.trim_end_matches('/'), id);
        let resp = self
            .http_client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = resp
            .error_for_status()
            .map_err(AppError::from)?
            .json::<SourceRecord>()
            .await?;
        Ok(Some(record))
    }
}
