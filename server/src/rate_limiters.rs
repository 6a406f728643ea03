use std::sync::atomic::Ordering::Relaxed;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::time::Duration;

use leaky_bucket::RateLimiter;

use crate::server_config::{cfg, BucketLimits};

/// Leaky-bucket limiters in front of the generation and embedding endpoints,
/// plus a shared backoff flag tripped by upstream rate-limit responses.
#[derive(Clone)]
pub struct RateLimiters {
    generation: Arc<RateLimiter>,
    embedding: Arc<RateLimiter>,
    backoff: Arc<AtomicBool>,
    backoff_duration: Duration,
}

fn build_bucket(limits: &BucketLimits) -> RateLimiter {
    RateLimiter::builder()
        .initial(1)
        .interval(Duration::from_millis(limits.refill_interval_ms as u64))
        .max(limits.rate_limit_per_sec)
        .refill(limits.refill_amount)
        .build()
}

impl RateLimiters {
    pub fn new(prompt_limits: &BucketLimits, embed_limits: &BucketLimits) -> Self {
        Self {
            generation: Arc::new(build_bucket(prompt_limits)),
            embedding: Arc::new(build_bucket(embed_limits)),
            backoff: Arc::new(AtomicBool::new(false)),
            backoff_duration: Duration::from_secs(60),
        }
    }

    pub fn from_config() -> Self {
        Self::new(&cfg.api.prompt_limits, &cfg.api.embed_limits)
    }

    pub async fn acquire_generation(&self) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }
        self.generation.acquire_one().await;
    }

    pub async fn acquire_embedding(&self) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }
        self.embedding.acquire_one().await;
    }

    /// Trip the backoff flag after an upstream 429; auto-resets after 60s.
    pub fn trigger_backoff(&self) {
        tracing::info!("Triggering backoff...");
        self.backoff.store(true, Relaxed);
        let self_ = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            tracing::info!("Backoff expired");
            self_.backoff.store(false, Relaxed);
        });
    }

    pub fn get_status(&self) -> String {
        let generation = format!("{}/{}", self.generation.balance(), self.generation.max());
        let embedding = format!("{}/{}", self.embedding.balance(), self.embedding.max());
        if self.backoff.load(Relaxed) {
            format!(
                "generation: {} embedding: {} (BACKOFF)",
                generation, embedding
            )
        } else {
            format!("generation: {} embedding: {}", generation, embedding)
        }
    }
}
