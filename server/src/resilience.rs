//! Retry and circuit-breaker wrapper for external calls.
//!
//! Each call retries transient failures with exponential backoff and jitter;
//! an exhausted call counts as one consecutive failure toward the breaker.
//! The generation service and the embedding service each get their own
//! breaker instance, shared by all callers of that dependency.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    error::{AppError, AppResult},
    server_config::cfg,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker, recorded to the store at cycle end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    pub fn from_config() -> Self {
        Self {
            max_attempts: cfg.resilience.max_attempts,
            backoff_base_ms: cfg.resilience.backoff_base_ms,
            backoff_max_ms: cfg.resilience.backoff_max_ms,
        }
    }

    /// Exponential delay for the given 1-based attempt, plus up to 50% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
            .min(self.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }
}

struct CircuitInner {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_cooldown: Duration,
    retry: RetryPolicy,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        failure_threshold: u32,
        open_cooldown: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            open_cooldown,
            retry,
            inner: Arc::new(Mutex::new(CircuitInner {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_utc: None,
                trial_in_flight: false,
            })),
        }
    }

    pub fn from_config(name: &str) -> Self {
        Self::new(
            name,
            cfg.resilience.failure_threshold,
            Duration::from_secs(cfg.resilience.open_cooldown_secs),
            RetryPolicy::from_config(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().unwrap().status
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitSnapshot {
            dependency: self.name.clone(),
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_utc,
            recorded_at: Utc::now(),
        }
    }

    /// Run one guarded call: fail fast while open, admit exactly one trial
    /// after the cooldown, and retry transient errors with backoff in between.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.admit()?;

        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => {
                    self.on_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "{} call failed (attempt {}/{}), retrying in {:?}: {}",
                        self.name,
                        attempt,
                        self.retry.max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    self.on_transient_failure();
                    return Err(err);
                }
                Err(err) => {
                    // The dependency answered; a contract-shaped failure is
                    // not evidence the service is down.
                    self.on_non_transient();
                    return Err(err);
                }
            }
        }
    }

    fn admit(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.status {
            CircuitStatus::Closed => Ok(()),
            CircuitStatus::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_cooldown {
                    inner.status = CircuitStatus::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("{} circuit half-open, admitting one trial call", self.name);
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitStatus::HalfOpen => {
                if inner.trial_in_flight {
                    Err(AppError::CircuitOpen(self.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != CircuitStatus::Closed {
            tracing::info!("{} circuit closed", self.name);
        }
        inner.status = CircuitStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.opened_at_utc = None;
        inner.trial_in_flight = false;
    }

    fn on_transient_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;
        let failed_trial = inner.status == CircuitStatus::HalfOpen;
        if failed_trial || inner.consecutive_failures >= self.failure_threshold {
            inner.status = CircuitStatus::Open;
            inner.opened_at = Some(Instant::now());
            inner.opened_at_utc = Some(Utc::now());
            tracing::warn!(
                "{} circuit open after {} consecutive failures (cooldown {:?})",
                self.name,
                inner.consecutive_failures,
                self.open_cooldown
            );
        }
    }

    fn on_non_transient(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.trial_in_flight = false;
        if inner.status == CircuitStatus::HalfOpen {
            // The trial reached the service, so it is back.
            inner.status = CircuitStatus::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.opened_at_utc = None;
        }
    }
}
