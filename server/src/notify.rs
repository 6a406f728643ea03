//! Outbound notifier. Events are fed through a channel to a service task that
//! delivers them best-effort; failed deliveries are held and retried on a
//! timer. Sink failures never roll back the persistence they describe.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{error::AppResult, model::CycleReport, HttpClient};

const RETRY_INTERVAL: Duration = Duration::from_secs(30);
const MAX_HELD_EVENTS: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ItemClassified {
        item_id: String,
        primary_category: String,
        confidence: f32,
        needs_review: bool,
    },
    ItemQuarantined {
        item_id: String,
        attempt_count: u32,
        last_error: Option<String>,
    },
    CycleCompleted {
        report: CycleReport,
    },
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &PipelineEvent) -> AppResult<()>;
}

/// Posts events as JSON to a configured webhook.
pub struct WebhookSink {
    http_client: HttpClient,
    endpoint: String,
}

impl WebhookSink {
    pub fn new(http_client: HttpClient, endpoint: &str) -> Self {
        Self {
            http_client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn deliver(&self, event: &PipelineEvent) -> AppResult<()> {
        self.http_client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await?
            .error_for_status()
            .map_err(crate::error::AppError::from)?;
        Ok(())
    }
}

/// Discards events. Used when no webhook is configured.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, _event: &PipelineEvent) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl NotifierHandle {
    /// Fire-and-forget. A closed channel only means shutdown is in progress.
    pub fn send(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Notifier channel closed, dropping event");
        }
    }
}

pub struct NotifierService;

impl NotifierService {
    pub fn start(
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> (NotifierHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();

        let handle = tokio::spawn(async move {
            let mut held: VecDeque<PipelineEvent> = VecDeque::new();
            let mut retry_tick = tokio::time::interval(RETRY_INTERVAL);
            retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if !held.is_empty() {
                            tracing::warn!("Notifier shutting down with {} undelivered events", held.len());
                        }
                        break;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => Self::deliver_or_hold(&*sink, event, &mut held).await,
                            None => break,
                        }
                    }
                    _ = retry_tick.tick() => {
                        let pending = held.len();
                        for _ in 0..pending {
                            let event = held.pop_front().unwrap();
                            Self::deliver_or_hold(&*sink, event, &mut held).await;
                        }
                    }
                }
            }
        });

        (NotifierHandle { tx }, handle)
    }

    async fn deliver_or_hold(
        sink: &dyn EventSink,
        event: PipelineEvent,
        held: &mut VecDeque<PipelineEvent>,
    ) {
        if let Err(e) = sink.deliver(&event).await {
            tracing::warn!("Event delivery failed, holding for retry: {e}");
            held.push_back(event);
            if held.len() > MAX_HELD_EVENTS {
                held.pop_front();
                tracing::warn!("Held event buffer full, dropped oldest event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::common::RecordingSink;

    fn classified(id: &str) -> PipelineEvent {
        PipelineEvent::ItemClassified {
            item_id: id.to_string(),
            primary_category: "academic.exams".to_string(),
            confidence: 0.9,
            needs_review: false,
        }
    }

    #[tokio::test]
    async fn test_events_reach_sink() {
        let sink = Arc::new(RecordingSink::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = NotifierService::start(sink.clone(), shutdown.clone());

        handle.send(classified("m1"));
        handle.send(classified("m2"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.delivered().len(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_block_senders() {
        let sink = Arc::new(RecordingSink::failing_first(10));
        let shutdown = CancellationToken::new();
        let (handle, task) = NotifierService::start(sink.clone(), shutdown.clone());

        // send() never errors even while the sink is down.
        handle.send(classified("m1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.delivered().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(classified("m1")).unwrap();
        assert_eq!(json["event"], "item_classified");
        assert_eq!(json["item_id"], "m1");
    }
}
