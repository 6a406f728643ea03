#![allow(dead_code)]

mod contract;
mod error;
mod feedback;
mod model;
mod notify;
mod observability;
mod pipeline;
mod prompt;
mod queue;
mod rate_limiters;
mod resilience;
mod retrieval;
mod server_config;
mod store;
#[cfg(test)]
mod testing;
mod util;

use std::{sync::Arc, time::Duration};

use mimalloc::MiMalloc;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    feedback::FeedbackService,
    notify::{EventSink, NotifierService, NullSink, WebhookSink},
    observability::CycleTracker,
    pipeline::{
        source::{HttpMailSource, MailSource},
        CycleScheduler, Orchestrator,
    },
    prompt::generation::{GenerationClient, HttpGenerationService},
    queue::IdempotentQueue,
    rate_limiters::RateLimiters,
    resilience::CircuitBreaker,
    retrieval::{ContextRetriever, HttpEmbedder, MemoryIndex},
    store::MemoryStore,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    server_config::validate_required_settings()?;
    let cfg = &*server_config::cfg;
    tracing::info!("\n{}", cfg);

    let http_client: HttpClient = reqwest::ClientBuilder::new().use_rustls_tls().build()?;
    let rate_limiters = RateLimiters::from_config();

    let store = Arc::new(MemoryStore::new());
    let queue = IdempotentQueue::from_config(store);

    let retriever = ContextRetriever::from_config(
        Arc::new(HttpEmbedder::new(http_client.clone(), rate_limiters.clone())),
        Arc::new(MemoryIndex::new()),
        CircuitBreaker::from_config("embedding"),
    );
    let classifier = GenerationClient::new(
        Arc::new(HttpGenerationService::new(
            http_client.clone(),
            rate_limiters.clone(),
        )),
        CircuitBreaker::from_config("generation"),
    );
    let source: Arc<dyn MailSource> = Arc::new(HttpMailSource::from_config(http_client.clone())?);

    let shutdown = CancellationToken::new();
    let sink: Arc<dyn EventSink> = if cfg.notifier.webhook_url.is_empty() {
        tracing::info!("No webhook configured, events will not be delivered");
        Arc::new(NullSink)
    } else {
        Arc::new(WebhookSink::new(
            http_client.clone(),
            &cfg.notifier.webhook_url,
        ))
    };
    let (notifier, notifier_task) = NotifierService::start(sink, shutdown.clone());

    let tracker = CycleTracker::new();
    let orchestrator = Orchestrator::from_config(
        source.clone(),
        queue.clone(),
        retriever.clone(),
        classifier.clone(),
        notifier,
        tracker.clone(),
    );
    let initial_schedule = orchestrator.load_schedule_state().await?;
    let cycle_scheduler = CycleScheduler::new(orchestrator, initial_schedule);
    let feedback = FeedbackService::from_config(source, queue, retriever.clone(), classifier.clone());

    let mut scheduler = JobScheduler::new().await?;

    {
        let cycle_scheduler = cycle_scheduler.clone();
        scheduler
            .add(Job::new_repeated_async(
                Duration::from_secs(cfg.settings.poll_interval_secs),
                move |_uuid, _l| {
                    let cycle_scheduler = cycle_scheduler.clone();
                    Box::pin(async move {
                        cycle_scheduler.tick().await;
                    })
                },
            )?)
            .await?;

        let feedback = feedback.clone();
        scheduler
            .add(Job::new_repeated_async(
                Duration::from_secs(cfg.settings.feedback_interval_secs),
                move |_uuid, _l| {
                    let feedback = feedback.clone();
                    Box::pin(async move {
                        match feedback.incorporate_pending().await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!("Incorporated {n} corrections"),
                            Err(e) => tracing::error!("Feedback pass failed: {e}"),
                        }
                    })
                },
            )?)
            .await?;

        let tracker = tracker.clone();
        let rate_limiters = rate_limiters.clone();
        let generation_breaker = classifier.breaker().clone();
        let embedding_breaker = retriever.breaker().clone();
        scheduler
            .add(Job::new_repeated(
                Duration::from_secs(cfg.settings.status_interval_secs),
                move |_uuid, _l| {
                    if let Some(table) = tracker.get_status_table() {
                        tracing::info!("Pipeline status:\n{}", table);
                    }
                    tracing::info!(
                        "Rate limits: {} | circuits: generation={} embedding={}",
                        rate_limiters.get_status(),
                        generation_breaker.status(),
                        embedding_breaker.status(),
                    );
                },
            )?)
            .await?;
    }

    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));

    scheduler.start().await?;
    tracing::info!(
        "Classification pipeline started, polling every {}s",
        cfg.settings.poll_interval_secs
    );

    shutdown_signal().await;
    shutdown.cancel();
    scheduler.shutdown().await?;
    let _ = notifier_task.await;
    tracing::info!("Cleanups done, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
