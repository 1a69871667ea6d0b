use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use core_http::{core_router, CoreHttpState};
use event_ledger::InMemoryEventLedger;
use gateway_webhook::{webhook_router, WebhookProcessor, WebhookState};
use observability::init_tracing;
use platform_core::AppConfig;
use platform_settings::{InMemorySettingsProvider, PlatformSettings};
use settlement::{spawn_release_sweep_loop, NoopNotificationSink, SettlementEngine};
use settlement_store::InMemorySettlementStore;
use tokio::sync::oneshot;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);

    let store = InMemorySettlementStore::new();
    let settings = Arc::new(InMemorySettingsProvider::new(PlatformSettings::default()));
    let engine = Arc::new(
        SettlementEngine::new(store, settings)
            .with_notifications(Arc::new(NoopNotificationSink)),
    );
    let ledger = Arc::new(InMemoryEventLedger::new());

    let webhook_state = Arc::new(WebhookState {
        processor: Arc::new(WebhookProcessor::new(engine.clone(), ledger)),
        secret: config.gateway.webhook_secret.clone(),
        tolerance_secs: config.gateway.signature_tolerance_secs,
    });
    let router = core_router(Arc::new(CoreHttpState {
        engine: engine.clone(),
    }))
    .merge(webhook_router(webhook_state));

    let (sweep_shutdown_tx, sweep_shutdown_rx) = oneshot::channel();
    let sweep_handle = spawn_release_sweep_loop(
        engine,
        Duration::from_millis(config.sweep.poll_interval_ms),
        sweep_shutdown_rx,
    );

    let listener = tokio::net::TcpListener::bind(&config.app.http_bind_addr).await?;
    info!(
        bind_addr = %config.app.http_bind_addr,
        env = config.app.env.as_str(),
        sweep_interval_ms = config.sweep.poll_interval_ms,
        "settlement server listening"
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = sweep_shutdown_tx.send(());
    let _ = sweep_handle.await;
    info!("settlement server stopped");
    Ok(())
}
