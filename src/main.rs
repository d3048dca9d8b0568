// =============================================================================
// Trade Relay Engine — Main Entry Point
// =============================================================================
//
// Receives trade signals from the charting platform over HTTP and fans them
// out to every configured brokerage account. Intake only enqueues; a single
// sequencer worker dispatches signals strictly in arrival order, and an
// independent reaper cancels pending orders that outlived their bar-count
// validity window.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod candles;
mod catalog;
mod config;
mod dispatcher;
mod filters;
mod notify;
mod reaper;
mod sequencer;
mod signal;
mod sizer;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::catalog::InstrumentCatalog;
use crate::config::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::notify::EventBus;
use crate::reaper::ExpiryReaper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".to_string());
    let store = Arc::new(ConfigStore::load(&config_path)?);

    {
        let config = store.get();
        info!(
            brokers = config.brokers.len(),
            instruments = config.instruments.len(),
            risk_percent = config.general.risk_percent,
            timeout_bars = config.general.order_timeout_bars,
            "trade relay starting"
        );
        if config.webhook.secret.is_empty() {
            warn!("webhook secret is not set; all intake requests will be rejected");
        }
    }

    // ── 2. Event bus & notification sinks ────────────────────────────────
    let events = EventBus::new();
    let _sinks = notify::spawn_sinks(&events, store.clone());

    // ── 3. Instrument catalog & broker adapters ──────────────────────────
    let catalog = Arc::new(InstrumentCatalog::from_config(&store.get()));
    let adapters = broker::build_adapters(&store.get(), &catalog, store.clone());

    for (id, adapter) in &adapters {
        match adapter.connect().await {
            Ok(()) => info!(broker = %id, name = adapter.display_name(), "broker connected"),
            Err(e) => {
                // A broker that cannot connect now may come back later; the
                // adapters reconnect on demand.
                error!(broker = %id, error = %e, "broker connection failed");
            }
        }
    }

    // ── 4. Shared state & signal queue ───────────────────────────────────
    let (queue, queue_rx) = sequencer::channel();
    let state = Arc::new(AppState::new(store.clone(), queue, events.clone()));
    let _recorder = state.clone().spawn_event_recorder();

    // ── 5. HTTP intake server ────────────────────────────────────────────
    let bind_addr = std::env::var("RELAY_BIND_ADDR")
        .unwrap_or_else(|_| store.get().webhook.bind_addr.clone());
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "webhook server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        {
            error!(error = %e, "webhook server failed");
        }
    });

    // ── 6. Sequencer worker (single consumer) ────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        adapters.clone(),
        catalog.clone(),
        store.clone(),
        events.clone(),
    ));
    let worker = sequencer::spawn_worker(
        queue_rx,
        dispatcher,
        store.clone(),
        events.clone(),
        shutdown_rx.clone(),
    );

    // ── 7. Expiry reaper ─────────────────────────────────────────────────
    let reaper = ExpiryReaper::new(
        adapters.clone(),
        catalog.clone(),
        store.clone(),
        events.clone(),
    )
    .spawn(shutdown_rx);

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");

    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    let _ = reaper.await;

    for (id, adapter) in &adapters {
        adapter.disconnect().await;
        info!(broker = %id, "broker session closed");
    }

    info!("trade relay shut down complete");
    Ok(())
}
