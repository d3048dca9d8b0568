// =============================================================================
// Expiry Reaper — cancels pending orders past their bar-count TTL
// =============================================================================
//
// Periodic sweep across every account: list pending orders, count closed bars
// since each order's broker-side creation time, cancel anything at or past
// the timeout. Orders with no known creation time are never cancelled.
//
// Brokers without native order expiry depend entirely on this loop.
// Per-order failures are logged and notified; the sweep always finishes.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::BrokerAdapter;
use crate::candles;
use crate::catalog::InstrumentCatalog;
use crate::config::ConfigStore;
use crate::notify::{EventBus, TradeEvent};

/// Per-sweep statistics, for logs and the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub orders_checked: usize,
    pub orders_expired: usize,
    pub orders_cancelled: usize,
    pub errors: usize,
}

impl SweepStats {
    fn absorb(&mut self, other: &SweepStats) {
        self.orders_checked += other.orders_checked;
        self.orders_expired += other.orders_expired;
        self.orders_cancelled += other.orders_cancelled;
        self.errors += other.errors;
    }
}

/// Periodic order-expiry service.
pub struct ExpiryReaper {
    adapters: BTreeMap<String, Arc<dyn BrokerAdapter>>,
    catalog: Arc<InstrumentCatalog>,
    store: Arc<ConfigStore>,
    events: EventBus,
}

impl ExpiryReaper {
    pub fn new(
        adapters: BTreeMap<String, Arc<dyn BrokerAdapter>>,
        catalog: Arc<InstrumentCatalog>,
        store: Arc<ConfigStore>,
        events: EventBus,
    ) -> Self {
        Self {
            adapters,
            catalog,
            store,
            events,
        }
    }

    /// Spawn the periodic loop. The current sweep finishes before shutdown
    /// takes effect.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval_secs = self.store.get().execution.reaper_interval_secs.max(1);
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        info!("reaper stopping");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                }

                let stats = self.sweep_all().await;
                if stats.orders_cancelled > 0 || stats.errors > 0 {
                    info!(
                        checked = stats.orders_checked,
                        expired = stats.orders_expired,
                        cancelled = stats.orders_cancelled,
                        errors = stats.errors,
                        "expiry sweep finished"
                    );
                }
            }
        })
    }

    /// One sweep across all accounts.
    pub async fn sweep_all(&self) -> SweepStats {
        let mut total = SweepStats::default();
        for (broker_id, adapter) in &self.adapters {
            let stats = self.sweep_account(broker_id, adapter.as_ref()).await;
            total.absorb(&stats);
        }
        total
    }

    /// Sweep one account. Never aborts on a single order's failure.
    pub async fn sweep_account(
        &self,
        broker_id: &str,
        adapter: &dyn BrokerAdapter,
    ) -> SweepStats {
        let mut stats = SweepStats::default();
        let config = self.store.get();
        let timeout_bars = config.general.order_timeout_bars;
        let bar_minutes = config.general.candle_timeframe_minutes as i64;

        let orders = match adapter.pending_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(broker = broker_id, error = %e, "could not list pending orders");
                stats.errors += 1;
                return stats;
            }
        };
        stats.orders_checked = orders.len();
        if orders.is_empty() {
            return stats;
        }

        let now = Utc::now();
        for order in &orders {
            let Some(created) = order.created_time else {
                // Age-unknown orders are left alone.
                debug!(
                    broker = broker_id,
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    "pending order has no creation time, skipping"
                );
                continue;
            };

            let params = self.catalog.candle_params(&order.symbol);
            let closed = candles::count_closed_bars(created, now, params, bar_minutes);
            if closed < timeout_bars {
                let expires = candles::timeout_instant(created, timeout_bars, params, bar_minutes);
                debug!(
                    broker = broker_id,
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    closed_bars = closed,
                    timeout_bars,
                    expires = %expires.format("%d/%m %H:%M UTC"),
                    "pending order still valid"
                );
                continue;
            }

            stats.orders_expired += 1;
            info!(
                broker = broker_id,
                order_id = %order.order_id,
                symbol = %order.symbol,
                closed_bars = closed,
                "order expired, cancelling"
            );

            match adapter.cancel_order(&order.order_id).await {
                Ok(result) if result.success => {
                    stats.orders_cancelled += 1;
                    self.events.emit(TradeEvent::OrderExpired {
                        broker: adapter.display_name().to_string(),
                        symbol: order.symbol.clone(),
                        order_id: order.order_id.clone(),
                        closed_bars: closed,
                        timeout_bars,
                    });
                }
                Ok(result) => {
                    stats.errors += 1;
                    warn!(
                        broker = broker_id,
                        order_id = %order.order_id,
                        message = %result.message,
                        "cancel rejected"
                    );
                    self.events.emit(TradeEvent::EngineError {
                        broker: Some(adapter.display_name().to_string()),
                        message: format!(
                            "failed to cancel expired order {}: {}",
                            order.order_id, result.message
                        ),
                    });
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(
                        broker = broker_id,
                        order_id = %order.order_id,
                        error = %e,
                        "cancel failed"
                    );
                    self.events.emit(TradeEvent::EngineError {
                        broker: Some(adapter.display_name().to_string()),
                        message: format!("failed to cancel expired order {}: {e}", order.order_id),
                    });
                }
            }
        }
        stats
    }
}
