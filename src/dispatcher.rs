// =============================================================================
// Dispatcher — fans one signal out to every eligible account
// =============================================================================
//
// Accounts are processed strictly in order with a randomized pause between
// them, so two brokers never see the same signal in the same instant. Each
// account runs the filter chain, gets a freshly sized order, and reports an
// outcome; a failure on one account never touches the others.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, OrderRequest};
use crate::catalog::InstrumentCatalog;
use crate::config::ConfigStore;
use crate::filters::{self, FilterReason};
use crate::notify::{EventBus, TradeEvent};
use crate::signal::Signal;
use crate::sizer::{LotLimits, PositionSizer};

/// Per-account result of one signal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    Submitted {
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
        lots: f64,
    },
    Filtered {
        reason: FilterReason,
        message: String,
    },
    Error {
        message: String,
    },
}

impl std::fmt::Display for AccountOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted { order_id, lots } => match order_id {
                Some(id) => write!(f, "submitted {lots} lots (order {id})"),
                None => write!(f, "submitted {lots} lots"),
            },
            Self::Filtered { reason, .. } => write!(f, "filtered ({reason})"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// Routes signals to broker adapters.
pub struct Dispatcher {
    adapters: BTreeMap<String, Arc<dyn BrokerAdapter>>,
    catalog: Arc<InstrumentCatalog>,
    store: Arc<ConfigStore>,
    events: EventBus,
}

impl Dispatcher {
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

    pub fn adapters(&self) -> &BTreeMap<String, Arc<dyn BrokerAdapter>> {
        &self.adapters
    }

    /// Process one signal across its target accounts, sequentially.
    pub async fn dispatch(&self, signal: &Signal, dry_run: bool) -> BTreeMap<String, AccountOutcome> {
        let config = self.store.get();
        let order = self.account_order(signal);
        let delay = &config.execution.delay_between_brokers;

        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            accounts = order.len(),
            dry_run,
            "dispatching signal"
        );

        let mut outcomes = BTreeMap::new();

        for (i, broker_id) in order.iter().enumerate() {
            let Some(adapter) = self.adapters.get(broker_id) else {
                outcomes.insert(
                    broker_id.clone(),
                    AccountOutcome::Error {
                        message: format!("broker {broker_id} not configured"),
                    },
                );
                continue;
            };

            // Randomized spacing; the first account starts immediately.
            if i > 0 && delay.enabled && delay.max_ms > 0 {
                let wait_ms = rand::thread_rng().gen_range(delay.min_ms..=delay.max_ms.max(delay.min_ms));
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }

            let outcome = self
                .place_on_account(broker_id, adapter.as_ref(), signal, dry_run)
                .await;
            info!(broker = %broker_id, outcome = %outcome, "account processed");
            outcomes.insert(broker_id.clone(), outcome);
        }

        outcomes
    }

    /// Resolve the processing order: the configured fixed order intersected
    /// with the signal's explicit target list, falling back to all enabled
    /// accounts.
    fn account_order(&self, signal: &Signal) -> Vec<String> {
        let config = self.store.get();

        let requested: Vec<String> = match &signal.brokers {
            Some(list) => list.clone(),
            None => self.adapters.keys().cloned().collect(),
        };

        if config.execution.broker_order.is_empty() {
            return requested;
        }
        config
            .execution
            .broker_order
            .iter()
            .filter(|id| requested.contains(*id))
            .cloned()
            .collect()
    }

    async fn place_on_account(
        &self,
        broker_id: &str,
        adapter: &dyn BrokerAdapter,
        signal: &Signal,
        dry_run: bool,
    ) -> AccountOutcome {
        let config = self.store.get();

        // Pre-trade gate.
        let limits = config.broker_limits(broker_id);
        let check = filters::check(adapter, &self.catalog, &limits, signal).await;
        if !check.passed {
            let reason = check.reason.unwrap_or(FilterReason::ConnectionError);
            self.events.emit(TradeEvent::FilterSkip {
                broker: adapter.display_name().to_string(),
                symbol: signal.symbol.clone(),
                reason: reason.to_string(),
                message: check.message.clone(),
            });
            return AccountOutcome::Filtered {
                reason,
                message: check.message,
            };
        }

        // Account value for sizing: equity preferred, balance fallback, then
        // the configured safety constant.
        let account = match adapter.account_info().await {
            Ok(account) => account,
            Err(e) => {
                return AccountOutcome::Error {
                    message: format!("account info unavailable: {e}"),
                }
            }
        };
        let mut account_value = if config.general.use_equity {
            account.equity
        } else {
            account.balance
        };
        if account_value <= 0.0 {
            account_value = account.balance;
        }
        if account_value <= 0.0 {
            warn!(broker = %broker_id, "no usable account value, using fallback");
            account_value = config.general.fallback_account_value;
        }

        // Size the position.
        let Some(spec) = self.catalog.spec(&signal.symbol) else {
            return AccountOutcome::Error {
                message: format!("no instrument spec for {}", signal.symbol),
            };
        };
        let size = PositionSizer::new(spec).calculate(
            &signal.symbol,
            account_value,
            config.general.risk_percent,
            signal.entry_price,
            signal.stop_loss,
            // Without market data the entry price is the best price proxy.
            Some(signal.entry_price),
            None,
            LotLimits::default(),
        );
        if size.lots <= 0.0 {
            self.events.emit(TradeEvent::EngineError {
                broker: Some(adapter.display_name().to_string()),
                message: format!("sizing failed for {}: {}", signal.symbol, size.details),
            });
            return AccountOutcome::Error {
                message: format!("position sizing failed: {}", size.details),
            };
        }

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type,
            volume_lots: size.lots,
            entry_price: Some(signal.entry_price),
            stop_loss: Some(signal.stop_loss),
            take_profit: Some(signal.take_profit),
            expiry_timestamp_ms: Some(signal.expiry_timestamp_ms()),
            label: format!("TV-{}", &signal.symbol[..signal.symbol.len().min(8)]),
            comment: format!("Signal {}m {}", signal.timeframe_minutes, signal.side),
        };

        if dry_run {
            return AccountOutcome::Submitted {
                order_id: None,
                lots: size.lots,
            };
        }

        match adapter.place_order(&request).await {
            Ok(result) if result.success => {
                self.events.emit(TradeEvent::OrderPlaced {
                    broker: adapter.display_name().to_string(),
                    symbol: signal.symbol.clone(),
                    side: signal.side.to_string(),
                    order_type: signal.order_type.to_string(),
                    lots: size.lots,
                    entry_price: signal.entry_price,
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    order_id: result.order_id.clone().unwrap_or_default(),
                });
                AccountOutcome::Submitted {
                    order_id: result.order_id,
                    lots: size.lots,
                }
            }
            Ok(result) => {
                self.events.emit(TradeEvent::EngineError {
                    broker: Some(adapter.display_name().to_string()),
                    message: format!("order rejected: {}", result.message),
                });
                AccountOutcome::Error {
                    message: result.message,
                }
            }
            Err(e) => {
                self.events.emit(TradeEvent::EngineError {
                    broker: Some(adapter.display_name().to_string()),
                    message: format!("order submission failed: {e}"),
                });
                AccountOutcome::Error {
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;

    const TEST_CONFIG: &str = r#"
[general]
risk_percent = 0.5

[execution.delay_between_brokers]
enabled = false

[instruments.EURUSD]
pip_size = 0.0001
pip_value_per_lot = 10.0
quote_currency = "USD"

[instruments.EURUSD.brokers]
a = "1"
b = "EURUSD.X"
"#;

    fn harness() -> (Dispatcher, Arc<MockBroker>, Arc<MockBroker>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, TEST_CONFIG).unwrap();
        let store = Arc::new(ConfigStore::load(&path).unwrap());
        // Keep the tempdir alive for the test duration.
        std::mem::forget(dir);

        let catalog = Arc::new(InstrumentCatalog::from_config(&store.get()));
        let a = Arc::new(MockBroker::new("a"));
        let b = Arc::new(MockBroker::new("b"));
        let mut adapters: BTreeMap<String, Arc<dyn BrokerAdapter>> = BTreeMap::new();
        adapters.insert("a".into(), a.clone());
        adapters.insert("b".into(), b.clone());

        (
            Dispatcher::new(adapters, catalog, store, EventBus::new()),
            a,
            b,
        )
    }

    fn signal() -> Signal {
        Signal::from_json(&serde_json::json!({
            "symbol": "EURUSD", "side": "LONG",
            "entry": 1.0850, "sl": 1.0820, "tp": 1.0950
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn submits_on_every_account() {
        let (dispatcher, a, b) = harness();
        let outcomes = dispatcher.dispatch(&signal(), false).await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes["a"], AccountOutcome::Submitted { .. }));
        assert!(matches!(outcomes["b"], AccountOutcome::Submitted { .. }));
        assert_eq!(a.placed.lock().len(), 1);
        assert_eq!(b.placed.lock().len(), 1);

        // 100k default mock is 10k equity: 0.5% of 10k over 30 pips at
        // 10/pip = 0.17 lots.
        let placed = &a.placed.lock()[0];
        assert!((placed.volume_lots - 0.17).abs() < 1e-9);
        assert!(placed.expiry_timestamp_ms.is_some());
        assert_eq!(placed.label, "TV-EURUSD");
    }

    #[tokio::test]
    async fn duplicate_signal_submits_once_per_account() {
        let (dispatcher, a, b) = harness();
        let first = dispatcher.dispatch(&signal(), false).await;
        assert!(matches!(first["a"], AccountOutcome::Submitted { .. }));

        let second = dispatcher.dispatch(&signal(), false).await;
        for outcome in second.values() {
            assert!(matches!(
                outcome,
                AccountOutcome::Filtered {
                    reason: FilterReason::DuplicateOrder,
                    ..
                }
            ));
        }
        assert_eq!(a.placed.lock().len(), 1);
        assert_eq!(b.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn explicit_target_list_restricts_accounts() {
        let (dispatcher, a, b) = harness();
        let mut signal = signal();
        signal.brokers = Some(vec!["b".into()]);

        let outcomes = dispatcher.dispatch(&signal, false).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes.contains_key("b"));
        assert_eq!(a.placed.lock().len(), 0);
        assert_eq!(b.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn failure_on_one_account_does_not_stop_the_next() {
        let (dispatcher, a, b) = harness();
        *a.fail_place.lock() = true;

        let outcomes = dispatcher.dispatch(&signal(), false).await;
        assert!(matches!(outcomes["a"], AccountOutcome::Error { .. }));
        assert!(matches!(outcomes["b"], AccountOutcome::Submitted { .. }));
        assert_eq!(b.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_places_nothing() {
        let (dispatcher, a, b) = harness();
        let outcomes = dispatcher.dispatch(&signal(), true).await;
        assert!(matches!(
            outcomes["a"],
            AccountOutcome::Submitted { order_id: None, .. }
        ));
        assert_eq!(a.placed.lock().len(), 0);
        assert_eq!(b.placed.lock().len(), 0);
    }

    #[tokio::test]
    async fn adjacent_accounts_are_spaced_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
[execution.delay_between_brokers]
enabled = true
min_ms = 60
max_ms = 60

[instruments.EURUSD]
pip_size = 0.0001
pip_value_per_lot = 10.0
[instruments.EURUSD.brokers]
a = "1"
b = "2"
"#,
        )
        .unwrap();
        std::mem::forget(dir);
        let store = Arc::new(ConfigStore::load(&path).unwrap());
        let catalog = Arc::new(InstrumentCatalog::from_config(&store.get()));
        let a = Arc::new(MockBroker::new("a"));
        let b = Arc::new(MockBroker::new("b"));
        let mut adapters: BTreeMap<String, Arc<dyn BrokerAdapter>> = BTreeMap::new();
        adapters.insert("a".into(), a.clone());
        adapters.insert("b".into(), b.clone());
        let dispatcher = Dispatcher::new(adapters, catalog, store, EventBus::new());

        dispatcher.dispatch(&signal(), false).await;

        let first = a.placed_at.lock()[0];
        let second = b.placed_at.lock()[0];
        assert!(second.duration_since(first) >= std::time::Duration::from_millis(60));
    }

    #[tokio::test]
    async fn zero_account_value_uses_fallback() {
        let (dispatcher, a, _b) = harness();
        {
            let mut account = a.account.lock();
            let state = account.as_mut().unwrap();
            state.equity = 0.0;
            state.balance = 0.0;
        }
        let outcomes = dispatcher.dispatch(&signal(), false).await;
        // Fallback value of 10k still produces a sized order.
        assert!(matches!(outcomes["a"], AccountOutcome::Submitted { .. }));
        let placed = &a.placed.lock()[0];
        assert!(placed.volume_lots > 0.0);
    }
}
