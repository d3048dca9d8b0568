// =============================================================================
// Pre-trade Filter — per-account eligibility gate
// =============================================================================
//
// Checks run in a fixed order and the first failure short-circuits:
// instrument mapping, account reachability, free-margin ratio, open-position
// cap, pending-order cap, duplicate prevention. Errors while listing
// positions or pending orders do not block the trade; a broker that cannot
// answer a list call can still usually take an order.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::broker::BrokerAdapter;
use crate::catalog::InstrumentCatalog;
use crate::config::FilterConfig;
use crate::signal::Signal;

/// Machine-readable reason a trade was not attempted on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterReason {
    InstrumentNotAvailable,
    ConnectionError,
    MarginInsufficient,
    MaxPositionsReached,
    MaxPendingOrders,
    DuplicateOrder,
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstrumentNotAvailable => "INSTRUMENT_NOT_AVAILABLE",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::MarginInsufficient => "MARGIN_INSUFFICIENT",
            Self::MaxPositionsReached => "MAX_POSITIONS_REACHED",
            Self::MaxPendingOrders => "MAX_PENDING_ORDERS",
            Self::DuplicateOrder => "DUPLICATE_ORDER",
        };
        write!(f, "{s}")
    }
}

/// Outcome of the filter chain for one account.
#[derive(Debug, Clone)]
pub struct FilterCheck {
    pub passed: bool,
    pub reason: Option<FilterReason>,
    pub message: String,
}

impl FilterCheck {
    fn blocked(reason: FilterReason, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            message: message.into(),
        }
    }

    fn passed() -> Self {
        Self {
            passed: true,
            reason: None,
            message: "all filters passed".into(),
        }
    }
}

/// Run the filter chain for `signal` against one account.
pub async fn check(
    broker: &dyn BrokerAdapter,
    catalog: &InstrumentCatalog,
    limits: &FilterConfig,
    signal: &Signal,
) -> FilterCheck {
    let broker_id = broker.broker_id();

    // 1. Instrument availability.
    if catalog.resolve(&signal.symbol, broker_id).is_none() {
        return FilterCheck::blocked(
            FilterReason::InstrumentNotAvailable,
            format!(
                "instrument {} not mapped for {}",
                signal.symbol,
                broker.display_name()
            ),
        );
    }

    // 2. Account state must be reachable.
    let account = match broker.account_info().await {
        Ok(account) => account,
        Err(e) => {
            return FilterCheck::blocked(
                FilterReason::ConnectionError,
                format!("could not get account info: {e}"),
            );
        }
    };

    // 3. Free-margin ratio. Unreported free margin reads as fully available.
    if account.equity > 0.0 {
        let margin_percent = if account.margin_free > 0.0 {
            account.margin_free / account.equity * 100.0
        } else {
            100.0
        };
        if margin_percent < limits.min_margin_percent {
            return FilterCheck::blocked(
                FilterReason::MarginInsufficient,
                format!(
                    "free margin {margin_percent:.1}% below minimum {:.1}%",
                    limits.min_margin_percent
                ),
            );
        }
    }

    // 4. Open-position cap. A list failure does not block.
    match broker.open_positions().await {
        Ok(positions) => {
            if positions.len() >= limits.max_open_positions as usize {
                return FilterCheck::blocked(
                    FilterReason::MaxPositionsReached,
                    format!(
                        "{} open positions, cap is {}",
                        positions.len(),
                        limits.max_open_positions
                    ),
                );
            }
        }
        Err(e) => debug!(broker = broker_id, error = %e, "position list failed, not blocking"),
    }

    // 5 + 6. Pending-order cap, then duplicate prevention on the same list.
    match broker.pending_orders().await {
        Ok(pending) => {
            if pending.len() >= limits.max_pending_orders as usize {
                return FilterCheck::blocked(
                    FilterReason::MaxPendingOrders,
                    format!(
                        "{} pending orders, cap is {}",
                        pending.len(),
                        limits.max_pending_orders
                    ),
                );
            }
            if limits.prevent_duplicate_orders {
                let wanted = signal.symbol.to_uppercase();
                if let Some(existing) = pending
                    .iter()
                    .find(|o| o.symbol.to_uppercase().contains(&wanted))
                {
                    return FilterCheck::blocked(
                        FilterReason::DuplicateOrder,
                        format!(
                            "pending order {} already covers {}",
                            existing.order_id, signal.symbol
                        ),
                    );
                }
            }
        }
        Err(e) => debug!(broker = broker_id, error = %e, "pending list failed, not blocking"),
    }

    FilterCheck::passed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::broker::{AccountState, PendingOrder};
    use crate::config::AppConfig;
    use crate::types::{OrderKind, Side};
    use chrono::Utc;

    fn catalog() -> InstrumentCatalog {
        let config = AppConfig::from_toml(
            r#"
[instruments.EURUSD]
pip_size = 0.0001
[instruments.EURUSD.brokers]
acct = "1"
"#,
        )
        .unwrap();
        InstrumentCatalog::from_config(&config)
    }

    fn signal() -> Signal {
        Signal::from_json(&serde_json::json!({
            "symbol": "EURUSD", "side": "LONG",
            "entry": 1.0850, "sl": 1.0800, "tp": 1.0950
        }))
        .unwrap()
    }

    fn pending(symbol: &str) -> PendingOrder {
        PendingOrder {
            order_id: "1".into(),
            symbol: symbol.into(),
            side: Side::Long,
            order_type: OrderKind::Limit,
            volume_lots: 1.0,
            entry_price: 1.0,
            stop_loss: None,
            take_profit: None,
            created_time: Some(Utc::now()),
            expiry_time: None,
            label: String::new(),
        }
    }

    #[tokio::test]
    async fn passes_clean_account() {
        let broker = MockBroker::new("acct");
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn unmapped_instrument_blocks() {
        let broker = MockBroker::new("other");
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::InstrumentNotAvailable));
    }

    #[tokio::test]
    async fn unreachable_account_blocks() {
        let broker = MockBroker::new("acct");
        *broker.fail_account_info.lock() = true;
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::ConnectionError));
    }

    #[tokio::test]
    async fn low_margin_blocks_but_unknown_margin_passes() {
        // Reported free margin at 10% of equity: blocked.
        let broker = MockBroker::new("acct").with_account(AccountState {
            account_id: "1".into(),
            balance: 10_000.0,
            equity: 10_000.0,
            margin_used: 9_000.0,
            margin_free: 1_000.0,
            currency: "USD".into(),
            leverage: 100,
        });
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::MarginInsufficient));

        // Zero (unreported) free margin reads as 100% available.
        let broker = MockBroker::new("acct").with_account(AccountState {
            account_id: "1".into(),
            balance: 10_000.0,
            equity: 10_000.0,
            margin_used: 0.0,
            margin_free: 0.0,
            currency: "USD".into(),
            leverage: 100,
        });
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn position_cap_blocks() {
        let broker = MockBroker::new("acct");
        {
            let mut positions = broker.positions.lock();
            for i in 0..5 {
                positions.push(crate::broker::Position {
                    position_id: i.to_string(),
                    symbol: "GBPUSD".into(),
                    side: Side::Long,
                    volume_lots: 1.0,
                    entry_price: 1.0,
                    current_price: None,
                    unrealized_pnl: None,
                });
            }
        }
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::MaxPositionsReached));
    }

    #[tokio::test]
    async fn pending_cap_blocks() {
        let broker = MockBroker::new("acct");
        for i in 0..10 {
            let mut order = pending("GBPUSD");
            order.order_id = i.to_string();
            broker.push_pending(order);
        }
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::MaxPendingOrders));
    }

    #[tokio::test]
    async fn duplicate_symbol_blocks_case_insensitive_substring() {
        let broker = MockBroker::new("acct");
        // Broker reports a suffixed handle; substring match still catches it.
        broker.push_pending(pending("eurusd.x"));
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert_eq!(result.reason, Some(FilterReason::DuplicateOrder));
    }

    #[tokio::test]
    async fn duplicate_check_can_be_disabled() {
        let broker = MockBroker::new("acct");
        broker.push_pending(pending("EURUSD"));
        let limits = FilterConfig {
            prevent_duplicate_orders: false,
            ..FilterConfig::default()
        };
        let result = check(&broker, &catalog(), &limits, &signal()).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn list_errors_do_not_block() {
        let broker = MockBroker::new("acct");
        *broker.fail_positions.lock() = true;
        *broker.fail_pending.lock() = true;
        let result = check(&broker, &catalog(), &FilterConfig::default(), &signal()).await;
        assert!(result.passed);
    }
}
