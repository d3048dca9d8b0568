// =============================================================================
// Broker Adapter — capability contract shared by all brokerage integrations
// =============================================================================
//
// Every adapter exposes the same eight operations over its own wire protocol.
// Transport faults never cross this boundary as panics; they surface as
// `BrokerError` values the dispatcher and reaper convert into per-account
// outcomes.
// =============================================================================

pub mod ctrader;
pub mod proto;
pub mod tradelocker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::InstrumentCatalog;
use crate::config::{AppConfig, BrokerKind, ConfigStore};
use crate::types::{OrderKind, Side};

// =============================================================================
// Errors
// =============================================================================

/// Typed adapter failure.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("symbol {0} not mapped for this broker")]
    SymbolNotMapped(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

// =============================================================================
// Wire-agnostic records
// =============================================================================

/// Account snapshot refreshed on demand.
///
/// `margin_free` may be zero when the broker does not report it or no
/// positions are open; the pre-trade filter then treats the ratio as 100%.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    #[serde(default)]
    pub margin_used: f64,
    #[serde(default)]
    pub margin_free: f64,
    pub currency: String,
    #[serde(default)]
    pub leverage: u32,
}

/// Tradable instrument as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Canonical name when known, otherwise the broker's own.
    pub symbol: String,
    /// Broker-native handle (numeric id or suffixed name).
    pub broker_symbol: String,
    #[serde(default)]
    pub description: String,
    pub pip_size: f64,
    #[serde(default)]
    pub digits: u32,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub min_lot: f64,
    #[serde(default)]
    pub max_lot: f64,
    #[serde(default)]
    pub lot_step: f64,
}

impl SymbolInfo {
    /// Round a price onto the instrument's tick grid.
    pub fn round_to_tick(&self, price: f64, direction: RoundDirection) -> f64 {
        if self.tick_size <= 0.0 {
            return round_to_digits(price, self.digits);
        }
        let ticks = price / self.tick_size;
        let rounded = match direction {
            RoundDirection::Up => ticks.ceil(),
            RoundDirection::Down => ticks.floor(),
            RoundDirection::Nearest => ticks.round(),
        };
        round_to_digits(rounded * self.tick_size, self.digits)
    }

    /// Round a stop-loss away from entry so the protective level never
    /// tightens past what was requested.
    pub fn round_sl_conservative(&self, sl: f64, entry: f64) -> f64 {
        if sl < entry {
            self.round_to_tick(sl, RoundDirection::Down)
        } else {
            self.round_to_tick(sl, RoundDirection::Up)
        }
    }

    /// Round a take-profit toward entry.
    pub fn round_tp_conservative(&self, tp: f64, entry: f64) -> f64 {
        if tp > entry {
            self.round_to_tick(tp, RoundDirection::Down)
        } else {
            self.round_to_tick(tp, RoundDirection::Up)
        }
    }

    /// Round an entry price against the trader (pay up on buys, receive less
    /// on sells).
    pub fn round_entry_conservative(&self, entry: f64, side: Side) -> f64 {
        match side {
            Side::Long => self.round_to_tick(entry, RoundDirection::Up),
            Side::Short => self.round_to_tick(entry, RoundDirection::Down),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RoundDirection {
    Nearest,
    Up,
    Down,
}

fn round_to_digits(price: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits.min(12) as i32);
    (price * factor).round() / factor
}

/// Pending (unfilled) order as observed at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: String,
    /// Canonical symbol when the reverse mapping knows the handle, otherwise
    /// the raw broker handle as a string.
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    pub volume_lots: f64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Broker-side creation time. `None` marks the order age-unknown; the
    /// reaper must never cancel such an order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub label: String,
}

/// Open position as observed at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume_lots: f64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
}

/// Adapter-agnostic order submission.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    pub volume_lots: f64,
    /// Required for LIMIT/STOP.
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Native-expiry hint; adapters whose broker cannot expire orders
    /// ignore it and rely on the reaper.
    pub expiry_timestamp_ms: Option<i64>,
    pub label: String,
    pub comment: String,
}

/// Outcome of a place or cancel operation.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
}

impl OrderResult {
    pub fn ok(order_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            message: message.into(),
            fill_price: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: message.into(),
            fill_price: None,
        }
    }
}

// =============================================================================
// The adapter trait
// =============================================================================

/// Capability set every brokerage integration implements. All operations may
/// suspend on remote I/O; timeouts are internal to each adapter.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Config key identifying this account.
    fn broker_id(&self) -> &str;

    /// Operator-facing display name.
    fn display_name(&self) -> &str;

    async fn connect(&self) -> Result<(), BrokerError>;
    async fn disconnect(&self);

    async fn account_info(&self) -> Result<AccountState, BrokerError>;
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError>;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<OrderResult, BrokerError>;
    async fn pending_orders(&self) -> Result<Vec<PendingOrder>, BrokerError>;
    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError>;
}

/// Build adapters for every enabled broker entry.
pub fn build_adapters(
    config: &AppConfig,
    catalog: &InstrumentCatalog,
    store: Arc<ConfigStore>,
) -> BTreeMap<String, Arc<dyn BrokerAdapter>> {
    let mut adapters: BTreeMap<String, Arc<dyn BrokerAdapter>> = BTreeMap::new();

    for (id, broker) in &config.brokers {
        if !broker.enabled {
            continue;
        }
        let mapping = catalog.broker_mapping(id);
        match broker.kind {
            BrokerKind::Ctrader => {
                adapters.insert(
                    id.clone(),
                    Arc::new(ctrader::CtraderAdapter::new(
                        id.clone(),
                        broker.clone(),
                        mapping,
                        store.clone(),
                    )),
                );
            }
            BrokerKind::Tradelocker => {
                adapters.insert(
                    id.clone(),
                    Arc::new(tradelocker::TradeLockerAdapter::new(
                        id.clone(),
                        broker.clone(),
                        mapping,
                    )),
                );
            }
        }
    }

    if adapters.is_empty() {
        warn!("no enabled brokers configured");
    }
    adapters
}

// =============================================================================
// Test double shared by filter / dispatcher / reaper tests
// =============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Scriptable in-memory adapter.
    pub struct MockBroker {
        pub id: String,
        pub account: Mutex<Option<AccountState>>,
        pub pending: Mutex<Vec<PendingOrder>>,
        pub positions: Mutex<Vec<Position>>,
        pub placed: Mutex<Vec<OrderRequest>>,
        pub cancelled: Mutex<Vec<String>>,
        /// When set, the named operation returns this error kind.
        pub fail_account_info: Mutex<bool>,
        pub fail_positions: Mutex<bool>,
        pub fail_pending: Mutex<bool>,
        pub fail_place: Mutex<bool>,
        /// Simulates a defective adapter for fail-forward tests.
        pub panic_on_place: Mutex<bool>,
        pub next_order_id: Mutex<u64>,
        /// Instants at which place_order ran, for spacing assertions.
        pub placed_at: Mutex<Vec<std::time::Instant>>,
    }

    impl MockBroker {
        pub fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                account: Mutex::new(Some(AccountState {
                    account_id: "1".into(),
                    balance: 10_000.0,
                    equity: 10_000.0,
                    margin_used: 0.0,
                    margin_free: 0.0,
                    currency: "USD".into(),
                    leverage: 100,
                })),
                pending: Mutex::new(Vec::new()),
                positions: Mutex::new(Vec::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                fail_account_info: Mutex::new(false),
                fail_positions: Mutex::new(false),
                fail_pending: Mutex::new(false),
                fail_place: Mutex::new(false),
                panic_on_place: Mutex::new(false),
                next_order_id: Mutex::new(1),
                placed_at: Mutex::new(Vec::new()),
            }
        }

        pub fn with_account(self, account: AccountState) -> Self {
            *self.account.lock() = Some(account);
            self
        }

        pub fn push_pending(&self, order: PendingOrder) {
            self.pending.lock().push(order);
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        fn broker_id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> &str {
            &self.id
        }

        async fn connect(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn account_info(&self) -> Result<AccountState, BrokerError> {
            if *self.fail_account_info.lock() {
                return Err(BrokerError::Timeout("account info"));
            }
            self.account.lock().clone().ok_or(BrokerError::NotConnected)
        }

        async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
            Ok(Vec::new())
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError> {
            if *self.panic_on_place.lock() {
                panic!("mock adapter panic");
            }
            if *self.fail_place.lock() {
                return Err(BrokerError::Transport("send failed".into()));
            }
            self.placed_at.lock().push(std::time::Instant::now());
            let id = {
                let mut next = self.next_order_id.lock();
                let id = *next;
                *next += 1;
                id.to_string()
            };
            self.placed.lock().push(request.clone());
            self.pending.lock().push(PendingOrder {
                order_id: id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                volume_lots: request.volume_lots,
                entry_price: request.entry_price.unwrap_or(0.0),
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                created_time: Some(Utc::now()),
                expiry_time: None,
                label: request.label.clone(),
            });
            Ok(OrderResult::ok(id, "placed"))
        }

        async fn cancel_order(&self, order_id: &str) -> Result<OrderResult, BrokerError> {
            self.cancelled.lock().push(order_id.to_string());
            self.pending.lock().retain(|o| o.order_id != order_id);
            Ok(OrderResult::ok(order_id, "cancelled"))
        }

        async fn pending_orders(&self) -> Result<Vec<PendingOrder>, BrokerError> {
            if *self.fail_pending.lock() {
                return Err(BrokerError::Timeout("pending orders"));
            }
            Ok(self.pending.lock().clone())
        }

        async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
            if *self.fail_positions.lock() {
                return Err(BrokerError::Timeout("positions"));
            }
            Ok(self.positions.lock().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol() -> SymbolInfo {
        SymbolInfo {
            symbol: "EURUSD".into(),
            broker_symbol: "1".into(),
            description: String::new(),
            pip_size: 0.0001,
            digits: 5,
            tick_size: 0.00001,
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
        }
    }

    #[test]
    fn conservative_sl_rounds_away_from_entry() {
        let s = symbol();
        // LONG: SL below entry rounds down.
        let sl = s.round_sl_conservative(1.084_567_4, 1.0900);
        assert!(sl <= 1.084_567_4);
        // SHORT: SL above entry rounds up.
        let sl = s.round_sl_conservative(1.095_432_6, 1.0900);
        assert!(sl >= 1.095_432_6);
    }

    #[test]
    fn conservative_tp_rounds_toward_entry() {
        let s = symbol();
        let tp = s.round_tp_conservative(1.095_678_9, 1.0900);
        assert!(tp <= 1.095_678_9);
        let tp = s.round_tp_conservative(1.084_321_2, 1.0900);
        assert!(tp >= 1.084_321_2);
    }

    #[test]
    fn conservative_entry_rounds_against_trader() {
        let s = symbol();
        assert!(s.round_entry_conservative(1.085_012_3, Side::Long) >= 1.085_012_3);
        assert!(s.round_entry_conservative(1.085_012_3, Side::Short) <= 1.085_012_3);
    }

    #[test]
    fn zero_tick_size_falls_back_to_digits() {
        let mut s = symbol();
        s.tick_size = 0.0;
        assert_eq!(s.round_to_tick(1.085_012_34, RoundDirection::Nearest), 1.08501);
    }
}
