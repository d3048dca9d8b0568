// =============================================================================
// TradeLocker adapter — stateless REST with JWT authentication
// =============================================================================
//
// A username/password exchange yields an access JWT. The JWT payload carries
// the canonical API host for the session; the public auth host is only a
// bootstrap. Every subsequent call sends the JWT plus an `accNum` selector
// header.
//
// TradeLocker has no native order expiry, which makes the expiry reaper
// essential for accounts behind this adapter. Cancel calls follow a fixed
// retry policy: two retries with 2 s backoff on timeout, 404 treated as
// success (already cancelled or filled).
// =============================================================================

use std::collections::HashMap;

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{
    AccountState, BrokerAdapter, BrokerError, OrderRequest, OrderResult, PendingOrder, Position,
    SymbolInfo,
};
use crate::config::BrokerConfig;
use crate::types::{OrderKind, Side};

const STATE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const ORDER_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(15);
const CANCEL_RETRIES: u32 = 2;
const CANCEL_BACKOFF: Duration = Duration::from_secs(2);

struct TlSession {
    access_token: String,
    /// Scheme + host used for all post-auth calls.
    api_base: String,
    account_id: i64,
    acc_num: i64,
    /// broker instrument name -> tradable instrument id.
    instrument_ids: HashMap<String, i64>,
    /// tradable instrument id -> broker instrument name.
    instrument_names: HashMap<i64, String>,
    /// Full instrument details keyed by broker name.
    instruments: HashMap<String, SymbolInfo>,
}

/// REST adapter for TradeLocker-backed accounts (GFT and similar prop firms).
pub struct TradeLockerAdapter {
    broker_id: String,
    name: String,
    demo: bool,
    base_url: String,
    email: String,
    password: String,
    server: String,
    configured_account_id: Option<i64>,

    /// canonical symbol -> broker instrument name.
    mapping: HashMap<String, String>,
    /// broker instrument name -> canonical symbol.
    reverse_mapping: HashMap<String, String>,

    http: reqwest::Client,
    session: Mutex<Option<TlSession>>,
}

impl TradeLockerAdapter {
    pub fn new(broker_id: String, config: BrokerConfig, mapping: HashMap<String, String>) -> Self {
        let reverse_mapping = mapping.iter().map(|(k, v)| (v.clone(), k.clone())).collect();
        let name = if config.name.is_empty() {
            broker_id.clone()
        } else {
            config.name.clone()
        };

        let http = reqwest::Client::builder()
            .timeout(STATE_READ_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            broker_id,
            name,
            demo: config.is_demo,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email,
            password: config.password,
            server: config.server,
            configured_account_id: config.account_id,
            mapping,
            reverse_mapping,
            http,
            session: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    async fn open_session(&self) -> Result<TlSession, BrokerError> {
        let auth_url = format!("{}/backend-api/auth/jwt/token", self.base_url);
        let response = self
            .http
            .post(&auth_url)
            .json(&json!({
                "email": self.email,
                "password": self.password,
                "server": self.server,
            }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "auth returned {status}: {body}"
            )));
        }

        let access_token = body
            .get("accessToken")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrokerError::AuthenticationFailed("no accessToken in auth response".into())
            })?
            .to_string();

        // The auth host is a bootstrap; the JWT names the host the session
        // actually lives on.
        let api_base = jwt_host_claim(&access_token)
            .map(|host| {
                if host.starts_with("http") {
                    host.trim_end_matches('/').to_string()
                } else {
                    format!("https://{host}")
                }
            })
            .unwrap_or_else(|| self.base_url.clone());
        debug!(broker = %self.broker_id, api_base, "authenticated");

        // Account selection: configured id, else first ACTIVE, else first.
        let accounts_url = format!("{api_base}/backend-api/auth/jwt/all-accounts");
        let response = self
            .http
            .get(&accounts_url)
            .bearer_auth(&access_token)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "account list returned {status}: {body}"
            )));
        }

        let accounts = body
            .get("accounts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if accounts.is_empty() {
            return Err(BrokerError::AuthenticationFailed("no accounts found".into()));
        }

        let selected = self
            .configured_account_id
            .and_then(|wanted| {
                accounts
                    .iter()
                    .find(|a| number_of(a, "id") == Some(wanted as f64))
            })
            .or_else(|| {
                accounts
                    .iter()
                    .find(|a| a.get("status").and_then(Value::as_str) == Some("ACTIVE"))
            })
            .or_else(|| accounts.first())
            .cloned()
            .expect("accounts non-empty");

        let account_id = number_of(&selected, "id").unwrap_or(0.0) as i64;
        let acc_num = number_of(&selected, "accNum").unwrap_or(0.0) as i64;
        info!(
            broker = %self.broker_id,
            account_id,
            acc_num,
            total = accounts.len(),
            "account selected"
        );

        let mut session = TlSession {
            access_token,
            api_base,
            account_id,
            acc_num,
            instrument_ids: HashMap::new(),
            instrument_names: HashMap::new(),
            instruments: HashMap::new(),
        };
        self.load_instruments(&mut session).await?;
        Ok(session)
    }

    async fn load_instruments(&self, session: &mut TlSession) -> Result<(), BrokerError> {
        let url = format!(
            "{}/backend-api/trade/accounts/{}/instruments",
            session.api_base, session.account_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .header("accNum", session.acc_num)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            warn!(broker = %self.broker_id, %status, "instrument load failed");
            return Ok(());
        }

        let rows = body
            .pointer("/d/instruments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in &rows {
            let Some(id) = number_of(row, "tradableInstrumentId").map(|v| v as i64) else {
                continue;
            };
            let Some(name) = row.get("name").and_then(Value::as_str) else {
                continue;
            };
            session.instrument_ids.insert(name.to_string(), id);
            session.instrument_names.insert(id, name.to_string());
            session.instruments.insert(
                name.to_string(),
                SymbolInfo {
                    symbol: self
                        .reverse_mapping
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| name.to_string()),
                    broker_symbol: name.to_string(),
                    description: row
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    pip_size: number_of(row, "pipSize").unwrap_or(0.0001),
                    digits: number_of(row, "digits").unwrap_or(5.0) as u32,
                    tick_size: number_of(row, "tickSize").unwrap_or(0.00001),
                    min_lot: number_of(row, "minOrderSize").unwrap_or(0.01),
                    max_lot: number_of(row, "maxOrderSize").unwrap_or(100.0),
                    lot_step: number_of(row, "orderSizeStep").unwrap_or(0.01),
                },
            );
        }
        info!(broker = %self.broker_id, count = session.instrument_ids.len(), "instruments loaded");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Symbol resolution
    // -------------------------------------------------------------------------

    /// Broker instrument name for a canonical symbol: config mapping first,
    /// then a direct name match, then the `.X` suffix convention.
    fn map_symbol(&self, session: &TlSession, symbol: &str) -> Option<String> {
        if let Some(mapped) = self.mapping.get(symbol) {
            return Some(mapped.clone());
        }
        if session.instrument_ids.contains_key(symbol) {
            return Some(symbol.to_string());
        }
        let suffixed = format!("{symbol}.X");
        session
            .instrument_ids
            .contains_key(&suffixed)
            .then_some(suffixed)
    }

    fn canonical_symbol(&self, session: &TlSession, instrument_id: i64) -> String {
        match session.instrument_names.get(&instrument_id) {
            Some(name) => self
                .reverse_mapping
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.clone()),
            None => instrument_id.to_string(),
        }
    }
}

fn transport(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout("http request")
    } else {
        BrokerError::Transport(e.to_string())
    }
}

/// Numeric JSON field that may arrive as a number or a numeric string.
fn number_of(value: &Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Extract the `host` claim from a JWT without verifying the signature.
/// Verification happens server-side; here the claim only routes requests.
fn jwt_host_claim(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims
        .get("host")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Broker-side creation time from an order row. Epoch milliseconds in
/// `createdDate`/`createdDateTime`, or an RFC 3339 string. `None` marks the
/// order age-unknown.
fn created_time_of(row: &Value) -> Option<DateTime<Utc>> {
    for key in ["createdDate", "createdDateTime"] {
        let Some(v) = row.get(key) else { continue };
        if let Some(ms) = v.as_i64().filter(|ms| *ms > 0) {
            if let Some(dt) = Utc.timestamp_millis_opt(ms).single() {
                return Some(dt);
            }
        }
        if let Some(s) = v.as_str() {
            if let Ok(ms) = s.parse::<i64>() {
                if let Some(dt) = Utc.timestamp_millis_opt(ms).single() {
                    return Some(dt);
                }
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
        }
    }
    None
}

// =============================================================================
// BrokerAdapter impl
// =============================================================================

#[async_trait::async_trait]
impl BrokerAdapter for TradeLockerAdapter {
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_session().await?);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        // Stateless API: dropping the token is the whole teardown.
        *self.session.lock().await = None;
    }

    async fn account_info(&self) -> Result<AccountState, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let url = format!("{}/backend-api/auth/jwt/all-accounts", session.api_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .timeout(STATE_READ_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(BrokerError::Rejected {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let accounts = body
            .get("accounts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let row = accounts
            .iter()
            .find(|a| number_of(a, "id") == Some(session.account_id as f64))
            .or_else(|| accounts.first())
            .ok_or_else(|| BrokerError::Transport("account vanished from list".into()))?;

        let balance = number_of(row, "accountBalance").unwrap_or(0.0);
        let currency = row
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_string();

        Ok(AccountState {
            account_id: session.account_id.to_string(),
            balance,
            // The list endpoint reports balance only. Margin is unreported;
            // zero free margin reads as "fully available" downstream.
            equity: balance,
            margin_used: 0.0,
            margin_free: 0.0,
            currency,
            leverage: 100,
        })
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;
        Ok(session.instruments.values().cloned().collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let broker_name = self
            .map_symbol(session, &request.symbol)
            .ok_or_else(|| BrokerError::SymbolNotMapped(request.symbol.clone()))?;
        let instrument_id = *session
            .instrument_ids
            .get(&broker_name)
            .ok_or_else(|| BrokerError::SymbolNotMapped(request.symbol.clone()))?;

        // Conservative tick rounding with the instrument's real grid.
        let info = session.instruments.get(&broker_name);
        let (entry, sl, tp) = match (info, request.entry_price) {
            (Some(info), Some(entry)) => (
                Some(info.round_entry_conservative(entry, request.side)),
                request.stop_loss.map(|v| info.round_sl_conservative(v, entry)),
                request.take_profit.map(|v| info.round_tp_conservative(v, entry)),
            ),
            _ => (request.entry_price, request.stop_loss, request.take_profit),
        };

        let order_type = match request.order_type {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::Stop => "stop",
        };
        let mut body = json!({
            "tradableInstrumentId": instrument_id,
            "qty": request.volume_lots,
            "side": if request.side == Side::Long { "buy" } else { "sell" },
            "type": order_type,
        });
        if request.order_type != OrderKind::Market {
            body["price"] = json!(entry);
            body["validity"] = json!("GTC");
        }
        if let Some(v) = sl {
            body["stopLoss"] = json!(v);
            body["stopLossType"] = json!("absolute");
        }
        if let Some(v) = tp {
            body["takeProfit"] = json!(v);
            body["takeProfitType"] = json!("absolute");
        }
        // No native expiry on this API; the hint in `request` is dropped and
        // the reaper owns the order's lifetime.

        info!(
            broker = %self.broker_id,
            symbol = %request.symbol,
            instrument = %broker_name,
            side = %request.side,
            order_type = %request.order_type,
            lots = request.volume_lots,
            "placing order"
        );

        let url = format!(
            "{}/backend-api/trade/accounts/{}/orders",
            session.api_base, session.account_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&session.access_token)
            .header("accNum", session.acc_num)
            .timeout(ORDER_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Ok(OrderResult::failed(format!(
                "order rejected ({status}): {body}"
            )));
        }

        let order_id = body
            .pointer("/d/orderId")
            .and_then(|v| {
                v.as_i64()
                    .map(|n| n.to_string())
                    .or_else(|| v.as_str().map(str::to_string))
            })
            .or_else(|| body.get("d").and_then(Value::as_i64).map(|n| n.to_string()));

        match order_id {
            Some(id) => Ok(OrderResult::ok(id, "order placed")),
            None => Ok(OrderResult {
                success: true,
                order_id: None,
                message: "order accepted (no id returned)".into(),
                fill_price: None,
            }),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResult, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let url = format!(
            "{}/backend-api/trade/orders/{}",
            session.api_base, order_id
        );

        let mut attempt = 0;
        loop {
            let result = self
                .http
                .delete(&url)
                .bearer_auth(&session.access_token)
                .header("accNum", session.acc_num)
                .timeout(CANCEL_TIMEOUT)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(OrderResult::ok(order_id, "order cancelled"));
                    }
                    if status.as_u16() == 404 {
                        // Already cancelled or filled; either way it is gone.
                        debug!(broker = %self.broker_id, order_id, "cancel target not found, treating as done");
                        return Ok(OrderResult::ok(order_id, "order already gone"));
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Ok(OrderResult::failed(format!(
                        "cancel rejected ({status}): {body}"
                    )));
                }
                Err(e) if e.is_timeout() && attempt < CANCEL_RETRIES => {
                    attempt += 1;
                    warn!(
                        broker = %self.broker_id,
                        order_id,
                        attempt,
                        "cancel timed out, retrying"
                    );
                    tokio::time::sleep(CANCEL_BACKOFF).await;
                }
                Err(e) => return Err(transport(e)),
            }
        }
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrder>, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let url = format!(
            "{}/backend-api/trade/accounts/{}/orders",
            session.api_base, session.account_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .header("accNum", session.acc_num)
            .timeout(STATE_READ_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(BrokerError::Rejected {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let rows = body
            .pointer("/d/orders")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_uppercase();
            if !matches!(status.as_str(), "PENDING" | "NEW" | "WORKING" | "") {
                continue;
            }

            let instrument_id = number_of(row, "tradableInstrumentId").unwrap_or(0.0) as i64;
            let side = if row.get("side").and_then(Value::as_str).unwrap_or("").to_lowercase()
                == "buy"
            {
                Side::Long
            } else {
                Side::Short
            };
            let order_type = row
                .get("type")
                .and_then(Value::as_str)
                .and_then(OrderKind::parse)
                .unwrap_or(OrderKind::Limit);

            out.push(PendingOrder {
                order_id: row
                    .get("id")
                    .map(|v| {
                        v.as_i64()
                            .map(|n| n.to_string())
                            .or_else(|| v.as_str().map(str::to_string))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default(),
                symbol: self.canonical_symbol(session, instrument_id),
                side,
                order_type,
                volume_lots: number_of(row, "qty").unwrap_or(0.0),
                entry_price: number_of(row, "price").unwrap_or(0.0),
                stop_loss: number_of(row, "stopLoss").filter(|v| *v > 0.0),
                take_profit: number_of(row, "takeProfit").filter(|v| *v > 0.0),
                created_time: created_time_of(row),
                expiry_time: None,
                label: String::new(),
            });
        }
        Ok(out)
    }

    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let url = format!(
            "{}/backend-api/trade/accounts/{}/positions",
            session.api_base, session.account_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&session.access_token)
            .header("accNum", session.acc_num)
            .timeout(STATE_READ_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(BrokerError::Rejected {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let rows = body
            .pointer("/d/positions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            let instrument_id = number_of(row, "tradableInstrumentId").unwrap_or(0.0) as i64;
            let side = if row.get("side").and_then(Value::as_str).unwrap_or("").to_lowercase()
                == "buy"
            {
                Side::Long
            } else {
                Side::Short
            };
            out.push(Position {
                position_id: row
                    .get("id")
                    .map(|v| {
                        v.as_i64()
                            .map(|n| n.to_string())
                            .or_else(|| v.as_str().map(str::to_string))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default(),
                symbol: self.canonical_symbol(session, instrument_id),
                side,
                volume_lots: number_of(row, "qty").unwrap_or(0.0),
                entry_price: number_of(row, "avgPrice").unwrap_or(0.0),
                current_price: number_of(row, "currentPrice").filter(|v| *v > 0.0),
                unrealized_pnl: number_of(row, "unrealizedPnl"),
            });
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TradeLockerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLockerAdapter")
            .field("broker_id", &self.broker_id)
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("demo", &self.demo)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerKind;

    fn make_jwt(claims: &Value) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = engine.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.c2ln")
    }

    fn adapter(base_url: &str, account_id: Option<i64>) -> TradeLockerAdapter {
        let config = BrokerConfig {
            enabled: true,
            kind: BrokerKind::Tradelocker,
            name: "GFT Test".into(),
            is_demo: true,
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            auto_refresh_token: false,
            base_url: base_url.to_string(),
            email: "user@example.com".into(),
            password: "pw".into(),
            server: "GFTTL".into(),
            account_id,
            limits: None,
        };
        let mut mapping = HashMap::new();
        mapping.insert("EURUSD".to_string(), "EURUSD.X".to_string());
        TradeLockerAdapter::new("gft_1".into(), config, mapping)
    }

    #[test]
    fn jwt_host_claim_decodes() {
        let token = make_jwt(&json!({"host": "api-dev.tradelocker.com", "sub": "u1"}));
        assert_eq!(
            jwt_host_claim(&token).as_deref(),
            Some("api-dev.tradelocker.com")
        );
        assert_eq!(jwt_host_claim("not-a-jwt"), None);
        let no_host = make_jwt(&json!({"sub": "u1"}));
        assert_eq!(jwt_host_claim(&no_host), None);
    }

    #[test]
    fn created_time_parsing() {
        let with_ms = json!({"createdDate": 1_690_000_000_000_i64});
        assert!(created_time_of(&with_ms).is_some());

        let with_string_ms = json!({"createdDateTime": "1690000000000"});
        assert!(created_time_of(&with_string_ms).is_some());

        let with_rfc = json!({"createdDate": "2026-07-31T17:59:00Z"});
        let dt = created_time_of(&with_rfc).unwrap();
        assert_eq!(dt.timestamp(), 1_785_520_740);

        // Age-unknown: no recognisable creation field.
        let without = json!({"id": 5});
        assert!(created_time_of(&without).is_none());
    }

    #[tokio::test]
    async fn connect_selects_first_active_account() {
        let mut server = mockito::Server::new_async().await;
        let token = make_jwt(&json!({"sub": "u1"}));

        let _auth = server
            .mock("POST", "/backend-api/auth/jwt/token")
            .with_status(200)
            .with_body(json!({"accessToken": token}).to_string())
            .create_async()
            .await;
        let _accounts = server
            .mock("GET", "/backend-api/auth/jwt/all-accounts")
            .with_status(200)
            .with_body(
                json!({"accounts": [
                    {"id": 100, "accNum": 1, "status": "CLOSED", "accountBalance": "0"},
                    {"id": 200, "accNum": 2, "status": "ACTIVE", "accountBalance": "50000", "currency": "USD"},
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let _instruments = server
            .mock(
                "GET",
                "/backend-api/trade/accounts/200/instruments",
            )
            .with_status(200)
            .with_body(
                json!({"d": {"instruments": [
                    {"tradableInstrumentId": 77, "name": "EURUSD.X", "pipSize": 0.0001,
                     "tickSize": 0.00001, "minOrderSize": 0.01, "maxOrderSize": 100.0,
                     "orderSizeStep": 0.01}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url(), None);
        adapter.connect().await.unwrap();

        let guard = adapter.session.lock().await;
        let session = guard.as_ref().unwrap();
        assert_eq!(session.account_id, 200);
        assert_eq!(session.acc_num, 2);
        assert_eq!(session.instrument_ids["EURUSD.X"], 77);
        // No host claim: auth host is kept.
        assert_eq!(session.api_base, server.url());
    }

    #[tokio::test]
    async fn cancel_treats_404_as_success() {
        let mut server = mockito::Server::new_async().await;
        let token = make_jwt(&json!({"sub": "u1"}));

        let _auth = server
            .mock("POST", "/backend-api/auth/jwt/token")
            .with_status(200)
            .with_body(json!({"accessToken": token}).to_string())
            .create_async()
            .await;
        let _accounts = server
            .mock("GET", "/backend-api/auth/jwt/all-accounts")
            .with_status(200)
            .with_body(
                json!({"accounts": [{"id": 1, "accNum": 1, "status": "ACTIVE"}]}).to_string(),
            )
            .create_async()
            .await;
        let _instruments = server
            .mock("GET", "/backend-api/trade/accounts/1/instruments")
            .with_status(200)
            .with_body(json!({"d": {"instruments": []}}).to_string())
            .create_async()
            .await;
        let _cancel = server
            .mock("DELETE", "/backend-api/trade/orders/999")
            .with_status(404)
            .with_body("{}")
            .create_async()
            .await;

        let adapter = adapter(&server.url(), Some(1));
        let result = adapter.cancel_order("999").await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancel_reports_other_statuses_as_failure() {
        let mut server = mockito::Server::new_async().await;
        let token = make_jwt(&json!({"sub": "u1"}));

        let _auth = server
            .mock("POST", "/backend-api/auth/jwt/token")
            .with_status(200)
            .with_body(json!({"accessToken": token}).to_string())
            .create_async()
            .await;
        let _accounts = server
            .mock("GET", "/backend-api/auth/jwt/all-accounts")
            .with_status(200)
            .with_body(
                json!({"accounts": [{"id": 1, "accNum": 1, "status": "ACTIVE"}]}).to_string(),
            )
            .create_async()
            .await;
        let _instruments = server
            .mock("GET", "/backend-api/trade/accounts/1/instruments")
            .with_status(200)
            .with_body(json!({"d": {"instruments": []}}).to_string())
            .create_async()
            .await;
        let _cancel = server
            .mock("DELETE", "/backend-api/trade/orders/999")
            .with_status(500)
            .with_body("{\"error\": \"boom\"}")
            .create_async()
            .await;

        let adapter = adapter(&server.url(), Some(1));
        let result = adapter.cancel_order("999").await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("500"));
    }

    #[tokio::test]
    async fn pending_orders_reverse_map_and_age_unknown() {
        let mut server = mockito::Server::new_async().await;
        let token = make_jwt(&json!({"sub": "u1"}));

        let _auth = server
            .mock("POST", "/backend-api/auth/jwt/token")
            .with_status(200)
            .with_body(json!({"accessToken": token}).to_string())
            .create_async()
            .await;
        let _accounts = server
            .mock("GET", "/backend-api/auth/jwt/all-accounts")
            .with_status(200)
            .with_body(
                json!({"accounts": [{"id": 1, "accNum": 1, "status": "ACTIVE"}]}).to_string(),
            )
            .create_async()
            .await;
        let _instruments = server
            .mock("GET", "/backend-api/trade/accounts/1/instruments")
            .with_status(200)
            .with_body(
                json!({"d": {"instruments": [
                    {"tradableInstrumentId": 77, "name": "EURUSD.X"},
                    {"tradableInstrumentId": 88, "name": "US30"}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;
        let _orders = server
            .mock("GET", "/backend-api/trade/accounts/1/orders")
            .with_status(200)
            .with_body(
                json!({"d": {"orders": [
                    {"id": 11, "tradableInstrumentId": 77, "qty": 1.5, "side": "buy",
                     "price": 1.0850, "type": "limit", "status": "PENDING",
                     "createdDate": 1_690_000_000_000_i64},
                    {"id": 12, "tradableInstrumentId": 88, "qty": 0.5, "side": "sell",
                     "price": 39000.0, "type": "limit", "status": "NEW"},
                    {"id": 13, "tradableInstrumentId": 77, "qty": 1.0, "side": "buy",
                     "price": 1.0800, "type": "limit", "status": "FILLED",
                     "createdDate": 1_690_000_000_000_i64}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url(), Some(1));
        let orders = adapter.pending_orders().await.unwrap();
        assert_eq!(orders.len(), 2, "filled order filtered out");

        // Mapped instrument reports the canonical symbol.
        let eurusd = orders.iter().find(|o| o.order_id == "11").unwrap();
        assert_eq!(eurusd.symbol, "EURUSD");
        assert_eq!(eurusd.side, Side::Long);
        assert!(eurusd.created_time.is_some());

        // Unmapped instrument passes the broker handle through, and with no
        // creation field it is age-unknown.
        let us30 = orders.iter().find(|o| o.order_id == "12").unwrap();
        assert_eq!(us30.symbol, "US30");
        assert!(us30.created_time.is_none());
    }
}
