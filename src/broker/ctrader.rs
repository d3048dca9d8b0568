// =============================================================================
// cTrader Open API adapter — persistent binary RPC over TLS
// =============================================================================
//
// A single long-lived session carries every request/response pair. Responses
// are correlated by the client message id echoed back in the frame envelope,
// so overlapping requests of the same kind cannot cross wires.
//
// Authentication is two-phase: application credentials first, then the
// account access token. Access tokens are short-lived; the paired refresh
// token is single-use, so a successful refresh must persist BOTH new tokens
// to the config store before the old pair is dropped. On persistence failure
// the old pair stays in memory.
//
// Wire quirks: volumes travel as lots x 100, monetary amounts as cents.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::proto::{payload_type as pt, Envelope, MessageReader, MessageWriter};
use super::{
    AccountState, BrokerAdapter, BrokerError, OrderRequest, OrderResult, PendingOrder, Position,
    SymbolInfo,
};
use crate::config::{BrokerConfig, ConfigStore};
use crate::types::{OrderKind, Side};

const DEMO_HOST: &str = "demo.ctraderapi.com";
const LIVE_HOST: &str = "live.ctraderapi.com";
const PORT: u16 = 5035;

const TOKEN_ENDPOINT: &str = "https://openapi.ctrader.com/apps/token";

const STATE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(15);
const ORDER_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// Wire enums.
const ORDER_TYPE_MARKET: u64 = 1;
const ORDER_TYPE_LIMIT: u64 = 2;
const ORDER_TYPE_STOP: u64 = 3;
const TRADE_SIDE_BUY: u64 = 1;
const TIF_GOOD_TILL_DATE: u64 = 1;
const TIF_GOOD_TILL_CANCEL: u64 = 2;

type TlsStream = tokio_native_tls::TlsStream<TcpStream>;
type PendingMap = Arc<SyncMutex<HashMap<String, oneshot::Sender<Envelope>>>>;

struct Session {
    writer: WriteHalf<TlsStream>,
    pending: PendingMap,
    reader: JoinHandle<()>,
    account_id: i64,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Persistent-session adapter for cTrader accounts.
pub struct CtraderAdapter {
    broker_id: String,
    name: String,
    demo: bool,
    client_id: String,
    client_secret: String,
    auto_refresh_token: bool,
    configured_account_id: Option<i64>,

    /// Current token pair. Swapped only after a rotation has been persisted.
    tokens: Mutex<(String, String)>,
    /// One refresh attempt per process lifetime; the grant is single-use.
    token_refreshed: AtomicBool,

    /// canonical symbol -> broker symbol-id string.
    mapping: HashMap<String, String>,
    /// broker symbol-id string -> canonical symbol.
    reverse: HashMap<String, String>,

    /// Symbol details cached from the last listSymbols call, keyed by id.
    symbol_cache: SyncMutex<HashMap<i64, SymbolInfo>>,

    session: Mutex<Option<Session>>,
    store: Arc<ConfigStore>,
    http: reqwest::Client,
}

impl CtraderAdapter {
    pub fn new(
        broker_id: String,
        config: BrokerConfig,
        mapping: HashMap<String, String>,
        store: Arc<ConfigStore>,
    ) -> Self {
        let reverse = mapping.iter().map(|(k, v)| (v.clone(), k.clone())).collect();
        let name = if config.name.is_empty() {
            broker_id.clone()
        } else {
            config.name.clone()
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            broker_id,
            name,
            demo: config.is_demo,
            client_id: config.client_id,
            client_secret: config.client_secret,
            auto_refresh_token: config.auto_refresh_token,
            configured_account_id: config.account_id,
            tokens: Mutex::new((config.access_token, config.refresh_token)),
            token_refreshed: AtomicBool::new(false),
            mapping,
            reverse,
            symbol_cache: SyncMutex::new(HashMap::new()),
            session: Mutex::new(None),
            store,
            http,
        }
    }

    // -------------------------------------------------------------------------
    // Token rotation
    // -------------------------------------------------------------------------

    /// Exchange the single-use refresh token for a fresh pair.
    ///
    /// Persist-then-swap: the new pair is written to the config store first;
    /// only when that succeeds do the in-memory tokens change. A crash
    /// between the two leaves a usable pair on disk.
    async fn refresh_access_token(&self) -> Result<(), BrokerError> {
        let (_, refresh_token) = self.tokens.lock().await.clone();
        if refresh_token.is_empty() {
            return Err(BrokerError::AuthenticationFailed(
                "no refresh token available".into(),
            ));
        }

        debug!(broker = %self.broker_id, "refreshing access token");
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("token endpoint: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("token response: {e}")))?;

        if !status.is_success() {
            return Err(BrokerError::AuthenticationFailed(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let new_access = body
            .get("accessToken")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrokerError::AuthenticationFailed("no access token in refresh response".into())
            })?
            .to_string();
        let new_refresh = body
            .get("refreshToken")
            .or_else(|| body.get("refresh_token"))
            .and_then(|v| v.as_str())
            .unwrap_or(refresh_token.as_str())
            .to_string();

        // Persist first. The old refresh grant is already burned at the
        // endpoint, so losing the new pair here would strand the account.
        if let Err(e) = self
            .store
            .update_broker_tokens(&self.broker_id, &new_access, &new_refresh)
            .await
        {
            warn!(broker = %self.broker_id, error = %e, "token persistence failed, keeping old pair in memory");
            return Err(BrokerError::Transport(format!(
                "token persistence failed: {e}"
            )));
        }

        *self.tokens.lock().await = (new_access, new_refresh);
        info!(broker = %self.broker_id, "access token refreshed and persisted");
        Ok(())
    }

    fn should_refresh_token(&self) -> bool {
        self.auto_refresh_token && !self.token_refreshed.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Session management
    // -------------------------------------------------------------------------

    async fn open_session(&self) -> Result<Session, BrokerError> {
        let host = if self.demo { DEMO_HOST } else { LIVE_HOST };

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, PORT)))
            .await
            .map_err(|_| BrokerError::Timeout("connect"))?
            .map_err(|e| BrokerError::ConnectionFailed(format!("{host}:{PORT}: {e}")))?;

        let tls = native_tls::TlsConnector::new()
            .map_err(|e| BrokerError::ConnectionFailed(format!("tls init: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(tls);
        let stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("tls handshake: {e}")))?;

        debug!(broker = %self.broker_id, host, "transport connected");

        let (read_half, writer) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), self.broker_id.clone()));

        let mut session = Session {
            writer,
            pending,
            reader,
            account_id: 0,
        };

        // Phase 1: application auth.
        let mut w = MessageWriter::new();
        w.string(2, &self.client_id).string(3, &self.client_secret);
        let res = request(&mut session, pt::APPLICATION_AUTH_REQ, w.finish(), STATE_READ_TIMEOUT)
            .await?;
        expect_ok(&res, pt::APPLICATION_AUTH_RES, "application auth")?;
        debug!(broker = %self.broker_id, "application authenticated");

        let access_token = self.tokens.lock().await.0.clone();

        // Resolve the account id when not configured: first account on the
        // token.
        let account_id = match self.configured_account_id {
            Some(id) => id,
            None => {
                let mut w = MessageWriter::new();
                w.string(2, &access_token);
                let res =
                    request(&mut session, pt::ACCOUNT_LIST_REQ, w.finish(), STATE_READ_TIMEOUT)
                        .await?;
                expect_ok(&res, pt::ACCOUNT_LIST_RES, "account list")?;
                let first = MessageReader::collect_field(&res.payload, 2)
                    .map_err(|e| BrokerError::Transport(e.to_string()))?
                    .into_iter()
                    .filter_map(|f| f.as_bytes())
                    .filter_map(|buf| {
                        MessageReader::find_field(buf, 1)
                            .ok()
                            .flatten()
                            .and_then(|v| v.as_i64())
                    })
                    .next();
                first.ok_or_else(|| {
                    BrokerError::AuthenticationFailed("no accounts found for this token".into())
                })?
            }
        };

        // Phase 2: account auth.
        let mut w = MessageWriter::new();
        w.int64(2, account_id).string(3, &access_token);
        let res =
            request(&mut session, pt::ACCOUNT_AUTH_REQ, w.finish(), STATE_READ_TIMEOUT).await?;
        expect_ok(&res, pt::ACCOUNT_AUTH_RES, "account auth")?;

        session.account_id = account_id;
        info!(broker = %self.broker_id, account_id, "account authenticated");
        Ok(session)
    }

    /// Run `f`-style request against the live session, connecting first if
    /// needed. The session lock is held for the full exchange, serializing
    /// wire mutations.
    async fn with_session(
        &self,
        payload_type: u32,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<Envelope, BrokerError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            if self.should_refresh_token() {
                match self.refresh_access_token().await {
                    Ok(()) => self.token_refreshed.store(true, Ordering::SeqCst),
                    Err(e) => warn!(broker = %self.broker_id, error = %e, "token refresh failed, trying existing token"),
                }
            }
            *guard = Some(self.open_session().await?);
        }
        let session = guard.as_mut().expect("session present");

        match request(session, payload_type, payload, wait).await {
            Ok(env) => Ok(env),
            Err(e) => {
                // A dead transport poisons the session; drop it so the next
                // call reconnects.
                if matches!(e, BrokerError::Transport(_)) {
                    *guard = None;
                }
                Err(e)
            }
        }
    }

    /// Connect if needed and return the authenticated account id.
    async fn ensure_account_id(&self) -> Result<i64, BrokerError> {
        self.connect().await?;
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|s| s.account_id)
            .ok_or(BrokerError::NotConnected)
    }

    fn canonical_symbol(&self, symbol_id: i64) -> String {
        let key = symbol_id.to_string();
        self.reverse.get(&key).cloned().unwrap_or(key)
    }
}

// =============================================================================
// Frame plumbing
// =============================================================================

async fn read_loop(mut reader: ReadHalf<TlsStream>, pending: PendingMap, broker_id: String) {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        let envelope = match Envelope::decode(&body) {
            Ok(e) => e,
            Err(e) => {
                warn!(broker = %broker_id, error = %e, "dropping undecodable frame");
                continue;
            }
        };

        if envelope.payload_type == pt::HEARTBEAT_EVENT {
            continue;
        }

        match envelope.client_msg_id.as_deref() {
            Some(id) => {
                let waiter = pending.lock().remove(id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => debug!(broker = %broker_id, msg_id = id, "late response discarded"),
                }
            }
            None => {
                // Unsolicited event (fills, margin calls). Observed only.
                debug!(broker = %broker_id, payload_type = envelope.payload_type, "event received");
            }
        }
    }
    // Connection gone: wake every waiter with a closed channel.
    pending.lock().clear();
    debug!(broker = %broker_id, "read loop ended");
}

async fn request(
    session: &mut Session,
    payload_type: u32,
    payload: Vec<u8>,
    wait: Duration,
) -> Result<Envelope, BrokerError> {
    let msg_id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    session.pending.lock().insert(msg_id.clone(), tx);

    let frame = Envelope::new(payload_type, payload, Some(msg_id.clone())).to_frame();
    if let Err(e) = session.writer.write_all(&frame).await {
        session.pending.lock().remove(&msg_id);
        return Err(BrokerError::Transport(format!("write failed: {e}")));
    }

    match timeout(wait, rx).await {
        Ok(Ok(envelope)) => Ok(envelope),
        Ok(Err(_)) => Err(BrokerError::Transport("connection closed".into())),
        Err(_) => {
            session.pending.lock().remove(&msg_id);
            Err(BrokerError::Timeout("rpc response"))
        }
    }
}

/// Fail on ERROR_RES, otherwise require the expected payload type.
fn expect_ok(envelope: &Envelope, expected: u32, what: &str) -> Result<(), BrokerError> {
    if envelope.payload_type == pt::ERROR_RES {
        let code = MessageReader::find_field(&envelope.payload, 1)
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let description = MessageReader::find_field(&envelope.payload, 2)
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        return Err(BrokerError::AuthenticationFailed(format!(
            "{what}: {code} {description}"
        )));
    }
    if envelope.payload_type != expected {
        return Err(BrokerError::Transport(format!(
            "{what}: unexpected payload type {}",
            envelope.payload_type
        )));
    }
    Ok(())
}

// =============================================================================
// BrokerAdapter impl
// =============================================================================

#[async_trait::async_trait]
impl BrokerAdapter for CtraderAdapter {
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        if self.should_refresh_token() {
            match self.refresh_access_token().await {
                Ok(()) => self.token_refreshed.store(true, Ordering::SeqCst),
                Err(e) => warn!(broker = %self.broker_id, error = %e, "token refresh failed, trying existing token"),
            }
        }
        *guard = Some(self.open_session().await?);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            drop(session);
            info!(broker = %self.broker_id, "disconnected");
        }
    }

    async fn account_info(&self) -> Result<AccountState, BrokerError> {
        let account_id = self.ensure_account_id().await?;

        let mut w = MessageWriter::new();
        w.int64(2, account_id);
        let res = self
            .with_session(pt::TRADER_REQ, w.finish(), STATE_READ_TIMEOUT)
            .await?;
        expect_ok(&res, pt::TRADER_RES, "trader info")?;

        let trader = MessageReader::find_field(&res.payload, 2)
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .and_then(|f| f.as_bytes().map(<[u8]>::to_vec))
            .ok_or_else(|| BrokerError::Transport("trader response missing body".into()))?;

        let cents = |field: u32| -> f64 {
            MessageReader::find_field(&trader, field)
                .ok()
                .flatten()
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as f64
                / 100.0
        };
        let balance = cents(2);
        let margin_used = cents(3);
        let leverage = MessageReader::find_field(&trader, 4)
            .ok()
            .flatten()
            .and_then(|v| v.as_u64())
            .map(|l| (l / 100) as u32)
            .unwrap_or(100);
        let currency = MessageReader::find_field(&trader, 5)
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "USD".to_string());

        Ok(AccountState {
            account_id: account_id.to_string(),
            balance,
            // The trader record reports balance only; equity tracks it until
            // positions move.
            equity: balance,
            margin_used,
            margin_free: (balance - margin_used).max(0.0),
            currency,
            leverage,
        })
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        let account_id = self.ensure_account_id().await?;

        let mut w = MessageWriter::new();
        w.int64(2, account_id);
        let res = self
            .with_session(pt::SYMBOLS_LIST_REQ, w.finish(), LIST_TIMEOUT)
            .await?;
        expect_ok(&res, pt::SYMBOLS_LIST_RES, "symbols list")?;

        let mut out = Vec::new();
        for entry in MessageReader::collect_field(&res.payload, 2)
            .map_err(|e| BrokerError::Transport(e.to_string()))?
        {
            let Some(buf) = entry.as_bytes() else { continue };
            let symbol_id = MessageReader::find_field(buf, 1)
                .ok()
                .flatten()
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let name = MessageReader::find_field(buf, 2)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("ID:{symbol_id}"));
            let digits = MessageReader::find_field(buf, 3)
                .ok()
                .flatten()
                .and_then(|v| v.as_u64())
                .unwrap_or(5) as u32;
            let description = MessageReader::find_field(buf, 4)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();

            let info = SymbolInfo {
                symbol: self.canonical_symbol(symbol_id),
                broker_symbol: symbol_id.to_string(),
                description,
                pip_size: 10f64.powi(-(digits as i32)),
                digits,
                tick_size: 10f64.powi(-(digits as i32)),
                min_lot: 0.01,
                max_lot: 100.0,
                lot_step: 0.01,
            };
            self.symbol_cache.lock().insert(symbol_id, info.clone());
            out.push(info);
        }
        debug!(broker = %self.broker_id, count = out.len(), "symbols listed");
        Ok(out)
    }

    async fn place_order(&self, request_in: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let handle = self
            .mapping
            .get(&request_in.symbol)
            .ok_or_else(|| BrokerError::SymbolNotMapped(request_in.symbol.clone()))?;
        let symbol_id: i64 = handle
            .parse()
            .map_err(|_| BrokerError::SymbolNotMapped(request_in.symbol.clone()))?;

        let account_id = self.ensure_account_id().await?;

        // Conservative tick rounding when symbol details are cached.
        let cached = self.symbol_cache.lock().get(&symbol_id).cloned();
        let (entry, sl, tp) = match (&cached, request_in.entry_price) {
            (Some(info), Some(entry)) => (
                Some(info.round_entry_conservative(entry, request_in.side)),
                request_in.stop_loss.map(|v| info.round_sl_conservative(v, entry)),
                request_in.take_profit.map(|v| info.round_tp_conservative(v, entry)),
            ),
            _ => (
                request_in.entry_price,
                request_in.stop_loss,
                request_in.take_profit,
            ),
        };

        let mut w = MessageWriter::new();
        w.int64(2, account_id).int64(3, symbol_id);
        match request_in.order_type {
            OrderKind::Market => {
                w.varint(4, ORDER_TYPE_MARKET);
            }
            OrderKind::Limit => {
                w.varint(4, ORDER_TYPE_LIMIT);
                if let Some(p) = entry {
                    w.double(7, p);
                }
            }
            OrderKind::Stop => {
                w.varint(4, ORDER_TYPE_STOP);
                if let Some(p) = entry {
                    w.double(8, p);
                }
            }
        }
        w.varint(
            5,
            if request_in.side == Side::Long {
                TRADE_SIDE_BUY
            } else {
                2
            },
        );
        // Lots to broker volume units.
        w.int64(6, (request_in.volume_lots * 100.0).round() as i64);

        match request_in.expiry_timestamp_ms {
            Some(ms) => {
                w.varint(9, TIF_GOOD_TILL_DATE);
                w.int64(10, ms);
            }
            None => {
                w.varint(9, TIF_GOOD_TILL_CANCEL);
            }
        }
        if let Some(v) = sl {
            w.double(11, v);
        }
        if let Some(v) = tp {
            w.double(12, v);
        }
        if !request_in.comment.is_empty() {
            let mut comment = request_in.comment.clone();
            comment.truncate(100);
            w.string(13, &comment);
        }
        if !request_in.label.is_empty() {
            let mut label = request_in.label.clone();
            label.truncate(50);
            w.string(15, &label);
        }

        info!(
            broker = %self.broker_id,
            symbol = %request_in.symbol,
            side = %request_in.side,
            order_type = %request_in.order_type,
            lots = request_in.volume_lots,
            "placing order"
        );

        let res = self
            .with_session(pt::NEW_ORDER_REQ, w.finish(), ORDER_TIMEOUT)
            .await?;

        if res.payload_type == pt::ERROR_RES || res.payload_type == pt::ORDER_ERROR_EVENT {
            let description = MessageReader::find_field(&res.payload, 2)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "order rejected".to_string());
            return Ok(OrderResult::failed(description));
        }

        // Execution event: order placed, or filled straight into a position.
        let order_id = MessageReader::find_field(&res.payload, 3)
            .ok()
            .flatten()
            .and_then(|f| f.as_bytes())
            .and_then(|buf| {
                MessageReader::find_field(buf, 1)
                    .ok()
                    .flatten()
                    .and_then(|v| v.as_i64())
            });
        let position_id = MessageReader::find_field(&res.payload, 4)
            .ok()
            .flatten()
            .and_then(|f| f.as_bytes())
            .and_then(|buf| {
                MessageReader::find_field(buf, 1)
                    .ok()
                    .flatten()
                    .and_then(|v| v.as_i64())
            });

        Ok(match (order_id, position_id) {
            (Some(id), _) => OrderResult::ok(id.to_string(), "order placed"),
            (None, Some(id)) => OrderResult::ok(id.to_string(), "order filled immediately"),
            (None, None) => OrderResult {
                success: true,
                order_id: None,
                message: format!("accepted (payload type {})", res.payload_type),
                fill_price: None,
            },
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResult, BrokerError> {
        let id: i64 = order_id
            .parse()
            .map_err(|_| BrokerError::Transport(format!("non-numeric order id: {order_id}")))?;
        let account_id = self.ensure_account_id().await?;

        let mut w = MessageWriter::new();
        w.int64(2, account_id).int64(3, id);
        let res = self
            .with_session(pt::CANCEL_ORDER_REQ, w.finish(), CANCEL_TIMEOUT)
            .await?;

        if res.payload_type == pt::ERROR_RES || res.payload_type == pt::ORDER_ERROR_EVENT {
            let description = MessageReader::find_field(&res.payload, 2)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "cancel rejected".to_string());
            return Ok(OrderResult::failed(description));
        }
        Ok(OrderResult::ok(order_id, "order cancelled"))
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrder>, BrokerError> {
        let res = self.reconcile().await?;
        let mut out = Vec::new();

        for entry in MessageReader::collect_field(&res.payload, 3)
            .map_err(|e| BrokerError::Transport(e.to_string()))?
        {
            let Some(buf) = entry.as_bytes() else { continue };
            let order_id = read_i64(buf, 1).unwrap_or(0);
            let Some(trade_data) = read_bytes(buf, 2) else { continue };

            let symbol_id = read_i64(trade_data, 1).unwrap_or(0);
            let volume = read_i64(trade_data, 2).unwrap_or(0) as f64 / 100.0;
            let side = if read_i64(trade_data, 3) == Some(TRADE_SIDE_BUY as i64) {
                Side::Long
            } else {
                Side::Short
            };
            let created_time = read_i64(trade_data, 4)
                .filter(|ms| *ms > 0)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

            let order_type = if read_i64(buf, 3) == Some(ORDER_TYPE_LIMIT as i64) {
                OrderKind::Limit
            } else {
                OrderKind::Stop
            };
            let entry_price = read_f64(buf, 4).or_else(|| read_f64(buf, 5)).unwrap_or(0.0);
            let expiry_time = read_i64(buf, 8)
                .filter(|ms| *ms > 0)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

            out.push(PendingOrder {
                order_id: order_id.to_string(),
                symbol: self.canonical_symbol(symbol_id),
                side,
                order_type,
                volume_lots: volume,
                entry_price,
                stop_loss: read_f64(buf, 6),
                take_profit: read_f64(buf, 7),
                created_time,
                expiry_time,
                label: read_str(buf, 9).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let res = self.reconcile().await?;
        let mut out = Vec::new();

        for entry in MessageReader::collect_field(&res.payload, 2)
            .map_err(|e| BrokerError::Transport(e.to_string()))?
        {
            let Some(buf) = entry.as_bytes() else { continue };
            let position_id = read_i64(buf, 1).unwrap_or(0);
            let Some(trade_data) = read_bytes(buf, 2) else { continue };

            let symbol_id = read_i64(trade_data, 1).unwrap_or(0);
            let volume = read_i64(trade_data, 2).unwrap_or(0) as f64 / 100.0;
            let side = if read_i64(trade_data, 3) == Some(TRADE_SIDE_BUY as i64) {
                Side::Long
            } else {
                Side::Short
            };

            out.push(Position {
                position_id: position_id.to_string(),
                symbol: self.canonical_symbol(symbol_id),
                side,
                volume_lots: volume,
                entry_price: read_f64(buf, 3).unwrap_or(0.0),
                current_price: None,
                unrealized_pnl: None,
            });
        }
        Ok(out)
    }
}

impl CtraderAdapter {
    async fn reconcile(&self) -> Result<Envelope, BrokerError> {
        let account_id = self.ensure_account_id().await?;
        let mut w = MessageWriter::new();
        w.int64(2, account_id);
        let res = self
            .with_session(pt::RECONCILE_REQ, w.finish(), LIST_TIMEOUT)
            .await?;
        expect_ok(&res, pt::RECONCILE_RES, "reconcile")?;
        Ok(res)
    }
}

fn read_i64(buf: &[u8], field: u32) -> Option<i64> {
    MessageReader::find_field(buf, field)
        .ok()
        .flatten()
        .and_then(|v| v.as_i64())
}

fn read_f64(buf: &[u8], field: u32) -> Option<f64> {
    MessageReader::find_field(buf, field)
        .ok()
        .flatten()
        .and_then(|v| v.as_f64())
}

fn read_bytes(buf: &[u8], field: u32) -> Option<&[u8]> {
    MessageReader::find_field(buf, field).ok().flatten().and_then(|v| v.as_bytes())
}

fn read_str(buf: &[u8], field: u32) -> Option<String> {
    MessageReader::find_field(buf, field)
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(str::to_string))
}

impl std::fmt::Debug for CtraderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtraderAdapter")
            .field("broker_id", &self.broker_id)
            .field("demo", &self.demo)
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .finish()
    }
}
