// =============================================================================
// Configuration — TOML file with env-var secret overrides and atomic save
// =============================================================================
//
// The file is the operator's source of truth, split into sections:
// {general, execution, filters, webhook, brokers, instruments, notifications}.
// Secrets (webhook secret, broker credentials) may be supplied via environment
// variables that override the file at load time.
//
// Token rotation rewrites exactly the two token fields of the targeted broker
// entry through a syntax-preserving TOML edit, then swaps the file with the
// atomic tmp + rename pattern. Rotations are serialized per broker so a
// concurrent order submission sees either the old pair or the new, never an
// interleaving.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::candles::SessionModel;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_risk_percent() -> f64 {
    0.5
}

fn default_timeframe_minutes() -> u32 {
    240
}

fn default_order_timeout_bars() -> u32 {
    4
}

fn default_fallback_account_value() -> f64 {
    10_000.0
}

fn default_min_margin_percent() -> f64 {
    30.0
}

fn default_max_open_positions() -> u32 {
    5
}

fn default_max_pending_orders() -> u32 {
    10
}

fn default_delay_min_ms() -> u64 {
    500
}

fn default_delay_max_ms() -> u64 {
    3000
}

fn default_reaper_interval_secs() -> u64 {
    900
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_contract_size() -> f64 {
    100_000.0
}

// =============================================================================
// Sections
// =============================================================================

/// Global trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Percent of account value risked per trade.
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,

    /// Size against equity when true, balance otherwise.
    #[serde(default = "default_true")]
    pub use_equity: bool,

    /// Timeframe of the signal charts, in minutes.
    #[serde(default = "default_timeframe_minutes")]
    pub candle_timeframe_minutes: u32,

    /// Closed bars after which a pending order is cancelled.
    #[serde(default = "default_order_timeout_bars")]
    pub order_timeout_bars: u32,

    /// Sizing fallback when the broker reports no usable balance or equity.
    #[serde(default = "default_fallback_account_value")]
    pub fallback_account_value: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            risk_percent: default_risk_percent(),
            use_equity: true,
            candle_timeframe_minutes: default_timeframe_minutes(),
            order_timeout_bars: default_order_timeout_bars(),
            fallback_account_value: default_fallback_account_value(),
        }
    }
}

/// Inter-account / inter-signal delay window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_delay_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub max_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_ms: default_delay_min_ms(),
            max_ms: default_delay_max_ms(),
        }
    }
}

/// Execution scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Fixed account processing order. Empty means all enabled brokers in
    /// config order.
    #[serde(default)]
    pub broker_order: Vec<String>,

    /// Randomized spacing applied between accounts and between signals.
    #[serde(default)]
    pub delay_between_brokers: DelayConfig,

    /// Seconds between expiry sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            broker_order: Vec::new(),
            delay_between_brokers: DelayConfig::default(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

/// Pre-trade filter limits, global defaults. Every field can be overridden
/// per broker via [`BrokerConfig::limits`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_margin_percent")]
    pub min_margin_percent: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_pending_orders")]
    pub max_pending_orders: u32,
    #[serde(default = "default_true")]
    pub prevent_duplicate_orders: bool,

    /// Reserved: drawdown limits are tracked by external tooling, the core
    /// does not enforce them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_drawdown_limit_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_drawdown_limit_percent: Option<f64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_margin_percent: default_min_margin_percent(),
            max_open_positions: default_max_open_positions(),
            max_pending_orders: default_max_pending_orders(),
            prevent_duplicate_orders: true,
            daily_drawdown_limit_percent: None,
            total_drawdown_limit_percent: None,
        }
    }
}

/// Partial per-broker override of [`FilterConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_margin_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_positions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_orders: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevent_duplicate_orders: Option<bool>,
}

/// Webhook intake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Shared secret; overridden by WEBHOOK_SECRET env var.
    #[serde(default)]
    pub secret: String,

    /// Optional IP allow-list. Empty means any source. The well-known
    /// charting-platform egress addresses are always allowed.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            secret: String::new(),
            allowed_ips: Vec::new(),
        }
    }
}

/// Which remote API a broker entry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Ctrader,
    Tradelocker,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ctrader => write!(f, "ctrader"),
            Self::Tradelocker => write!(f, "tradelocker"),
        }
    }
}

/// One brokerage account. Credential fields are adapter-specific; unused ones
/// stay empty. Env vars of the form `BROKER_<ID>_<FIELD>` override the file
/// for password, client_secret, access_token and refresh_token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "type")]
    pub kind: BrokerKind,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub is_demo: bool,

    // --- cTrader credentials -------------------------------------------------
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default = "default_true")]
    pub auto_refresh_token: bool,

    // --- TradeLocker credentials --------------------------------------------
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub server: String,

    /// Preferred account id at the broker. Optional for both adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<i64>,

    /// Per-broker filter overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FilterOverrides>,
}

/// One instrument entry, keyed by canonical symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub pip_size: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_value_per_lot: Option<f64>,

    #[serde(default = "default_contract_size")]
    pub contract_size: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_currency: Option<String>,

    /// Bar-boundary offset override. Auto-detected from the symbol when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candle_phase_minutes: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_model: Option<SessionModel>,

    /// Broker-specific symbol handle per broker id.
    #[serde(default)]
    pub brokers: BTreeMap<String, String>,
}

/// One outbound notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub enabled: bool,

    // Channel-specific settings, flat like the broker credentials.
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub webhook_url: String,
}

/// Notification fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_order_placed: bool,
    #[serde(default = "default_true")]
    pub on_order_expired: bool,
    #[serde(default)]
    pub on_filter_skip: bool,
    #[serde(default = "default_true")]
    pub on_error: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_order_placed: true,
            on_order_expired: true,
            on_filter_skip: false,
            on_error: true,
            channels: Vec::new(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub brokers: BTreeMap<String, BrokerConfig>,
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

impl AppConfig {
    /// Parse a TOML document and layer env-var secrets over it.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text).context("failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Effective filter limits for one broker: global defaults plus any
    /// per-broker overrides.
    pub fn broker_limits(&self, broker_id: &str) -> FilterConfig {
        let mut limits = self.filters.clone();
        if let Some(overrides) = self.brokers.get(broker_id).and_then(|b| b.limits.as_ref()) {
            if let Some(v) = overrides.min_margin_percent {
                limits.min_margin_percent = v;
            }
            if let Some(v) = overrides.max_open_positions {
                limits.max_open_positions = v;
            }
            if let Some(v) = overrides.max_pending_orders {
                limits.max_pending_orders = v;
            }
            if let Some(v) = overrides.prevent_duplicate_orders {
                limits.prevent_duplicate_orders = v;
            }
        }
        limits
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook.secret = secret;
            }
        }

        for (id, broker) in self.brokers.iter_mut() {
            let prefix = format!("BROKER_{}_", id.to_uppercase());
            let over = |field: &str| std::env::var(format!("{prefix}{field}")).ok();

            if let Some(v) = over("PASSWORD") {
                broker.password = v;
            }
            if let Some(v) = over("CLIENT_SECRET") {
                broker.client_secret = v;
            }
            if let Some(v) = over("ACCESS_TOKEN") {
                broker.access_token = v;
            }
            if let Some(v) = over("REFRESH_TOKEN") {
                broker.refresh_token = v;
            }
        }
    }
}

// =============================================================================
// ConfigStore
// =============================================================================

/// Shared handle to the configuration: in-memory snapshot plus the file it
/// came from. Reload is explicit; the snapshot never changes under a reader.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<AppConfig>>,
    /// One rotation lock per broker id. Guards read-modify-write of the
    /// token fields against concurrent rotations on the same entry.
    rotation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConfigStore {
    /// Load the store from `path`. A missing file yields defaults with a
    /// warning so a fresh deployment can boot and be configured over env.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config = AppConfig::from_toml(&text)
                    .with_context(|| format!("invalid config at {}", path.display()))?;
                info!(
                    path = %path.display(),
                    brokers = config.brokers.len(),
                    instruments = config.instruments.len(),
                    "config loaded"
                );
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
                let mut config = AppConfig::default();
                config.apply_env_overrides();
                config
            }
        };

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
            rotation_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Current immutable snapshot.
    pub fn get(&self) -> Arc<AppConfig> {
        self.current.read().clone()
    }

    /// Re-read the file and swap the snapshot. Operator-triggered.
    pub fn reload(&self) -> Result<()> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let config = AppConfig::from_toml(&text)?;
        *self.current.write() = Arc::new(config);
        info!(path = %self.path.display(), "config reloaded");
        Ok(())
    }

    /// Persist a rotated token pair for one broker.
    ///
    /// Rewrites only `access_token` and `refresh_token` of the targeted entry,
    /// preserving the rest of the document (comments included), then renames
    /// a temp file over the original. The in-memory snapshot is swapped only
    /// after the file write succeeds, so a crash mid-rotation leaves a usable
    /// pair on disk either way.
    pub async fn update_broker_tokens(
        &self,
        broker_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()> {
        let lock = {
            let mut locks = self.rotation_locks.lock().await;
            locks
                .entry(broker_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // --- File rewrite ----------------------------------------------------
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut doc: toml_edit::DocumentMut = text
            .parse()
            .context("config file is not valid TOML, refusing to rewrite")?;

        let entry = doc
            .get_mut("brokers")
            .and_then(toml_edit::Item::as_table_mut)
            .and_then(|brokers| brokers.get_mut(broker_id))
            .with_context(|| format!("broker '{broker_id}' not present in config file"))?;
        entry["access_token"] = toml_edit::value(access_token);
        entry["refresh_token"] = toml_edit::value(refresh_token);

        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, doc.to_string())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename over {}", self.path.display()))?;

        // --- In-memory swap --------------------------------------------------
        {
            let mut current = self.current.write();
            let mut config = (**current).clone();
            if let Some(broker) = config.brokers.get_mut(broker_id) {
                broker.access_token = access_token.to_string();
                broker.refresh_token = refresh_token.to_string();
            }
            *current = Arc::new(config);
        }

        info!(broker_id, "broker tokens rotated and persisted");
        Ok(())
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
risk_percent = 1.0

[webhook]
secret = "file-secret"

[brokers.ic_demo]
type = "ctrader"
name = "IC Markets Demo"
client_id = "app-id"
client_secret = "app-secret"
access_token = "old-access"
refresh_token = "old-refresh"
account_id = 4242

[brokers.gft_1]
type = "tradelocker"
name = "GFT Funded #1"
base_url = "https://demo.tradelocker.com"
email = "user@example.com"
password = "pw"
server = "GFTTL"
is_demo = false

[brokers.gft_1.limits]
max_open_positions = 2

[instruments.EURUSD]
pip_size = 0.0001
pip_value_per_lot = 10.0
quote_currency = "USD"

[instruments.EURUSD.brokers]
ic_demo = "1"
gft_1 = "EURUSD.X"
"#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.general.risk_percent, 1.0);
        assert!(config.general.use_equity);
        assert_eq!(config.general.candle_timeframe_minutes, 240);
        assert_eq!(config.general.order_timeout_bars, 4);
        assert_eq!(config.filters.min_margin_percent, 30.0);
        assert_eq!(config.execution.delay_between_brokers.min_ms, 500);
        assert_eq!(config.execution.delay_between_brokers.max_ms, 3000);
        assert_eq!(config.execution.reaper_interval_secs, 900);

        let ic = &config.brokers["ic_demo"];
        assert_eq!(ic.kind, BrokerKind::Ctrader);
        assert!(ic.enabled);
        assert!(ic.is_demo);
        assert_eq!(ic.account_id, Some(4242));

        let gft = &config.brokers["gft_1"];
        assert_eq!(gft.kind, BrokerKind::Tradelocker);
        assert!(!gft.is_demo);

        let eurusd = &config.instruments["EURUSD"];
        assert_eq!(eurusd.pip_size, 0.0001);
        assert_eq!(eurusd.brokers["gft_1"], "EURUSD.X");
    }

    #[test]
    fn per_broker_limit_overrides() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let global = config.broker_limits("ic_demo");
        assert_eq!(global.max_open_positions, 5);
        let overridden = config.broker_limits("gft_1");
        assert_eq!(overridden.max_open_positions, 2);
        // Untouched fields keep the global value.
        assert_eq!(overridden.max_pending_orders, 10);
    }

    #[tokio::test]
    async fn token_rotation_rewrites_only_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        store
            .update_broker_tokens("ic_demo", "new-access", "new-refresh")
            .await
            .unwrap();

        // In-memory snapshot updated.
        let config = store.get();
        assert_eq!(config.brokers["ic_demo"].access_token, "new-access");
        assert_eq!(config.brokers["ic_demo"].refresh_token, "new-refresh");

        // File updated, other entries untouched.
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("new-access"));
        assert!(text.contains("new-refresh"));
        assert!(!text.contains("old-access"));
        assert!(text.contains("GFT Funded #1"));
        assert!(text.contains("EURUSD.X"));

        // A fresh load sees the rotated pair.
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get().brokers["ic_demo"].access_token, "new-access");
    }

    #[tokio::test]
    async fn token_rotation_unknown_broker_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let err = store
            .update_broker_tokens("nope", "a", "b")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        // Old pair still intact on disk.
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("old-access"));
        assert!(text.contains("old-refresh"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let store = ConfigStore::load("/nonexistent/relay.toml").unwrap();
        let config = store.get();
        assert!(config.brokers.is_empty());
        assert_eq!(config.general.risk_percent, 0.5);
    }
}
