// =============================================================================
// Events & Notifications — structured core events with external sinks
// =============================================================================
//
// The core publishes `TradeEvent`s on a broadcast channel and never waits for
// a sink. Sinks (Telegram, Discord webhook, system mail) subscribe and fan
// each event out according to the notifications config. A slow sink can lag
// and lose events; it cannot stall the trading pipeline.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{ChannelConfig, ConfigStore, NotificationsConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Structured event emitted by the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeEvent {
    OrderPlaced {
        broker: String,
        symbol: String,
        side: String,
        order_type: String,
        lots: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        order_id: String,
    },
    OrderExpired {
        broker: String,
        symbol: String,
        order_id: String,
        closed_bars: u32,
        timeout_bars: u32,
    },
    FilterSkip {
        broker: String,
        symbol: String,
        reason: String,
        message: String,
    },
    EngineError {
        broker: Option<String>,
        message: String,
    },
}

impl TradeEvent {
    /// One-line operator summary.
    pub fn summary(&self) -> String {
        match self {
            Self::OrderPlaced {
                broker,
                symbol,
                side,
                lots,
                entry_price,
                ..
            } => format!("{broker}: placed {side} {lots} lots {symbol} @ {entry_price}"),
            Self::OrderExpired {
                broker,
                symbol,
                order_id,
                closed_bars,
                timeout_bars,
            } => format!(
                "{broker}: cancelled expired order {order_id} on {symbol} ({closed_bars}/{timeout_bars} bars)"
            ),
            Self::FilterSkip {
                broker,
                symbol,
                reason,
                ..
            } => format!("{broker}: skipped {symbol} ({reason})"),
            Self::EngineError { broker, message } => match broker {
                Some(b) => format!("{b}: error: {message}"),
                None => format!("error: {message}"),
            },
        }
    }

    fn body(&self) -> String {
        let mut lines = vec![self.summary()];
        match self {
            Self::OrderPlaced {
                order_type,
                stop_loss,
                take_profit,
                order_id,
                ..
            } => {
                lines.push(format!("type: {order_type}"));
                lines.push(format!("SL: {stop_loss}  TP: {take_profit}"));
                if !order_id.is_empty() {
                    lines.push(format!("order id: {order_id}"));
                }
            }
            Self::FilterSkip { message, .. } => lines.push(message.clone()),
            _ => {}
        }
        lines.push(format!("at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")));
        lines.join("\n")
    }

    fn title(&self) -> String {
        match self {
            Self::OrderPlaced { symbol, .. } => format!("Order placed: {symbol}"),
            Self::OrderExpired { symbol, .. } => format!("Order expired: {symbol}"),
            Self::FilterSkip { symbol, .. } => format!("Signal skipped: {symbol}"),
            Self::EngineError { .. } => "Trading error".to_string(),
        }
    }
}

/// Cheap-to-clone publisher handle.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TradeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish without blocking. No subscribers is fine.
    pub fn emit(&self, event: TradeEvent) {
        debug!(event = %event.summary(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Sink task
// =============================================================================

/// Spawn the notification fan-out task. Reads the channel list from the live
/// config on every event so channel edits apply on reload.
pub fn spawn_sinks(bus: &EventBus, store: Arc<ConfigStore>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "notification sink lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let config = store.get().notifications.clone();
            if !should_notify(&config, &event) {
                continue;
            }

            for channel in config.channels.iter().filter(|c| c.enabled) {
                if let Err(e) = send_to_channel(&http, channel, &event).await {
                    warn!(channel = %channel.kind, error = %e, "notification send failed");
                }
            }
        }
    })
}

fn should_notify(config: &NotificationsConfig, event: &TradeEvent) -> bool {
    if !config.enabled {
        return false;
    }
    match event {
        TradeEvent::OrderPlaced { .. } => config.on_order_placed,
        TradeEvent::OrderExpired { .. } => config.on_order_expired,
        TradeEvent::FilterSkip { .. } => config.on_filter_skip,
        TradeEvent::EngineError { .. } => config.on_error,
    }
}

async fn send_to_channel(
    http: &reqwest::Client,
    channel: &ChannelConfig,
    event: &TradeEvent,
) -> anyhow::Result<()> {
    match channel.kind.as_str() {
        "telegram" => {
            if channel.bot_token.is_empty() || channel.chat_id.is_empty() {
                anyhow::bail!("telegram channel missing bot_token or chat_id");
            }
            let url = format!("https://api.telegram.org/bot{}/sendMessage", channel.bot_token);
            let response = http
                .post(&url)
                .json(&serde_json::json!({
                    "chat_id": channel.chat_id,
                    "text": format!("{}\n{}", event.title(), event.body()),
                }))
                .send()
                .await?;
            anyhow::ensure!(
                response.status().is_success(),
                "telegram returned {}",
                response.status()
            );
        }
        "discord" => {
            if channel.webhook_url.is_empty() {
                anyhow::bail!("discord channel missing webhook_url");
            }
            let response = http
                .post(&channel.webhook_url)
                .json(&serde_json::json!({
                    "content": format!("**{}**\n{}", event.title(), event.body()),
                }))
                .send()
                .await?;
            anyhow::ensure!(
                response.status().is_success(),
                "discord returned {}",
                response.status()
            );
        }
        "email" => {
            if channel.to.is_empty() {
                anyhow::bail!("email channel missing recipient");
            }
            // System mail; the MTA handles delivery and retries.
            let mut child = tokio::process::Command::new("mail")
                .arg("-s")
                .arg(format!("[trade-relay] {}", event.title()))
                .arg(&channel.to)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()?;
            if let Some(stdin) = child.stdin.as_mut() {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(event.body().as_bytes()).await?;
            }
            let status = child.wait().await?;
            anyhow::ensure!(status.success(), "mail exited with {status}");
        }
        other => anyhow::bail!("unknown notification channel type: {other}"),
    }
    Ok(())
}
