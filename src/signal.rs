// =============================================================================
// Signal — trade intent received from the charting platform
// =============================================================================
//
// Webhook payloads arrive either as JSON or as a free-text alert message.
// Both shapes normalise into `Signal`. Field aliases cover the spellings the
// charting platform has used over time, including the French alert templates.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::types::{OrderKind, Side};

/// Validation or parse failure on an incoming signal. Reported to the caller
/// as a client error; nothing is enqueued.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SignalError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unrecognised side: {0}")]
    InvalidSide(String),

    #[error("{0} must be a non-zero price")]
    InvalidPrice(&'static str),

    #[error("{0}")]
    InvalidLevels(String),

    #[error("could not parse alert text: {0}")]
    Unparseable(String),
}

/// Immutable trade intent. Built once at intake, dropped after dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub validity_bars: u32,
    pub timeframe_minutes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    /// Explicit target accounts; all enabled accounts when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brokers: Option<Vec<String>>,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    // -------------------------------------------------------------------------
    // JSON intake
    // -------------------------------------------------------------------------

    /// Build a signal from a JSON payload, accepting the documented field
    /// aliases (entry/entry_price/price, sl/stop_loss, tp/take_profit, ...).
    pub fn from_json(data: &Value) -> Result<Self, SignalError> {
        let symbol = data
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or(SignalError::MissingField("symbol"))?;

        let side_raw = data
            .get("side")
            .or_else(|| data.get("action"))
            .and_then(Value::as_str)
            .ok_or(SignalError::MissingField("side"))?;
        let side =
            Side::parse(side_raw).ok_or_else(|| SignalError::InvalidSide(side_raw.to_string()))?;

        let entry_price = number_field(data, &["entry", "entry_price", "price"])
            .ok_or(SignalError::MissingField("entry"))?;
        let stop_loss =
            number_field(data, &["sl", "stop_loss"]).ok_or(SignalError::MissingField("sl"))?;
        let take_profit =
            number_field(data, &["tp", "take_profit"]).ok_or(SignalError::MissingField("tp"))?;

        let order_type = data
            .get("order_type")
            .and_then(Value::as_str)
            .and_then(OrderKind::parse)
            .unwrap_or_default();

        let validity_bars = number_field(data, &["validity_bars", "validBars"])
            .map(|v| v as u32)
            .filter(|v| *v > 0)
            .unwrap_or(1);

        let timeframe_minutes = data
            .get("timeframe")
            .map(parse_timeframe)
            .unwrap_or(240);

        let atr = number_field(data, &["atr"]).filter(|v| *v > 0.0);

        let brokers = data.get("brokers").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        let signal = Self {
            symbol,
            side,
            order_type,
            entry_price,
            stop_loss,
            take_profit,
            validity_bars,
            timeframe_minutes,
            atr,
            brokers: brokers.filter(|b| !b.is_empty()),
            received_at: Utc::now(),
        };
        signal.validate()?;
        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Free-text intake
    // -------------------------------------------------------------------------

    /// Parse a plain-text alert.
    ///
    /// Shape: a header line with a LONG/SHORT token (or colored-dot marker)
    /// followed by the symbol, then `key: value` lines for entry, SL, TP,
    /// ATR and validity. Unknown keys are ignored. Both English and French
    /// key spellings are accepted, as is the comma decimal separator.
    pub fn from_text(text: &str) -> Result<Self, SignalError> {
        let mut side: Option<Side> = None;
        let mut symbol: Option<String> = None;
        let mut entry: Option<f64> = None;
        let mut sl: Option<f64> = None;
        let mut tp: Option<f64> = None;
        let mut atr: Option<f64> = None;
        let mut validity_bars: u32 = 1;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if side.is_none() {
                if let Some((found_side, found_symbol)) = parse_header_line(line) {
                    side = Some(found_side);
                    symbol = found_symbol;
                    continue;
                }
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = normalize_key(key);
            let value = value.trim();

            match key.as_str() {
                "entry" | "entree" | "prix" | "prix d'entree" => entry = parse_number(value),
                "sl" | "stop" | "stop loss" | "stop-loss" => sl = parse_number(value),
                "tp" | "target" | "take profit" | "objectif" => tp = parse_number(value),
                "atr" => atr = parse_number(value),
                "validity" | "validity bars" | "validite" | "valid bars" | "bougies" => {
                    if let Some(v) = parse_number(value) {
                        if v >= 1.0 {
                            validity_bars = v as u32;
                        }
                    }
                }
                _ => {}
            }
        }

        let side = side.ok_or_else(|| {
            SignalError::Unparseable("no LONG/SHORT marker found".to_string())
        })?;
        let symbol = symbol
            .filter(|s| !s.is_empty())
            .ok_or(SignalError::MissingField("symbol"))?;

        let signal = Self {
            symbol,
            side,
            order_type: OrderKind::default(),
            entry_price: entry.ok_or(SignalError::MissingField("entry"))?,
            stop_loss: sl.ok_or(SignalError::MissingField("sl"))?,
            take_profit: tp.ok_or(SignalError::MissingField("tp"))?,
            validity_bars,
            timeframe_minutes: 240,
            atr,
            brokers: None,
            received_at: Utc::now(),
        };
        signal.validate()?;
        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Enforce the price-level invariants. A violation is a client error,
    /// never silently fixed.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.entry_price == 0.0 {
            return Err(SignalError::InvalidPrice("entry"));
        }
        if self.stop_loss == 0.0 {
            return Err(SignalError::InvalidPrice("sl"));
        }
        if self.take_profit == 0.0 {
            return Err(SignalError::InvalidPrice("tp"));
        }

        match self.side {
            Side::Long => {
                if self.stop_loss >= self.entry_price {
                    return Err(SignalError::InvalidLevels(format!(
                        "LONG requires SL ({}) below entry ({})",
                        self.stop_loss, self.entry_price
                    )));
                }
                if self.take_profit <= self.entry_price {
                    return Err(SignalError::InvalidLevels(format!(
                        "LONG requires TP ({}) above entry ({})",
                        self.take_profit, self.entry_price
                    )));
                }
            }
            Side::Short => {
                if self.stop_loss <= self.entry_price {
                    return Err(SignalError::InvalidLevels(format!(
                        "SHORT requires SL ({}) above entry ({})",
                        self.stop_loss, self.entry_price
                    )));
                }
                if self.take_profit >= self.entry_price {
                    return Err(SignalError::InvalidLevels(format!(
                        "SHORT requires TP ({}) below entry ({})",
                        self.take_profit, self.entry_price
                    )));
                }
            }
        }
        Ok(())
    }

    /// Broker-native expiry hint: now + validity window. Only adapters whose
    /// broker supports native expiry consume it.
    pub fn expiry_timestamp_ms(&self) -> i64 {
        let window_ms = self.validity_bars as i64 * self.timeframe_minutes as i64 * 60_000;
        self.received_at.timestamp_millis() + window_ms
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// Numeric field that may arrive as a JSON number or a numeric string.
fn number_field(data: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = data.get(*key) {
            if let Some(n) = v.as_f64() {
                return Some(n);
            }
            if let Some(s) = v.as_str() {
                if let Some(n) = parse_number(s) {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Timeframe as minutes. Accepts bare minutes ("240"), chart shorthand
/// ("H4", "M15", "D") or a JSON number.
fn parse_timeframe(value: &Value) -> u32 {
    if let Some(n) = value.as_u64() {
        return if n > 0 { n as u32 } else { 240 };
    }
    let Some(s) = value.as_str() else {
        return 240;
    };
    let s = s.trim().to_uppercase();
    if let Ok(n) = s.parse::<u32>() {
        return if n > 0 { n } else { 240 };
    }
    match s.as_str() {
        "M1" => 1,
        "M5" => 5,
        "M15" => 15,
        "M30" => 30,
        "H1" => 60,
        "H2" => 120,
        "H4" => 240,
        "H8" => 480,
        "H12" => 720,
        "D" | "D1" | "1D" => 1440,
        "W" | "W1" | "1W" => 10_080,
        _ => 240,
    }
}

/// Number with either '.' or ',' as decimal separator, ignoring trailing
/// junk like units.
fn parse_number(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .replace(',', ".")
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    cleaned.parse().ok()
}

/// Recognise the alert header: a side token (word or colored dot) followed by
/// the symbol, possibly wrapped in parentheses.
fn parse_header_line(line: &str) -> Option<(Side, Option<String>)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        let side = match *token {
            "🟢" => Some(Side::Long),
            "🔴" => Some(Side::Short),
            _ => Side::parse(token),
        };
        let Some(side) = side else { continue };

        // Symbol is the next token that looks like an instrument name,
        // stripped of surrounding parentheses. A second side token (e.g. the
        // word after a dot marker) is not a symbol.
        let symbol = tokens[i + 1..].iter().find_map(|t| {
            if Side::parse(t).is_some() || matches!(*t, "🟢" | "🔴") {
                return None;
            }
            let stripped: String = t
                .chars()
                .filter(|c| !matches!(*c, '(' | ')' | '[' | ']'))
                .collect();
            let upper = stripped.to_uppercase();
            (upper.len() >= 3
                && upper
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '/'))
            .then_some(upper)
        });

        return Some((side, symbol));
    }
    None
}

/// Lowercase a key and strip accents the alert templates use.
fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'é' | 'è' | 'ê' => 'e',
            'à' | 'â' => 'a',
            'î' => 'i',
            'ô' => 'o',
            'û' | 'ù' => 'u',
            _ => c,
        })
        .collect()
}
