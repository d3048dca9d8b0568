// =============================================================================
// Candle Calculator — chart-aligned bar counting for order expiry
// =============================================================================
//
// Pending orders expire after a number of *closed* bars on the signal's
// timeframe, matching the bar count the external chart displays. Bars are
// anchored to a per-symbol phase offset from the Unix epoch, and only bars
// whose start falls inside the instrument's trading session count.
//
// Session models:
//   24x7 — crypto, always open.
//   24x5 — forex/metals/indices, closed Friday 22:00 UTC to Sunday 22:00 UTC.
//   RTH  — US equities, weekdays 14:30-21:00 UTC only.
// =============================================================================

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Hard cap on bar iteration per count, protects against clock skew feeding
/// an absurd creation time into the loop.
const MAX_BAR_ITERATIONS: i64 = 1000;

/// Trading-session model for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionModel {
    #[serde(rename = "24x7")]
    TwentyFourSeven,
    #[serde(rename = "24x5")]
    TwentyFourFive,
    #[serde(rename = "RTH")]
    Rth,
}

impl std::fmt::Display for SessionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TwentyFourSeven => write!(f, "24x7"),
            Self::TwentyFourFive => write!(f, "24x5"),
            Self::Rth => write!(f, "RTH"),
        }
    }
}

/// Phase offset and session model for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleParams {
    /// Offset in minutes between the Unix epoch and the canonical bar
    /// boundary for this symbol.
    pub phase_minutes: i64,
    pub session: SessionModel,
}

/// Guess candle parameters from the symbol name when the instrument catalog
/// has no explicit entry. Crypto anchors at 0, US equities at 150, everything
/// else (forex, metals, indices) at -120.
pub fn detect_params(symbol: &str) -> CandleParams {
    let upper = symbol.to_uppercase();

    const CRYPTO: &[&str] = &["BTC", "ETH", "SOL", "BNB", "LTC", "XRP", "ADA", "DOGE"];
    if CRYPTO.iter().any(|c| upper.contains(c)) {
        return CandleParams {
            phase_minutes: 0,
            session: SessionModel::TwentyFourSeven,
        };
    }

    const US_STOCKS: &[&str] = &["AAPL", "MSFT", "NVDA", "TSLA", "AMZN", "GOOGL", "JPM", "V."];
    if US_STOCKS.iter().any(|s| upper.contains(s)) {
        return CandleParams {
            phase_minutes: 150,
            session: SessionModel::Rth,
        };
    }

    CandleParams {
        phase_minutes: -120,
        session: SessionModel::TwentyFourFive,
    }
}

/// Bar index of a UTC instant: floor((unix_minutes - phase) / bar_minutes).
pub fn bar_index(t: DateTime<Utc>, phase_minutes: i64, bar_minutes: i64) -> i64 {
    let unix_minutes = t.timestamp().div_euclid(60);
    (unix_minutes - phase_minutes).div_euclid(bar_minutes)
}

/// Start instant of a bar index.
pub fn bar_start(index: i64, phase_minutes: i64, bar_minutes: i64) -> DateTime<Utc> {
    let minutes = index * bar_minutes + phase_minutes;
    Utc.timestamp_opt(minutes * 60, 0).unwrap()
}

/// Whether the market trades at instant `t` under the given session model.
pub fn is_market_open(t: DateTime<Utc>, session: SessionModel) -> bool {
    match session {
        SessionModel::TwentyFourSeven => true,
        SessionModel::TwentyFourFive => {
            let weekday = t.weekday();
            let hour = t.hour();
            if weekday == Weekday::Fri && hour >= 22 {
                return false;
            }
            if weekday == Weekday::Sat {
                return false;
            }
            if weekday == Weekday::Sun && hour < 22 {
                return false;
            }
            true
        }
        SessionModel::Rth => {
            let weekday = t.weekday();
            if weekday == Weekday::Sat || weekday == Weekday::Sun {
                return false;
            }
            // 14:30 to 21:00 UTC inclusive.
            let minutes_of_day = t.hour() * 60 + t.minute();
            (870..=1260).contains(&minutes_of_day)
        }
    }
}

/// Count closed bars between `created` and `now`.
///
/// For 24x7 this is a plain index difference. For 24x5/RTH only bars whose
/// start instant falls inside the trading session count, so a weekend
/// contributes nothing on a forex chart.
pub fn count_closed_bars(
    created: DateTime<Utc>,
    now: DateTime<Utc>,
    params: CandleParams,
    bar_minutes: i64,
) -> u32 {
    let created_idx = bar_index(created, params.phase_minutes, bar_minutes);
    let now_idx = bar_index(now, params.phase_minutes, bar_minutes);

    if params.session == SessionModel::TwentyFourSeven {
        return (now_idx - created_idx).max(0) as u32;
    }

    let mut closed = 0u32;
    let mut idx = created_idx;
    while idx < now_idx {
        let start = bar_start(idx, params.phase_minutes, bar_minutes);
        if is_market_open(start, params.session) {
            closed += 1;
        }
        idx += 1;
        if idx > created_idx + MAX_BAR_ITERATIONS {
            break;
        }
    }
    closed
}

/// Instant at which an order created at `created` reaches `timeout_bars`
/// closed bars. Used for operator-facing display only.
pub fn timeout_instant(
    created: DateTime<Utc>,
    timeout_bars: u32,
    params: CandleParams,
    bar_minutes: i64,
) -> DateTime<Utc> {
    let created_idx = bar_index(created, params.phase_minutes, bar_minutes);

    if params.session == SessionModel::TwentyFourSeven {
        return bar_start(created_idx + timeout_bars as i64, params.phase_minutes, bar_minutes);
    }

    let mut idx = created_idx;
    let mut counted = 0u32;
    while counted < timeout_bars {
        let start = bar_start(idx, params.phase_minutes, bar_minutes);
        if is_market_open(start, params.session) {
            counted += 1;
        }
        idx += 1;
        if idx > created_idx + MAX_BAR_ITERATIONS {
            break;
        }
    }
    bar_start(idx, params.phase_minutes, bar_minutes)
}
