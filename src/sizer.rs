// =============================================================================
// Position Sizer — risk-based lot computation
// =============================================================================
//
//   lots = (account_value × risk% / 100) / (sl_pips × pip_value_per_lot)
//
// The pip value per standard lot comes from the instrument config when set.
// Otherwise it is derived dynamically, which is reliable for USD-quoted pairs
// and a rough proxy for everything else. A table of conservative defaults per
// quote currency backstops the derivation: when the derived value strays more
// than 50% from the table entry, the table wins. An incorrect price proxy on
// an exotic cross must never produce an oversized position.
// =============================================================================

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::InstrumentSpec;

/// Relative deviation from the table default at which the derived pip value
/// is discarded.
const SANITY_GATE_MAX_DEVIATION: f64 = 0.50;

/// Conservative pip-value-per-lot defaults (USD account currency) keyed by
/// quote currency. JPY assumes the conventional 0.01 pip size, hence the
/// larger figure.
const DEFAULT_PIP_VALUES: &[(&str, f64)] = &[
    ("USD", 10.0),
    ("EUR", 11.0),
    ("GBP", 12.7),
    ("JPY", 6.5),
    ("CHF", 11.3),
    ("CAD", 7.3),
    ("AUD", 6.6),
    ("NZD", 6.0),
    ("ZAR", 0.55),
    ("MXN", 0.53),
    ("TRY", 0.30),
    ("SEK", 0.95),
    ("NOK", 0.95),
    ("PLN", 2.5),
    ("HUF", 0.028),
    ("CZK", 0.43),
    ("SGD", 7.4),
    ("HKD", 1.28),
];

/// Lot-size limits for one instrument on one account.
#[derive(Debug, Clone, Copy)]
pub struct LotLimits {
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
}

impl Default for LotLimits {
    fn default() -> Self {
        Self {
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
        }
    }
}

/// Result of a position-size calculation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSize {
    /// Lots after rounding and clamping. Zero means the inputs were
    /// degenerate; `details` says why.
    pub lots: f64,
    /// Risk actually taken with the rounded lot count, in account currency.
    pub risk_amount: f64,
    /// Pip value per lot used in the computation.
    pub pip_value_per_lot: f64,
    /// Stop-loss distance in pips.
    pub sl_pips: f64,
    /// Human-readable breakdown for logs and notifications.
    pub details: String,
}

impl PositionSize {
    fn degenerate(risk_amount: f64, sl_pips: f64, details: impl Into<String>) -> Self {
        Self {
            lots: 0.0,
            risk_amount,
            pip_value_per_lot: 0.0,
            sl_pips,
            details: details.into(),
        }
    }
}

/// Risk-based sizer for one instrument.
pub struct PositionSizer<'a> {
    spec: &'a InstrumentSpec,
}

impl<'a> PositionSizer<'a> {
    pub fn new(spec: &'a InstrumentSpec) -> Self {
        Self { spec }
    }

    /// Compute the lot size for a trade.
    ///
    /// `current_price` feeds the dynamic pip-value proxy for USD-base pairs;
    /// `quote_to_account_rate` short-circuits the proxy with an exact
    /// conversion when the caller has one.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        &self,
        symbol: &str,
        account_value: f64,
        risk_percent: f64,
        entry_price: f64,
        sl_price: f64,
        current_price: Option<f64>,
        quote_to_account_rate: Option<f64>,
        limits: LotLimits,
    ) -> PositionSize {
        let risk_amount = account_value * (risk_percent / 100.0);

        let sl_distance = (entry_price - sl_price).abs();
        let sl_pips = sl_distance / self.spec.pip_size;

        if sl_pips == 0.0 {
            return PositionSize::degenerate(
                risk_amount,
                0.0,
                "stop-loss distance is zero, cannot size position",
            );
        }

        let pip_value = self.pip_value_per_lot(symbol, current_price, quote_to_account_rate);
        if pip_value <= 0.0 {
            return PositionSize::degenerate(
                risk_amount,
                sl_pips,
                "could not determine pip value per lot",
            );
        }

        let raw_lots = risk_amount / (sl_pips * pip_value);

        // Round to the nearest lot step, then clamp. Clamping up to min_lot
        // deliberately exceeds the risk target; callers see that in
        // `risk_amount`.
        let step = if limits.lot_step > 0.0 { limits.lot_step } else { 0.01 };
        let mut lots = (raw_lots / step).round() * step;
        lots = lots.clamp(limits.min_lot, limits.max_lot);
        // Cut float noise from the step division.
        lots = (lots * 1_000_000.0).round() / 1_000_000.0;

        let actual_risk = lots * sl_pips * pip_value;

        let details = format!(
            "account {account_value:.2} | risk {risk_percent}% = {risk_amount:.2} | \
             sl {sl_pips:.1} pips | pip value/lot {pip_value:.2} | \
             raw {raw_lots:.4} -> {lots:.2} lots | actual risk {actual_risk:.2}"
        );
        debug!(symbol, %details, "position sized");

        PositionSize {
            lots,
            risk_amount: actual_risk,
            pip_value_per_lot: pip_value,
            sl_pips,
            details,
        }
    }

    // -------------------------------------------------------------------------
    // Pip-value derivation
    // -------------------------------------------------------------------------

    /// Pip value per standard lot in account currency.
    ///
    /// Order of preference: static config value, exact conversion rate,
    /// price proxy for USD-base pairs, contract-size base. The result is then
    /// run through the sanity gate.
    fn pip_value_per_lot(
        &self,
        symbol: &str,
        current_price: Option<f64>,
        quote_to_account_rate: Option<f64>,
    ) -> f64 {
        if let Some(v) = self.spec.pip_value_per_lot {
            return v;
        }

        let base = self.spec.contract_size * self.spec.pip_size;

        let quote = match self.spec.quote_currency.as_deref() {
            // Unspecified or account-currency quote: the base value is exact.
            None | Some("USD") => return base,
            Some(q) => q,
        };

        let derived = if let Some(rate) = quote_to_account_rate {
            base * rate
        } else if let Some(price) = current_price.filter(|p| *p > 1.0) {
            // USD/XXX proxy: P&L accrues in the quote currency, divide by the
            // pair price to convert back. Known-lossy for crosses.
            base / price
        } else {
            base
        };

        self.sanity_gate(symbol, quote, derived)
    }

    /// Clamp a derived pip value to the conservative table default when it
    /// deviates by more than 50%.
    fn sanity_gate(&self, symbol: &str, quote_currency: &str, derived: f64) -> f64 {
        let default = DEFAULT_PIP_VALUES
            .iter()
            .find(|(c, _)| *c == quote_currency)
            .map(|(_, v)| *v);

        let Some(mut default) = default else {
            return derived;
        };

        // The table assumes the conventional pip size per currency; rescale
        // for instruments configured with a non-standard one (JPY entries
        // already assume 0.01).
        let conventional = if quote_currency == "JPY" { 0.01 } else { 0.0001 };
        if self.spec.pip_size != conventional && conventional > 0.0 {
            default *= self.spec.pip_size / conventional;
        }

        let deviation = (derived - default).abs() / default;
        if deviation > SANITY_GATE_MAX_DEVIATION {
            warn!(
                symbol,
                quote_currency,
                derived,
                default,
                deviation_pct = deviation * 100.0,
                "derived pip value failed sanity gate, using table default"
            );
            return default;
        }
        derived
    }
}
