// =============================================================================
// Instrument Catalog — canonical symbol to broker handle and spec lookups
// =============================================================================
//
// Read-only mapping built from the `[instruments]` config section at startup.
// A symbol that does not resolve for a given account is not fatal; the
// dispatcher skips that account.
// =============================================================================

use std::collections::HashMap;

use crate::candles::{self, CandleParams, SessionModel};
use crate::config::AppConfig;

/// Sizing-relevant properties of one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    pub pip_size: f64,
    /// Static pip value per lot in account currency. When absent the sizer
    /// derives one dynamically.
    pub pip_value_per_lot: Option<f64>,
    pub contract_size: f64,
    pub quote_currency: Option<String>,
    pub phase_minutes: i64,
    pub session: SessionModel,
}

struct CatalogEntry {
    spec: InstrumentSpec,
    /// broker id -> broker-specific symbol handle.
    handles: HashMap<String, String>,
}

/// Immutable symbol catalog shared by the dispatcher and the reaper.
pub struct InstrumentCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl InstrumentCatalog {
    /// Build the catalog from the configuration tree.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut entries = HashMap::new();
        for (symbol, inst) in &config.instruments {
            let detected = candles::detect_params(symbol);
            let spec = InstrumentSpec {
                pip_size: inst.pip_size,
                pip_value_per_lot: inst.pip_value_per_lot,
                contract_size: inst.contract_size,
                quote_currency: inst.quote_currency.clone(),
                phase_minutes: inst.candle_phase_minutes.unwrap_or(detected.phase_minutes),
                session: inst.session_model.unwrap_or(detected.session),
            };
            entries.insert(
                symbol.to_uppercase(),
                CatalogEntry {
                    spec,
                    handles: inst
                        .brokers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                },
            );
        }
        Self { entries }
    }

    /// Broker-specific handle for `symbol` on `broker_id`, if mapped.
    pub fn resolve(&self, symbol: &str, broker_id: &str) -> Option<&str> {
        self.entries
            .get(&symbol.to_uppercase())
            .and_then(|e| e.handles.get(broker_id))
            .map(String::as_str)
    }

    /// Canonical symbol for a broker-specific handle, if any entry maps to it.
    pub fn reverse(&self, broker_id: &str, handle: &str) -> Option<&str> {
        self.entries.iter().find_map(|(symbol, entry)| {
            (entry.handles.get(broker_id).map(String::as_str) == Some(handle))
                .then_some(symbol.as_str())
        })
    }

    /// Sizing spec for a canonical symbol.
    pub fn spec(&self, symbol: &str) -> Option<&InstrumentSpec> {
        self.entries.get(&symbol.to_uppercase()).map(|e| &e.spec)
    }

    /// Candle parameters for expiry counting. Falls back to symbol-class
    /// auto-detection for instruments the catalog does not know.
    pub fn candle_params(&self, symbol: &str) -> CandleParams {
        match self.spec(symbol) {
            Some(spec) => CandleParams {
                phase_minutes: spec.phase_minutes,
                session: spec.session,
            },
            None => candles::detect_params(symbol),
        }
    }

    /// Per-broker mapping (canonical -> handle) used by adapters for reverse
    /// symbol reporting.
    pub fn broker_mapping(&self, broker_id: &str) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(symbol, entry)| {
                entry
                    .handles
                    .get(broker_id)
                    .map(|h| (symbol.clone(), h.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> InstrumentCatalog {
        let config = AppConfig::from_toml(
            r#"
[instruments.EURUSD]
pip_size = 0.0001
pip_value_per_lot = 10.0
quote_currency = "USD"

[instruments.EURUSD.brokers]
ic_demo = "1"
gft_1 = "EURUSD.X"

[instruments.USDJPY]
pip_size = 0.01
quote_currency = "JPY"
candle_phase_minutes = -60
session_model = "24x5"

[instruments.BTCUSD]
pip_size = 1.0
contract_size = 1.0
"#,
        )
        .unwrap();
        InstrumentCatalog::from_config(&config)
    }

    #[test]
    fn resolve_and_reverse() {
        let cat = catalog();
        assert_eq!(cat.resolve("EURUSD", "ic_demo"), Some("1"));
        assert_eq!(cat.resolve("eurusd", "gft_1"), Some("EURUSD.X"));
        assert_eq!(cat.resolve("EURUSD", "unknown"), None);
        assert_eq!(cat.resolve("GBPUSD", "ic_demo"), None);
        assert_eq!(cat.reverse("gft_1", "EURUSD.X"), Some("EURUSD"));
        assert_eq!(cat.reverse("gft_1", "XAUUSD.X"), None);
    }

    #[test]
    fn spec_lookup() {
        let cat = catalog();
        let spec = cat.spec("USDJPY").unwrap();
        assert_eq!(spec.pip_size, 0.01);
        assert_eq!(spec.quote_currency.as_deref(), Some("JPY"));
        assert_eq!(spec.contract_size, 100_000.0);
        assert!(cat.spec("GBPUSD").is_none());
    }

    #[test]
    fn candle_params_config_beats_detection() {
        let cat = catalog();
        // Explicit override wins.
        assert_eq!(cat.candle_params("USDJPY").phase_minutes, -60);
        // No override: forex defaults.
        assert_eq!(cat.candle_params("EURUSD").phase_minutes, -120);
        // BTCUSD detected as crypto even though phase not configured.
        assert_eq!(
            cat.candle_params("BTCUSD").session,
            SessionModel::TwentyFourSeven
        );
        // Unknown symbol falls back to detection entirely.
        assert_eq!(
            cat.candle_params("AAPL").session,
            SessionModel::Rth
        );
    }

    #[test]
    fn broker_mapping_subset() {
        let cat = catalog();
        let mapping = cat.broker_mapping("gft_1");
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping["EURUSD"], "EURUSD.X");
    }
}
