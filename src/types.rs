// =============================================================================
// Shared types used across the trade relay engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction as expressed by the charting platform.
///
/// Incoming alerts say LONG/SHORT (or BUY/SELL); brokers think in BUY/SELL.
/// Everything is normalised to this enum at the intake boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Parse any of the accepted spellings (LONG/BUY, SHORT/SELL).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Self::Long),
            "SHORT" | "SELL" => Some(Self::Short),
            _ => None,
        }
    }

    /// Broker-facing side string.
    pub fn as_broker_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Order type requested by the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }
}

impl Default for OrderKind {
    fn default() -> Self {
        Self::Limit
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}
