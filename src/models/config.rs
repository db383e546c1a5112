//! Strategy configuration snapshot as stored by the platform.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Capital allocation and leverage preference declared by a strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskProfile {
    /// Base capital the strategy recommends, currency-agnostic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_capital: Option<Decimal>,

    /// Leverage multiplier; absent or non-positive means no leverage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<Decimal>,
}

impl RiskProfile {
    /// Leverage if it is strictly positive.
    pub fn usable_leverage(&self) -> Option<Decimal> {
        self.leverage.filter(|l| *l > Decimal::ZERO)
    }

    /// Recommended capital if it is strictly positive.
    pub fn usable_capital(&self) -> Option<Decimal> {
        self.recommended_capital.filter(|c| *c > Decimal::ZERO)
    }
}

/// One configuration snapshot of a trading strategy.
///
/// Only the fields that feed margin derivation are modeled; anything else in
/// the stored JSON is ignored on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    /// Traded pair, e.g. "B-BTC_USDT" for futures or "BTCINR" for spot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,

    /// Older snapshots name the instrument here instead of `pair`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_profile: Option<RiskProfile>,
}

impl StrategyConfig {
    /// Instrument identifier, preferring `pair` over `instrument`.
    ///
    /// Empty strings count as unset. Returns an empty string when neither
    /// field carries an identifier.
    pub fn instrument_id(&self) -> &str {
        self.pair
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.instrument.as_deref().filter(|i| !i.is_empty()))
            .unwrap_or("")
    }

    /// Parse a snapshot from its stored JSON form.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
