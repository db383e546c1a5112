//! Margin classification and derived margin fields.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;

/// Identifier prefix used by futures contracts.
pub const FUTURES_PREFIX: &str = "B-";

/// Whether an instrument is settled spot or as a leveraged futures contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Spot,
    Futures,
}

impl InstrumentKind {
    /// Classify an instrument from its identifier.
    pub fn classify(instrument_id: &str) -> Self {
        if instrument_id.starts_with(FUTURES_PREFIX) {
            Self::Futures
        } else {
            Self::Spot
        }
    }

    /// Currency margin is posted in for this kind of instrument.
    pub fn margin_currency(&self) -> MarginCurrency {
        match self {
            InstrumentKind::Spot => MarginCurrency::Inr,
            InstrumentKind::Futures => MarginCurrency::Usdt,
        }
    }
}

/// Currency a margin requirement is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginCurrency {
    Inr,
    Usdt,
}

impl MarginCurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginCurrency::Inr => "INR",
            MarginCurrency::Usdt => "USDT",
        }
    }
}

impl fmt::Display for MarginCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarginCurrency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INR" => Ok(Self::Inr),
            "USDT" => Ok(Self::Usdt),
            other => anyhow::bail!("Unknown margin currency: {}", other),
        }
    }
}

/// Margin fields derived from a strategy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginResult {
    /// Required margin; `None` when the configuration carries no capital
    pub margin_required: Option<Decimal>,

    pub margin_currency: MarginCurrency,
}

impl MarginResult {
    /// True when there is a margin amount worth persisting.
    pub fn is_set(&self) -> bool {
        self.margin_required.is_some()
    }
}

impl fmt::Display for MarginResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.margin_required {
            Some(margin) => write!(f, "{} {}", margin.normalize(), self.margin_currency),
            None => write!(f, "unset ({})", self.margin_currency),
        }
    }
}
