//! Calculator for strategy margin requirements.

use rust_decimal::Decimal;

use crate::models::{InstrumentKind, MarginResult, RiskProfile, StrategyConfig};

/// Calculator deriving margin fields from a strategy configuration.
pub struct MarginCalculator;

impl MarginCalculator {
    /// Derive required margin and its currency for a configuration.
    ///
    /// Currency comes only from the instrument identifier: a `B-` prefix
    /// marks a futures contract margined in USDT, anything else (including a
    /// missing identifier) is spot margined in INR. The amount comes from the
    /// risk profile and is left unset when there is no capital to work from.
    pub fn calculate(config: &StrategyConfig) -> MarginResult {
        let kind = InstrumentKind::classify(config.instrument_id());

        MarginResult {
            margin_required: config
                .risk_profile
                .as_ref()
                .and_then(|risk| Self::margin_amount(risk, kind)),
            margin_currency: kind.margin_currency(),
        }
    }

    /// Margin amount for a risk profile.
    ///
    /// Only futures with leverage above 1 reduce the requirement; leverage of
    /// exactly 1 leaves the full capital in place.
    fn margin_amount(risk: &RiskProfile, kind: InstrumentKind) -> Option<Decimal> {
        let capital = risk.usable_capital()?;

        match risk.usable_leverage() {
            Some(leverage) if kind == InstrumentKind::Futures && leverage > Decimal::ONE => {
                Some(capital / leverage)
            }
            _ => Some(capital),
        }
    }
}
