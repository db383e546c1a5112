//! Data models for strategies, their configurations, and margin fields.

mod config;
mod margin;
mod strategy;

pub use config::{RiskProfile, StrategyConfig};
pub use margin::{InstrumentKind, MarginCurrency, MarginResult};
pub use strategy::Strategy;
