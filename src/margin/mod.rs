//! Margin derivation for strategy configurations.

mod calculator;

pub use calculator::MarginCalculator;
