//! Batch migration that writes derived margin fields onto stored strategies.

mod backfill;
mod config;

pub use backfill::MarginBackfill;
pub use config::BackfillConfig;
