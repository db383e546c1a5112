//! Data-access interface used by the margin backfill.

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{MarginResult, Strategy, StrategyConfig};

/// Failures a repository reports in a form callers can match on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The strategy does not exist (or no longer exists) in the store.
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),
}

impl RepositoryError {
    /// True when `err` was caused by a missing strategy.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::StrategyNotFound(_))
        )
    }
}

/// Read and write access to stored strategies.
///
/// The backfill only depends on this trait, so it can run against the
/// sqlite store or any other source of strategy records.
#[async_trait]
pub trait StrategyRepository: Send + Sync {
    /// All strategies, oldest first.
    async fn list_all(&self) -> Result<Vec<Strategy>>;

    /// Most recent configuration snapshot of a strategy, if it has one.
    async fn latest_config(&self, strategy_id: &str) -> Result<Option<StrategyConfig>>;

    /// Write derived margin fields back onto a strategy.
    ///
    /// Fails with [`RepositoryError::StrategyNotFound`] when the strategy is gone.
    async fn update_margin_fields(&self, strategy_id: &str, result: &MarginResult) -> Result<()>;
}
