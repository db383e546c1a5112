//! Margin backfill: derives margin fields for every stored strategy.
//!
//! For each strategy the latest configuration snapshot is run through the
//! margin calculator and the result is written back when a margin amount
//! could be derived. Per-record failures are logged and counted; only a
//! failure to enumerate strategies aborts the run.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use tracing::{debug, error, info, warn};

use crate::db::{RepositoryError, StrategyRepository};
use crate::margin::MarginCalculator;
use crate::models::{MarginResult, Strategy};

use super::BackfillConfig;

/// Why a strategy was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Both margin fields were already present and only missing ones were requested
    AlreadySet,
    /// The strategy has no configuration snapshot
    NoConfig,
    /// The latest snapshot carries no capital to derive a margin from
    NoMargin,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::AlreadySet => "margin already set",
            SkipReason::NoConfig => "no configuration",
            SkipReason::NoMargin => "no margin derivable",
        };
        f.write_str(s)
    }
}

/// Result of processing a single strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Updated(MarginResult),
    Skipped(SkipReason),
    Failed(String),
}

/// A strategy that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub strategy_id: String,
    pub error: String,
}

/// Summary of a backfill run.
#[derive(Debug, Clone, Default)]
pub struct BackfillReport {
    pub total: usize,
    pub updated: usize,
    pub skipped_already_set: usize,
    pub skipped_no_config: usize,
    pub skipped_no_margin: usize,
    pub failures: Vec<RecordFailure>,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl BackfillReport {
    /// Count an outcome for a strategy.
    pub fn record(&mut self, strategy_id: &str, outcome: &RecordOutcome) {
        self.total += 1;
        match outcome {
            RecordOutcome::Updated(_) => self.updated += 1,
            RecordOutcome::Skipped(SkipReason::AlreadySet) => self.skipped_already_set += 1,
            RecordOutcome::Skipped(SkipReason::NoConfig) => self.skipped_no_config += 1,
            RecordOutcome::Skipped(SkipReason::NoMargin) => self.skipped_no_margin += 1,
            RecordOutcome::Failed(error) => self.failures.push(RecordFailure {
                strategy_id: strategy_id.to_string(),
                error: error.clone(),
            }),
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_already_set + self.skipped_no_config + self.skipped_no_margin
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// True when every strategy was either updated or skipped.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Margin Backfill ===")?;
        writeln!(f, "Strategies:      {}", self.total)?;
        writeln!(
            f,
            "Updated:         {}{}",
            self.updated,
            if self.dry_run { " (dry run, nothing written)" } else { "" }
        )?;
        writeln!(f, "Skipped:         {}", self.skipped())?;
        writeln!(f, "  No config:     {}", self.skipped_no_config)?;
        writeln!(f, "  No margin:     {}", self.skipped_no_margin)?;
        writeln!(f, "  Already set:   {}", self.skipped_already_set)?;
        writeln!(f, "Failed:          {}", self.failed())?;
        for failure in &self.failures {
            writeln!(f, "  {}: {}", failure.strategy_id, failure.error)?;
        }
        writeln!(f, "Elapsed:         {:.2}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Status:          {}",
            if self.is_success() { "Success" } else { "Completed with failures" }
        )?;
        Ok(())
    }
}

/// Batch process applying the margin calculator to every stored strategy.
pub struct MarginBackfill<R> {
    repo: R,
    config: BackfillConfig,
}

impl<R: StrategyRepository> MarginBackfill<R> {
    /// Create a new backfill over a repository.
    pub fn new(repo: R, config: BackfillConfig) -> Self {
        Self { repo, config }
    }

    /// The repository this backfill reads from and writes to.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Process every strategy in sequence and summarize the outcomes.
    pub async fn run(&self) -> Result<BackfillReport> {
        let started = Instant::now();
        let strategies = self
            .repo
            .list_all()
            .await
            .context("Failed to enumerate strategies")?;

        info!(
            strategies = strategies.len(),
            dry_run = self.config.dry_run,
            only_missing = self.config.only_missing,
            "Starting margin backfill"
        );

        let mut report = BackfillReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };

        for strategy in &strategies {
            let outcome = self.process(strategy).await;
            report.record(&strategy.id, &outcome);
        }

        report.elapsed = started.elapsed();

        info!(
            total = report.total,
            updated = report.updated,
            skipped = report.skipped(),
            failed = report.failed(),
            "Margin backfill finished"
        );

        Ok(report)
    }

    /// Derive and persist margin fields for one strategy.
    pub async fn process(&self, strategy: &Strategy) -> RecordOutcome {
        if self.config.only_missing && strategy.has_margin() {
            debug!(strategy = %strategy.id, "Margin already set, skipping");
            return RecordOutcome::Skipped(SkipReason::AlreadySet);
        }

        let config = match self.repo.latest_config(&strategy.id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(strategy = %strategy.id, "No configuration snapshot, skipping");
                return RecordOutcome::Skipped(SkipReason::NoConfig);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(strategy = %strategy.id, error = %message, "Failed to load configuration");
                return RecordOutcome::Failed(message);
            }
        };

        let result = MarginCalculator::calculate(&config);
        if !result.is_set() {
            debug!(
                strategy = %strategy.id,
                instrument = config.instrument_id(),
                "No margin derivable, skipping"
            );
            return RecordOutcome::Skipped(SkipReason::NoMargin);
        }

        if self.config.dry_run {
            info!(strategy = %strategy.id, margin = %result, "Would update margin");
            return RecordOutcome::Updated(result);
        }

        match self.persist(&strategy.id, &result).await {
            Ok(()) => {
                info!(strategy = %strategy.id, margin = %result, "Updated margin");
                RecordOutcome::Updated(result)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(strategy = %strategy.id, error = %message, "Failed to update margin");
                RecordOutcome::Failed(message)
            }
        }
    }

    /// Write margin fields, retrying transient failures with backoff.
    ///
    /// A missing strategy is permanent and fails on the first attempt.
    async fn persist(&self, strategy_id: &str, result: &MarginResult) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.write_retry_initial)
            .with_max_elapsed_time(Some(self.config.write_retry_window))
            .build();

        let repo = &self.repo;
        backoff::future::retry_notify(
            policy,
            move || async move {
                repo.update_margin_fields(strategy_id, result)
                    .await
                    .map_err(|e| {
                        if RepositoryError::is_not_found(&e) {
                            backoff::Error::permanent(e)
                        } else {
                            backoff::Error::transient(e)
                        }
                    })
            },
            |e: anyhow::Error, wait: Duration| {
                warn!(
                    strategy = %strategy_id,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "Margin write failed, retrying"
                );
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::models::{MarginCurrency, RiskProfile, StrategyConfig};

    /// In-memory repository with injectable failures.
    #[derive(Default)]
    struct MemoryRepository {
        strategies: Vec<Strategy>,
        configs: HashMap<String, StrategyConfig>,
        broken_configs: Vec<String>,
        /// Listed but removed before the write lands
        deleted: Vec<String>,
        /// Remaining write failures per strategy id
        write_failures: Mutex<HashMap<String, usize>>,
        writes: Mutex<Vec<(String, MarginResult)>>,
        write_attempts: Mutex<usize>,
    }

    impl MemoryRepository {
        fn with_strategy(mut self, id: &str, config: Option<StrategyConfig>) -> Self {
            self.strategies.push(Strategy::new(id.to_string(), format!("Strategy {}", id)));
            if let Some(config) = config {
                self.configs.insert(id.to_string(), config);
            }
            self
        }

        fn writes(&self) -> Vec<(String, MarginResult)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StrategyRepository for MemoryRepository {
        async fn list_all(&self) -> Result<Vec<Strategy>> {
            Ok(self.strategies.clone())
        }

        async fn latest_config(&self, strategy_id: &str) -> Result<Option<StrategyConfig>> {
            if self.broken_configs.iter().any(|id| id == strategy_id) {
                anyhow::bail!("config for {} is not valid JSON", strategy_id);
            }
            Ok(self.configs.get(strategy_id).cloned())
        }

        async fn update_margin_fields(&self, strategy_id: &str, result: &MarginResult) -> Result<()> {
            *self.write_attempts.lock().unwrap() += 1;

            if self.deleted.iter().any(|id| id == strategy_id) {
                return Err(RepositoryError::StrategyNotFound(strategy_id.to_string()).into());
            }

            let mut failures = self.write_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(strategy_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("database is locked");
                }
            }

            self.writes
                .lock()
                .unwrap()
                .push((strategy_id.to_string(), *result));
            Ok(())
        }
    }

    fn config(pair: &str, capital: Option<rust_decimal::Decimal>, leverage: Option<rust_decimal::Decimal>) -> StrategyConfig {
        StrategyConfig {
            pair: Some(pair.to_string()),
            instrument: None,
            risk_profile: Some(RiskProfile {
                recommended_capital: capital,
                leverage,
            }),
        }
    }

    fn fast_config() -> BackfillConfig {
        BackfillConfig {
            write_retry_window: Duration::from_secs(5),
            write_retry_initial: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_counts_updated_and_skipped() {
        let repo = MemoryRepository::default()
            .with_strategy("futures", Some(config("B-BTCUSDT", Some(dec!(1000)), Some(dec!(5)))))
            .with_strategy("spot", Some(config("BTCINR", Some(dec!(1000)), Some(dec!(5)))))
            .with_strategy("no-capital", Some(config("BTCINR", None, Some(dec!(2)))))
            .with_strategy("no-config", None);

        let backfill = MarginBackfill::new(repo, fast_config());
        let report = backfill.run().await.unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.updated, 2);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.skipped_no_margin, 1);
        assert_eq!(report.skipped_no_config, 1);
        assert!(report.is_success());

        let writes = backfill.repository().writes();
        assert_eq!(
            writes,
            vec![
                (
                    "futures".to_string(),
                    MarginResult {
                        margin_required: Some(dec!(200)),
                        margin_currency: MarginCurrency::Usdt,
                    }
                ),
                (
                    "spot".to_string(),
                    MarginResult {
                        margin_required: Some(dec!(1000)),
                        margin_currency: MarginCurrency::Inr,
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let repo = MemoryRepository::default()
            .with_strategy("futures", Some(config("B-BTCUSDT", Some(dec!(1000)), Some(dec!(5)))));

        let backfill = MarginBackfill::new(
            repo,
            BackfillConfig {
                dry_run: true,
                ..fast_config()
            },
        );
        let report = backfill.run().await.unwrap();

        assert_eq!(report.updated, 1);
        assert!(report.dry_run);
        assert!(backfill.repository().writes().is_empty());
        assert_eq!(*backfill.repository().write_attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_run() {
        let mut repo = MemoryRepository::default()
            .with_strategy("broken", Some(config("BTCINR", Some(dec!(10)), None)))
            .with_strategy("locked", Some(config("BTCINR", Some(dec!(20)), None)))
            .with_strategy("ok", Some(config("BTCINR", Some(dec!(30)), None)));
        repo.broken_configs.push("broken".to_string());
        repo.write_failures
            .lock()
            .unwrap()
            .insert("locked".to_string(), usize::MAX);

        let backfill = MarginBackfill::new(
            repo,
            BackfillConfig {
                write_retry_window: Duration::ZERO,
                write_retry_initial: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let report = backfill.run().await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed(), 2);
        assert!(!report.is_success());

        let failed_ids: Vec<_> = report.failures.iter().map(|f| f.strategy_id.as_str()).collect();
        assert_eq!(failed_ids, vec!["broken", "locked"]);
        assert!(report.failures[1].error.contains("database is locked"));

        let writes = backfill.repository().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "ok");
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let repo = MemoryRepository::default()
            .with_strategy("flaky", Some(config("B-ETHUSDT", Some(dec!(600)), Some(dec!(3)))));
        repo.write_failures
            .lock()
            .unwrap()
            .insert("flaky".to_string(), 2);

        let backfill = MarginBackfill::new(repo, fast_config());
        let report = backfill.run().await.unwrap();

        assert_eq!(report.updated, 1);
        assert!(report.is_success());
        assert_eq!(*backfill.repository().write_attempts.lock().unwrap(), 3);
        assert_eq!(backfill.repository().writes()[0].1.margin_required, Some(dec!(200)));
    }

    #[tokio::test]
    async fn test_missing_strategy_is_not_retried() {
        let mut repo = MemoryRepository::default()
            .with_strategy("gone", Some(config("BTCINR", Some(dec!(100)), None)))
            .with_strategy("ok", Some(config("BTCINR", Some(dec!(200)), None)));
        repo.deleted.push("gone".to_string());

        let backfill = MarginBackfill::new(
            repo,
            BackfillConfig {
                write_retry_window: Duration::from_secs(30),
                write_retry_initial: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let report = backfill.run().await.unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].strategy_id, "gone");
        assert!(report.failures[0].error.contains("Strategy not found: gone"));
        assert_eq!(report.updated, 1);
        // One attempt each for "gone" and "ok"
        assert_eq!(*backfill.repository().write_attempts.lock().unwrap(), 2);
        assert!(report.elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_missing_strategy_in_sqlite_fails_fast() {
        use crate::db::Database;

        let backfill = MarginBackfill::new(
            Database::in_memory().await.unwrap(),
            BackfillConfig {
                write_retry_window: Duration::from_secs(30),
                write_retry_initial: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let result = MarginResult {
            margin_required: Some(dec!(100)),
            margin_currency: MarginCurrency::Inr,
        };

        let started = Instant::now();
        let err = backfill.persist("missing", &result).await.unwrap_err();

        assert!(RepositoryError::is_not_found(&err));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_only_missing_skips_strategies_with_margin() {
        let mut repo = MemoryRepository::default()
            .with_strategy("done", Some(config("BTCINR", Some(dec!(500)), None)))
            .with_strategy("todo", Some(config("BTCINR", Some(dec!(700)), None)));
        repo.strategies[0].margin_required = Some(dec!(400));
        repo.strategies[0].margin_currency = Some(MarginCurrency::Inr);

        let backfill = MarginBackfill::new(
            repo,
            BackfillConfig {
                only_missing: true,
                ..fast_config()
            },
        );
        let report = backfill.run().await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped_already_set, 1);
        assert_eq!(backfill.repository().writes()[0].0, "todo");
    }

    #[tokio::test]
    async fn test_backfill_against_sqlite() {
        use crate::db::Database;
        use serde_json::json;

        let db = Database::in_memory().await.unwrap();
        db.upsert_strategy("s-1", "Futures grid").await.unwrap();
        db.upsert_strategy("s-2", "Spot dca").await.unwrap();
        db.add_config_snapshot("s-1", &json!({ "pair": "B-BTCUSDT" }))
            .await
            .unwrap();
        db.add_config_snapshot(
            "s-1",
            &json!({ "pair": "B-BTCUSDT", "riskProfile": { "recommendedCapital": "1500", "leverage": 3 } }),
        )
        .await
        .unwrap();

        let backfill = MarginBackfill::new(db, fast_config());
        let report = backfill.run().await.unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped_no_config, 1);

        let stored = backfill.repository().get_strategy("s-1").await.unwrap().unwrap();
        assert_eq!(stored.margin_required, Some(dec!(500)));
        assert_eq!(stored.margin_currency, Some(MarginCurrency::Usdt));

        // Running again yields the same fields
        backfill.run().await.unwrap();
        let again = backfill.repository().get_strategy("s-1").await.unwrap().unwrap();
        assert_eq!(again.margin_required, stored.margin_required);
    }

    #[test]
    fn test_report_display() {
        let mut report = BackfillReport::default();
        report.record("a", &RecordOutcome::Skipped(SkipReason::NoConfig));
        report.record("b", &RecordOutcome::Failed("boom".to_string()));

        let text = report.to_string();
        assert!(text.contains("Strategies:      2"));
        assert!(text.contains("  b: boom"));
        assert!(text.contains("Completed with failures"));
    }
}
