//! Strategy store backed by sqlite.
//!
//! Holds what the margin backfill reads and writes:
//! - Strategies and their persisted margin fields
//! - Versioned configuration snapshots per strategy

mod repository;

pub use repository::{RepositoryError, StrategyRepository};

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{MarginCurrency, MarginResult, Strategy, StrategyConfig};

/// Timestamp format produced by sqlite's `datetime('now')`.
const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// Database connection pool for the strategy store.
pub struct Database {
    pool: SqlitePool,
}

/// Stored strategy row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredStrategy {
    pub id: String,
    pub name: String,
    pub margin_required: Option<String>,
    pub margin_currency: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredStrategy {
    fn into_strategy(self) -> Result<Strategy> {
        let margin_required = self
            .margin_required
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .with_context(|| format!("Invalid margin_required on strategy {}", self.id))?;
        let margin_currency = self
            .margin_currency
            .as_deref()
            .map(MarginCurrency::from_str)
            .transpose()
            .with_context(|| format!("Invalid margin_currency on strategy {}", self.id))?;

        Ok(Strategy {
            margin_required,
            margin_currency,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
        })
    }
}

/// Counts of strategies by margin state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarginStats {
    pub total: i64,
    pub with_margin: i64,
    pub without_margin: i64,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME)
        .with_context(|| format!("Invalid timestamp: {}", raw))?;
    Ok(naive.and_utc())
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create a private in-memory database.
    ///
    /// Every sqlite memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Strategies
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                margin_required TEXT,
                margin_currency TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Configuration snapshots
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(strategy_id, version),
                FOREIGN KEY (strategy_id) REFERENCES strategies(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_strategy_configs_strategy ON strategy_configs(strategy_id, version)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Strategies ====================

    /// Save or rename a strategy.
    pub async fn upsert_strategy(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies (id, name)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(NULLIF(excluded.name, ''), strategies.name),
                updated_at = datetime('now')
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a single strategy by id.
    pub async fn get_strategy(&self, id: &str) -> Result<Option<Strategy>> {
        let row = sqlx::query_as::<_, StoredStrategy>("SELECT * FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch strategy")?;

        row.map(StoredStrategy::into_strategy).transpose()
    }

    /// Count strategies with and without margin fields.
    pub async fn margin_stats(&self) -> Result<MarginStats> {
        let (total, with_margin): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE
                    WHEN margin_required IS NOT NULL AND margin_currency IS NOT NULL THEN 1
                    ELSE 0
                END), 0)
            FROM strategies
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MarginStats {
            total,
            with_margin,
            without_margin: total - with_margin,
        })
    }

    // ==================== Config Snapshots ====================

    /// Append a configuration snapshot, returning its version.
    ///
    /// The raw JSON is stored as-is so fields this crate does not model are
    /// preserved.
    pub async fn add_config_snapshot(
        &self,
        strategy_id: &str,
        config: &serde_json::Value,
    ) -> Result<i64> {
        let raw = serde_json::to_string(config).context("Failed to encode strategy config")?;

        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO strategy_configs (strategy_id, version, config)
            SELECT ?, COALESCE(MAX(version), 0) + 1, ?
            FROM strategy_configs WHERE strategy_id = ?
            RETURNING version
            "#,
        )
        .bind(strategy_id)
        .bind(&raw)
        .bind(strategy_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to store config for strategy {}", strategy_id))?;

        Ok(version)
    }

    /// Number of configuration snapshots stored for a strategy.
    pub async fn config_count(&self, strategy_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM strategy_configs WHERE strategy_id = ?")
                .bind(strategy_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[async_trait]
impl StrategyRepository for Database {
    async fn list_all(&self) -> Result<Vec<Strategy>> {
        let rows = sqlx::query_as::<_, StoredStrategy>(
            "SELECT * FROM strategies ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch strategies")?;

        rows.into_iter().map(StoredStrategy::into_strategy).collect()
    }

    async fn latest_config(&self, strategy_id: &str) -> Result<Option<StrategyConfig>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT config FROM strategy_configs WHERE strategy_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch config for strategy {}", strategy_id))?;

        row.map(|(raw,)| {
            StrategyConfig::from_json(&raw)
                .with_context(|| format!("Malformed config for strategy {}", strategy_id))
        })
        .transpose()
    }

    async fn update_margin_fields(&self, strategy_id: &str, result: &MarginResult) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE strategies SET
                margin_required = ?,
                margin_currency = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(result.margin_required.map(|m| m.to_string()))
        .bind(result.margin_currency.as_str())
        .bind(strategy_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update margin for strategy {}", strategy_id))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::StrategyNotFound(strategy_id.to_string()).into());
        }

        Ok(())
    }
}
