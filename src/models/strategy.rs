//! Stored strategy record with its persisted margin fields.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::margin::MarginCurrency;

/// A trading strategy as held in the strategy store.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    /// Strategy identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Margin written back by the last backfill, if any
    pub margin_required: Option<Decimal>,

    pub margin_currency: Option<MarginCurrency>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// Create a new strategy with no margin fields.
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            margin_required: None,
            margin_currency: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when both margin fields have been written.
    pub fn has_margin(&self) -> bool {
        self.margin_required.is_some() && self.margin_currency.is_some()
    }

    /// Get display name (name or id).
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}
