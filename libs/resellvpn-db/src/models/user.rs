use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Reseller-or-customer node of the reseller forest. Balance fields are only
/// ever mutated through atomic increments tied to a Payment row;
/// `applied_discount_percent` is only written by discount propagation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub role: String,
    pub tg_id: Option<i64>,
    pub balance: Decimal,
    pub profit_balance: Decimal,
    pub total_profit: Decimal,
    pub parent_id: Option<i64>,
    pub profit_percent: f64,
    pub initial_discount_percent: f64,
    pub applied_discount_percent: f64,
    pub is_disabled: bool,
    pub is_parent_disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Disabled state is the logical OR of self-disabled and parent-disabled.
    pub fn is_effectively_disabled(&self) -> bool {
        self.is_disabled || self.is_parent_disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn user(disabled: bool, parent_disabled: bool) -> User {
        User {
            id: 1,
            role: "reseller".into(),
            tg_id: None,
            balance: dec!(0),
            profit_balance: dec!(0),
            total_profit: dec!(0),
            parent_id: None,
            profit_percent: 0.0,
            initial_discount_percent: 0.0,
            applied_discount_percent: 0.0,
            is_disabled: disabled,
            is_parent_disabled: parent_disabled,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn effective_disable_is_or_of_flags() {
        assert!(!user(false, false).is_effectively_disabled());
        assert!(user(true, false).is_effectively_disabled());
        assert!(user(false, true).is_effectively_disabled());
        assert!(user(true, true).is_effectively_disabled());
    }
}
