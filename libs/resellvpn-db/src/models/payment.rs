use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const PAYMENT_STATUS_PENDING: &str = "pending";
pub const PAYMENT_STATUS_APPLIED: &str = "applied";
pub const PAYMENT_STATUS_REJECTED: &str = "rejected";

pub const PAYMENT_TYPE_PACKAGE_PURCHASE: &str = "package_purchase";
pub const PAYMENT_TYPE_WALLET_RECHARGE: &str = "wallet_recharge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Applied,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => PAYMENT_STATUS_PENDING,
            Self::Applied => PAYMENT_STATUS_APPLIED,
            Self::Rejected => PAYMENT_STATUS_REJECTED,
        }
    }

    /// APPLIED and REJECTED are terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentType {
    PackagePurchase,
    WalletRecharge,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PackagePurchase => PAYMENT_TYPE_PACKAGE_PURCHASE,
            Self::WalletRecharge => PAYMENT_TYPE_WALLET_RECHARGE,
        }
    }
}

/// Immutable financial transaction. Status transitions are one-way:
/// pending -> applied | rejected, enforced in the repository update.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub payer_id: i64,
    pub amount: Decimal,
    #[sqlx(rename = "type")]
    pub payment_type: String,
    pub status: String,
    pub profit_amount: Decimal,
    pub parent_profit: Decimal,
    pub receipt_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn status_enum(&self) -> Option<PaymentStatus> {
        match self.status.as_str() {
            PAYMENT_STATUS_PENDING => Some(PaymentStatus::Pending),
            PAYMENT_STATUS_APPLIED => Some(PaymentStatus::Applied),
            PAYMENT_STATUS_REJECTED => Some(PaymentStatus::Rejected),
            _ => None,
        }
    }
}
