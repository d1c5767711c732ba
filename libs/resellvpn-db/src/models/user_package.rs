use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A purchase record binding a User, a catalog Package, a ClientStat and a
/// Server. There is no status column; state is derived from the timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserPackage {
    pub id: i64,
    pub user_id: i64,
    pub package_id: i64,
    pub server_id: i64,
    pub stat_id: Uuid,
    pub payment_id: Option<i64>,
    pub name: String,
    pub order_n: i32,
    pub finished_at: Option<DateTime<Utc>>,
    pub threshold_warning_sent_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserPackage {
    /// ACTIVE = not superseded/cancelled and not exhausted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none() && self.finished_at.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Eligible for a threshold warning: active and never warned before.
    /// Once `threshold_warning_sent_at` is stamped the package can never be
    /// selected again, which is what keeps warnings at-most-once.
    pub fn awaiting_warning(&self) -> bool {
        self.is_active() && self.threshold_warning_sent_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pack() -> UserPackage {
        UserPackage {
            id: 1,
            user_id: 1,
            package_id: 1,
            server_id: 1,
            stat_id: Uuid::new_v4(),
            payment_id: None,
            name: "Basic".into(),
            order_n: 1,
            finished_at: None,
            threshold_warning_sent_at: None,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn state_is_derived_from_timestamps() {
        let active = pack();
        assert!(active.is_active());
        assert!(!active.is_finished());

        let mut finished = pack();
        finished.finished_at = Some(Utc::now());
        assert!(!finished.is_active());
        assert!(finished.is_finished());

        let mut deleted = pack();
        deleted.deleted_at = Some(Utc::now());
        assert!(!deleted.is_active());
    }

    #[test]
    fn warning_is_at_most_once() {
        let fresh = pack();
        assert!(fresh.awaiting_warning());

        // Stamped before dispatch; a later tick must never pick it up again.
        let mut warned = pack();
        warned.threshold_warning_sent_at = Some(Utc::now());
        assert!(!warned.awaiting_warning());
    }

    #[test]
    fn finished_and_deleted_packages_are_never_warned() {
        let mut finished = pack();
        finished.finished_at = Some(Utc::now());
        assert!(!finished.awaiting_warning());

        let mut deleted = pack();
        deleted.deleted_at = Some(Utc::now());
        assert!(!deleted.awaiting_warning());
    }
}
