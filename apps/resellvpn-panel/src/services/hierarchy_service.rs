//! Recursive reseller tree: discount propagation, per-purchase profit split,
//! cascading block/unblock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use resellvpn_db::models::{PaymentStatus, PaymentType, Server, User};
use resellvpn_db::repositories::{
    ActivityRepository, PaymentRepository, ServerRepository, UserPackageRepository, UserRepository,
};

use crate::error::{CoreError, CoreResult};
use crate::services::panel_client::PanelClient;
use crate::services::storage::ObjectStorage;
use crate::utils::task_pool;

const TOGGLE_MAX_CONCURRENT: usize = 5;
const TOGGLE_RATE_PER_SECOND: u32 = 5;

/// Closed-form applied discount for a child under a parent. Percentages in,
/// percentage out; decimals internally.
pub fn applied_discount(parent_applied: f64, parent_profit: f64, child_own: f64) -> f64 {
    let pd = parent_applied / 100.0;
    let pp = parent_profit / 100.0;
    let cd = child_own / 100.0;
    100.0 - (1.0 - pd) * (1.0 + pp) * (1.0 - cd) * 100.0
}

/// Break-even bound: the largest direct-child discount a profit percent can
/// sustain.
pub fn max_child_discount(profit_percent: f64) -> f64 {
    profit_percent / (100.0 + profit_percent) * 100.0
}

/// Signed ledger movement on one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerDelta {
    pub balance: Decimal,
    pub profit_balance: Decimal,
    pub total_profit: Decimal,
}

impl LedgerDelta {
    pub fn reversed(&self) -> Self {
        Self {
            balance: -self.balance,
            profit_balance: -self.profit_balance,
            total_profit: -self.total_profit,
        }
    }
}

/// Outcome of splitting one purchase amount across the buyer's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseSplit {
    /// Account the delta lands on: the parent when one exists, else the
    /// buyer's own wallet.
    pub account_id: i64,
    pub delta: LedgerDelta,
    pub profit_amount: Decimal,
    pub parent_profit: Decimal,
}

fn profit_ratio(user: &User) -> Decimal {
    if user.balance.is_zero() {
        // NaN guard: an empty wallet carries no profit share.
        Decimal::ZERO
    } else {
        user.profit_balance / user.balance
    }
}

/// Pure split computation; the service applies it atomically and the reject
/// path applies its exact reversal.
pub fn compute_purchase_split(amount: Decimal, payer: &User, parent: Option<&User>) -> PurchaseSplit {
    let profit_amount = profit_ratio(payer) * amount;
    match parent {
        Some(parent) => {
            let parent_profit = profit_ratio(parent) * amount;
            PurchaseSplit {
                account_id: parent.id,
                delta: LedgerDelta {
                    balance: -amount,
                    profit_balance: -parent_profit,
                    total_profit: parent_profit - profit_amount,
                },
                profit_amount,
                parent_profit,
            }
        }
        None => PurchaseSplit {
            account_id: payer.id,
            delta: LedgerDelta {
                balance: -amount,
                profit_balance: -profit_amount,
                total_profit: profit_amount,
            },
            profit_amount,
            parent_profit: Decimal::ZERO,
        },
    }
}

pub struct RecordedPayment {
    pub payment: resellvpn_db::models::Payment,
    pub split: PurchaseSplit,
}

#[derive(Clone)]
pub struct HierarchyService {
    pool: PgPool,
    user_repo: UserRepository,
    payment_repo: PaymentRepository,
    pack_repo: UserPackageRepository,
    server_repo: ServerRepository,
    activity_repo: ActivityRepository,
    panel: Arc<PanelClient>,
    storage: Arc<dyn ObjectStorage>,
}

impl HierarchyService {
    pub fn new(pool: PgPool, panel: Arc<PanelClient>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            user_repo: UserRepository::new(pool.clone()),
            payment_repo: PaymentRepository::new(pool.clone()),
            pack_repo: UserPackageRepository::new(pool.clone()),
            server_repo: ServerRepository::new(pool.clone()),
            activity_repo: ActivityRepository::new(pool.clone()),
            pool,
            panel,
            storage,
        }
    }

    /// Changes a node's profit percent after validating every direct child
    /// against the break-even bound, then recomputes applied discounts for
    /// the whole subtree.
    pub async fn update_profit_percent(&self, user_id: i64, profit_percent: f64) -> CoreResult<()> {
        let user = self
            .user_repo
            .get_by_id(user_id)
            .await?
            .ok_or(CoreError::NotFound("user"))?;

        let bound = max_child_discount(profit_percent);
        for child in self.user_repo.get_children(user_id).await? {
            if child.initial_discount_percent > bound {
                return Err(CoreError::DiscountExceedsProfit {
                    child_id: child.id,
                    max_percent: bound,
                });
            }
        }

        self.user_repo
            .update_profit_percent(user_id, profit_percent)
            .await?;

        let mut updated = user;
        updated.profit_percent = profit_percent;
        self.propagate_from(&updated).await?;

        let _ = self
            .activity_repo
            .log(
                Some(user_id),
                "profit_percent",
                &format!("profit percent set to {:.2}", profit_percent),
            )
            .await;
        Ok(())
    }

    /// Changes a child's own discount (validated against the parent's profit
    /// bound) and recomputes the child's subtree.
    pub async fn update_child_discount(
        &self,
        parent_id: i64,
        child_id: i64,
        discount_percent: f64,
    ) -> CoreResult<()> {
        let parent = self
            .user_repo
            .get_by_id(parent_id)
            .await?
            .ok_or(CoreError::NotFound("user"))?;
        let child = self
            .user_repo
            .get_by_id(child_id)
            .await?
            .ok_or(CoreError::NotFound("user"))?;
        if child.parent_id != Some(parent.id) {
            return Err(CoreError::Validation("not a direct child".into()));
        }

        let bound = max_child_discount(parent.profit_percent);
        if discount_percent > bound {
            return Err(CoreError::DiscountExceedsProfit {
                child_id,
                max_percent: bound,
            });
        }

        self.user_repo
            .update_initial_discount_percent(child_id, discount_percent)
            .await?;

        let applied = applied_discount(
            parent.applied_discount_percent,
            parent.profit_percent,
            discount_percent,
        );
        self.user_repo
            .update_applied_discount_percent(child_id, applied)
            .await?;

        let mut updated_child = child;
        updated_child.initial_discount_percent = discount_percent;
        updated_child.applied_discount_percent = applied;
        self.propagate_from(&updated_child).await?;
        Ok(())
    }

    /// Top-down walk of the node's subtree. The subtree is loaded once via a
    /// recursive query, assembled into an owned-children map and walked in
    /// memory; each child's computation uses the parent's just-updated
    /// *applied* discount, never the initial one.
    async fn propagate_from(&self, root: &User) -> CoreResult<()> {
        let descendants = self.user_repo.list_descendants(root.id).await?;
        if descendants.is_empty() {
            return Ok(());
        }

        let mut children_of: HashMap<i64, Vec<User>> = HashMap::new();
        for node in descendants {
            if let Some(pid) = node.parent_id {
                children_of.entry(pid).or_default().push(node);
            }
        }

        let mut recomputed = Vec::new();
        collect_applied(root, &children_of, &mut recomputed);

        for (id, applied) in recomputed {
            self.user_repo
                .update_applied_discount_percent(id, applied)
                .await?;
        }
        Ok(())
    }

    /// Records the commercial transaction for a purchase and moves the money.
    /// Wallet-only payments (no receipt) settle immediately as APPLIED;
    /// receipt payments stay PENDING for review.
    pub async fn record_purchase_payment(
        &self,
        payer: &User,
        amount: Decimal,
        receipt_tmp: Option<&str>,
    ) -> CoreResult<RecordedPayment> {
        let receipt_image = match receipt_tmp {
            Some(tmp_name) => Some(self.persist_receipt(tmp_name).await?),
            None => None,
        };

        let parent = match payer.parent_id {
            Some(pid) => self.user_repo.get_by_id(pid).await?,
            None => None,
        };
        let split = compute_purchase_split(amount, payer, parent.as_ref());

        let status = if receipt_image.is_some() {
            PaymentStatus::Pending
        } else {
            PaymentStatus::Applied
        };

        let mut tx = self.pool.begin().await.map_err(|e| CoreError::Internal(e.into()))?;
        UserRepository::adjust_ledger(
            &mut *tx,
            split.account_id,
            split.delta.balance,
            split.delta.profit_balance,
            split.delta.total_profit,
        )
        .await?;
        let payment = PaymentRepository::create(
            &mut *tx,
            payer.id,
            amount,
            PaymentType::PackagePurchase,
            status,
            split.profit_amount,
            split.parent_profit,
            receipt_image.as_deref(),
        )
        .await?;
        tx.commit()
            .await
            .context("Failed to commit purchase payment")
            .map_err(CoreError::Internal)?;

        info!(
            payment_id = payment.id,
            payer_id = payer.id,
            account_id = split.account_id,
            %amount,
            "purchase payment recorded"
        );
        Ok(RecordedPayment { payment, split })
    }

    /// Wallet recharge staged for admin review; the balance is credited on
    /// accept, never at creation.
    pub async fn record_recharge_payment(
        &self,
        payer: &User,
        amount: Decimal,
        receipt_tmp: &str,
    ) -> CoreResult<resellvpn_db::models::Payment> {
        let receipt_image = self.persist_receipt(receipt_tmp).await?;

        let payment = PaymentRepository::create(
            &self.pool,
            payer.id,
            amount,
            PaymentType::WalletRecharge,
            PaymentStatus::Pending,
            Decimal::ZERO,
            Decimal::ZERO,
            Some(&receipt_image),
        )
        .await?;
        Ok(payment)
    }

    /// Review outcome for a staged recharge. The wallet is credited only on
    /// accept; the settle guard makes a second review a no-op error.
    pub async fn settle_recharge_payment(&self, payment_id: i64, accept: bool) -> CoreResult<()> {
        let payment = self
            .payment_repo
            .get_by_id(payment_id)
            .await?
            .ok_or(CoreError::NotFound("payment"))?;
        if payment.payment_type != PaymentType::WalletRecharge.as_str() {
            return Err(CoreError::Validation("not a recharge payment".into()));
        }

        let to = if accept {
            PaymentStatus::Applied
        } else {
            PaymentStatus::Rejected
        };
        if !self.payment_repo.settle(payment_id, to).await? {
            return Err(CoreError::Validation("payment already settled".into()));
        }

        if accept {
            UserRepository::adjust_ledger(
                &self.pool,
                payment.payer_id,
                payment.amount,
                Decimal::ZERO,
                Decimal::ZERO,
            )
            .await?;
            info!(payment_id, payer_id = payment.payer_id, "recharge credited");
        }
        Ok(())
    }

    /// Exactly reverses the split a payment applied. Used by the purchase
    /// reject path; apply-then-reverse returns every ledger field to its
    /// pre-purchase value.
    pub async fn reverse_purchase_payment(
        &self,
        payment: &resellvpn_db::models::Payment,
    ) -> CoreResult<()> {
        let payer = self
            .user_repo
            .get_by_id(payment.payer_id)
            .await?
            .ok_or(CoreError::NotFound("user"))?;
        let account_id = payer.parent_id.unwrap_or(payer.id);

        // Reconstruct from the payment row rather than recomputing ratios,
        // which may have drifted since the purchase.
        let reversal = if payer.parent_id.is_some() {
            LedgerDelta {
                balance: payment.amount,
                profit_balance: payment.parent_profit,
                total_profit: payment.profit_amount - payment.parent_profit,
            }
        } else {
            LedgerDelta {
                balance: payment.amount,
                profit_balance: payment.profit_amount,
                total_profit: -payment.profit_amount,
            }
        };

        UserRepository::adjust_ledger(
            &self.pool,
            account_id,
            reversal.balance,
            reversal.profit_balance,
            reversal.total_profit,
        )
        .await?;

        info!(payment_id = payment.id, account_id, "purchase payment reversed");
        Ok(())
    }

    /// Cascading block/unblock. Panel credentials are toggled through the
    /// bounded fan-out pool first, then both flags flip in one transaction.
    /// Unblocking skips children who disabled themselves.
    pub async fn toggle_block(&self, user_id: i64, blocked: bool) -> CoreResult<()> {
        let children = self.user_repo.get_children(user_id).await?;
        let mut target_ids = vec![user_id];
        for child in &children {
            if blocked || !child.is_disabled {
                target_ids.push(child.id);
            }
        }

        let packs = self.pack_repo.active_for_users(&target_ids).await?;
        let servers: HashMap<i64, Server> = self
            .server_repo
            .get_active()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut tasks = Vec::new();
        for pack in &packs {
            let Some(server) = servers.get(&pack.server_id).cloned() else {
                warn!(
                    user_package_id = pack.id,
                    server_id = pack.server_id,
                    "no active server for credential toggle"
                );
                continue;
            };
            let panel = self.panel.clone();
            let stat_id = pack.stat_id;
            let enabled = !blocked;
            tasks.push(async move {
                (stat_id, panel.toggle_client(&server, stat_id, enabled).await)
            });
        }

        let results =
            task_pool::run(tasks, TOGGLE_MAX_CONCURRENT, TOGGLE_RATE_PER_SECOND).await;
        for (stat_id, result) in results {
            if let Err(e) = result {
                warn!(%stat_id, "credential toggle failed: {}", e);
            }
        }

        self.user_repo.set_block_flags(user_id, blocked).await?;
        let _ = self
            .activity_repo
            .log(
                Some(user_id),
                "block",
                if blocked { "user blocked" } else { "user unblocked" },
            )
            .await;
        Ok(())
    }

    async fn persist_receipt(&self, tmp_name: &str) -> CoreResult<String> {
        let bytes = self
            .storage
            .get(tmp_name)
            .await
            .map_err(CoreError::Internal)?;
        let permanent = format!("receipts/{}.jpg", Uuid::new_v4());
        self.storage
            .upload(&permanent, &bytes)
            .await
            .map_err(CoreError::Internal)?;
        self.storage
            .delete(&[tmp_name.to_string()])
            .await
            .map_err(CoreError::Internal)?;
        Ok(permanent)
    }
}

fn collect_applied(parent: &User, children_of: &HashMap<i64, Vec<User>>, out: &mut Vec<(i64, f64)>) {
    let Some(children) = children_of.get(&parent.id) else {
        return;
    };
    for child in children {
        let applied = applied_discount(
            parent.applied_discount_percent,
            parent.profit_percent,
            child.initial_discount_percent,
        );
        out.push((child.id, applied));

        let mut updated = child.clone();
        updated.applied_discount_percent = applied;
        collect_applied(&updated, children_of, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn user(id: i64, parent: Option<i64>, balance: Decimal, profit_balance: Decimal) -> User {
        User {
            id,
            role: "reseller".into(),
            tg_id: None,
            balance,
            profit_balance,
            total_profit: dec!(0),
            parent_id: parent,
            profit_percent: 0.0,
            initial_discount_percent: 0.0,
            applied_discount_percent: 0.0,
            is_disabled: false,
            is_parent_disabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn break_even_bound_matches_closed_form() {
        assert!((max_child_discount(50.0) - 33.333333333333336).abs() < 1e-9);
        assert!((max_child_discount(0.0) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn discount_propagates_through_applied_not_initial() {
        // root: profit 50%, discount 0; mid: own 10%; leaf: own 5%.
        let mid_applied = applied_discount(0.0, 50.0, 10.0);
        // 100 - (1.0)*(1.5)*(0.9)*100 = -35
        assert!((mid_applied - -35.0).abs() < 1e-9);

        // leaf must see mid's applied (-35), not its initial (10).
        let leaf_applied = applied_discount(mid_applied, 0.0, 5.0);
        // 100 - (1.35)*(1.0)*(0.95)*100 = -28.25
        assert!((leaf_applied - -28.25).abs() < 1e-9);

        let wrong = applied_discount(10.0, 0.0, 5.0);
        assert!((leaf_applied - wrong).abs() > 1e-6);
    }

    #[test]
    fn subtree_walk_recomputes_transitively() {
        let mut root = user(1, None, dec!(0), dec!(0));
        root.profit_percent = 50.0;
        let mut mid = user(2, Some(1), dec!(0), dec!(0));
        mid.initial_discount_percent = 10.0;
        let mut leaf = user(3, Some(2), dec!(0), dec!(0));
        leaf.initial_discount_percent = 5.0;

        let mut children_of: HashMap<i64, Vec<User>> = HashMap::new();
        children_of.insert(1, vec![mid]);
        children_of.insert(2, vec![leaf]);

        let mut out = Vec::new();
        collect_applied(&root, &children_of, &mut out);

        assert_eq!(out.len(), 2);
        let mid_applied = applied_discount(0.0, 50.0, 10.0);
        assert_eq!(out[0].0, 2);
        assert!((out[0].1 - mid_applied).abs() < 1e-9);
        assert_eq!(out[1].0, 3);
        assert!((out[1].1 - applied_discount(mid_applied, 0.0, 5.0)).abs() < 1e-9);
    }

    #[test]
    fn parent_split_uses_parent_profit_ratio() {
        let parent = user(1, None, dec!(1000), dec!(100));
        let payer = user(2, Some(1), dec!(500), dec!(50));
        let split = compute_purchase_split(dec!(200), &payer, Some(&parent));

        assert_eq!(split.account_id, 1);
        // parent ratio 0.1, payer ratio 0.1
        assert_eq!(split.parent_profit, dec!(20));
        assert_eq!(split.profit_amount, dec!(20));
        assert_eq!(split.delta.balance, dec!(-200));
        assert_eq!(split.delta.profit_balance, dec!(-20));
        assert_eq!(split.delta.total_profit, dec!(0));
    }

    #[test]
    fn zero_parent_balance_guards_division() {
        let parent = user(1, None, dec!(0), dec!(0));
        let payer = user(2, Some(1), dec!(0), dec!(0));
        let split = compute_purchase_split(dec!(100), &payer, Some(&parent));
        assert_eq!(split.parent_profit, dec!(0));
        assert_eq!(split.profit_amount, dec!(0));
    }

    #[test]
    fn wallet_split_charges_the_buyer() {
        let payer = user(2, None, dec!(400), dec!(40));
        let split = compute_purchase_split(dec!(100), &payer, None);
        assert_eq!(split.account_id, 2);
        assert_eq!(split.profit_amount, dec!(10));
        assert_eq!(split.parent_profit, dec!(0));
        assert_eq!(split.delta.balance, dec!(-100));
        assert_eq!(split.delta.profit_balance, dec!(-10));
        assert_eq!(split.delta.total_profit, dec!(10));
    }

    #[test]
    fn apply_then_reverse_is_identity() {
        let parent = user(1, None, dec!(1000), dec!(250));
        let payer = user(2, Some(1), dec!(300), dec!(60));
        let split = compute_purchase_split(dec!(120), &payer, Some(&parent));

        let reversed = split.delta.reversed();
        assert_eq!(split.delta.balance + reversed.balance, dec!(0));
        assert_eq!(split.delta.profit_balance + reversed.profit_balance, dec!(0));
        assert_eq!(split.delta.total_profit + reversed.total_profit, dec!(0));
    }
}
