//! Purchase and renewal lifecycle for user packages. A UserPackage has no
//! status column; ACTIVE / FINISHED / DELETED are derived from timestamps.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use resellvpn_db::models::{Package, PaymentStatus, Server, User, UserPackage};
use resellvpn_db::repositories::{
    ActivityRepository, ClientStatRepository, PackageRepository, PaymentRepository,
    ServerRepository, StatUpsert, UserPackageRepository, UserRepository,
};

use crate::error::{CoreError, CoreResult};
use crate::services::alloc::AllocationStrategy;
use crate::services::hierarchy_service::HierarchyService;
use crate::services::panel_client::{ClientSpec, PanelClient, PartialClientSpec};
use crate::utils::ids;

const PANEL_ID_LEN: usize = 16;

/// Unused traffic/time carried from a superseded package into its renewal.
/// Each carried quantity is capped at the old package's equivalence bound, so
/// a user cannot convert hoarded traffic into unbounded extra days or vice
/// versa.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarryOver {
    pub traffic_gb: f64,
    pub days: f64,
}

impl CarryOver {
    pub fn compute(old: &Package, remaining_gb: f64, remaining_days: f64) -> Self {
        if old.traffic_gb <= 0.0 || old.expiration_days <= 0 {
            return Self {
                traffic_gb: 0.0,
                days: 0.0,
            };
        }
        let old_days = f64::from(old.expiration_days);
        let max_days = (remaining_gb / old.traffic_gb) * old_days;
        let max_traffic = (remaining_days / old_days) * old.traffic_gb;
        Self {
            traffic_gb: remaining_gb.min(max_traffic).max(0.0),
            days: remaining_days.min(max_days).max(0.0),
        }
    }
}

fn purchase_amount(price: i64, applied_discount_percent: f64) -> Decimal {
    let discount = Decimal::from_f64(applied_discount_percent).unwrap_or_default();
    Decimal::from(price) * (Decimal::ONE_HUNDRED - discount) / Decimal::ONE_HUNDRED
}

fn expiry_millis(days: f64) -> i64 {
    let extra = Duration::milliseconds((days * 86_400_000.0) as i64);
    (Utc::now() + extra).timestamp_millis()
}

fn gb_to_bytes(gb: f64) -> i64 {
    (gb * 1024.0 * 1024.0 * 1024.0) as i64
}

#[derive(Clone)]
pub struct PackageService {
    pool: PgPool,
    user_repo: UserRepository,
    package_repo: PackageRepository,
    pack_repo: UserPackageRepository,
    stat_repo: ClientStatRepository,
    server_repo: ServerRepository,
    payment_repo: PaymentRepository,
    activity_repo: ActivityRepository,
    panel: Arc<PanelClient>,
    hierarchy: Arc<HierarchyService>,
    alloc: Arc<dyn AllocationStrategy>,
}

impl PackageService {
    pub fn new(
        pool: PgPool,
        panel: Arc<PanelClient>,
        hierarchy: Arc<HierarchyService>,
        alloc: Arc<dyn AllocationStrategy>,
    ) -> Self {
        Self {
            user_repo: UserRepository::new(pool.clone()),
            package_repo: PackageRepository::new(pool.clone()),
            pack_repo: UserPackageRepository::new(pool.clone()),
            stat_repo: ClientStatRepository::new(pool.clone()),
            server_repo: ServerRepository::new(pool.clone()),
            payment_repo: PaymentRepository::new(pool.clone()),
            activity_repo: ActivityRepository::new(pool.clone()),
            pool,
            panel,
            hierarchy,
            alloc,
        }
    }

    pub async fn get_user_packages(&self, user_id: i64) -> CoreResult<Vec<UserPackage>> {
        Ok(self.pack_repo.get_for_user(user_id).await?)
    }

    /// Fresh provision: panel first, money second, local rows last in one
    /// transaction. A panel failure leaves no local state; a local failure
    /// after provisioning is the acknowledged drift window the sync loop
    /// repairs.
    pub async fn buy_package(
        &self,
        user: &User,
        package_id: i64,
        receipt_tmp: Option<&str>,
    ) -> CoreResult<UserPackage> {
        self.ensure_not_blocked(user).await?;
        let package = self
            .package_repo
            .get_by_id(package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or(CoreError::NotFound("package"))?;

        let servers = self.server_repo.get_active().await?;
        let server = self
            .alloc
            .pick_server(&servers)
            .ok_or(CoreError::NotFound("active server"))?
            .clone();

        let stat_id = Uuid::new_v4();
        let spec = ClientSpec {
            id: stat_id,
            email: ids::panel_id(PANEL_ID_LEN),
            sub_id: ids::panel_id(PANEL_ID_LEN),
            total_bytes: package.traffic_bytes(),
            expiry_time: expiry_millis(f64::from(package.expiration_days)),
            limit_ip: package.user_count,
        };
        self.panel.add_client(&server, &spec).await?;

        let amount = purchase_amount(package.price, user.applied_discount_percent);
        let recorded = self
            .hierarchy
            .record_purchase_payment(user, amount, receipt_tmp)
            .await?;

        let pack = self
            .persist_purchase(user, &package, &server, &spec, Some(recorded.payment.id))
            .await?;

        info!(
            user_id = user.id,
            package_id,
            user_package_id = pack.id,
            server_id = server.id,
            "package purchased"
        );
        Ok(pack)
    }

    /// Renewal reuses the existing panel credential. The superseded package
    /// is soft-deleted up front so the counters can never be double counted.
    /// Unfinished packages carry their unused remainder into the new one; if
    /// that path fails the renewal degrades to a fresh-style provision after
    /// logging the swallowed cause.
    pub async fn renew_package(
        &self,
        user: &User,
        package_id: i64,
        existing_id: i64,
        receipt_tmp: Option<&str>,
    ) -> CoreResult<UserPackage> {
        self.ensure_not_blocked(user).await?;
        let package = self
            .package_repo
            .get_by_id(package_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or(CoreError::NotFound("package"))?;
        let old_pack = self
            .pack_repo
            .get_by_id(existing_id)
            .await?
            .filter(|p| p.user_id == user.id && p.deleted_at.is_none())
            .ok_or(CoreError::NotFound("user package"))?;
        let old_package = self
            .package_repo
            .get_by_id(old_pack.package_id)
            .await?
            .ok_or(CoreError::NotFound("package"))?;
        let server = self
            .server_repo
            .get_by_id(old_pack.server_id)
            .await?
            .ok_or(CoreError::NotFound("server"))?;
        let stat = self
            .stat_repo
            .get_by_id(old_pack.stat_id)
            .await?
            .ok_or(CoreError::NotFound("client stat"))?;

        self.pack_repo.soft_delete(old_pack.id).await?;

        let mut total_gb = package.traffic_gb;
        let mut days = f64::from(package.expiration_days);

        if !old_pack.is_finished() {
            let remaining_gb = stat.remaining_bytes() as f64 / (1024.0 * 1024.0 * 1024.0);
            let remaining_days =
                (stat.expiry_time - Utc::now().timestamp_millis()).max(0) as f64 / 86_400_000.0;
            let carry = CarryOver::compute(&old_package, remaining_gb, remaining_days);
            total_gb += carry.traffic_gb;
            days += carry.days;

            match self
                .reprovision(&server, stat.id, total_gb, days, package.user_count)
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        user_package_id = old_pack.id,
                        stat_id = %stat.id,
                        "carry-over renewal failed, falling back to fresh provision: {}",
                        e
                    );
                    total_gb = package.traffic_gb;
                    days = f64::from(package.expiration_days);
                    self.reprovision(&server, stat.id, total_gb, days, package.user_count)
                        .await?;
                }
            }
        } else {
            self.reprovision(&server, stat.id, total_gb, days, package.user_count)
                .await?;
        }

        let amount = purchase_amount(package.price, user.applied_discount_percent);
        let recorded = self
            .hierarchy
            .record_purchase_payment(user, amount, receipt_tmp)
            .await?;

        let spec = ClientSpec {
            id: stat.id,
            email: stat.email.clone(),
            sub_id: stat.sub_id.clone(),
            total_bytes: gb_to_bytes(total_gb),
            expiry_time: expiry_millis(days),
            limit_ip: package.user_count,
        };
        let pack = self
            .persist_purchase(user, &package, &server, &spec, Some(recorded.payment.id))
            .await?;

        info!(
            user_id = user.id,
            package_id,
            superseded = old_pack.id,
            user_package_id = pack.id,
            "package renewed"
        );
        Ok(pack)
    }

    /// Settles the receipt-review payment as applied. Settling is guarded in
    /// the repository, so a second accept is a no-op error.
    pub async fn accept_purchase(&self, user_package_id: i64) -> CoreResult<()> {
        let pack = self
            .pack_repo
            .get_by_id(user_package_id)
            .await?
            .ok_or(CoreError::NotFound("user package"))?;
        let payment_id = pack.payment_id.ok_or(CoreError::NotFound("payment"))?;

        if !self.payment_repo.settle(payment_id, PaymentStatus::Applied).await? {
            return Err(CoreError::Validation("payment already settled".into()));
        }
        let _ = self
            .activity_repo
            .log(Some(pack.user_id), "purchase_accepted", &pack.name)
            .await;
        Ok(())
    }

    /// Full rejection: settle the payment, reverse the ledger split, retire
    /// the package, remove the panel credential and block the buyer.
    pub async fn reject_purchase(&self, user_package_id: i64) -> CoreResult<()> {
        let pack = self
            .pack_repo
            .get_by_id(user_package_id)
            .await?
            .ok_or(CoreError::NotFound("user package"))?;
        let payment_id = pack.payment_id.ok_or(CoreError::NotFound("payment"))?;
        let payment = self
            .payment_repo
            .get_by_id(payment_id)
            .await?
            .ok_or(CoreError::NotFound("payment"))?;

        if !self.payment_repo.settle(payment_id, PaymentStatus::Rejected).await? {
            return Err(CoreError::Validation("payment already settled".into()));
        }

        self.hierarchy.reverse_purchase_payment(&payment).await?;
        self.pack_repo.soft_delete(pack.id).await?;

        if let Some(server) = self.server_repo.get_by_id(pack.server_id).await? {
            if let Err(e) = self.panel.delete_client(&server, pack.stat_id).await {
                warn!(
                    user_package_id = pack.id,
                    stat_id = %pack.stat_id,
                    "panel credential removal failed on reject: {}",
                    e
                );
            }
        }

        self.hierarchy.toggle_block(pack.user_id, true).await?;

        info!(user_package_id = pack.id, user_id = pack.user_id, "purchase rejected");
        Ok(())
    }

    async fn ensure_not_blocked(&self, user: &User) -> CoreResult<()> {
        if user.is_effectively_disabled() {
            return Err(CoreError::AccountBlocked);
        }
        let ancestors = self.user_repo.list_ancestors(user.id).await?;
        if ancestors.iter().any(|a| a.is_effectively_disabled()) {
            return Err(CoreError::AccountBlocked);
        }
        Ok(())
    }

    async fn reprovision(
        &self,
        server: &Server,
        stat_id: Uuid,
        total_gb: f64,
        days: f64,
        limit_ip: i32,
    ) -> CoreResult<()> {
        self.panel.reset_client_traffic(server, stat_id).await?;
        self.panel
            .update_client(
                server,
                stat_id,
                &PartialClientSpec {
                    total_bytes: Some(gb_to_bytes(total_gb)),
                    expiry_time: Some(expiry_millis(days)),
                    enable: Some(true),
                    limit_ip: Some(limit_ip),
                },
            )
            .await
    }

    /// Stat row and UserPackage row land in one transaction. Failure here
    /// leaves the panel holding a client the DB does not know about; that is
    /// logged at error severity and repaired by reconciliation, never retried
    /// here.
    async fn persist_purchase(
        &self,
        user: &User,
        package: &Package,
        server: &Server,
        spec: &ClientSpec,
        payment_id: Option<i64>,
    ) -> CoreResult<UserPackage> {
        let result: anyhow::Result<UserPackage> = async {
            let mut tx = self.pool.begin().await.context("Failed to begin purchase tx")?;
            ClientStatRepository::upsert_one(
                &mut *tx,
                server.id,
                &StatUpsert {
                    id: spec.id,
                    email: spec.email.clone(),
                    sub_id: spec.sub_id.clone(),
                    tg_id: user.tg_id.map(|id| id.to_string()),
                    flow: None,
                    total: spec.total_bytes,
                    up: 0,
                    down: 0,
                    expiry_time: spec.expiry_time,
                    enable: true,
                    limit_ip: spec.limit_ip,
                },
            )
            .await?;
            let order_n = UserPackageRepository::next_order_n(&mut *tx, user.id).await?;
            let pack = UserPackageRepository::insert(
                &mut *tx,
                user.id,
                package.id,
                server.id,
                spec.id,
                payment_id,
                &package.name,
                order_n,
            )
            .await?;
            tx.commit().await.context("Failed to commit purchase tx")?;
            Ok(pack)
        }
        .await;

        result.map_err(|source| {
            error!(
                stat_id = %spec.id,
                server_id = server.id,
                user_id = user.id,
                "local persist failed after successful provisioning: {:#}",
                source
            );
            CoreError::LedgerPersist {
                stat_id: spec.id,
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn package(traffic_gb: f64, expiration_days: i32) -> Package {
        Package {
            id: 1,
            name: "Basic".into(),
            category: "vpn".into(),
            traffic_gb,
            expiration_days,
            price: 1000,
            user_count: 2,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn carry_over_caps_each_quantity_at_its_bound() {
        // 10 GB / 30 days, 6 GB and 10 days left.
        let carry = CarryOver::compute(&package(10.0, 30), 6.0, 10.0);
        // days bound: (6/10)*30 = 18 -> 10 days fit uncapped
        assert!((carry.days - 10.0).abs() < 1e-9);
        // traffic bound: (10/30)*10 = 3.33.. -> 6 GB capped down
        assert!((carry.traffic_gb - 10.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn carry_over_of_nothing_is_nothing() {
        let carry = CarryOver::compute(&package(10.0, 30), 0.0, 0.0);
        assert_eq!(carry, CarryOver { traffic_gb: 0.0, days: 0.0 });
    }

    #[test]
    fn carry_over_guards_degenerate_old_package() {
        let carry = CarryOver::compute(&package(0.0, 0), 5.0, 5.0);
        assert_eq!(carry, CarryOver { traffic_gb: 0.0, days: 0.0 });
    }

    #[test]
    fn full_remainder_carries_when_balanced() {
        // Half the traffic and half the time left: both fit their bounds.
        let carry = CarryOver::compute(&package(10.0, 30), 5.0, 15.0);
        assert!((carry.traffic_gb - 5.0).abs() < 1e-9);
        assert!((carry.days - 15.0).abs() < 1e-9);
    }

    #[test]
    fn discount_reduces_purchase_amount() {
        assert_eq!(purchase_amount(1000, 25.0), dec!(750));
        assert_eq!(purchase_amount(1000, 0.0), dec!(1000));
    }

    #[test]
    fn negative_discount_is_a_markup() {
        assert_eq!(purchase_amount(1000, -35.0), dec!(1350));
    }

    #[test]
    fn gb_conversion_is_binary() {
        assert_eq!(gb_to_bytes(1.0), 1024 * 1024 * 1024);
        assert_eq!(gb_to_bytes(0.5), 512 * 1024 * 1024);
    }
}
