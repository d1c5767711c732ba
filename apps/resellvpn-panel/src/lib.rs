//! Reseller platform core: package lifecycle, reseller ledger and the
//! reconciliation jobs that keep the local mirror honest. Consumed by an API
//! façade that lives elsewhere; this crate owns the semantics.

use std::sync::Arc;

use sqlx::PgPool;

pub mod error;
pub mod services;
pub mod utils;

use services::alloc::AllocationStrategy;
use services::hierarchy_service::HierarchyService;
use services::notify::Notifier;
use services::package_service::PackageService;
use services::panel_client::{PanelClient, PanelCredentials};
use services::storage::ObjectStorage;

use resellvpn_db::repositories::{ClientStatRepository, ServerRepository};

/// Shared handles wired once at startup and cloned into every consumer.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub panel: Arc<PanelClient>,
    pub hierarchy: Arc<HierarchyService>,
    pub packages: Arc<PackageService>,
    pub notifier: Arc<dyn Notifier>,
    pub admin_chat_id: i64,
    pub production: bool,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        creds: PanelCredentials,
        notifier: Arc<dyn Notifier>,
        storage: Arc<dyn ObjectStorage>,
        alloc: Arc<dyn AllocationStrategy>,
        admin_chat_id: i64,
        production: bool,
    ) -> Self {
        let panel = Arc::new(PanelClient::new(
            creds,
            ServerRepository::new(pool.clone()),
            ClientStatRepository::new(pool.clone()),
        ));
        let hierarchy = Arc::new(HierarchyService::new(pool.clone(), panel.clone(), storage));
        let packages = Arc::new(PackageService::new(
            pool.clone(),
            panel.clone(),
            hierarchy.clone(),
            alloc,
        ));
        Self {
            pool,
            panel,
            hierarchy,
            packages,
            notifier,
            admin_chat_id,
            production,
        }
    }
}
