pub mod activity_repo;
pub mod client_stat_repo;
pub mod package_repo;
pub mod payment_repo;
pub mod promo_repo;
pub mod server_repo;
pub mod user_package_repo;
pub mod user_repo;

pub use activity_repo::ActivityRepository;
pub use client_stat_repo::{ClientStatRepository, StatUpsert};
pub use package_repo::PackageRepository;
pub use payment_repo::PaymentRepository;
pub use promo_repo::PromoRepository;
pub use server_repo::ServerRepository;
pub use user_package_repo::UserPackageRepository;
pub use user_repo::UserRepository;
