pub mod activity;
pub mod client_stat;
pub mod package;
pub mod payment;
pub mod promo;
pub mod server;
pub mod user;
pub mod user_package;

pub use activity::Activity;
pub use client_stat::ClientStat;
pub use package::Package;
pub use payment::{Payment, PaymentStatus, PaymentType};
pub use promo::PromoCode;
pub use server::Server;
pub use user::User;
pub use user_package::UserPackage;
