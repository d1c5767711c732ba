pub mod alloc;
pub mod client_stat_service;
pub mod hierarchy_service;
pub mod notify;
pub mod package_service;
pub mod panel_client;
pub mod storage;
pub mod sync_service;
