//! Interval jobs that pull panel truth into the local mirror and close out
//! packages. Each job runs in its own task on its own timer; ticks within a
//! job are serial, and every unit of work catches its own errors so one
//! server's outage never stalls the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use resellvpn_db::models::Server;
use resellvpn_db::repositories::{
    ServerRepository, StatUpsert, UserPackageRepository, UserRepository,
};

use crate::error::CoreResult;
use crate::services::client_stat_service::ClientStatService;
use crate::services::notify::Notifier;
use crate::services::panel_client::{PanelClient, ServerHealth};
use crate::utils::task_pool;

const SYNC_INTERVAL: Duration = Duration::from_secs(60);
const SERVER_STATS_INTERVAL: Duration = Duration::from_secs(600);
const BACKUP_INTERVAL: Duration = Duration::from_secs(60);

const NOTIFY_MAX_CONCURRENT: usize = 5;
const NOTIFY_RATE_PER_SECOND: u32 = 5;

const TRAFFIC_WARNING_RATIO: f64 = 0.85;
const EXPIRY_WARNING_MS: i64 = 2 * 86_400_000;

/// Stats whose package deserves a warning: quota ≥85% used, or ≤2 days left.
/// Unlimited entries (total or expiry of 0) never match on that axis.
pub fn threshold_stat_ids(stats: &[StatUpsert], now_ms: i64) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for s in stats {
        let by_traffic =
            s.total > 0 && (s.up + s.down) as f64 >= s.total as f64 * TRAFFIC_WARNING_RATIO;
        let by_time = s.expiry_time > 0 && s.expiry_time - now_ms <= EXPIRY_WARNING_MS;
        if by_traffic || by_time {
            ids.push(s.id);
        }
    }
    ids
}

/// Stats that are exhausted: quota fully consumed or expiry in the past.
pub fn finished_stat_ids(stats: &[StatUpsert], now_ms: i64) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for s in stats {
        let by_traffic = s.total > 0 && s.up + s.down >= s.total;
        let by_time = s.expiry_time > 0 && s.expiry_time <= now_ms;
        if by_traffic || by_time {
            ids.push(s.id);
        }
    }
    ids
}

/// Composite load score, higher is busier. Weighted sum of cpu%, memory and
/// disk used ratios, 1/5/15-minute load averages, average network GB and
/// uptime days, rounded to 2 decimals.
pub fn health_score(h: &ServerHealth) -> f64 {
    let mem_pct = if h.mem.total > 0.0 {
        h.mem.current / h.mem.total * 100.0
    } else {
        0.0
    };
    let disk_pct = if h.disk.total > 0.0 {
        h.disk.current / h.disk.total * 100.0
    } else {
        0.0
    };
    let load = h.loads.first().copied().unwrap_or(0.0) * 0.5
        + h.loads.get(1).copied().unwrap_or(0.0) * 0.3
        + h.loads.get(2).copied().unwrap_or(0.0) * 0.2;
    let net_gb = (h.net_traffic.sent + h.net_traffic.recv) / 2.0 / 1e9;
    let uptime_days = h.uptime as f64 / 86_400.0;

    let score = 0.30 * h.cpu
        + 0.25 * mem_pct
        + 0.15 * disk_pct
        + 0.15 * load
        + 0.10 * net_gb
        + 0.05 * uptime_days;
    (score * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct SyncService {
    server_repo: ServerRepository,
    pack_repo: UserPackageRepository,
    user_repo: UserRepository,
    stats: ClientStatService,
    panel: Arc<PanelClient>,
    notifier: Arc<dyn Notifier>,
    admin_chat_id: i64,
    production: bool,
}

impl SyncService {
    pub fn new(
        pool: PgPool,
        panel: Arc<PanelClient>,
        notifier: Arc<dyn Notifier>,
        admin_chat_id: i64,
        production: bool,
    ) -> Self {
        Self {
            server_repo: ServerRepository::new(pool.clone()),
            pack_repo: UserPackageRepository::new(pool.clone()),
            user_repo: UserRepository::new(pool.clone()),
            stats: ClientStatService::new(pool, panel.clone()),
            panel,
            notifier,
            admin_chat_id,
            production,
        }
    }

    /// Spawns one task per job. Ticks await their work, so a slow tick
    /// delays the next one instead of overlapping it.
    pub fn start(self) {
        let sync = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sync.run_sync_tick().await;
            }
        });

        let stats = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SERVER_STATS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                stats.run_server_stats_tick().await;
            }
        });

        if self.production {
            let backup = self;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(BACKUP_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    backup.run_backup_tick().await;
                }
            });
        }

        info!("reconciliation jobs started");
    }

    pub async fn run_sync_tick(&self) {
        let servers = match self.server_repo.get_active().await {
            Ok(servers) => servers,
            Err(e) => {
                error!("sync tick: failed to load servers: {:#}", e);
                return;
            }
        };

        for server in servers {
            if let Err(e) = self.sync_one_server(&server).await {
                error!(server_id = server.id, job = "sync_client_stats", "tick failed: {}", e);
            }
        }
    }

    /// Warning, finish and missing passes consume the listing first; the
    /// mirror write is the final step of the tick.
    async fn sync_one_server(&self, server: &Server) -> CoreResult<()> {
        let (upserts, online_ids) = self.stats.list_managed(server).await?;
        let now_ms = Utc::now().timestamp_millis();

        self.send_threshold_warnings(&upserts, now_ms).await?;
        self.update_finished_packages(&upserts, now_ms).await?;

        let present: Vec<Uuid> = upserts.iter().map(|s| s.id).collect();
        let outcome = self.stats.reconcile_missing(server, &present).await?;
        if !outcome.gone.is_empty() {
            let closed = self
                .pack_repo
                .mark_finished_by_stat_ids(&outcome.gone)
                .await?;
            warn!(
                server_id = server.id,
                closed, "finished packages whose panel entries disappeared"
            );
        }

        if let Err(e) = self.panel.del_depleted_clients(server).await {
            warn!(server_id = server.id, "depleted-client purge failed: {}", e);
        }

        self.stats.store_tick(server, &upserts, &online_ids).await?;
        Ok(())
    }

    /// Mark-before-notify: the warned flag is committed first so a dispatch
    /// failure can never warn a package twice. A lost notification stays
    /// lost.
    async fn send_threshold_warnings(&self, upserts: &[StatUpsert], now_ms: i64) -> CoreResult<()> {
        let stat_ids = threshold_stat_ids(upserts, now_ms);
        if stat_ids.is_empty() {
            return Ok(());
        }
        let packs: Vec<_> = self
            .pack_repo
            .unwarned_active_by_stat_ids(&stat_ids)
            .await?
            .into_iter()
            .filter(|p| p.awaiting_warning())
            .collect();
        if packs.is_empty() {
            return Ok(());
        }

        let pack_ids: Vec<i64> = packs.iter().map(|p| p.id).collect();
        self.pack_repo.mark_warned(&pack_ids).await?;

        self.dispatch(
            packs
                .iter()
                .map(|p| {
                    (
                        p.user_id,
                        format!("Package \"{}\" is nearly exhausted: over 85% of traffic used or less than 2 days remain.", p.name),
                    )
                })
                .collect(),
        )
        .await;
        Ok(())
    }

    async fn update_finished_packages(&self, upserts: &[StatUpsert], now_ms: i64) -> CoreResult<()> {
        let stat_ids = finished_stat_ids(upserts, now_ms);
        if stat_ids.is_empty() {
            return Ok(());
        }
        let packs = self.pack_repo.unfinished_active_by_stat_ids(&stat_ids).await?;
        if packs.is_empty() {
            return Ok(());
        }

        let pack_ids: Vec<i64> = packs.iter().map(|p| p.id).collect();
        self.pack_repo.mark_finished(&pack_ids).await?;
        info!(count = pack_ids.len(), "packages finished");

        self.dispatch(
            packs
                .iter()
                .map(|p| (p.user_id, format!("Package \"{}\" has finished.", p.name)))
                .collect(),
        )
        .await;
        Ok(())
    }

    /// Bounded fan-out to the messaging platform; failures are logged per
    /// recipient and never retried.
    async fn dispatch(&self, messages: Vec<(i64, String)>) {
        let user_ids: Vec<i64> = messages.iter().map(|(id, _)| *id).collect();
        let chat_ids: HashMap<i64, i64> = match self.user_repo.get_tg_ids(&user_ids).await {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => {
                error!("failed to resolve chat ids: {:#}", e);
                return;
            }
        };

        let mut tasks = Vec::new();
        for (user_id, text) in messages {
            let Some(chat_id) = chat_ids.get(&user_id).copied() else {
                continue;
            };
            let notifier = self.notifier.clone();
            tasks.push(async move { (user_id, notifier.send_message(chat_id, &text).await) });
        }

        let results = task_pool::run(tasks, NOTIFY_MAX_CONCURRENT, NOTIFY_RATE_PER_SECOND).await;
        for (user_id, result) in results {
            if let Err(e) = result {
                warn!(user_id, "notification dispatch failed: {:#}", e);
            }
        }
    }

    pub async fn run_server_stats_tick(&self) {
        let servers = match self.server_repo.get_active().await {
            Ok(servers) => servers,
            Err(e) => {
                error!("server stats tick: failed to load servers: {:#}", e);
                return;
            }
        };

        for server in servers {
            let result = async {
                let health = self.panel.get_server_health(&server).await?;
                let score = health_score(&health);
                self.server_repo
                    .update_health_score(server.id, score)
                    .await?;
                info!(server_id = server.id, score, "server health scored");
                CoreResult::Ok(())
            }
            .await;
            if let Err(e) = result {
                error!(server_id = server.id, job = "server_stats", "tick failed: {}", e);
            }
        }
    }

    pub async fn run_backup_tick(&self) {
        let servers = match self.server_repo.get_active().await {
            Ok(servers) => servers,
            Err(e) => {
                error!("backup tick: failed to load servers: {:#}", e);
                return;
            }
        };

        for server in servers {
            let result = async {
                let snapshot = self.panel.get_db(&server).await?;
                let name = format!(
                    "backup-{}-{}.db",
                    server.domain,
                    Utc::now().format("%Y%m%d-%H%M%S")
                );
                self.notifier
                    .send_document(self.admin_chat_id, &name, snapshot)
                    .await
                    .map_err(crate::error::CoreError::Internal)?;
                CoreResult::Ok(())
            }
            .await;
            if let Err(e) = result {
                error!(server_id = server.id, job = "backup_db", "tick failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::panel_client::{NetTraffic, ResourceUsage};

    const GB: i64 = 1024 * 1024 * 1024;

    fn upsert(total: i64, up: i64, down: i64, expiry_time: i64) -> StatUpsert {
        StatUpsert {
            id: Uuid::new_v4(),
            email: "e".into(),
            sub_id: "s".into(),
            tg_id: None,
            flow: None,
            total,
            up,
            down,
            expiry_time,
            enable: true,
            limit_ip: 1,
        }
    }

    #[test]
    fn warning_fires_at_85_percent_traffic() {
        let now = 1_000_000;
        let far = now + 30 * 86_400_000;
        let under = upsert(100 * GB, 40 * GB, 44 * GB, far);
        let over = upsert(100 * GB, 45 * GB, 40 * GB, far);
        let stats = vec![under.clone(), over.clone()];
        let ids = threshold_stat_ids(&stats, now);
        assert_eq!(ids, vec![over.id]);
    }

    #[test]
    fn warning_fires_within_two_days_of_expiry() {
        let now = 10 * 86_400_000;
        let soon = upsert(100 * GB, 0, 0, now + 86_400_000);
        let later = upsert(100 * GB, 0, 0, now + 3 * 86_400_000);
        let ids = threshold_stat_ids(&[soon.clone(), later], now);
        assert_eq!(ids, vec![soon.id]);
    }

    #[test]
    fn unlimited_entries_never_warn() {
        let now = 1_000_000;
        let unlimited = upsert(0, 50 * GB, 50 * GB, 0);
        assert!(threshold_stat_ids(&[unlimited], now).is_empty());
    }

    #[test]
    fn finished_by_traffic_or_time() {
        let now = 10 * 86_400_000;
        let far = now + 30 * 86_400_000;
        let depleted = upsert(10 * GB, 6 * GB, 4 * GB, far);
        let expired = upsert(100 * GB, 0, 0, now - 1);
        let live = upsert(100 * GB, GB, GB, far);
        let ids = finished_stat_ids(&[depleted.clone(), expired.clone(), live], now);
        assert_eq!(ids, vec![depleted.id, expired.id]);
    }

    #[test]
    fn zero_expiry_means_no_time_finish() {
        let now = 10 * 86_400_000;
        let unlimited = upsert(100 * GB, 0, 0, 0);
        assert!(finished_stat_ids(&[unlimited], now).is_empty());
    }

    #[test]
    fn health_score_weighted_sum() {
        let health = ServerHealth {
            cpu: 50.0,
            mem: ResourceUsage {
                current: 4.0,
                total: 8.0,
            },
            disk: ResourceUsage {
                current: 1.0,
                total: 4.0,
            },
            loads: vec![1.0, 2.0, 3.0],
            net_traffic: NetTraffic {
                sent: 1e9,
                recv: 3e9,
            },
            uptime: 2 * 86_400,
        };
        // 0.30*50 + 0.25*50 + 0.15*25 + 0.15*(0.5+0.6+0.6) + 0.10*2 + 0.05*2
        let expected: f64 = 15.0 + 12.5 + 3.75 + 0.255 + 0.2 + 0.1;
        assert!((health_score(&health) - (expected * 100.0).round() / 100.0).abs() < 1e-9);
    }

    #[test]
    fn health_score_rounds_to_two_decimals() {
        let health = ServerHealth {
            cpu: 33.333,
            mem: ResourceUsage {
                current: 0.0,
                total: 0.0,
            },
            disk: ResourceUsage {
                current: 0.0,
                total: 0.0,
            },
            loads: vec![],
            net_traffic: NetTraffic {
                sent: 0.0,
                recv: 0.0,
            },
            uptime: 0,
        };
        let score = health_score(&health);
        assert_eq!(score, (score * 100.0).round() / 100.0);
        assert!((score - 10.0).abs() < 0.01);
    }
}
