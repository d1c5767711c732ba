//! Local mirror of remote panel client state. One sync tick per server:
//! list, filter, bulk upsert, then reconcile entries the panel stopped
//! reporting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use resellvpn_db::models::Server;
use resellvpn_db::repositories::{ClientStatRepository, StatUpsert};

use crate::error::CoreResult;
use crate::services::panel_client::{PanelClient, PanelStat};

/// Keeps only records we manage: a parseable UUID id on our inbound.
/// Foreign inbounds and hand-made panel entries are dropped, with the ids
/// returned alongside so callers can apply the same filter to online lists.
pub fn filter_managed(server: &Server, raw: Vec<PanelStat>) -> Vec<(Uuid, PanelStat)> {
    raw.into_iter()
        .filter(|s| s.inbound_id == server.inbound_id)
        .filter_map(|s| match Uuid::parse_str(&s.id) {
            Ok(id) => Some((id, s)),
            Err(_) => {
                debug!(email = %s.email, "skipping unmanaged panel client");
                None
            }
        })
        .collect()
}

fn to_upsert(id: Uuid, stat: &PanelStat) -> StatUpsert {
    StatUpsert {
        id,
        email: stat.email.clone(),
        sub_id: stat.sub_id.clone(),
        tg_id: stat.tg_id.clone(),
        flow: stat.flow.clone(),
        total: stat.total,
        up: stat.up,
        down: stat.down,
        expiry_time: stat.expiry_time,
        enable: stat.enable,
        limit_ip: stat.limit_ip,
    }
}

/// Ids of entries the panel stopped listing, split into first-miss (flag)
/// and second-miss (gone) sets.
pub struct MissingOutcome {
    pub newly_flagged: Vec<Uuid>,
    pub gone: Vec<Uuid>,
}

/// State changes for one server's missing-entry debounce. For every locally
/// active stat: listed again while flagged -> the flag is cleared; absent and
/// unflagged -> first miss, flag it; absent and already flagged -> second
/// consecutive miss, the entry is gone.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MissTransitions {
    pub seen_again: Vec<Uuid>,
    pub first_miss: Vec<Uuid>,
    pub gone: Vec<Uuid>,
}

pub fn miss_transitions(active: &[Uuid], flagged: &[Uuid], present: &[Uuid]) -> MissTransitions {
    let flagged: HashSet<Uuid> = flagged.iter().copied().collect();
    let present: HashSet<Uuid> = present.iter().copied().collect();

    let mut t = MissTransitions::default();
    for id in active {
        match (present.contains(id), flagged.contains(id)) {
            (true, true) => t.seen_again.push(*id),
            (true, false) => {}
            (false, false) => t.first_miss.push(*id),
            (false, true) => t.gone.push(*id),
        }
    }
    t
}

#[derive(Clone)]
pub struct ClientStatService {
    stat_repo: ClientStatRepository,
    panel: Arc<PanelClient>,
}

impl ClientStatService {
    pub fn new(pool: PgPool, panel: Arc<PanelClient>) -> Self {
        Self {
            stat_repo: ClientStatRepository::new(pool),
            panel,
        }
    }

    /// Listing half of a mirror pass: the managed records seen this tick
    /// plus the online emails resolved to local ids. Downstream passes reuse
    /// these without re-listing.
    pub async fn list_managed(&self, server: &Server) -> CoreResult<(Vec<StatUpsert>, Vec<Uuid>)> {
        let raw = self.panel.list_client_stats(server).await?;
        let managed = filter_managed(server, raw);

        let online_emails = self.panel.list_online_client_ids(server).await?;
        let by_email: HashMap<&str, Uuid> = managed
            .iter()
            .map(|(id, s)| (s.email.as_str(), *id))
            .collect();
        let online_ids: Vec<Uuid> = online_emails
            .iter()
            .filter_map(|e| by_email.get(e.as_str()).copied())
            .collect();

        let upserts: Vec<StatUpsert> = managed.iter().map(|(id, s)| to_upsert(*id, s)).collect();
        Ok((upserts, online_ids))
    }

    /// Storage half: one atomic bulk upsert, run at the end of the tick.
    pub async fn store_tick(
        &self,
        server: &Server,
        upserts: &[StatUpsert],
        online_ids: &[Uuid],
    ) -> CoreResult<u64> {
        let written = self.stat_repo.bulk_upsert(server.id, upserts, online_ids).await?;
        debug!(
            server_id = server.id,
            written,
            online = online_ids.len(),
            "client stats mirrored"
        );
        Ok(written)
    }

    /// Debounced disappearance handling: a stat must be absent from two
    /// consecutive listings before it is reported gone, so one flaky listing
    /// never finishes a live package.
    pub async fn reconcile_missing(
        &self,
        server: &Server,
        present_ids: &[Uuid],
    ) -> CoreResult<MissingOutcome> {
        let active = self.stat_repo.active_stat_ids(server.id).await?;
        let flagged = self.stat_repo.flagged_active_ids(server.id).await?;
        let t = miss_transitions(&active, &flagged, present_ids);

        self.stat_repo.clear_missing(server.id, &t.seen_again).await?;
        self.stat_repo.set_missing(server.id, &t.first_miss).await?;

        if !t.first_miss.is_empty() {
            warn!(
                server_id = server.id,
                count = t.first_miss.len(),
                "panel stopped listing active clients"
            );
        }
        Ok(MissingOutcome {
            newly_flagged: t.first_miss,
            gone: t.gone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server() -> Server {
        Server {
            id: 1,
            domain: "vpn.example.net".into(),
            inbound_id: 4,
            token: None,
            is_active: true,
            health_score: None,
            created_at: Utc::now(),
        }
    }

    fn stat(id: &str, inbound_id: i32, email: &str) -> PanelStat {
        PanelStat {
            id: id.into(),
            inbound_id,
            email: email.into(),
            sub_id: "sub".into(),
            tg_id: None,
            flow: None,
            total: 0,
            up: 0,
            down: 0,
            expiry_time: 0,
            enable: true,
            limit_ip: 1,
        }
    }

    #[test]
    fn filter_drops_foreign_inbounds() {
        let id = Uuid::new_v4();
        let raw = vec![
            stat(&id.to_string(), 4, "ours"),
            stat(&Uuid::new_v4().to_string(), 9, "theirs"),
        ];
        let managed = filter_managed(&server(), raw);
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].0, id);
        assert_eq!(managed[0].1.email, "ours");
    }

    #[test]
    fn filter_drops_unparseable_ids() {
        let raw = vec![
            stat("hand-made-entry", 4, "manual"),
            stat(&Uuid::new_v4().to_string(), 4, "managed"),
        ];
        let managed = filter_managed(&server(), raw);
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].1.email, "managed");
    }

    #[test]
    fn first_miss_flags_but_does_not_finish() {
        let missing = Uuid::new_v4();
        let listed = Uuid::new_v4();
        let t = miss_transitions(&[missing, listed], &[], &[listed]);
        assert_eq!(t.first_miss, vec![missing]);
        assert!(t.gone.is_empty());
        assert!(t.seen_again.is_empty());
    }

    #[test]
    fn second_consecutive_miss_is_gone() {
        let missing = Uuid::new_v4();
        // Still absent on the next listing, flag already set.
        let t = miss_transitions(&[missing], &[missing], &[]);
        assert_eq!(t.gone, vec![missing]);
        assert!(t.first_miss.is_empty());
    }

    #[test]
    fn reappearing_stat_clears_the_flag() {
        let flaky = Uuid::new_v4();
        // Missed once, then listed again: the debounce resets instead of
        // finishing a live package.
        let t = miss_transitions(&[flaky], &[flaky], &[flaky]);
        assert_eq!(t.seen_again, vec![flaky]);
        assert!(t.first_miss.is_empty());
        assert!(t.gone.is_empty());
    }

    #[test]
    fn steadily_listed_stat_has_no_transitions() {
        let id = Uuid::new_v4();
        let t = miss_transitions(&[id], &[], &[id]);
        assert_eq!(t, MissTransitions::default());
    }

    #[test]
    fn upsert_conversion_preserves_counters() {
        let id = Uuid::new_v4();
        let mut s = stat(&id.to_string(), 4, "x");
        s.total = 100;
        s.up = 40;
        s.down = 25;
        s.expiry_time = 1234;
        let u = to_upsert(id, &s);
        assert_eq!(u.id, id);
        assert_eq!((u.total, u.up, u.down, u.expiry_time), (100, 40, 25, 1234));
    }
}
