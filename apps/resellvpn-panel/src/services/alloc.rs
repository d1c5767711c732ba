use resellvpn_db::models::Server;

/// Pluggable placement for new credentials. `PackageLedger` only sees this
/// trait, so load-aware placement can be swapped in without touching the
/// purchase flow.
pub trait AllocationStrategy: Send + Sync {
    fn pick_server<'a>(&self, servers: &'a [Server]) -> Option<&'a Server>;
}

/// Current production behavior: the shared default pool is the first active
/// server.
pub struct FirstActive;

impl AllocationStrategy for FirstActive {
    fn pick_server<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        servers.first()
    }
}

/// Load-aware placement over the health score written by the server-stats
/// job. Higher score means a busier box; unknown scores sort first so fresh
/// servers get traffic.
pub struct LeastLoaded;

impl AllocationStrategy for LeastLoaded {
    fn pick_server<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        servers.iter().min_by(|a, b| {
            let sa = a.health_score.unwrap_or(0.0);
            let sb = b.health_score.unwrap_or(0.0);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(id: i64, score: Option<f64>) -> Server {
        Server {
            id,
            domain: format!("s{}.example.net", id),
            inbound_id: 1,
            token: None,
            is_active: true,
            health_score: score,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn first_active_picks_head_of_pool() {
        let servers = vec![server(3, None), server(7, None)];
        assert_eq!(FirstActive.pick_server(&servers).unwrap().id, 3);
        assert!(FirstActive.pick_server(&[]).is_none());
    }

    #[test]
    fn least_loaded_prefers_lowest_score() {
        let servers = vec![
            server(1, Some(61.5)),
            server(2, Some(12.3)),
            server(3, Some(44.0)),
        ];
        assert_eq!(LeastLoaded.pick_server(&servers).unwrap().id, 2);
    }

    #[test]
    fn least_loaded_treats_unknown_score_as_idle() {
        let servers = vec![server(1, Some(5.0)), server(2, None)];
        assert_eq!(LeastLoaded.pick_server(&servers).unwrap().id, 2);
    }
}
