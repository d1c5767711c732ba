//! Request-path error taxonomy.
//!
//! Background-job failures never use these: they are swallowed at the
//! iteration boundary and logged with server/job context.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input, rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// Purchase denied: the user or an ancestor is disabled. No side effect.
    #[error("account is blocked")]
    AccountBlocked,

    /// Panel login response carried no session cookie.
    #[error("panel authentication failed for server {server_id}")]
    PanelAuth { server_id: i64 },

    /// Underlying HTTP failure talking to the panel.
    #[error("panel request failed for server {server_id} ({status:?})")]
    PanelRequest {
        server_id: i64,
        status: Option<u16>,
    },

    /// Panel reported failure provisioning a credential.
    #[error("panel rejected addClient: {0}")]
    PanelAddClient(String),

    /// Panel reported failure replacing a credential.
    #[error("panel rejected updateClient: {0}")]
    PanelUpdateClient(String),

    /// Provisioning step failed during buy; no local state was created.
    #[error("package provisioning failed")]
    PackageProvision(#[source] anyhow::Error),

    /// Atomic local write failed after successful remote provisioning.
    /// Represents drift the next sync tick must repair; logged at error
    /// severity for operational alerting.
    #[error("ledger persist failed after provisioning (stat {stat_id})")]
    LedgerPersist {
        stat_id: uuid::Uuid,
        #[source]
        source: anyhow::Error,
    },

    /// A child's discount would exceed the break-even bound of the new
    /// profit percent.
    #[error("discount of child {child_id} exceeds profit bound (max {max_percent:.2}%)")]
    DiscountExceedsProfit { child_id: i64, max_percent: f64 },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Provisioning-class failures are surfaced to callers as a generic
    /// "provisioning failed"; the concrete variant stays in the logs.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::PanelAuth { .. }
                | Self::PanelRequest { .. }
                | Self::PanelAddClient(_)
                | Self::PanelUpdateClient(_)
                | Self::PackageProvision(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
