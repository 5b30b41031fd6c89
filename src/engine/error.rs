use thiserror::Error;
use ulid::Ulid;

use crate::model::{format_ms, Ms};

/// Every failure is scoped to the single operation that produced it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not authenticated: no user identity on this session")]
    NotAuthenticated,

    #[error("invalid range: end ({}) must be after start ({})", format_ms(.end), format_ms(.start))]
    InvalidRange { start: Ms, end: Ms },

    #[error("time slot overlaps existing reservation {0}")]
    Overlap(Ulid),

    #[error("reservation {0} belongs to another user")]
    NotOwner(Ulid),

    #[error("administrator privileges required")]
    NotAdmin,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("reservations are only possible from {} until {}", format_ms(.earliest), format_ms(.latest))]
    OutsideBookingWindow { earliest: Ms, latest: Ms },

    #[error("invalid color {0:?}: expected #RGB or #RRGGBB")]
    InvalidColor(String),

    #[error("administrator {0} is configured at startup and cannot be revoked")]
    ConfiguredAdmin(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to Postgres clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotAuthenticated => "28000",
            EngineError::InvalidRange { .. } | EngineError::InvalidColor(_) => "22023",
            // exclusion_violation, what a Postgres EXCLUDE constraint raises
            EngineError::Overlap(_) => "23P01",
            EngineError::NotOwner(_) | EngineError::NotAdmin | EngineError::ConfiguredAdmin(_) => {
                "42501"
            }
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::OutsideBookingWindow { .. } => "23514",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    pub(crate) fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("reservation {id}"))
    }

    pub(crate) fn profile_not_found(id: &str) -> Self {
        EngineError::NotFound(format!("profile {id}"))
    }
}
