use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "waschplan_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "waschplan_query_duration_seconds";

/// Counter: bookings rejected because the slot was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "waschplan_reservation_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "waschplan_connections_active";
pub const CONNECTIONS_TOTAL: &str = "waschplan_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "waschplan_connections_rejected_total";

/// Gauge: laundry rooms with a loaded engine.
pub const TENANTS_ACTIVE: &str = "waschplan_tenants_active";

pub const AUTH_FAILURES_TOTAL: &str = "waschplan_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "waschplan_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "waschplan_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metric label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectProfiles { .. } => "select_profiles",
        Command::UpdateProfile { .. } => "update_profile",
        Command::SelectAdmins => "select_admins",
        Command::InsertAdmin { .. } => "insert_admin",
        Command::DeleteAdmin { .. } => "delete_admin",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
