use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command.
pub const QUERIES_TOTAL: &str = "turnos_queries_total";

/// Histogram: query latency in seconds.
pub const QUERY_DURATION_SECONDS: &str = "turnos_query_duration_seconds";

/// Counter: bookings accepted (created or rescheduled into place).
pub const BOOKINGS_CREATED_TOTAL: &str = "turnos_bookings_created_total";

/// Counter: booking attempts that lost a race and returned Conflict.
pub const BOOKING_CONFLICTS_TOTAL: &str = "turnos_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "turnos_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "turnos_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "turnos_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "turnos_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "turnos_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turnos_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turnos_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBusiness { .. } => "create_business",
        Command::CreateService { .. } => "create_service",
        Command::DeleteService { .. } => "delete_service",
        Command::AddSchedule { .. } => "add_schedule",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::RemoveSchedule { .. } => "remove_schedule",
        Command::RegisterUser { .. } => "register_user",
        Command::CreateBooking { .. } => "create_booking",
        Command::ChangeBookingStatus { .. } => "change_booking_status",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::SelectMyBookings => "select_my_bookings",
        Command::SelectMyAssignments => "select_my_assignments",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailableEmployees { .. } => "select_available_employees",
        Command::SelectBusinesses => "select_businesses",
        Command::SelectServices { .. } => "select_services",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectEmployees { .. } => "select_employees",
        Command::Listen { .. } => "listen",
        Command::Unlisten { channel: Some(_) } => "unlisten",
        Command::Unlisten { channel: None } => "unlisten_all",
    }
}
