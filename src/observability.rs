use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairtime_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairtime_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "chairtime_bookings_created_total";

/// Counter: bookings rejected because the time was already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "chairtime_booking_conflicts_total";

/// Counter: "any staff" requests nobody could take.
pub const NO_CAPACITY_TOTAL: &str = "chairtime_no_capacity_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairtime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairtime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairtime_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairtime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairtime_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "chairtime_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertStaff { .. } => "insert_staff",
        Command::SetStaffActive { .. } => "set_staff_active",
        Command::SetWorkingHours { .. } => "set_working_hours",
        Command::ClearWorkingHours { .. } => "clear_working_hours",
        Command::UpsertService(_) => "upsert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertCustomer(_) => "insert_customer",
        Command::InsertBooking(_) => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectStaff => "select_staff",
        Command::SelectServices => "select_services",
    }
}
