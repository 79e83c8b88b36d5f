use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: bookings admitted. Labels: status (initial status).
pub const BOOKINGS_ADMITTED_TOTAL: &str = "roombook_bookings_admitted_total";

/// Counter: booking requests rejected. Labels: reason (`EngineError::kind`).
pub const BOOKINGS_REJECTED_TOTAL: &str = "roombook_bookings_rejected_total";

/// Counter: booking lifecycle transitions applied. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roombook_booking_transitions_total";

/// Counter: derived room status flips written by the reconciler. Labels: status.
pub const ROOM_STATUS_CHANGES_TOTAL: &str = "roombook_room_status_changes_total";

/// Histogram: full sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "roombook_sweep_duration_seconds";

/// Counter: rooms a sweep failed to reconcile.
pub const SWEEP_FAILURES_TOTAL: &str = "roombook_sweep_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Counter: queries refused because the session user is not a known actor.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: appends that hit the persist timeout.
pub const WAL_PERSIST_TIMEOUTS_TOTAL: &str = "roombook_wal_persist_timeouts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectUsers => "select_users",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectRoomStatus { .. } => "select_room_status",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectUserOverlaps { .. } => "select_user_overlaps",
        Command::SelectSchedule { .. } => "select_schedule",
    }
}
